//! State shared by the lifecycle components

use super::events::{CallNotice, Command};
use super::{ConnectionSession, SessionState};
use crate::config::{CallLinkConfig, TimingConfig};
use crate::error::{Error, FailureReport};
use crate::lifecycle::{TimerHandle, TimerRegistry};
use crate::peer::{LinkState, SignalingState};
use crate::signaling::protocol::{IceCandidate, OutboundSignal};
use std::collections::VecDeque;
use tracing::debug;

/// What the state machine last heard about the current link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    /// Generation of the current (or pending) link; 0 before the first
    pub generation: u64,
    /// `CreatePeerLink` issued, link not built yet
    pub pending: bool,
    /// Link built
    pub exists: bool,
    /// Connection state
    pub state: LinkState,
    /// Offer/answer sub-state
    pub signaling: SignalingState,
    /// Built in relay-only mode
    pub relay_only: bool,
    /// A local offer is being created
    pub making_offer: bool,
    /// A remote description has been applied
    pub remote_description_set: bool,
    /// Candidate gathering finished or timed out
    pub gathering_complete: bool,
}

impl LinkStatus {
    fn fresh(generation: u64, relay_only: bool) -> Self {
        Self {
            generation,
            pending: true,
            exists: false,
            state: LinkState::New,
            signaling: SignalingState::Stable,
            relay_only,
            making_offer: false,
            remote_description_set: false,
            gathering_complete: false,
        }
    }

    /// Whether the link is healthy
    pub fn is_connected(&self) -> bool {
        self.exists && self.state == LinkState::Connected
    }

    /// Whether the link reports trouble
    pub fn is_degraded(&self) -> bool {
        self.state.is_degraded()
    }

    /// Whether an offer/answer exchange is in progress
    pub fn is_negotiating(&self) -> bool {
        self.making_offer || self.signaling != SignalingState::Stable
    }
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            pending: false,
            ..Self::fresh(0, false)
        }
    }
}

/// Capture stream status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaStatus {
    /// A stream is held and all its tracks are live
    pub live: bool,
    /// `AcquireMedia` issued, no answer yet
    pub acquiring: bool,
    /// Last acquisition failed; waiting for an explicit retry
    pub failed: bool,
}

/// Offer to create as soon as the next link exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferIntent {
    /// Restart ICE
    pub ice_restart: bool,
    /// Tell the partner our link was replaced
    pub rebuilt: bool,
}

/// Remote offer held until the link can take it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOffer {
    /// Offer SDP
    pub sdp: String,
    /// Offer restarts ICE
    pub ice_restart: bool,
}

/// Session record plus everything the lifecycle components act on
///
/// Components never do I/O. They mutate this and queue [`Command`]s.
#[derive(Debug)]
pub struct SessionCore {
    /// Session record
    pub session: ConnectionSession,
    /// Every delayed action of the session
    pub timers: TimerRegistry,
    /// Current link
    pub link: LinkStatus,
    /// Capture stream
    pub media: MediaStatus,
    /// Timing constants
    pub timing: TimingConfig,
    /// Pending initial-connection timeout or setup extension
    pub setup_timer: Option<TimerHandle>,
    local_id: String,
    outbox: VecDeque<Command>,
    link_waiting_for_media: Option<bool>,
    next_offer: Option<OfferIntent>,
    early_offer: Option<PendingOffer>,
    remote_candidates: Vec<IceCandidate>,
    last_error: Option<String>,
}

impl SessionCore {
    /// Create the state for an unmatched session
    pub fn new(config: &CallLinkConfig, local_id: &str) -> Self {
        Self {
            session: ConnectionSession::new(config.network_hint, config.force_relay),
            timers: TimerRegistry::new(),
            link: LinkStatus::default(),
            media: MediaStatus::default(),
            timing: config.timing.clone(),
            setup_timer: None,
            local_id: local_id.to_string(),
            outbox: VecDeque::new(),
            link_waiting_for_media: None,
            next_offer: None,
            early_offer: None,
            remote_candidates: Vec::new(),
            last_error: None,
        }
    }

    /// Local peer id
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Whether this side sends the first offer and wins collisions
    pub fn is_initiator(&self) -> bool {
        self.local_id.as_str() < self.session.partner_id.as_str()
    }

    /// Recovery is pointless while the authority flag is set and the link
    /// is healthy right now
    pub fn blocks_recovery(&self) -> bool {
        self.session.authority.get() && self.link.is_connected()
    }

    /// Queue a command
    pub fn push(&mut self, command: Command) {
        self.outbox.push_back(command);
    }

    /// Queue a caller notification
    pub fn notify(&mut self, notice: CallNotice) {
        self.push(Command::Notify(notice));
    }

    /// Queue a signaling message
    pub fn send(&mut self, signal: OutboundSignal) {
        self.push(Command::Send(signal));
    }

    /// Take every queued command
    pub fn drain(&mut self) -> Vec<Command> {
        self.outbox.drain(..).collect()
    }

    /// Commands queued so far
    pub fn queued(&self) -> impl Iterator<Item = &Command> {
        self.outbox.iter()
    }

    /// Change state and notify; no-op if unchanged
    pub fn set_state(&mut self, state: SessionState) {
        if self.session.state == state {
            return;
        }
        debug!(
            session_id = %self.session.session_id,
            from = ?self.session.state,
            to = ?state,
            "Session state transition"
        );
        self.session.state = state;
        self.notify(CallNotice::StateChanged(state));
    }

    /// Replace the current link with a new generation
    ///
    /// Closes the old link, builds the new one once capture is live and
    /// remembers which offer to make when it exists.
    pub fn rebuild_link(&mut self, relay_only: bool, offer: Option<OfferIntent>) -> u64 {
        if self.link.exists || self.link.pending {
            self.push(Command::CloseLink {
                generation: self.link.generation,
            });
        }

        let generation = self.link.generation + 1;
        self.link = LinkStatus::fresh(generation, relay_only);
        self.remote_candidates.clear();
        self.next_offer = offer;

        debug!(
            session_id = %self.session.session_id,
            generation,
            relay_only,
            "Building link"
        );

        if self.media.live {
            self.push(Command::CreatePeerLink {
                generation,
                relay_only,
            });
        } else {
            self.link_waiting_for_media = Some(relay_only);
            self.request_media();
        }
        generation
    }

    /// Ask for a capture stream unless a request is already out
    pub fn request_media(&mut self) {
        if self.media.acquiring {
            return;
        }
        self.media.acquiring = true;
        self.media.failed = false;
        self.push(Command::AcquireMedia);
    }

    /// Capture is live; build the link that was waiting for it
    pub fn media_acquired(&mut self) {
        self.media.live = true;
        self.media.acquiring = false;
        self.media.failed = false;
        if let Some(relay_only) = self.link_waiting_for_media.take() {
            self.push(Command::CreatePeerLink {
                generation: self.link.generation,
                relay_only,
            });
        }
    }

    /// Capture failed
    pub fn media_failed(&mut self) {
        self.media.live = false;
        self.media.acquiring = false;
        self.media.failed = true;
    }

    /// Whether a link build is parked until capture is live
    pub fn link_waiting_for_media(&self) -> bool {
        self.link_waiting_for_media.is_some()
    }

    /// Offer to make once the current link exists
    pub fn take_next_offer(&mut self) -> Option<OfferIntent> {
        self.next_offer.take()
    }

    /// Hold a remote offer until the link can take it
    pub fn hold_offer(&mut self, offer: PendingOffer) {
        if self.early_offer.replace(offer).is_some() {
            debug!("Replaced an earlier held offer");
        }
    }

    /// Take the held remote offer
    pub fn take_held_offer(&mut self) -> Option<PendingOffer> {
        self.early_offer.take()
    }

    /// Hold a remote candidate until a remote description is applied
    pub fn hold_candidate(&mut self, candidate: IceCandidate) {
        self.remote_candidates.push(candidate);
    }

    /// Queue every held candidate against the current link, in arrival order
    pub fn flush_candidates(&mut self) -> usize {
        let generation = self.link.generation;
        let held: Vec<IceCandidate> = self.remote_candidates.drain(..).collect();
        let count = held.len();
        for candidate in held {
            self.push(Command::AddRemoteCandidate {
                generation,
                candidate,
            });
        }
        count
    }

    /// Number of held remote candidates
    pub fn held_candidates(&self) -> usize {
        self.remote_candidates.len()
    }

    /// Remember the most recent failure for diagnostics
    pub fn record_error(&mut self, error: &str) {
        self.last_error = Some(error.to_string());
    }

    /// Most recent failure
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Build a caller-visible report with the session's diagnostics
    pub fn failure_report(&self, error: &Error) -> FailureReport {
        FailureReport::from_error(
            error,
            self.session.reconnect_attempts,
            self.session.network_type,
            self.session.force_relay(),
        )
    }

    /// Forget per-session negotiation leftovers, for a brand-new session
    pub fn clear_negotiation(&mut self) {
        self.setup_timer = None;
        self.link_waiting_for_media = None;
        self.next_offer = None;
        self.early_offer = None;
        self.remote_candidates.clear();
        self.last_error = None;
    }

    /// Mark the current link as gone without building another
    pub fn drop_link(&mut self) -> Option<u64> {
        let had_link = self.link.exists || self.link.pending;
        let generation = self.link.generation;
        self.link.exists = false;
        self.link.pending = false;
        self.link.state = LinkState::Closed;
        self.link.signaling = SignalingState::Closed;
        self.link_waiting_for_media = None;
        had_link.then_some(generation)
    }
}
