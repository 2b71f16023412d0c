//! Connection state machine
//!
//! Owns one session and routes every [`SessionEvent`] and due timer to the
//! lifecycle components. It never performs I/O: side effects leave through
//! [`ConnectionStateMachine::drain_commands`] and time is always passed in,
//! so the whole lifecycle runs the same against a real or simulated clock.
//!
//! ```text
//!              Matched
//!   Idle ───────────────► Matched ──link built──► Connecting
//!                                                     │
//!                                     link connected  │
//!                                                     ▼
//!        ┌──── grace expired ──── Connected ◄──── recovered ────┐
//!        ▼                                                      │
//!   Disconnected / Failed ── restart ─► relay rebuild ─► full reconnect
//!                                                           │
//!                                         budget exhausted  ▼
//!                                                         Ended
//! ```

use super::context::{OfferIntent, PendingOffer};
use super::events::{CallNotice, Command, MediaOutcome, NegotiationOp, OperationOutcome};
use super::network::NetworkClassifier;
use super::{
    ConnectionSession, EndReason, LinkStatus, NetworkType, SessionCore, SessionEvent, SessionPhase,
    SessionState,
};
use crate::config::CallLinkConfig;
use crate::error::Error;
use crate::lifecycle::{
    backoff::delay_ms, GraceExpiry, GraceKind, GracePeriodHandler, NegotiationRestartCoordinator,
    ReconnectDecision, ReconnectionOrchestrator, RestartDecision, TimerAction, TimerHandle,
    TimerId, TimerRegistry,
};
use crate::peer::{LinkState, NegotiationEvent, SignalingState};
use crate::signaling::protocol::{IceCandidate, InboundSignal, OutboundSignal};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Drives one call from match to end
#[derive(Debug)]
pub struct ConnectionStateMachine {
    core: SessionCore,
    grace: GracePeriodHandler,
    restart: NegotiationRestartCoordinator,
    reconnect: ReconnectionOrchestrator,
    classifier: NetworkClassifier,
    inactivity_timer: Option<TimerHandle>,
    heartbeat_timer: Option<TimerHandle>,
    idle_timer: Option<TimerHandle>,
    gathering_timer: Option<TimerHandle>,
    negotiation_retries: u32,
    pending_retries: HashMap<TimerId, Command>,
}

impl ConnectionStateMachine {
    /// Create an unmatched session for the local peer `local_id`
    pub fn new(config: &CallLinkConfig, local_id: &str) -> Self {
        Self {
            core: SessionCore::new(config, local_id),
            grace: GracePeriodHandler::new(),
            restart: NegotiationRestartCoordinator::new(),
            reconnect: ReconnectionOrchestrator::new(),
            classifier: NetworkClassifier::new(),
            inactivity_timer: None,
            heartbeat_timer: None,
            idle_timer: None,
            gathering_timer: None,
            negotiation_retries: 0,
            pending_retries: HashMap::new(),
        }
    }

    /// Session record
    pub fn session(&self) -> &ConnectionSession {
        &self.core.session
    }

    /// What is known about the current link
    pub fn link(&self) -> &LinkStatus {
        &self.core.link
    }

    /// Timer registry
    pub fn timers(&self) -> &TimerRegistry {
        &self.core.timers
    }

    /// Shared component state
    pub fn core(&self) -> &SessionCore {
        &self.core
    }

    /// Whether a grace window of `kind` is open
    pub fn grace_open(&self, kind: GraceKind) -> bool {
        self.grace.is_open(kind)
    }

    /// Current restart attempt counter
    pub fn restart_attempt(&self) -> u32 {
        self.restart.attempt()
    }

    /// Whether the session has ended
    pub fn is_ended(&self) -> bool {
        self.core.session.state == SessionState::Ended
    }

    /// Earliest pending timer deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.core.timers.next_deadline()
    }

    /// Take every command queued since the last call
    pub fn drain_commands(&mut self) -> Vec<Command> {
        self.core.drain()
    }

    /// Process one input
    pub fn handle_event(&mut self, event: SessionEvent, now: Instant) {
        if self.is_ended() {
            match event {
                SessionEvent::TryAgain => self.try_again(now),
                other => debug!(event = ?other, "Session ended, event ignored"),
            }
            return;
        }

        match event {
            SessionEvent::Matched {
                partner_id,
                room_id,
            } => self.on_matched(partner_id, room_id, now),
            SessionEvent::Signal(signal) => self.on_signal(signal, now),
            SessionEvent::Negotiation { generation, event } => {
                if generation != self.core.link.generation || !self.core.link.exists {
                    debug!(
                        generation,
                        current = self.core.link.generation,
                        "Dropping event from stale link"
                    );
                    return;
                }
                self.touch(now);
                self.on_negotiation(event, now);
            }
            SessionEvent::Operation {
                generation,
                outcome,
            } => {
                if generation != self.core.link.generation {
                    debug!(
                        generation,
                        current = self.core.link.generation,
                        "Dropping outcome for stale link"
                    );
                    return;
                }
                self.touch(now);
                self.on_operation(outcome, now);
            }
            SessionEvent::Media(outcome) => self.on_media(outcome),
            SessionEvent::TrackEnded => {
                warn!(
                    session_id = %self.core.session.session_id,
                    "Capture track ended"
                );
                self.core.media.live = false;
            }
            SessionEvent::Activity => {
                self.touch(now);
                if self.core.session.phase == SessionPhase::PostConnection {
                    self.arm_idle(now);
                }
            }
            SessionEvent::RetryMedia => {
                if self.core.media.failed {
                    info!("Retrying media acquisition");
                    self.core.request_media();
                }
            }
            SessionEvent::Hangup => self.end(EndReason::LocalHangup),
            SessionEvent::BrowserClosing => self.end(EndReason::BrowserClosing),
            SessionEvent::TryAgain => debug!("Try again ignored: session still running"),
        }
    }

    /// Run every timer due at or before `now`; returns how many fired
    pub fn handle_timeout(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some((handle, action)) = self.core.timers.pop_due(now) {
            fired += 1;
            self.on_timer(handle, action, now);
        }
        fired
    }

    fn on_matched(&mut self, partner_id: String, room_id: String, now: Instant) {
        if self.core.session.state != SessionState::Idle {
            warn!(%partner_id, "Already matched, ignoring");
            return;
        }
        info!(
            session_id = %self.core.session.session_id,
            %partner_id,
            %room_id,
            initiator = self.core.local_id() < partner_id.as_str(),
            "Matched with partner"
        );
        self.core.session.partner_id = partner_id;
        self.core.session.room_id = room_id;
        self.core.set_state(SessionState::Matched);
        self.start_session(now);
    }

    fn start_session(&mut self, now: Instant) {
        self.arm_inactivity(now);
        self.arm_heartbeat(now);
        let offer = self.core.is_initiator().then_some(OfferIntent {
            ice_restart: false,
            rebuilt: false,
        });
        let relay_only = self.core.session.force_relay();
        self.core.rebuild_link(relay_only, offer);
    }

    fn on_media(&mut self, outcome: MediaOutcome) {
        match outcome {
            MediaOutcome::Acquired { tracks } => {
                info!(tracks, "Media acquired");
                self.core.media_acquired();
            }
            MediaOutcome::Failed(err) => {
                warn!(error = %err, "Media acquisition failed");
                self.core.media_failed();
                let error = Error::MediaAccess(err);
                self.core.record_error(&error.to_string());
                let report = self.core.failure_report(&error);
                self.core.notify(CallNotice::Failure(report));
            }
        }
    }

    fn on_signal(&mut self, signal: InboundSignal, now: Instant) {
        if let Some(from) = signal.sender() {
            if from != self.core.session.partner_id {
                debug!(from, kind = signal.kind(), "Ignoring signal from non-partner");
                return;
            }
        }
        self.touch(now);

        match signal {
            InboundSignal::Offer {
                sdp,
                ice_restart,
                rebuilt,
                ..
            } => self.on_remote_offer(sdp, ice_restart, rebuilt),
            InboundSignal::Answer { sdp, .. } => {
                let link = &self.core.link;
                if !link.exists || link.signaling != SignalingState::HaveLocalOffer {
                    debug!(signaling = ?link.signaling, "Ignoring unexpected answer");
                    return;
                }
                let generation = link.generation;
                self.core.push(Command::ApplyAnswer { generation, sdp });
            }
            InboundSignal::IceCandidate { candidate, .. } => self.on_remote_candidate(candidate),
            InboundSignal::CallEnded => self.end(EndReason::PartnerEnded),
            InboundSignal::PartnerDisconnected => self.end(EndReason::PartnerDisconnected),
            InboundSignal::PartnerTimeout => self.end(EndReason::PartnerTimeout),
            InboundSignal::SessionTimeout => self.end(EndReason::SessionTimeout),
            InboundSignal::PartnerTemporarilyDisconnected => {
                info!("Partner signaling dropped");
                self.core
                    .notify(CallNotice::PartnerTemporarilyDisconnected);
            }
            InboundSignal::PartnerReconnected => {
                info!("Partner signaling restored");
                self.core.notify(CallNotice::PartnerReconnected);
            }
        }
    }

    fn on_remote_offer(&mut self, sdp: String, ice_restart: bool, rebuilt: bool) {
        if !self.core.session.is_matched() {
            debug!("Offer before match, ignoring");
            return;
        }

        let offer = PendingOffer { sdp, ice_restart };

        if rebuilt && self.core.link.exists && self.core.link.remote_description_set {
            // Partner's new link cannot talk to our old one
            info!(
                generation = self.core.link.generation,
                "Partner rebuilt its link, rebuilding ours"
            );
            self.core.hold_offer(offer);
            let relay_only = self.core.session.force_relay();
            let generation = self.core.rebuild_link(relay_only, None);
            self.reconnect
                .adopt_partner_rebuild(&mut self.core, generation);
            return;
        }

        if !self.core.link.exists {
            debug!("Link not built yet, holding offer");
            self.core.hold_offer(offer);
            return;
        }

        let initiator = self.core.is_initiator();
        let link = &mut self.core.link;
        let collision = link.making_offer || link.signaling == SignalingState::HaveLocalOffer;
        if collision && initiator {
            debug!("Offer collision, keeping ours");
            return;
        }
        if collision {
            debug!("Offer collision, rolling back ours");
            link.making_offer = false;
        }
        // A pending retry of our own offer is moot once we answer theirs
        self.pending_retries
            .retain(|_, command| !matches!(command, Command::CreateOffer { .. }));
        let link = &mut self.core.link;
        link.signaling = SignalingState::HaveRemoteOffer;
        let generation = link.generation;
        if offer.ice_restart {
            debug!(generation, "Accepting ICE restart offer");
        }
        self.core.push(Command::AcceptOffer {
            generation,
            sdp: offer.sdp,
            rollback: collision,
        });
    }

    fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        let link = &self.core.link;
        if link.exists && link.remote_description_set {
            let generation = link.generation;
            self.core.push(Command::AddRemoteCandidate {
                generation,
                candidate,
            });
        } else {
            self.core.hold_candidate(candidate);
        }
    }

    fn on_negotiation(&mut self, event: NegotiationEvent, now: Instant) {
        match event {
            NegotiationEvent::StateChanged(state) => {
                debug!(
                    generation = self.core.link.generation,
                    from = ?self.core.link.state,
                    to = ?state,
                    "Link state changed"
                );
                self.core.link.state = state;
                match state {
                    LinkState::Connected => self.on_connected(now),
                    LinkState::Disconnected | LinkState::Failed => self.on_degraded(state, now),
                    _ => {}
                }
            }
            NegotiationEvent::SignalingChanged(signaling) => {
                self.core.link.signaling = signaling;
            }
            NegotiationEvent::CandidateFound(local) => {
                let signal = OutboundSignal::IceCandidate {
                    room_id: self.core.session.room_id.clone(),
                    to: self.core.session.partner_id.clone(),
                    candidate: local.candidate,
                };
                self.core.send(signal);
                if !self.core.link.relay_only {
                    if let Some(network_type) = self.classifier.observe(local.kind) {
                        self.classify(network_type);
                    }
                }
            }
            NegotiationEvent::GatheringComplete => {
                self.core.link.gathering_complete = true;
                self.core.timers.cancel_slot(&mut self.gathering_timer);
                self.finish_classification();
            }
        }
    }

    fn finish_classification(&mut self) {
        if self.core.link.relay_only {
            return;
        }
        if let Some(network_type) = self.classifier.finish() {
            debug!(
                candidates = self.classifier.candidate_count(),
                %network_type,
                "Candidate gathering finished"
            );
            self.classify(network_type);
        }
    }

    fn classify(&mut self, network_type: NetworkType) {
        if self.core.session.network_type == network_type {
            return;
        }
        info!(
            from = %self.core.session.network_type,
            to = %network_type,
            "Network classified"
        );
        self.core.session.network_type = network_type;
        self.core.notify(CallNotice::NetworkClassified(network_type));
    }

    fn on_connected(&mut self, now: Instant) {
        let recovered = self.core.session.ever_connected;

        self.grace.on_recovered(&mut self.core);
        self.restart.on_connected(&mut self.core);
        self.reconnect.on_connected(&mut self.core);
        self.cancel_negotiation_retries();
        self.core.timers.cancel_slot(&mut self.core.setup_timer);

        let session = &mut self.core.session;
        let first = session
            .authority
            .set(now, &mut session.phase, &mut self.core.timers);
        if first {
            // The freeze cancelled everything; these handles are dead
            self.inactivity_timer = None;
            self.heartbeat_timer = None;
            self.idle_timer = None;
            self.gathering_timer = None;
        }

        let session = &mut self.core.session;
        session.ever_connected = true;
        session.last_stable_at = Some(now);
        session.reconnect_attempts = 0;
        session.escalation.reset();

        info!(
            session_id = %session.session_id,
            generation = self.core.link.generation,
            relay_only = self.core.link.relay_only,
            network_type = %session.network_type,
            recovered,
            "Link connected"
        );

        self.core.set_state(SessionState::Connected);
        if !self.is_pending(&self.heartbeat_timer) {
            self.arm_heartbeat(now);
        }
        if !self.is_pending(&self.idle_timer) {
            self.arm_idle(now);
        }
        self.core.notify(CallNotice::Connected { recovered });
    }

    fn on_degraded(&mut self, state: LinkState, now: Instant) {
        if self.core.session.phase == SessionPhase::PostConnection {
            if let Some(kind) = GraceKind::for_state(state) {
                self.grace.on_degradation(&mut self.core, kind, now);
            }
            return;
        }

        if state == LinkState::Failed {
            warn!(
                generation = self.core.link.generation,
                "Link failed before first connection"
            );
            self.repair(now);
        } else {
            debug!("Disconnected before first connection, waiting");
        }
    }

    fn repair(&mut self, now: Instant) {
        let decision = self.restart.request(&mut self.core, now);
        self.after_restart(decision, now);
    }

    fn after_restart(&mut self, decision: RestartDecision, now: Instant) {
        if decision == RestartDecision::Escalate {
            self.restart.abandon(&mut self.core);
            self.full_reconnect(now);
        }
    }

    fn full_reconnect(&mut self, now: Instant) {
        let decision = self.reconnect.request(&mut self.core, now);
        self.after_reconnect(decision);
    }

    fn after_reconnect(&mut self, decision: ReconnectDecision) {
        if decision == ReconnectDecision::Exhausted {
            self.fail_exhausted();
        }
    }

    fn fail_exhausted(&mut self) {
        let error = Error::ExhaustedRetries {
            attempts: self.core.session.reconnect_attempts,
            network_type: self.core.session.network_type,
            relay_only: self.core.session.force_relay(),
            last_error: self
                .core
                .last_error()
                .unwrap_or("link did not recover")
                .to_string(),
        };
        error!(
            session_id = %self.core.session.session_id,
            error = %error,
            "Giving up on the call"
        );
        let report = self.core.failure_report(&error);
        self.core.notify(CallNotice::Failure(report));
        self.end(EndReason::ExhaustedRetries);
    }

    fn on_operation(&mut self, outcome: OperationOutcome, now: Instant) {
        match outcome {
            OperationOutcome::LinkCreated => self.on_link_created(now),
            OperationOutcome::OfferCreated {
                sdp,
                ice_restart,
                rebuilt,
            } => {
                if !self.core.link.making_offer {
                    debug!("Local offer superseded by a remote offer, not sending");
                    return;
                }
                self.negotiation_retries = 0;
                self.core.link.making_offer = false;
                self.core.link.signaling = SignalingState::HaveLocalOffer;
                let signal = OutboundSignal::Offer {
                    room_id: self.core.session.room_id.clone(),
                    to: self.core.session.partner_id.clone(),
                    sdp,
                    ice_restart,
                    rebuilt,
                };
                self.core.send(signal);
            }
            OperationOutcome::AnswerCreated { sdp } => {
                self.negotiation_retries = 0;
                self.remote_description_applied();
                let signal = OutboundSignal::Answer {
                    room_id: self.core.session.room_id.clone(),
                    to: self.core.session.partner_id.clone(),
                    sdp,
                };
                self.core.send(signal);
            }
            OperationOutcome::AnswerApplied => {
                self.negotiation_retries = 0;
                self.remote_description_applied();
            }
            OperationOutcome::CandidateAdded => {}
            OperationOutcome::Failed { command, error } => {
                self.on_operation_failed(*command, error, now)
            }
        }
    }

    fn remote_description_applied(&mut self) {
        self.core.link.signaling = SignalingState::Stable;
        self.core.link.remote_description_set = true;
        let flushed = self.core.flush_candidates();
        if flushed > 0 {
            debug!(flushed, "Applied held remote candidates");
        }
    }

    fn on_link_created(&mut self, now: Instant) {
        let generation = self.core.link.generation;
        if !self.core.link.pending {
            debug!(generation, "Duplicate link creation, ignoring");
            return;
        }
        self.core.link.pending = false;
        self.core.link.exists = true;
        self.classifier = NetworkClassifier::new();
        self.reconnect.on_link_created(&mut self.core, generation);

        if self.core.session.phase == SessionPhase::PreConnection {
            self.core.timers.cancel_slot(&mut self.gathering_timer);
            let restrictive = self.core.link.relay_only
                || self.core.session.network_type == NetworkType::Restrictive;
            self.gathering_timer = self.core.timers.register(
                TimerAction::IceGatheringTimeout { generation },
                self.core.timing.ice_gathering_timeout(restrictive),
                "ice-gathering",
                now,
            );

            if self.core.session.state == SessionState::Matched {
                self.core.set_state(SessionState::Connecting);
            }
            if self.core.setup_timer.is_none() {
                self.core.setup_timer = self.core.timers.register(
                    TimerAction::InitialConnectionTimeout,
                    self.core.timing.initial_connection_timeout(),
                    "initial-connection",
                    now,
                );
            }
        }

        debug!(generation, "Link ready");

        if let Some(offer) = self.core.take_held_offer() {
            // Answering the partner supersedes any offer of our own
            self.core.take_next_offer();
            self.core.link.signaling = SignalingState::HaveRemoteOffer;
            self.core.push(Command::AcceptOffer {
                generation,
                sdp: offer.sdp,
                rollback: false,
            });
        } else if let Some(intent) = self.core.take_next_offer() {
            self.core.link.making_offer = true;
            self.core.push(Command::CreateOffer {
                generation,
                ice_restart: intent.ice_restart,
                rebuilt: intent.rebuilt,
            });
        }
    }

    fn on_operation_failed(&mut self, command: Command, error: String, now: Instant) {
        let generation = self.core.link.generation;
        let op = command.negotiation_op();
        warn!(
            generation,
            ?op,
            error = %error,
            "Link operation failed"
        );
        self.core.record_error(&error);

        if op == Some(NegotiationOp::CreateLink) && self.reconnect.is_inflight(generation) {
            let decision = self
                .reconnect
                .on_step_failed(&mut self.core, &error, now);
            self.after_reconnect(decision);
            return;
        }
        if op == Some(NegotiationOp::CreateOffer) {
            if !self.core.link.making_offer {
                debug!(generation, "Failed offer was already superseded by a remote offer");
                return;
            }
            self.core.link.making_offer = false;
        }

        self.negotiation_retries += 1;
        let retry = self.negotiation_retries;
        if retry <= self.core.timing.max_negotiation_retries {
            let delay = Duration::from_millis(delay_ms(
                retry,
                self.core.timing.negotiation_retry_initial_ms,
                self.core.timing.negotiation_retry_max_ms,
            ));
            if let Some(timer) = self.core.timers.register(
                TimerAction::NegotiationRetry { retry },
                delay,
                "negotiation:retry",
                now,
            ) {
                debug!(retry, delay_ms = delay.as_millis() as u64, "Retrying link operation");
                self.pending_retries.insert(timer.id(), command);
            }
            return;
        }

        self.negotiation_retries = 0;
        let failure = Error::NegotiationFailed(error);
        let report = self.core.failure_report(&failure);
        self.core.notify(CallNotice::Failure(report));
        self.restart.abandon(&mut self.core);
        self.full_reconnect(now);
    }

    fn cancel_negotiation_retries(&mut self) {
        self.negotiation_retries = 0;
        self.pending_retries.clear();
        self.core
            .timers
            .cancel_matching(|action| matches!(action, TimerAction::NegotiationRetry { .. }));
    }

    fn on_timer(&mut self, handle: TimerHandle, action: TimerAction, now: Instant) {
        match action {
            TimerAction::InitialConnectionTimeout => {
                self.core.setup_timer = None;
                self.on_setup_deadline(0, now);
            }
            TimerAction::SetupExtension { extension } => {
                self.core.setup_timer = None;
                self.on_setup_deadline(extension, now);
            }
            TimerAction::IceGatheringTimeout { generation } => {
                self.gathering_timer = None;
                if generation != self.core.link.generation || self.core.link.gathering_complete {
                    return;
                }
                debug!(generation, "Candidate gathering timed out");
                self.core.link.gathering_complete = true;
                self.finish_classification();
            }
            TimerAction::SessionInactivity => {
                self.inactivity_timer = None;
                warn!(
                    session_id = %self.core.session.session_id,
                    "No activity before connecting, ending session"
                );
                self.end(EndReason::Inactive);
            }
            TimerAction::GraceExpiry(kind) => {
                if self.grace.on_expiry(&mut self.core, kind) == GraceExpiry::Repair {
                    self.repair(now);
                }
            }
            TimerAction::StabilityCheck => {
                let decision = self.restart.on_stability_check(&mut self.core, now);
                self.after_restart(decision, now);
            }
            TimerAction::RestartCompletion { attempt } => {
                let decision = self
                    .restart
                    .on_completion_timeout(&mut self.core, attempt, now);
                self.after_restart(decision, now);
            }
            TimerAction::RestartRetry => {
                let decision = self.restart.on_retry_due(&mut self.core, now);
                self.after_restart(decision, now);
            }
            TimerAction::ReconnectAttempt { attempt } => {
                self.reconnect.on_attempt_due(&mut self.core, attempt, now);
            }
            TimerAction::NegotiationRetry { retry } => {
                let Some(command) = self.pending_retries.remove(&handle.id()) else {
                    return;
                };
                if command.generation() != Some(self.core.link.generation) {
                    debug!(retry, "Dropping retry for replaced link");
                    return;
                }
                if let Command::CreateOffer { .. } = command {
                    self.core.link.making_offer = true;
                }
                debug!(retry, "Re-issuing link operation");
                self.core.push(command);
            }
            TimerAction::Heartbeat => {
                self.heartbeat_timer = None;
                let signal = OutboundSignal::Heartbeat {
                    room_id: self.core.session.room_id.clone(),
                };
                self.core.send(signal);
                self.arm_heartbeat(now);
            }
            TimerAction::ActiveCallInactivity => {
                self.idle_timer = None;
                info!("No activity on the call");
                self.core.notify(CallNotice::Idle);
                self.arm_idle(now);
            }
        }
    }

    /// Setup deadline reached without a connection
    ///
    /// Slow is not failed: unless the link reported a genuine failure the
    /// deadline moves out by a growing extension.
    fn on_setup_deadline(&mut self, extensions_done: u32, now: Instant) {
        if self.core.session.ever_connected {
            return;
        }

        if self.core.link.state == LinkState::Failed {
            warn!(
                generation = self.core.link.generation,
                "Setup deadline reached with a failed link"
            );
            self.repair(now);
            return;
        }

        let extension = extensions_done + 1;
        let delay = Duration::from_millis(delay_ms(
            extension,
            self.core.timing.connection_setup_extension_ms,
            self.core.timing.max_setup_extension_ms,
        ));
        self.core.setup_timer = self.core.timers.register(
            TimerAction::SetupExtension { extension },
            delay,
            "setup-extension",
            now,
        );
        info!(
            extension,
            delay_ms = delay.as_millis() as u64,
            link_state = ?self.core.link.state,
            "Connection setup still in progress, extending"
        );
        self.core
            .notify(CallNotice::SetupExtended { extension, delay });
    }

    /// Inbound activity keeps an unconnected session alive
    fn touch(&mut self, now: Instant) {
        if self.core.session.phase == SessionPhase::PreConnection {
            self.arm_inactivity(now);
        }
    }

    fn arm_inactivity(&mut self, now: Instant) {
        self.core.timers.cancel_slot(&mut self.inactivity_timer);
        self.inactivity_timer = self.core.timers.register(
            TimerAction::SessionInactivity,
            self.core.timing.session_inactivity_timeout(),
            "session-inactivity",
            now,
        );
    }

    fn arm_heartbeat(&mut self, now: Instant) {
        self.core.timers.cancel_slot(&mut self.heartbeat_timer);
        self.heartbeat_timer = self.core.timers.register(
            TimerAction::Heartbeat,
            self.core.timing.heartbeat_interval(),
            "heartbeat",
            now,
        );
    }

    fn arm_idle(&mut self, now: Instant) {
        self.core.timers.cancel_slot(&mut self.idle_timer);
        self.idle_timer = self.core.timers.register(
            TimerAction::ActiveCallInactivity,
            self.core.timing.active_call_inactivity_timeout(),
            "active-call-inactivity",
            now,
        );
    }

    fn is_pending(&self, slot: &Option<TimerHandle>) -> bool {
        slot.as_ref()
            .is_some_and(|handle| self.core.timers.is_pending(handle))
    }

    /// Terminal; only [`SessionEvent::TryAgain`] leaves this
    fn end(&mut self, reason: EndReason) {
        if self.is_ended() {
            return;
        }
        info!(
            session_id = %self.core.session.session_id,
            ?reason,
            reconnect_attempts = self.core.session.reconnect_attempts,
            restarts = self.core.session.negotiation_restart_attempts,
            "Session ending"
        );

        let room_id = self.core.session.room_id.clone();
        let partner_id = self.core.session.partner_id.clone();
        if self.core.session.is_matched() {
            match reason {
                EndReason::LocalHangup | EndReason::ExhaustedRetries | EndReason::Inactive => {
                    self.core.send(OutboundSignal::EndCall {
                        room_id,
                        to: partner_id,
                    });
                }
                EndReason::BrowserClosing => {
                    self.core.send(OutboundSignal::BrowserClosing { room_id });
                }
                _ => {}
            }
        }

        self.core.timers.shutdown();
        self.inactivity_timer = None;
        self.heartbeat_timer = None;
        self.idle_timer = None;
        self.gathering_timer = None;
        self.core.setup_timer = None;
        self.pending_retries.clear();
        self.negotiation_retries = 0;
        self.grace = GracePeriodHandler::new();
        self.restart = NegotiationRestartCoordinator::new();
        self.reconnect = ReconnectionOrchestrator::new();

        if let Some(generation) = self.core.drop_link() {
            self.core.push(Command::CloseLink { generation });
        }
        self.core.push(Command::StopMedia);
        self.core.media.live = false;
        self.core.media.acquiring = false;

        self.core.set_state(SessionState::Ended);
        self.core.notify(CallNotice::Ended(reason));
    }

    /// Start a fresh session with the same partner and room
    fn try_again(&mut self, now: Instant) {
        if !self.core.session.is_matched() {
            debug!("Try again without a partner, ignoring");
            return;
        }
        info!(
            previous_session = %self.core.session.session_id,
            "Starting over with the same partner"
        );
        self.core.session.renew();
        self.core.timers = TimerRegistry::new();
        self.core.clear_negotiation();
        self.core.media = Default::default();
        self.classifier = NetworkClassifier::new();
        self.core.set_state(SessionState::Matched);
        self.start_session(now);
    }
}
