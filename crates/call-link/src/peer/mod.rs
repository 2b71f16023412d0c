//! Negotiation library seam
//!
//! The lifecycle core never touches `webrtc` directly. It issues commands
//! that the driver executes against a [`PeerLink`], and it consumes the
//! link's callbacks as closed [`NegotiationEvent`] variants tagged with the
//! link generation that produced them.

pub mod connection;

pub use connection::{RtcPeerLink, RtcPeerLinkFactory};

use crate::media::MediaStream;
use crate::session::events::SessionEvent;
use crate::signaling::protocol::IceCandidate;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connection state reported by the negotiation library
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created, nothing negotiated yet
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media path established
    Connected,
    /// Connectivity lost, may come back on its own
    Disconnected,
    /// Connectivity checks failed
    Failed,
    /// Closed locally
    Closed,
}

impl LinkState {
    /// Whether the state calls for recovery
    pub fn is_degraded(&self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Failed)
    }
}

/// Offer/answer sub-state of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No exchange in progress
    Stable,
    /// Local offer applied, waiting for an answer
    HaveLocalOffer,
    /// Remote offer applied, answer not yet applied
    HaveRemoteOffer,
    /// Link closed
    Closed,
}

/// Kind of a locally gathered candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    /// Local interface address
    Host,
    /// Address learned from a STUN server
    ServerReflexive,
    /// Address learned from a connectivity check
    PeerReflexive,
    /// Address allocated on a TURN server
    Relay,
}

/// Locally gathered candidate, ready to trickle to the partner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCandidate {
    /// Wire form
    pub candidate: IceCandidate,
    /// Candidate kind, used for network classification
    pub kind: CandidateType,
}

/// Callbacks from the negotiation library
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEvent {
    /// Connection state changed
    StateChanged(LinkState),
    /// Signaling sub-state changed
    SignalingChanged(SignalingState),
    /// A local candidate was gathered
    CandidateFound(LocalCandidate),
    /// Candidate gathering finished
    GatheringComplete,
}

/// Parameters for building one link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkOptions {
    /// Generation the link belongs to
    pub generation: u64,
    /// Only gather and use relay candidates
    pub relay_only: bool,
}

/// Delivers a link's callbacks to the session queue
///
/// Every event is tagged with the generation the sink was created for, so
/// callbacks from a replaced link are recognisable and dropped.
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl LinkEventSink {
    /// Create a sink for one link generation
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { generation, tx }
    }

    /// Generation this sink tags events with
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Forward an event; returns false once the session queue is gone
    pub fn emit(&self, event: NegotiationEvent) -> bool {
        self.tx
            .send(SessionEvent::Negotiation {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// One negotiation-library connection object
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Generation this link was built for
    fn generation(&self) -> u64;

    /// Create an offer, apply it locally and return its SDP
    async fn create_offer(&self, ice_restart: bool) -> Result<String>;

    /// Apply a remote offer (rolling back a local one first if asked),
    /// create and apply an answer, and return its SDP
    async fn accept_offer(&self, sdp: String, rollback: bool) -> Result<String>;

    /// Apply a remote answer
    async fn apply_answer(&self, sdp: String) -> Result<()>;

    /// Add a remote trickle candidate
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Attach the tracks of a capture stream
    async fn attach_stream(&self, stream: &MediaStream) -> Result<()>;

    /// Close the link; idempotent
    async fn close(&self) -> Result<()>;
}

/// Builds links
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    /// Build a link whose callbacks go to `events`
    async fn create(&self, options: LinkOptions, events: LinkEventSink)
        -> Result<Arc<dyn PeerLink>>;
}
