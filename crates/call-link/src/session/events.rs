//! Messages in and out of the state machine
//!
//! Everything that happens to a session arrives as a [`SessionEvent`];
//! everything the session wants done leaves as a [`Command`]. Commands that
//! touch a link carry the generation they were issued for so the driver can
//! refuse to run them against a replacement.

use crate::error::{FailureReport, MediaAccessError};
use crate::lifecycle::EscalationLevel;
use crate::peer::{LinkState, NegotiationEvent};
use crate::session::{EndReason, NetworkType, SessionState};
use crate::signaling::protocol::{IceCandidate, InboundSignal, OutboundSignal};
use std::time::Duration;

/// Input to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The rendezvous paired us with a partner
    Matched {
        /// Partner peer id
        partner_id: String,
        /// Room shared with the partner
        room_id: String,
    },
    /// Message from the signaling server
    Signal(InboundSignal),
    /// Callback from a link
    Negotiation {
        /// Generation of the link that produced it
        generation: u64,
        /// The callback
        event: NegotiationEvent,
    },
    /// Result of an asynchronous link operation
    Operation {
        /// Generation the operation was issued for
        generation: u64,
        /// The result
        outcome: OperationOutcome,
    },
    /// Result of a capture request
    Media(MediaOutcome),
    /// A capture track ended on its own
    TrackEnded,
    /// Application-level activity (input, UI interaction)
    Activity,
    /// User asked to retry capture after a media failure
    RetryMedia,
    /// User hung up
    Hangup,
    /// Local process is going away
    BrowserClosing,
    /// User asked to start over after the session ended
    TryAgain,
}

/// Capture request result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaOutcome {
    /// Stream ready
    Acquired {
        /// Number of tracks in the stream
        tracks: usize,
    },
    /// Capture refused or impossible
    Failed(MediaAccessError),
}

/// Link operations that can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOp {
    /// Building the link
    CreateLink,
    /// Creating and applying a local offer
    CreateOffer,
    /// Applying a remote offer and answering it
    AcceptOffer,
    /// Applying a remote answer
    ApplyAnswer,
    /// Adding a remote candidate
    AddCandidate,
}

/// Result of an asynchronous link operation
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    /// Link built and capture tracks attached
    LinkCreated,
    /// Local offer applied
    OfferCreated {
        /// Offer SDP
        sdp: String,
        /// Offer restarts ICE
        ice_restart: bool,
        /// Offer follows a link replacement
        rebuilt: bool,
    },
    /// Remote offer applied and local answer applied
    AnswerCreated {
        /// Answer SDP
        sdp: String,
    },
    /// Remote answer applied
    AnswerApplied,
    /// Remote candidate added
    CandidateAdded,
    /// Operation failed
    Failed {
        /// The command that failed, for retrying
        command: Box<Command>,
        /// Error text
        error: String,
    },
}

/// Side effect requested by the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Acquire a capture stream
    AcquireMedia,
    /// Stop the capture stream
    StopMedia,
    /// Build a link for `generation`
    CreatePeerLink {
        /// Generation of the new link
        generation: u64,
        /// Only use relay candidates
        relay_only: bool,
    },
    /// Create and apply a local offer
    CreateOffer {
        /// Link generation
        generation: u64,
        /// Restart ICE
        ice_restart: bool,
        /// Mark the offer as following a link replacement
        rebuilt: bool,
    },
    /// Apply a remote offer and answer it
    AcceptOffer {
        /// Link generation
        generation: u64,
        /// Offer SDP
        sdp: String,
        /// Roll back a pending local offer first
        rollback: bool,
    },
    /// Apply a remote answer
    ApplyAnswer {
        /// Link generation
        generation: u64,
        /// Answer SDP
        sdp: String,
    },
    /// Add a remote candidate
    AddRemoteCandidate {
        /// Link generation
        generation: u64,
        /// Candidate payload
        candidate: IceCandidate,
    },
    /// Close a link; idempotent
    CloseLink {
        /// Link generation
        generation: u64,
    },
    /// Send a signaling message
    Send(OutboundSignal),
    /// Report something to the caller
    Notify(CallNotice),
}

impl Command {
    /// Link operation this command performs, if any
    pub fn negotiation_op(&self) -> Option<NegotiationOp> {
        match self {
            Command::CreatePeerLink { .. } => Some(NegotiationOp::CreateLink),
            Command::CreateOffer { .. } => Some(NegotiationOp::CreateOffer),
            Command::AcceptOffer { .. } => Some(NegotiationOp::AcceptOffer),
            Command::ApplyAnswer { .. } => Some(NegotiationOp::ApplyAnswer),
            Command::AddRemoteCandidate { .. } => Some(NegotiationOp::AddCandidate),
            _ => None,
        }
    }

    /// Link generation a command targets, if any
    pub fn generation(&self) -> Option<u64> {
        match self {
            Command::CreatePeerLink { generation, .. }
            | Command::CreateOffer { generation, .. }
            | Command::AcceptOffer { generation, .. }
            | Command::ApplyAnswer { generation, .. }
            | Command::AddRemoteCandidate { generation, .. }
            | Command::CloseLink { generation } => Some(*generation),
            _ => None,
        }
    }
}

/// Caller-visible notification
#[derive(Debug, Clone, PartialEq)]
pub enum CallNotice {
    /// Session state changed
    StateChanged(SessionState),
    /// Link became healthy
    Connected {
        /// Healthy again after a degradation
        recovered: bool,
    },
    /// A healthy link reported trouble; recovery may follow
    Degraded(LinkState),
    /// A recovery step started
    Recovering {
        /// Rung of the ladder
        level: EscalationLevel,
        /// Attempt number within that rung
        attempt: u32,
        /// Wait before the step runs
        delay: Duration,
    },
    /// Network classification changed
    NetworkClassified(NetworkType),
    /// Setup is slow but progressing; the deadline moved
    SetupExtended {
        /// 1-indexed extension number
        extension: u32,
        /// Length of this extension
        delay: Duration,
    },
    /// No application activity on the established call for a while
    Idle,
    /// Partner's signaling dropped but may come back
    PartnerTemporarilyDisconnected,
    /// Partner's signaling came back
    PartnerReconnected,
    /// Caller-visible failure
    Failure(FailureReport),
    /// Session ended
    Ended(EndReason),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_generation() {
        assert_eq!(
            Command::CloseLink { generation: 4 }.generation(),
            Some(4)
        );
        assert_eq!(Command::AcquireMedia.generation(), None);
        assert_eq!(
            Command::ApplyAnswer {
                generation: 2,
                sdp: String::new()
            }
            .negotiation_op(),
            Some(NegotiationOp::ApplyAnswer)
        );
        assert_eq!(Command::StopMedia.negotiation_op(), None);
        assert_eq!(
            Command::Notify(CallNotice::Idle).generation(),
            None
        );
    }
}
