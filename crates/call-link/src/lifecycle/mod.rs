//! Connection lifecycle components
//!
//! Leaves first: [`BackoffCalculator`] and [`TimerRegistry`] know nothing
//! about calls; [`ConnectionAuthority`] freezes the registry; the grace,
//! restart and reconnection components act on a [`SessionCore`] and are
//! sequenced by the state machine.
//!
//! [`SessionCore`]: crate::session::SessionCore

pub mod authority;
pub mod backoff;
pub mod grace;
pub mod reconnect;
pub mod restart;
pub mod timers;

pub use authority::ConnectionAuthority;
pub use backoff::{delay_ms, BackoffCalculator, BACKOFF_MULTIPLIER};
pub use grace::{GraceDecision, GraceExpiry, GraceKind, GracePeriodHandler, GraceWindow};
pub use reconnect::{ReconnectDecision, ReconnectionOrchestrator};
pub use restart::{NegotiationRestartCoordinator, RestartDecision};
pub use timers::{TimerAction, TimerHandle, TimerId, TimerRegistry, TimerScope};

use serde::Serialize;

/// Rungs of the recovery ladder, in escalation order
///
/// Within one degradation episode the level only moves up; a healthy
/// connection drops it back to `Stable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    /// Nothing wrong
    Stable,
    /// Waiting out a degradation signal
    GraceWindow,
    /// In-place ICE restart
    IceRestart,
    /// Link replaced in relay-only mode
    RelayRebuild,
    /// Full reconnection with backoff
    FullReconnect,
    /// Every attempt used up
    Exhausted,
}

impl EscalationLevel {
    /// Move up to `level`; returns whether the level changed
    pub fn promote(&mut self, level: EscalationLevel) -> bool {
        if level > *self {
            *self = level;
            true
        } else {
            false
        }
    }

    /// Drop back to `Stable`
    pub fn reset(&mut self) {
        *self = EscalationLevel::Stable;
    }
}
