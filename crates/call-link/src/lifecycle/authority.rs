//! "Has this session ever been healthy" flag

use super::timers::TimerRegistry;
use crate::session::SessionPhase;
use tokio::time::Instant;
use tracing::info;

/// Write-once-per-session record of the first healthy connection
///
/// Setting it freezes the timer registry, so nothing scheduled while the
/// session was still trying to connect can act afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionAuthority {
    established_at: Option<Instant>,
}

impl ConnectionAuthority {
    /// Create an unset flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the first healthy connection
    ///
    /// The first call freezes `timers` and moves the session to
    /// post-connection. Later calls change nothing and return false.
    pub fn set(
        &mut self,
        now: Instant,
        phase: &mut SessionPhase,
        timers: &mut TimerRegistry,
    ) -> bool {
        if !self.set_at(now) {
            return false;
        }

        let cancelled = timers.freeze_all();
        *phase = SessionPhase::PostConnection;
        info!(cancelled, "Connection authority established");
        true
    }

    /// Flip the flag without touching timers or phase
    pub fn set_at(&mut self, now: Instant) -> bool {
        if self.established_at.is_some() {
            return false;
        }
        self.established_at = Some(now);
        true
    }

    /// Whether the session has ever been healthy
    pub fn get(&self) -> bool {
        self.established_at.is_some()
    }

    /// When the flag was set
    pub fn established_at(&self) -> Option<Instant> {
        self.established_at
    }

    /// Clear the flag for a brand-new session
    pub fn reset(&mut self) {
        self.established_at = None;
    }
}
