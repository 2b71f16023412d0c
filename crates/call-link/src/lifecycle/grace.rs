//! Grace windows for momentary degradation on an established call

use super::timers::{TimerAction, TimerHandle};
use super::EscalationLevel;
use crate::peer::LinkState;
use crate::session::{CallNotice, SessionCore, SessionPhase, SessionState};
use crate::Error;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Kind of degradation signal a window absorbs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraceKind {
    /// Link reported disconnected
    Disconnection,
    /// Link reported failed
    NegotiationFailure,
}

impl GraceKind {
    /// Kind matching a degraded link state
    pub fn for_state(state: LinkState) -> Option<Self> {
        match state {
            LinkState::Disconnected => Some(GraceKind::Disconnection),
            LinkState::Failed => Some(GraceKind::NegotiationFailure),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            GraceKind::Disconnection => "grace:disconnection",
            GraceKind::NegotiationFailure => "grace:negotiation-failure",
        }
    }

    fn index(&self) -> usize {
        match self {
            GraceKind::Disconnection => 0,
            GraceKind::NegotiationFailure => 1,
        }
    }
}

/// One open window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraceWindow {
    /// What it absorbs
    pub kind: GraceKind,
    /// When it opened
    pub started_at: Instant,
    /// How long it stays open
    pub duration: Duration,
    /// Expiry timer
    pub timer: TimerHandle,
}

/// What happened to a degradation signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraceDecision {
    /// Never connected or no authority; the setup path handles it
    NotEstablished,
    /// A window of this kind is already open
    AlreadyOpen,
    /// A window was opened
    Opened,
    /// The registry refused the timer (session ended)
    Refused,
}

/// What an expired window asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraceExpiry {
    /// The link recovered meanwhile; nothing to do
    Recovered,
    /// Still degraded; start a repair
    Repair,
    /// No window of that kind was open (stale expiry)
    Stale,
}

/// Absorbs degradation signals for a bounded window before escalating
#[derive(Debug, Default)]
pub struct GracePeriodHandler {
    windows: [Option<GraceWindow>; 2],
}

impl GracePeriodHandler {
    /// Create a handler with no open window
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle a degradation signal of `kind`
    pub fn on_degradation(
        &mut self,
        core: &mut SessionCore,
        kind: GraceKind,
        now: Instant,
    ) -> GraceDecision {
        if core.session.phase != SessionPhase::PostConnection || !core.session.authority.get() {
            debug!(?kind, "Degradation before first connection, not opening a grace window");
            return GraceDecision::NotEstablished;
        }

        if self.windows[kind.index()].is_some() {
            debug!(?kind, "Grace window already open");
            return GraceDecision::AlreadyOpen;
        }

        let duration = match kind {
            GraceKind::Disconnection => {
                Duration::from_millis(core.timing.disconnection_grace_period_ms)
            }
            GraceKind::NegotiationFailure => {
                Duration::from_millis(core.timing.ice_failure_grace_period_ms)
            }
        };

        let Some(timer) =
            core.timers
                .register(TimerAction::GraceExpiry(kind), duration, kind.label(), now)
        else {
            return GraceDecision::Refused;
        };

        core.session.escalation.promote(EscalationLevel::GraceWindow);
        warn!(
            session_id = %core.session.session_id,
            ?kind,
            duration_ms = duration.as_millis() as u64,
            "Link degraded, grace window opened"
        );

        self.windows[kind.index()] = Some(GraceWindow {
            kind,
            started_at: now,
            duration,
            timer,
        });
        GraceDecision::Opened
    }

    /// The link is healthy again; close every window without acting
    pub fn on_recovered(&mut self, core: &mut SessionCore) -> usize {
        let mut closed = 0;
        for slot in self.windows.iter_mut() {
            if let Some(window) = slot.take() {
                core.timers.cancel(&window.timer);
                closed += 1;
            }
        }
        if closed > 0 {
            info!(
                session_id = %core.session.session_id,
                closed,
                "Link recovered within grace window"
            );
        }
        closed
    }

    /// A window's timer fired
    pub fn on_expiry(&mut self, core: &mut SessionCore, kind: GraceKind) -> GraceExpiry {
        let Some(window) = self.windows[kind.index()].take() else {
            return GraceExpiry::Stale;
        };

        if !core.link.is_degraded() {
            debug!(?kind, "Grace window expired after natural recovery");
            return GraceExpiry::Recovered;
        }

        // One repair per episode: the other window has nothing left to add
        for slot in self.windows.iter_mut() {
            if let Some(other) = slot.take() {
                core.timers.cancel(&other.timer);
            }
        }

        let state = if core.link.state == LinkState::Failed {
            SessionState::Failed
        } else {
            SessionState::Disconnected
        };
        warn!(
            session_id = %core.session.session_id,
            ?kind,
            elapsed_ms = window.duration.as_millis() as u64,
            "Grace window expired while degraded"
        );
        // Becomes the last error of an exhaustion report if repair never succeeds
        let error = Error::TransientDegradation(format!(
            "link {:?} for {} ms",
            core.link.state,
            window.duration.as_millis()
        ));
        core.record_error(&error.to_string());
        core.set_state(state);
        core.notify(CallNotice::Degraded(core.link.state));
        GraceExpiry::Repair
    }

    /// Whether a window of `kind` is open
    pub fn is_open(&self, kind: GraceKind) -> bool {
        self.windows[kind.index()].is_some()
    }

    /// The open window of `kind`
    pub fn window(&self, kind: GraceKind) -> Option<&GraceWindow> {
        self.windows[kind.index()].as_ref()
    }
}
