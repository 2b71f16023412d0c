//! Lightweight in-place repair before full teardown
//!
//! The first repair of a session is an ICE restart on the existing link.
//! Every later one (or the first, on a restrictive network) replaces the
//! link in relay-only mode. After `max_ice_restart_attempts` retries the
//! coordinator hands over to the reconnection orchestrator.

use super::backoff::BackoffCalculator;
use super::timers::{TimerAction, TimerHandle};
use super::EscalationLevel;
use crate::session::context::OfferIntent;
use crate::session::{CallNotice, Command, NetworkType, SessionCore};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of a restart request or timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Authority set and link healthy; nothing to repair
    Blocked,
    /// A full reconnection is in flight
    Reconnecting,
    /// A restart is already in flight
    InProgress,
    /// Negotiation not stable yet; a stability check is armed
    Deferred {
        /// 1-indexed check number
        check: u32,
    },
    /// ICE restart offer requested
    IceRestart {
        /// Restart attempt (0 is the first)
        attempt: u32,
    },
    /// Link replaced in relay-only mode
    RelayRebuild {
        /// Restart attempt
        attempt: u32,
    },
    /// Restart timed out; another one is scheduled
    Scheduled {
        /// Attempt that will run
        attempt: u32,
        /// Wait before it runs
        delay: Duration,
    },
    /// The restart completed (link healthy at timeout)
    Healthy,
    /// Timeout for a superseded attempt
    Stale,
    /// Repair budget used up; hand over to full reconnection
    Escalate,
}

/// Attempts lightweight repair of the current link
#[derive(Debug, Default)]
pub struct NegotiationRestartCoordinator {
    attempt: u32,
    in_progress: bool,
    stability_checks: u32,
    completion_timer: Option<TimerHandle>,
    retry_timer: Option<TimerHandle>,
    stability_timer: Option<TimerHandle>,
}

impl NegotiationRestartCoordinator {
    /// Create a coordinator at attempt 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Current attempt counter
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether a restart is in flight
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// Try to repair the link
    pub fn request(&mut self, core: &mut SessionCore, now: Instant) -> RestartDecision {
        if core.blocks_recovery() {
            debug!("Restart rejected: link healthy");
            return RestartDecision::Blocked;
        }
        if core.session.is_reconnecting {
            debug!("Restart rejected: full reconnection in flight");
            return RestartDecision::Reconnecting;
        }
        if self.in_progress {
            debug!(attempt = self.attempt, "Restart rejected: already in progress");
            return RestartDecision::InProgress;
        }

        core.timers.cancel_slot(&mut self.retry_timer);

        if !core.link.exists || core.link.is_negotiating() {
            return self.defer(core, now);
        }
        self.stability_checks = 0;
        core.timers.cancel_slot(&mut self.stability_timer);

        if self.attempt > core.timing.max_ice_restart_attempts {
            warn!(attempt = self.attempt, "Restart budget exhausted");
            return RestartDecision::Escalate;
        }

        let attempt = self.attempt;
        // Only the first repair of the whole session gets a plain ICE restart
        let force_relay = core.session.network_type == NetworkType::Restrictive
            || attempt > 0
            || core.session.negotiation_restart_attempts > 0
            || core.session.force_relay();

        self.in_progress = true;
        core.session.negotiation_restart_attempts += 1;

        let decision = if force_relay {
            if core.session.escalate_relay() {
                info!(session_id = %core.session.session_id, "Relay-only mode engaged");
            }
            core.session.escalation.promote(EscalationLevel::RelayRebuild);
            core.rebuild_link(
                true,
                Some(OfferIntent {
                    ice_restart: false,
                    rebuilt: true,
                }),
            );
            RestartDecision::RelayRebuild { attempt }
        } else {
            core.session.escalation.promote(EscalationLevel::IceRestart);
            core.link.making_offer = true;
            core.push(Command::CreateOffer {
                generation: core.link.generation,
                ice_restart: true,
                rebuilt: false,
            });
            RestartDecision::IceRestart { attempt }
        };

        info!(
            session_id = %core.session.session_id,
            attempt,
            ?decision,
            "Link repair started"
        );

        core.notify(CallNotice::Recovering {
            level: core.session.escalation,
            attempt,
            delay: Duration::ZERO,
        });

        self.completion_timer = core.timers.register(
            TimerAction::RestartCompletion { attempt },
            core.timing.ice_restart_timeout(),
            "restart:completion",
            now,
        );

        decision
    }

    fn defer(&mut self, core: &mut SessionCore, now: Instant) -> RestartDecision {
        if self.stability_checks >= core.timing.max_stability_checks {
            warn!(
                checks = self.stability_checks,
                "Negotiation never stabilised, escalating"
            );
            self.stability_checks = 0;
            return RestartDecision::Escalate;
        }

        self.stability_checks += 1;
        core.timers.cancel_slot(&mut self.stability_timer);
        self.stability_timer = core.timers.register(
            TimerAction::StabilityCheck,
            core.timing.stability_check_interval(),
            "restart:stability",
            now,
        );
        debug!(
            check = self.stability_checks,
            signaling = ?core.link.signaling,
            "Restart deferred until negotiation is stable"
        );
        RestartDecision::Deferred {
            check: self.stability_checks,
        }
    }

    /// A stability check fired
    pub fn on_stability_check(&mut self, core: &mut SessionCore, now: Instant) -> RestartDecision {
        self.stability_timer = None;
        self.request(core, now)
    }

    /// A restart retry backoff elapsed
    pub fn on_retry_due(&mut self, core: &mut SessionCore, now: Instant) -> RestartDecision {
        self.retry_timer = None;
        self.request(core, now)
    }

    /// The completion window of `attempt` elapsed
    pub fn on_completion_timeout(
        &mut self,
        core: &mut SessionCore,
        attempt: u32,
        now: Instant,
    ) -> RestartDecision {
        self.completion_timer = None;
        if attempt != self.attempt || !self.in_progress {
            return RestartDecision::Stale;
        }
        self.in_progress = false;

        if core.link.is_connected() {
            return RestartDecision::Healthy;
        }

        if self.attempt < core.timing.max_ice_restart_attempts {
            self.attempt += 1;
            let backoff = BackoffCalculator::new(
                core.timing.ice_restart_backoff_initial_ms,
                core.timing.ice_restart_backoff_max_ms,
            );
            let delay = backoff.delay(self.attempt);
            warn!(
                session_id = %core.session.session_id,
                next_attempt = self.attempt,
                delay_ms = delay.as_millis() as u64,
                "Link repair timed out, retrying"
            );
            self.retry_timer =
                core.timers
                    .register(TimerAction::RestartRetry, delay, "restart:retry", now);
            return RestartDecision::Scheduled {
                attempt: self.attempt,
                delay,
            };
        }

        self.attempt += 1;
        warn!(
            session_id = %core.session.session_id,
            "Link repair attempts exhausted"
        );
        RestartDecision::Escalate
    }

    /// Stop tracking the in-flight repair; the orchestrator owns the link now
    pub fn abandon(&mut self, core: &mut SessionCore) {
        self.in_progress = false;
        self.stability_checks = 0;
        core.timers.cancel_slot(&mut self.completion_timer);
        core.timers.cancel_slot(&mut self.retry_timer);
        core.timers.cancel_slot(&mut self.stability_timer);
    }

    /// The link is healthy; start the next episode from attempt 0
    pub fn on_connected(&mut self, core: &mut SessionCore) {
        if self.in_progress || self.attempt > 0 {
            info!(attempt = self.attempt, "Link repair succeeded");
        }
        self.abandon(core);
        self.attempt = 0;
    }
}
