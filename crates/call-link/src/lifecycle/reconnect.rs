//! Full link recreation with bounded retries

use super::backoff::{delay_ms, BackoffCalculator};
use super::timers::{TimerAction, TimerHandle};
use super::EscalationLevel;
use crate::session::context::OfferIntent;
use crate::session::{CallNotice, NetworkType, SessionCore};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Outcome of a reconnection request or step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Authority set and link healthy; nothing to do
    Blocked,
    /// A reconnection is already in flight
    AlreadyReconnecting,
    /// Attempt scheduled after a backoff delay
    Scheduled {
        /// 1-indexed attempt
        attempt: u32,
        /// Backoff before it runs
        delay: Duration,
    },
    /// Link rebuild issued
    Started {
        /// 1-indexed attempt
        attempt: u32,
        /// Generation of the new link
        generation: u64,
    },
    /// The link recovered while the attempt was waiting
    Cancelled,
    /// Budget used up; the session must end
    Exhausted,
}

/// Rebuilds the link from scratch, at most `max_reconnect_attempts` times
/// between healthy connections
#[derive(Debug, Default)]
pub struct ReconnectionOrchestrator {
    attempt_timer: Option<TimerHandle>,
    inflight_generation: Option<u64>,
}

impl ReconnectionOrchestrator {
    /// Create an idle orchestrator
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the next reconnection attempt
    pub fn request(&mut self, core: &mut SessionCore, now: Instant) -> ReconnectDecision {
        if core.blocks_recovery() {
            debug!("Reconnection rejected: link healthy");
            return ReconnectDecision::Blocked;
        }
        if core.session.is_reconnecting {
            debug!("Reconnection rejected: already reconnecting");
            return ReconnectDecision::AlreadyReconnecting;
        }
        if core.session.reconnect_attempts >= core.timing.max_reconnect_attempts {
            core.session.escalation.promote(EscalationLevel::Exhausted);
            error!(
                session_id = %core.session.session_id,
                attempts = core.session.reconnect_attempts,
                network_type = %core.session.network_type,
                relay_only = core.session.force_relay(),
                last_error = core.last_error().unwrap_or("none"),
                "Reconnection attempts exhausted"
            );
            return ReconnectDecision::Exhausted;
        }

        let backoff = BackoffCalculator::new(
            core.timing.initial_reconnect_delay_ms,
            core.timing.max_reconnect_delay_ms,
        );
        let attempt = core.session.reconnect_attempts + 1;
        let delay = backoff.delay(attempt);

        let Some(timer) = core.timers.register(
            TimerAction::ReconnectAttempt { attempt },
            delay,
            "reconnect:attempt",
            now,
        ) else {
            return ReconnectDecision::Blocked;
        };

        core.session.is_reconnecting = true;
        core.session.reconnect_attempts = attempt;
        core.session.escalation.promote(EscalationLevel::FullReconnect);
        self.attempt_timer = Some(timer);

        warn!(
            session_id = %core.session.session_id,
            attempt,
            max_attempts = core.timing.max_reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling full reconnection"
        );
        core.notify(CallNotice::Recovering {
            level: EscalationLevel::FullReconnect,
            attempt,
            delay,
        });

        ReconnectDecision::Scheduled { attempt, delay }
    }

    /// The backoff for `attempt` elapsed; tear down and rebuild
    pub fn on_attempt_due(
        &mut self,
        core: &mut SessionCore,
        attempt: u32,
        now: Instant,
    ) -> ReconnectDecision {
        self.attempt_timer = None;

        if core.blocks_recovery() {
            info!(attempt, "Link recovered before reconnection ran");
            core.session.is_reconnecting = false;
            return ReconnectDecision::Cancelled;
        }

        if attempt > 1 || core.session.network_type == NetworkType::Restrictive {
            core.session.escalate_relay();
        }
        let relay_only = core.session.force_relay();

        let generation = core.rebuild_link(
            relay_only,
            Some(OfferIntent {
                ice_restart: false,
                rebuilt: true,
            }),
        );
        self.inflight_generation = Some(generation);

        if !core.session.ever_connected {
            core.timers.cancel_slot(&mut core.setup_timer);
            let timeout = core.timing.initial_connection_timeout_ms
                + delay_ms(
                    attempt,
                    core.timing.connection_setup_extension_ms,
                    core.timing.initial_connection_timeout_ms,
                );
            core.setup_timer = core.timers.register(
                TimerAction::InitialConnectionTimeout,
                Duration::from_millis(timeout),
                "initial-connection:reconnect",
                now,
            );
        }

        info!(
            session_id = %core.session.session_id,
            attempt,
            generation,
            relay_only,
            "Full reconnection started"
        );
        ReconnectDecision::Started {
            attempt,
            generation,
        }
    }

    /// A link finished building; clears the in-flight mark if it was ours
    pub fn on_link_created(&mut self, core: &mut SessionCore, generation: u64) -> bool {
        if self.inflight_generation != Some(generation) {
            return false;
        }
        self.inflight_generation = None;
        core.session.is_reconnecting = false;
        debug!(generation, "Reconnection link ready");
        true
    }

    /// Whether `generation` is the link this orchestrator is building
    pub fn is_inflight(&self, generation: u64) -> bool {
        self.inflight_generation == Some(generation)
    }

    /// The partner replaced its link and we rebuilt ours to match; a
    /// pending attempt of our own would only tear that down again
    pub fn adopt_partner_rebuild(&mut self, core: &mut SessionCore, generation: u64) -> bool {
        if !core.timers.cancel_slot(&mut self.attempt_timer) {
            return false;
        }
        self.inflight_generation = Some(generation);
        info!(generation, "Pending reconnection superseded by partner rebuild");
        true
    }

    /// A step of the attempt failed; schedule the next one or give up
    pub fn on_step_failed(
        &mut self,
        core: &mut SessionCore,
        error: &str,
        now: Instant,
    ) -> ReconnectDecision {
        warn!(
            session_id = %core.session.session_id,
            attempt = core.session.reconnect_attempts,
            error,
            "Reconnection step failed"
        );
        core.record_error(error);
        self.inflight_generation = None;
        core.timers.cancel_slot(&mut self.attempt_timer);
        core.session.is_reconnecting = false;
        self.request(core, now)
    }

    /// The link is healthy
    pub fn on_connected(&mut self, core: &mut SessionCore) {
        core.timers.cancel_slot(&mut self.attempt_timer);
        self.inflight_generation = None;
        core.session.is_reconnecting = false;
    }
}
