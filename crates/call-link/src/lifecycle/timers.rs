//! Central registry for every delayed action in a session
//!
//! Timers are data, not closures: each entry carries a [`TimerAction`] that
//! the state machine dispatches when the registry reports it due. This keeps
//! bulk cancellation a single operation and makes stale callbacks impossible,
//! since a cancelled entry simply no longer exists.

use super::grace::GraceKind;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Registry-assigned timer identifier
pub type TimerId = u64;

/// Which part of the lifecycle a timer belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerScope {
    /// Only meaningful until the first healthy connection
    PreConnection,
    /// Repair and reconnection bookkeeping
    Recovery,
    /// Lives as long as the session (heartbeat, idle notices)
    Session,
}

/// What to do when a timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// First-connection window elapsed
    InitialConnectionTimeout,
    /// A setup extension elapsed
    SetupExtension {
        /// 1-indexed extension number
        extension: u32,
    },
    /// Candidate gathering window for a link elapsed
    IceGatheringTimeout {
        /// Link generation the window was armed for
        generation: u64,
    },
    /// No activity before the first connection
    SessionInactivity,
    /// A grace window closed
    GraceExpiry(GraceKind),
    /// Re-check whether signaling has become stable
    StabilityCheck,
    /// An ICE restart did not complete in time
    RestartCompletion {
        /// Restart attempt the window belongs to
        attempt: u32,
    },
    /// Backoff before the next ICE restart elapsed
    RestartRetry,
    /// Backoff before a full reconnection elapsed
    ReconnectAttempt {
        /// 1-indexed reconnection attempt
        attempt: u32,
    },
    /// Backoff before retrying a failed description/candidate operation
    NegotiationRetry {
        /// 1-indexed retry number
        retry: u32,
    },
    /// Send a heartbeat through signaling
    Heartbeat,
    /// No application activity on an established call
    ActiveCallInactivity,
}

impl TimerAction {
    /// Lifecycle scope of this action
    pub fn scope(&self) -> TimerScope {
        match self {
            TimerAction::InitialConnectionTimeout
            | TimerAction::SetupExtension { .. }
            | TimerAction::IceGatheringTimeout { .. }
            | TimerAction::SessionInactivity => TimerScope::PreConnection,
            TimerAction::GraceExpiry(_)
            | TimerAction::StabilityCheck
            | TimerAction::RestartCompletion { .. }
            | TimerAction::RestartRetry
            | TimerAction::ReconnectAttempt { .. }
            | TimerAction::NegotiationRetry { .. } => TimerScope::Recovery,
            TimerAction::Heartbeat | TimerAction::ActiveCallInactivity => TimerScope::Session,
        }
    }
}

/// Handle to a scheduled timer
///
/// Only the registry creates these. Cancelling goes through
/// [`TimerRegistry::cancel`], which is idempotent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerHandle {
    id: TimerId,
    label: &'static str,
    scheduled_at: Instant,
    fire_at: Instant,
}

impl TimerHandle {
    /// Registry-assigned id
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Diagnostic label
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// When the timer was registered
    pub fn scheduled_at(&self) -> Instant {
        self.scheduled_at
    }

    /// When the timer is due
    pub fn fire_at(&self) -> Instant {
        self.fire_at
    }
}

#[derive(Debug)]
struct Entry {
    handle: TimerHandle,
    action: TimerAction,
}

/// Tracks every scheduled delayed action of one session
#[derive(Debug, Default)]
pub struct TimerRegistry {
    next_id: TimerId,
    entries: HashMap<TimerId, Entry>,
    due: BTreeSet<(Instant, TimerId)>,
    /// Set by `freeze_all`; pre-connection timers are refused afterwards
    frozen: bool,
    /// Set by `shutdown`; everything is refused afterwards
    closed: bool,
}

impl TimerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` to fire `delay` after `now`
    ///
    /// Returns `None` instead of scheduling when the session has already
    /// reached a healthy connection and the action only matters before one,
    /// or when the session has ended.
    pub fn register(
        &mut self,
        action: TimerAction,
        delay: Duration,
        label: &'static str,
        now: Instant,
    ) -> Option<TimerHandle> {
        if self.closed {
            debug!(label, "Timer refused: session ended");
            return None;
        }

        if self.frozen && action.scope() == TimerScope::PreConnection {
            warn!(label, ?action, "Timer refused: connection already established");
            return None;
        }

        self.next_id += 1;
        let handle = TimerHandle {
            id: self.next_id,
            label,
            scheduled_at: now,
            fire_at: now + delay,
        };

        debug!(
            label,
            id = handle.id,
            delay_ms = delay.as_millis() as u64,
            "Timer registered"
        );

        self.due.insert((handle.fire_at, handle.id));
        self.entries.insert(
            handle.id,
            Entry {
                handle: handle.clone(),
                action,
            },
        );

        Some(handle)
    }

    /// Cancel a timer; returns whether it was still pending
    pub fn cancel(&mut self, handle: &TimerHandle) -> bool {
        match self.entries.remove(&handle.id) {
            Some(entry) => {
                self.due.remove(&(entry.handle.fire_at, entry.handle.id));
                debug!(label = entry.handle.label, id = entry.handle.id, "Timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel an optional handle in place
    pub fn cancel_slot(&mut self, slot: &mut Option<TimerHandle>) -> bool {
        match slot.take() {
            Some(handle) => self.cancel(&handle),
            None => false,
        }
    }

    /// Cancel every pending timer of the given scope
    pub fn cancel_scope(&mut self, scope: TimerScope) -> usize {
        self.cancel_matching(|action| action.scope() == scope)
    }

    /// Cancel every pending timer whose action matches `predicate`
    pub fn cancel_matching<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&TimerAction) -> bool,
    {
        let ids: Vec<TimerId> = self
            .entries
            .values()
            .filter(|entry| predicate(&entry.action))
            .map(|entry| entry.handle.id)
            .collect();

        for id in &ids {
            if let Some(entry) = self.entries.remove(id) {
                self.due.remove(&(entry.handle.fire_at, entry.handle.id));
            }
        }

        ids.len()
    }

    /// Cancel everything and refuse pre-connection timers from now on
    ///
    /// Called once per session, at the first healthy connection.
    pub fn freeze_all(&mut self) -> usize {
        let cancelled = self.clear();
        self.frozen = true;
        debug!(cancelled, "Timer registry frozen");
        cancelled
    }

    /// Cancel everything and refuse all timers from now on
    pub fn shutdown(&mut self) -> usize {
        let cancelled = self.clear();
        self.closed = true;
        cancelled
    }

    fn clear(&mut self) -> usize {
        let cancelled = self.entries.len();
        self.entries.clear();
        self.due.clear();
        cancelled
    }

    /// Remove and return the earliest timer due at or before `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerHandle, TimerAction)> {
        let &(fire_at, id) = self.due.iter().next()?;
        if fire_at > now {
            return None;
        }

        self.due.remove(&(fire_at, id));
        let entry = self.entries.remove(&id)?;
        debug!(label = entry.handle.label, id, "Timer fired");
        Some((entry.handle, entry.action))
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.due.iter().next().map(|&(fire_at, _)| fire_at)
    }

    /// Whether the handle is still scheduled
    pub fn is_pending(&self, handle: &TimerHandle) -> bool {
        self.entries.contains_key(&handle.id)
    }

    /// Whether any pending timer carries `action`
    pub fn has_action(&self, action: TimerAction) -> bool {
        self.entries.values().any(|entry| entry.action == action)
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no timer is pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `freeze_all` has run
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Whether `shutdown` has run
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
