//! Session record and the state machine that owns it

pub mod context;
pub mod driver;
pub mod events;
pub mod machine;
pub mod network;

pub use context::{LinkStatus, SessionCore};
pub use driver::{SessionDriver, SessionHandle};
pub use events::{CallNotice, Command, MediaOutcome, NegotiationOp, OperationOutcome, SessionEvent};
pub use machine::ConnectionStateMachine;
pub use network::NetworkClassifier;

use crate::lifecycle::{ConnectionAuthority, EscalationLevel};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

/// Unique session identifier
pub type SessionId = String;

/// Network classification derived from gathered candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Server-reflexive paths work
    Open,
    /// Only relayed paths were found
    Moderate,
    /// Neither reflexive nor relayed paths were found
    Restrictive,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkType::Open => "open",
            NetworkType::Moderate => "moderate",
            NetworkType::Restrictive => "restrictive",
        };
        f.write_str(name)
    }
}

/// Caller-visible session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Waiting to be matched with a partner
    Idle,
    /// Partner known, acquiring media and building the link
    Matched,
    /// Link built, negotiation in progress
    Connecting,
    /// Link healthy
    Connected,
    /// Link lost connectivity and the grace window ran out
    Disconnected,
    /// Link failed and the grace window ran out
    Failed,
    /// Terminal
    Ended,
}

/// Whether the session has ever been healthy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPhase {
    /// No healthy connection yet
    PreConnection,
    /// At least one healthy connection
    PostConnection,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// Local process is shutting down
    BrowserClosing,
    /// Partner hung up
    PartnerEnded,
    /// Partner left the room
    PartnerDisconnected,
    /// Server lost the partner
    PartnerTimeout,
    /// Server expired the room
    SessionTimeout,
    /// Nothing happened before the first connection
    Inactive,
    /// Every repair and reconnection attempt failed
    ExhaustedRetries,
}

/// One call attempt
///
/// Owned by [`ConnectionStateMachine`]; everything else sees it through
/// [`SessionCore`].
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    /// Diagnostic id, fresh per attempt
    pub session_id: SessionId,
    /// Partner peer id
    pub partner_id: String,
    /// Room shared with the partner
    pub room_id: String,
    /// Current state
    pub state: SessionState,
    /// Pre- or post-connection
    pub phase: SessionPhase,
    /// Full reconnections started since the last healthy connection
    pub reconnect_attempts: u32,
    /// Lightweight repairs started in this session
    pub negotiation_restart_attempts: u32,
    /// Whether the link was ever healthy
    pub ever_connected: bool,
    /// Current network classification
    pub network_type: NetworkType,
    /// Last time the link became healthy
    pub last_stable_at: Option<Instant>,
    /// A full reconnection is in flight
    pub is_reconnecting: bool,
    /// Current rung of the recovery ladder
    pub escalation: EscalationLevel,
    /// Healthy-connection flag
    pub authority: ConnectionAuthority,
    force_relay: bool,
    initial_network_type: NetworkType,
    initial_force_relay: bool,
}

impl ConnectionSession {
    /// Create an unmatched session
    pub fn new(network_hint: Option<NetworkType>, force_relay: bool) -> Self {
        let network_type = network_hint.unwrap_or(NetworkType::Open);
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            partner_id: String::new(),
            room_id: String::new(),
            state: SessionState::Idle,
            phase: SessionPhase::PreConnection,
            reconnect_attempts: 0,
            negotiation_restart_attempts: 0,
            ever_connected: false,
            network_type,
            last_stable_at: None,
            is_reconnecting: false,
            escalation: EscalationLevel::Stable,
            authority: ConnectionAuthority::new(),
            force_relay,
            initial_network_type: network_type,
            initial_force_relay: force_relay,
        }
    }

    /// Relay-only mode is in force
    pub fn force_relay(&self) -> bool {
        self.force_relay
    }

    /// Switch to relay-only mode for the rest of the session
    ///
    /// Returns true if this call changed the mode.
    pub fn escalate_relay(&mut self) -> bool {
        let changed = !self.force_relay;
        self.force_relay = true;
        changed
    }

    /// Whether the partner side is known
    pub fn is_matched(&self) -> bool {
        !self.partner_id.is_empty()
    }

    /// Start over for the same partner and room
    ///
    /// Fresh id, authority reset, counters zeroed, relay mode and network
    /// type back to their configured starting values.
    pub fn renew(&mut self) {
        self.session_id = uuid::Uuid::new_v4().to_string();
        self.state = SessionState::Idle;
        self.phase = SessionPhase::PreConnection;
        self.reconnect_attempts = 0;
        self.negotiation_restart_attempts = 0;
        self.ever_connected = false;
        self.network_type = self.initial_network_type;
        self.last_stable_at = None;
        self.is_reconnecting = false;
        self.escalation = EscalationLevel::Stable;
        self.authority.reset();
        self.force_relay = self.initial_force_relay;
    }
}
