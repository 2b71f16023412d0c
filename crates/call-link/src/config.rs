//! Configuration types for the call link

use crate::session::NetworkType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for a call session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLinkConfig {
    /// WebSocket signaling server URL (ws:// or wss://)
    pub signaling_url: String,

    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (required for relay mode)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Local peer ID (auto-generated if None)
    pub peer_id: Option<String>,

    /// Known network classification, if the host already measured it
    pub network_hint: Option<NetworkType>,

    /// Start every link in relay-only mode
    pub force_relay: bool,

    /// Capture constraints passed to the media source
    pub media: MediaConstraints,

    /// Lifecycle timing constants
    pub timing: TimingConfig,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Capture constraints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture audio
    pub audio: bool,

    /// Capture video
    pub video: bool,

    /// Preferred video width
    pub video_width: u32,

    /// Preferred video height
    pub video_height: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            video_width: 1280,
            video_height: 720,
        }
    }
}

/// Timing constants for the connection lifecycle
///
/// Defaults are the canonical interoperability values; older revisions
/// (30s initial timeout, 3 reconnect attempts) are superseded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// First connection window before extending (default: 60000)
    pub initial_connection_timeout_ms: u64,
    /// Base extension when setup is slow but progressing (default: 15000)
    pub connection_setup_extension_ms: u64,
    /// Cap for successive setup extensions (default: 30000)
    pub max_setup_extension_ms: u64,
    /// ICE gathering window (default: 15000)
    pub ice_gathering_timeout_ms: u64,
    /// ICE gathering window under relay/restrictive networks (default: 25000)
    pub relay_ice_gathering_timeout_ms: u64,
    /// Idle limit before the first connection (default: 600000)
    pub session_inactivity_timeout_ms: u64,
    /// Idle notice interval on an established call (default: 1800000)
    pub active_call_inactivity_timeout_ms: u64,
    /// Signaling heartbeat period (default: 30000)
    pub heartbeat_interval_ms: u64,
    /// Full reconnection budget (default: 5)
    pub max_reconnect_attempts: u32,
    /// First full reconnection delay (default: 2000)
    pub initial_reconnect_delay_ms: u64,
    /// Full reconnection delay cap (default: 30000)
    pub max_reconnect_delay_ms: u64,
    /// Grace window after a disconnected signal (default: 10000)
    pub disconnection_grace_period_ms: u64,
    /// Grace window after a negotiation-failed signal (default: 5000)
    pub ice_failure_grace_period_ms: u64,
    /// Window for an ICE restart to complete (default: 10000)
    pub ice_restart_timeout_ms: u64,
    /// Retries after the first ICE restart (default: 3)
    pub max_ice_restart_attempts: u32,
    /// First ICE restart retry delay (default: 1000)
    pub ice_restart_backoff_initial_ms: u64,
    /// ICE restart retry delay cap (default: 8000)
    pub ice_restart_backoff_max_ms: u64,
    /// Poll interval while waiting for signaling to become stable (default: 500)
    pub stability_check_interval_ms: u64,
    /// Stability polls before escalating (default: 4)
    pub max_stability_checks: u32,
    /// First negotiation operation retry delay (default: 500)
    pub negotiation_retry_initial_ms: u64,
    /// Negotiation operation retry delay cap (default: 4000)
    pub negotiation_retry_max_ms: u64,
    /// Negotiation operation retries before surfacing (default: 3)
    pub max_negotiation_retries: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            initial_connection_timeout_ms: 60_000,
            connection_setup_extension_ms: 15_000,
            max_setup_extension_ms: 30_000,
            ice_gathering_timeout_ms: 15_000,
            relay_ice_gathering_timeout_ms: 25_000,
            session_inactivity_timeout_ms: 600_000,
            active_call_inactivity_timeout_ms: 1_800_000,
            heartbeat_interval_ms: 30_000,
            max_reconnect_attempts: 5,
            initial_reconnect_delay_ms: 2_000,
            max_reconnect_delay_ms: 30_000,
            disconnection_grace_period_ms: 10_000,
            ice_failure_grace_period_ms: 5_000,
            ice_restart_timeout_ms: 10_000,
            max_ice_restart_attempts: 3,
            ice_restart_backoff_initial_ms: 1_000,
            ice_restart_backoff_max_ms: 8_000,
            stability_check_interval_ms: 500,
            max_stability_checks: 4,
            negotiation_retry_initial_ms: 500,
            negotiation_retry_max_ms: 4_000,
            max_negotiation_retries: 3,
        }
    }
}

impl TimingConfig {
    /// Initial connection window as a Duration
    pub fn initial_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_connection_timeout_ms)
    }

    /// ICE gathering window for the given relay mode
    pub fn ice_gathering_timeout(&self, relay_or_restrictive: bool) -> Duration {
        if relay_or_restrictive {
            Duration::from_millis(self.relay_ice_gathering_timeout_ms)
        } else {
            Duration::from_millis(self.ice_gathering_timeout_ms)
        }
    }

    /// Heartbeat period as a Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Pre-connection idle limit as a Duration
    pub fn session_inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.session_inactivity_timeout_ms)
    }

    /// Established-call idle notice interval as a Duration
    pub fn active_call_inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.active_call_inactivity_timeout_ms)
    }

    /// ICE restart completion window as a Duration
    pub fn ice_restart_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_restart_timeout_ms)
    }

    /// Stability poll interval as a Duration
    pub fn stability_check_interval(&self) -> Duration {
        Duration::from_millis(self.stability_check_interval_ms)
    }

    /// Validate timing relationships
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.max_reconnect_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_reconnect_attempts must be at least 1".to_string(),
            ));
        }

        if self.initial_reconnect_delay_ms > self.max_reconnect_delay_ms {
            return Err(Error::InvalidConfig(format!(
                "initial_reconnect_delay_ms ({}) exceeds max_reconnect_delay_ms ({})",
                self.initial_reconnect_delay_ms, self.max_reconnect_delay_ms
            )));
        }

        if self.ice_restart_backoff_initial_ms > self.ice_restart_backoff_max_ms {
            return Err(Error::InvalidConfig(format!(
                "ice_restart_backoff_initial_ms ({}) exceeds ice_restart_backoff_max_ms ({})",
                self.ice_restart_backoff_initial_ms, self.ice_restart_backoff_max_ms
            )));
        }

        if self.connection_setup_extension_ms >= self.initial_connection_timeout_ms {
            return Err(Error::InvalidConfig(format!(
                "connection_setup_extension_ms ({}) must be shorter than initial_connection_timeout_ms ({})",
                self.connection_setup_extension_ms, self.initial_connection_timeout_ms
            )));
        }

        let windows = [
            ("initial_connection_timeout_ms", self.initial_connection_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("disconnection_grace_period_ms", self.disconnection_grace_period_ms),
            ("ice_failure_grace_period_ms", self.ice_failure_grace_period_ms),
            ("ice_restart_timeout_ms", self.ice_restart_timeout_ms),
            ("stability_check_interval_ms", self.stability_check_interval_ms),
        ];
        for (name, value) in windows {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }

        Ok(())
    }
}

impl Default for CallLinkConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8080".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            peer_id: None,
            network_hint: None,
            force_relay: false,
            media: MediaConstraints::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl CallLinkConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `stun_servers` is empty
    /// - `force_relay` is set without any TURN server
    /// - `signaling_url` is not a valid WebSocket URL
    /// - the media constraints request neither audio nor video
    /// - any timing constant is inconsistent
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        if self.force_relay && self.turn_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "force_relay requires at least one TURN server".to_string(),
            ));
        }

        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        if !self.media.audio && !self.media.video {
            return Err(Error::InvalidConfig(
                "media constraints must request audio, video or both".to_string(),
            ));
        }

        self.timing.validate()
    }

    /// Create a configuration preset for networks known to block direct paths
    ///
    /// Starts in relay-only mode with the longer gathering window.
    ///
    /// # Example
    ///
    /// ```
    /// use remotemedia_call_link::config::{CallLinkConfig, TurnServerConfig};
    ///
    /// let config = CallLinkConfig::restrictive_network_preset("ws://localhost:8080")
    ///     .with_turn_servers(vec![TurnServerConfig {
    ///         url: "turn:turn.example.com:3478".to_string(),
    ///         username: "user".to_string(),
    ///         credential: "pass".to_string(),
    ///     }]);
    /// assert!(config.force_relay);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn restrictive_network_preset(signaling_url: &str) -> Self {
        Self {
            signaling_url: signaling_url.to_string(),
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            network_hint: Some(NetworkType::Restrictive),
            force_relay: true,
            ..Default::default()
        }
    }

    /// Create a configuration preset for audio-only calls
    pub fn audio_only_preset(signaling_url: &str) -> Self {
        Self {
            signaling_url: signaling_url.to_string(),
            media: MediaConstraints {
                video: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Set the peer ID for this configuration
    pub fn with_peer_id(mut self, peer_id: &str) -> Self {
        self.peer_id = Some(peer_id.to_string());
        self
    }

    /// Seed the network classification
    pub fn with_network_hint(mut self, network_type: NetworkType) -> Self {
        self.network_hint = Some(network_type);
        self
    }

    /// Replace the timing constants
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }
}
