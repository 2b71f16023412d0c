//! Error types for the call link

use crate::session::NetworkType;

/// Result type alias using call link Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while establishing or recovering a call
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling connection error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Camera/microphone could not be acquired
    #[error("Media access failed: {0}")]
    MediaAccess(#[from] MediaAccessError),

    /// Offer/answer/candidate exchange rejected
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Disconnected or failed signal on a previously healthy link
    #[error("Transient degradation: {0}")]
    TransientDegradation(String),

    /// Every repair and reconnection attempt has been used up
    #[error(
        "Connection failed after {attempts} reconnection attempts \
         (network: {network_type}, relay: {relay_only}): {last_error}"
    )]
    ExhaustedRetries {
        /// Full reconnection attempts made
        attempts: u32,
        /// Network classification at the time of failure
        network_type: NetworkType,
        /// Whether relay-only mode was in force
        relay_only: bool,
        /// Last error observed before giving up
        last_error: String,
    },

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The session has already ended
    #[error("Session ended")]
    SessionEnded,

    /// Internal error (should not occur in normal operation)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Media capture failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaAccessError {
    /// The user or platform refused capture permission
    #[error("permission denied")]
    PermissionDenied,

    /// No capture device matched
    #[error("device not found")]
    DeviceNotFound,

    /// Device exists but is held by another process
    #[error("device busy")]
    DeviceBusy,

    /// The requested constraints cannot be satisfied
    #[error("unsupported constraints: {0}")]
    UnsupportedConstraints(String),
}

/// Error taxonomy used to decide how a failure propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Capture failed; retry acquisition only
    MediaAccessFailure,
    /// Description or candidate exchange rejected; retried locally
    NegotiationFailure,
    /// Degradation of a healthy link; absorbed by the grace window
    TransientDegradation,
    /// Terminal; requires a user-initiated restart
    ExhaustedRetries,
    /// Invalid configuration
    Configuration,
    /// Signaling, I/O and library plumbing
    Transport,
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::MediaAccess(_) | Error::MediaTrackError(_) => ErrorClass::MediaAccessFailure,
            Error::NegotiationFailed(_) | Error::SdpError(_) | Error::IceCandidateError(_) => {
                ErrorClass::NegotiationFailure
            }
            Error::TransientDegradation(_) => ErrorClass::TransientDegradation,
            Error::ExhaustedRetries { .. } => ErrorClass::ExhaustedRetries,
            Error::InvalidConfig(_) => ErrorClass::Configuration,
            Error::SignalingError(_)
            | Error::PeerConnectionError(_)
            | Error::WebSocketError(_)
            | Error::SerializationError(_)
            | Error::SessionEnded
            | Error::InternalError(_)
            | Error::WebRtcError(_)
            | Error::IoError(_)
            | Error::Other(_) => ErrorClass::Transport,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::NegotiationFailed(_)
                | Error::SdpError(_)
                | Error::IceCandidateError(_)
                | Error::TransientDegradation(_)
                | Error::MediaAccess(_)
                | Error::WebSocketError(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error escapes to the caller-visible error channel
    ///
    /// Transient classes are recovered locally; only exhaustion and media
    /// failures are reported.
    pub fn is_caller_visible(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::MediaAccessFailure
                | ErrorClass::ExhaustedRetries
                | ErrorClass::Configuration
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}

/// Caller-visible failure, cloneable so it can ride on notices
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FailureReport {
    /// Taxonomy class
    pub class: ErrorClass,
    /// Human-readable description
    pub message: String,
    /// Full reconnection attempts made so far
    pub attempts: u32,
    /// Network classification
    pub network_type: NetworkType,
    /// Whether relay-only mode was in force
    pub relay_only: bool,
}

impl FailureReport {
    /// Build a report from an error plus session diagnostics
    pub fn from_error(
        error: &Error,
        attempts: u32,
        network_type: NetworkType,
        relay_only: bool,
    ) -> Self {
        Self {
            class: error.class(),
            message: error.to_string(),
            attempts,
            network_type,
            relay_only,
        }
    }
}
