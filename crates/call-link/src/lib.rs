//! Peer-to-peer call connection lifecycle for RemoteMedia
//!
//! This crate establishes, monitors and recovers a single peer-to-peer media
//! call between two clients that meet through a signaling server. The
//! interesting part is the lifecycle: deciding when to wait, when to restart
//! ICE, when to rebuild the link and when to leave a healthy link alone.
//!
//! # Features
//!
//! - **Connection authority**: the first healthy connection freezes every
//!   pre-connection timer so nothing stale can tear the call down
//! - **Grace windows**: momentary disconnects on an established call are
//!   absorbed instead of triggering repair
//! - **Escalating recovery**: ICE restart, relay-only rebuild, then full
//!   reconnection with exponential backoff and a fixed budget
//! - **Setup extensions**: slow first connections are extended, not failed
//! - **Perfect negotiation**: deterministic initiator, collision rollback,
//!   buffered early offers and candidates
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  SessionDriver (tokio task)                             │
//! │  ├─ event queue ◄── SignalingClient, PeerLink callbacks │
//! │  ├─ next timer deadline                                 │
//! │  └─ ConnectionStateMachine (no I/O)                     │
//! │      ├─ TimerRegistry + ConnectionAuthority             │
//! │      ├─ GracePeriodHandler                              │
//! │      ├─ NegotiationRestartCoordinator                   │
//! │      └─ ReconnectionOrchestrator                        │
//! │     ↓ commands                                          │
//! │  PeerLinkFactory / MediaSource / SignalingSink          │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use remotemedia_call_link::CallLinkConfig;
//!
//! let config = CallLinkConfig {
//!     signaling_url: "ws://localhost:8080".to_string(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! assert_eq!(config.timing.initial_connection_timeout_ms, 60_000);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use remotemedia_call_link::{
//!     CallLinkConfig, RtcPeerLinkFactory, SessionDriver, SignalingClient,
//!     SyntheticMediaSource,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> remotemedia_call_link::Result<()> {
//! let config = CallLinkConfig::default();
//! let (signaling, mut inbound) = SignalingClient::connect(&config.signaling_url, "alice").await?;
//! let (driver, handle, mut notices) = SessionDriver::new(
//!     &config,
//!     "alice",
//!     Arc::new(RtcPeerLinkFactory::new(&config)),
//!     Arc::new(SyntheticMediaSource::new("alice")),
//!     Arc::new(signaling),
//! );
//! tokio::spawn(driver.run());
//!
//! let forward = handle.clone();
//! tokio::spawn(async move {
//!     while let Some(signal) = inbound.recv().await {
//!         if forward.signal(signal).is_err() {
//!             break;
//!         }
//!     }
//! });
//!
//! handle.matched("bob", "room-1")?;
//! while let Some(notice) = notices.recv().await {
//!     println!("{:?}", notice);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

pub use config::{CallLinkConfig, MediaConstraints, TimingConfig, TurnServerConfig};
pub use error::{Error, ErrorClass, FailureReport, MediaAccessError, Result};
pub use lifecycle::{EscalationLevel, TimerAction, TimerRegistry};
pub use media::{MediaSource, MediaStream, SyntheticMediaSource};
pub use peer::{PeerLink, PeerLinkFactory, RtcPeerLinkFactory};
pub use session::{
    CallNotice, Command, ConnectionStateMachine, EndReason, NetworkType, SessionDriver,
    SessionEvent, SessionHandle, SessionState,
};
pub use signaling::{SignalingClient, SignalingSink};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
