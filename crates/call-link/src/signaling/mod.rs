//! Signaling: wire protocol and WebSocket client

pub mod client;
pub mod protocol;

pub use client::SignalingClient;
pub use protocol::{IceCandidate, InboundSignal, OutboundSignal};

use crate::Result;
use async_trait::async_trait;

/// Outbound half of the signaling channel
#[async_trait]
pub trait SignalingSink: Send + Sync {
    /// Deliver one message to the server
    async fn send(&self, signal: OutboundSignal) -> Result<()>;
}
