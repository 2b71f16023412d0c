//! WebSocket signaling client
//!
//! Inbound messages are parsed into [`InboundSignal`]s and handed out on a
//! channel; outbound messages go through an unbounded channel to a
//! dedicated writer task.

use super::protocol::{InboundSignal, OutboundSignal};
use super::SignalingSink;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket connection to the rendezvous server
pub struct SignalingClient {
    url: String,
    tx: mpsc::UnboundedSender<Message>,
    closed: CancellationToken,
}

impl SignalingClient {
    /// Connect as `peer_id`; inbound signals arrive on the returned receiver
    ///
    /// The peer id travels as a `peerId` query parameter so the server can
    /// route messages addressed to us.
    pub async fn connect(
        url: &str,
        peer_id: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundSignal>)> {
        let url = with_peer_id(url, peer_id);
        info!("Connecting to signaling server: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        info!("Connected to signaling server");

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        tokio::spawn(Self::sender_task(write, rx, closed.clone()));
        tokio::spawn(Self::receiver_task(read, inbound_tx, closed.clone()));

        Ok((Self { url, tx, closed }, inbound_rx))
    }

    /// Server URL including the peer id
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the socket has gone away
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close the socket and stop both tasks
    pub fn close(&self) {
        self.closed.cancel();
    }

    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
        closed: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = closed.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if let Err(e) = write.send(msg).await {
                        error!("Failed to send WebSocket message: {}", e);
                        closed.cancel();
                        break;
                    }
                }
            }
        }

        debug!("Sender task terminated");
    }

    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        inbound: mpsc::UnboundedSender<InboundSignal>,
        closed: CancellationToken,
    ) {
        loop {
            let msg_result = tokio::select! {
                _ = closed.cancelled() => break,
                next = read.next() => match next {
                    Some(msg_result) => msg_result,
                    None => break,
                },
            };

            match msg_result {
                Ok(Message::Text(text)) => match InboundSignal::from_json(&text) {
                    Ok(signal) => {
                        debug!(kind = signal.kind(), "Received signaling message");
                        if inbound.send(signal).is_err() {
                            debug!("Inbound receiver dropped, stopping receiver");
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to handle signaling message: {}", e),
                },
                Ok(Message::Close(_)) => {
                    info!("WebSocket connection closed");
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        closed.cancel();
        debug!("Receiver task terminated");
    }
}

#[async_trait]
impl SignalingSink for SignalingClient {
    async fn send(&self, signal: OutboundSignal) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SignalingError("signaling connection closed".to_string()));
        }
        let json = signal.to_json()?;
        debug!(kind = signal.kind(), "Sending signaling message");
        self.tx
            .send(Message::Text(json))
            .map_err(|e| Error::SignalingError(format!("Failed to queue message: {}", e)))
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

fn with_peer_id(url: &str, peer_id: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}peerId={}", url, separator, peer_id)
}
