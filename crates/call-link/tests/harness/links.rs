//! Scripted negotiation library
//!
//! Links built by [`ScriptedLinks`] succeed at every operation with fake SDP
//! and record what they were asked to do. Tests drive connection state by
//! emitting [`NegotiationEvent`]s through the sink kept per generation.

use async_trait::async_trait;
use remotemedia_call_link::media::MediaStream;
use remotemedia_call_link::peer::{
    LinkEventSink, LinkOptions, LinkState, NegotiationEvent, PeerLink, PeerLinkFactory,
};
use remotemedia_call_link::signaling::protocol::IceCandidate;
use remotemedia_call_link::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One operation a scripted link performed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    CreateOffer { ice_restart: bool },
    /// A delayed offer finished; only recorded while an offer delay is set
    OfferReady { ice_restart: bool },
    AcceptOffer { sdp: String, rollback: bool },
    ApplyAnswer { sdp: String },
    AddCandidate(String),
    AttachStream { tracks: usize },
    Close,
}

#[derive(Default)]
struct Shared {
    created: Vec<LinkOptions>,
    sinks: HashMap<u64, LinkEventSink>,
    ops: Vec<(u64, LinkOp)>,
}

/// Link factory for tests
#[derive(Default)]
pub struct ScriptedLinks {
    shared: Arc<Mutex<Shared>>,
    failing: Arc<AtomicBool>,
    offer_delay: Arc<Mutex<Duration>>,
}

impl ScriptedLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every link reports `Failed` as soon as it makes an offer
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Offers take `delay` to produce, in virtual time
    pub fn set_offer_delay(&self, delay: Duration) {
        *self.offer_delay.lock().unwrap() = delay;
    }

    /// Options of every link built so far, oldest first
    pub fn created(&self) -> Vec<LinkOptions> {
        self.shared.lock().unwrap().created.clone()
    }

    /// Generation of the newest link
    pub fn latest(&self) -> Option<u64> {
        self.created().last().map(|options| options.generation)
    }

    /// Operations performed on `generation`
    pub fn ops(&self, generation: u64) -> Vec<LinkOp> {
        self.shared
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter(|(g, _)| *g == generation)
            .map(|(_, op)| op.clone())
            .collect()
    }

    /// Every operation on every link
    pub fn all_ops(&self) -> Vec<(u64, LinkOp)> {
        self.shared.lock().unwrap().ops.clone()
    }

    /// Deliver a callback as if link `generation` produced it
    pub fn emit(&self, generation: u64, event: NegotiationEvent) -> bool {
        let sink = self.shared.lock().unwrap().sinks.get(&generation).cloned();
        match sink {
            Some(sink) => sink.emit(event),
            None => false,
        }
    }

    /// Shorthand for a connection state change
    pub fn set_state(&self, generation: u64, state: LinkState) -> bool {
        self.emit(generation, NegotiationEvent::StateChanged(state))
    }
}

#[async_trait]
impl PeerLinkFactory for ScriptedLinks {
    async fn create(
        &self,
        options: LinkOptions,
        events: LinkEventSink,
    ) -> Result<Arc<dyn PeerLink>> {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.created.push(options);
            shared.sinks.insert(options.generation, events.clone());
        }
        Ok(Arc::new(ScriptedLink {
            generation: options.generation,
            shared: self.shared.clone(),
            failing: self.failing.clone(),
            offer_delay: self.offer_delay.clone(),
            events,
        }))
    }
}

struct ScriptedLink {
    generation: u64,
    shared: Arc<Mutex<Shared>>,
    failing: Arc<AtomicBool>,
    offer_delay: Arc<Mutex<Duration>>,
    events: LinkEventSink,
}

impl ScriptedLink {
    fn record(&self, op: LinkOp) {
        self.shared.lock().unwrap().ops.push((self.generation, op));
    }
}

#[async_trait]
impl PeerLink for ScriptedLink {
    fn generation(&self) -> u64 {
        self.generation
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        self.record(LinkOp::CreateOffer { ice_restart });
        let delay = *self.offer_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
            self.record(LinkOp::OfferReady { ice_restart });
        }
        if self.failing.load(Ordering::SeqCst) {
            self.events
                .emit(NegotiationEvent::StateChanged(LinkState::Failed));
        }
        Ok(format!("offer-{}", self.generation))
    }

    async fn accept_offer(&self, sdp: String, rollback: bool) -> Result<String> {
        self.record(LinkOp::AcceptOffer { sdp, rollback });
        Ok(format!("answer-{}", self.generation))
    }

    async fn apply_answer(&self, sdp: String) -> Result<()> {
        self.record(LinkOp::ApplyAnswer { sdp });
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(LinkOp::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn attach_stream(&self, stream: &MediaStream) -> Result<()> {
        self.record(LinkOp::AttachStream {
            tracks: stream.tracks().len(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record(LinkOp::Close);
        Ok(())
    }
}
