//! Call link test harness
//!
//! Runs a real [`SessionDriver`] against scripted collaborators:
//! - [`ScriptedLinks`] stands in for the negotiation library
//! - [`RecordingSignaling`] captures everything sent to the server
//! - [`ScriptedMedia`] refuses capture a set number of times, then hands
//!   out synthetic tracks
//!
//! Tests run on paused tokio time, so hour-long scenarios finish instantly.
//!
//! Basic usage pattern:
//!
//! 1. Create a `CallHarness` with `CallHarness::start("alice")`
//! 2. Bring the call up with `harness.connect("bob", "room-1")`, or with
//!    `harness.respond(..)` when the partner is the offerer
//! 3. Emit link callbacks through `harness.links` and watch notices
//! 4. Call `harness.shutdown()` to clean up

#![allow(dead_code)]

pub mod links;

use async_trait::async_trait;
use remotemedia_call_link::media::{MediaSource, MediaStream};
use remotemedia_call_link::peer::LinkState;
use remotemedia_call_link::signaling::protocol::{InboundSignal, OutboundSignal};
use remotemedia_call_link::{
    CallLinkConfig, CallNotice, MediaAccessError, MediaConstraints, SessionDriver,
    SessionHandle, SignalingSink, SyntheticMediaSource,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use links::{LinkOp, ScriptedLinks};

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Session error: {0}")]
    SessionError(#[from] remotemedia_call_link::Error),

    #[error("Notice stream closed")]
    Closed,
}

/// Longest a harness wait runs, in virtual time
const WAIT_LIMIT: Duration = Duration::from_secs(3 * 60 * 60);

/// Signaling sink that keeps every message
#[derive(Default)]
pub struct RecordingSignaling {
    sent: Mutex<Vec<OutboundSignal>>,
}

impl RecordingSignaling {
    pub fn sent(&self) -> Vec<OutboundSignal> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&OutboundSignal) -> bool) -> usize {
        self.sent.lock().unwrap().iter().filter(|s| predicate(s)).count()
    }
}

#[async_trait]
impl SignalingSink for RecordingSignaling {
    async fn send(&self, signal: OutboundSignal) -> remotemedia_call_link::Result<()> {
        self.sent.lock().unwrap().push(signal);
        Ok(())
    }
}

/// Capture source that refuses the first `denials` requests
pub struct ScriptedMedia {
    denials: AtomicUsize,
    requests: AtomicUsize,
    inner: SyntheticMediaSource,
}

impl ScriptedMedia {
    pub fn new(label: &str, denials: usize) -> Self {
        Self {
            denials: AtomicUsize::new(denials),
            requests: AtomicUsize::new(0),
            inner: SyntheticMediaSource::new(label),
        }
    }

    /// Capture requests seen so far
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for ScriptedMedia {
    async fn acquire_stream(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaAccessError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let denied = self
            .denials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if denied {
            return Err(MediaAccessError::PermissionDenied);
        }
        self.inner.acquire_stream(constraints).await
    }
}

/// A running session plus its scripted collaborators
pub struct CallHarness {
    pub handle: SessionHandle,
    pub links: Arc<ScriptedLinks>,
    pub signaling: Arc<RecordingSignaling>,
    pub media: Arc<ScriptedMedia>,
    notices: mpsc::UnboundedReceiver<CallNotice>,
    seen: Vec<CallNotice>,
    partner: String,
    task: JoinHandle<remotemedia_call_link::Result<()>>,
}

impl CallHarness {
    /// Start a session with default configuration
    pub fn start(local_id: &str) -> Self {
        Self::with_config(CallLinkConfig::default(), local_id)
    }

    /// Start a session with `config`
    pub fn with_config(config: CallLinkConfig, local_id: &str) -> Self {
        Self::build(config, local_id, 0)
    }

    /// Start a session whose first `denials` capture requests are refused
    pub fn with_media_denials(local_id: &str, denials: usize) -> Self {
        Self::build(CallLinkConfig::default(), local_id, denials)
    }

    fn build(config: CallLinkConfig, local_id: &str, denials: usize) -> Self {
        let links = Arc::new(ScriptedLinks::new());
        let signaling = Arc::new(RecordingSignaling::default());
        let media = Arc::new(ScriptedMedia::new(local_id, denials));
        let (driver, handle, notices) = SessionDriver::new(
            &config,
            local_id,
            links.clone(),
            media.clone(),
            signaling.clone(),
        );
        let task = tokio::spawn(driver.run());

        Self {
            handle,
            links,
            signaling,
            media,
            notices,
            seen: Vec::new(),
            partner: String::new(),
            task,
        }
    }

    /// Let spawned operations run and their results come back
    pub async fn settle(&self) {
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Settle until `condition` holds
    pub async fn until(&self, what: &str, condition: impl Fn(&Self) -> bool) -> HarnessResult<()> {
        for _ in 0..1_000 {
            if condition(self) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Err(HarnessError::Timeout(what.to_string()))
    }

    /// Next notice, waiting in virtual time
    pub async fn next_notice(&mut self) -> HarnessResult<CallNotice> {
        let notice = tokio::time::timeout(WAIT_LIMIT, self.notices.recv())
            .await
            .map_err(|_| HarnessError::Timeout("notice".to_string()))?
            .ok_or(HarnessError::Closed)?;
        self.seen.push(notice.clone());
        Ok(notice)
    }

    /// Wait for the first notice matching `predicate`
    pub async fn wait_for(
        &mut self,
        predicate: impl Fn(&CallNotice) -> bool,
    ) -> HarnessResult<CallNotice> {
        loop {
            let notice = self.next_notice().await?;
            if predicate(&notice) {
                return Ok(notice);
            }
        }
    }

    /// Collect notices already delivered without waiting
    pub fn drain(&mut self) -> &[CallNotice] {
        while let Ok(notice) = self.notices.try_recv() {
            self.seen.push(notice);
        }
        &self.seen
    }

    /// Every notice seen so far
    pub fn seen(&mut self) -> Vec<CallNotice> {
        self.drain().to_vec()
    }

    /// Match with `partner`, finish offer/answer and report the link healthy
    ///
    /// Assumes the local id sorts before `partner`, so we are the offerer.
    /// Returns the connected link's generation.
    pub async fn connect(&mut self, partner: &str, room: &str) -> HarnessResult<u64> {
        self.partner = partner.to_string();
        self.handle.matched(partner, room)?;

        self.until("local offer", |h| {
            h.signaling
                .count(|s| matches!(s, OutboundSignal::Offer { .. }))
                > 0
        })
        .await?;
        let generation = self
            .links
            .latest()
            .ok_or_else(|| HarnessError::Timeout("link".to_string()))?;

        self.answer(generation).await?;
        self.links.set_state(generation, LinkState::Connected);
        self.wait_for(|n| matches!(n, CallNotice::Connected { .. }))
            .await?;
        Ok(generation)
    }

    /// Match with `partner` as the answering side and report the link healthy
    ///
    /// Assumes `partner` sorts before the local id, so the partner offers.
    /// Returns the connected link's generation.
    pub async fn respond(&mut self, partner: &str, room: &str) -> HarnessResult<u64> {
        self.partner = partner.to_string();
        self.handle.matched(partner, room)?;
        self.handle.signal(InboundSignal::Offer {
            from: Some(partner.to_string()),
            sdp: format!("offer-from-{}", partner),
            ice_restart: false,
            rebuilt: false,
        })?;

        self.until("local answer", |h| {
            h.signaling
                .count(|s| matches!(s, OutboundSignal::Answer { .. }))
                > 0
        })
        .await?;
        let generation = self
            .links
            .latest()
            .ok_or_else(|| HarnessError::Timeout("link".to_string()))?;

        self.links.set_state(generation, LinkState::Connected);
        self.wait_for(|n| matches!(n, CallNotice::Connected { .. }))
            .await?;
        Ok(generation)
    }

    /// Deliver the partner's answer and wait until link `generation` applied it
    pub async fn answer(&self, generation: u64) -> HarnessResult<()> {
        self.handle.signal(InboundSignal::Answer {
            from: Some(self.partner.clone()),
            sdp: format!("answer-from-{}", self.partner),
        })?;
        self.until("answer applied", |h| {
            h.links
                .ops(generation)
                .iter()
                .any(|op| matches!(op, LinkOp::ApplyAnswer { .. }))
        })
        .await
    }

    /// Stop the driver and wait for it
    pub async fn shutdown(self) {
        self.handle.shutdown();
        let _ = self.task.await;
    }
}
