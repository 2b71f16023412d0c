//! Async driver for the state machine
//!
//! One tokio task owns the [`ConnectionStateMachine`]. It waits on the event
//! queue, the next timer deadline and a shutdown token, feeds whatever woke
//! it into the machine, then executes the commands the machine queued.
//! Media acquisition and link construction run as spawned tasks scoped to a
//! cancellation token. Operations on a built link go through that link's own
//! worker, one at a time and in issue order. Everything reports back through
//! the same queue.

use super::events::{CallNotice, Command, MediaOutcome, OperationOutcome, SessionEvent};
use super::machine::ConnectionStateMachine;
use crate::config::{CallLinkConfig, MediaConstraints};
use crate::media::{MediaSource, MediaStream};
use crate::peer::{LinkEventSink, LinkOptions, PeerLink, PeerLinkFactory};
use crate::signaling::protocol::InboundSignal;
use crate::signaling::SignalingSink;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A built link and the queue of its operation worker
struct LinkEntry {
    generation: u64,
    link: Arc<dyn PeerLink>,
    ops: mpsc::UnboundedSender<Command>,
    worker: CancellationToken,
}

impl LinkEntry {
    async fn close(self) {
        self.worker.cancel();
        close_link(self.link.as_ref(), self.generation).await;
    }
}

/// Which link generation is wanted and which one is built
#[derive(Default)]
struct LinkSlot {
    wanted: Option<u64>,
    current: Option<LinkEntry>,
}

impl LinkSlot {
    fn queue(&self, generation: u64) -> Option<mpsc::UnboundedSender<Command>> {
        match &self.current {
            Some(entry) if entry.generation == generation => Some(entry.ops.clone()),
            _ => None,
        }
    }

    fn take(&mut self, generation: u64) -> Option<LinkEntry> {
        match self.current.take() {
            Some(entry) if entry.generation == generation => Some(entry),
            other => {
                self.current = other;
                None
            }
        }
    }
}

/// Cloneable handle for feeding a running [`SessionDriver`]
#[derive(Clone)]
pub struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: CancellationToken,
}

impl SessionHandle {
    /// Post a raw event
    pub fn send(&self, event: SessionEvent) -> Result<()> {
        self.events.send(event).map_err(|_| Error::SessionEnded)
    }

    /// Sender for collaborators that post events themselves
    pub fn events(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.events.clone()
    }

    /// The rendezvous paired us with `partner_id` in `room_id`
    pub fn matched(&self, partner_id: &str, room_id: &str) -> Result<()> {
        self.send(SessionEvent::Matched {
            partner_id: partner_id.to_string(),
            room_id: room_id.to_string(),
        })
    }

    /// Deliver an inbound signaling message
    pub fn signal(&self, signal: InboundSignal) -> Result<()> {
        self.send(SessionEvent::Signal(signal))
    }

    /// End the call
    pub fn hangup(&self) -> Result<()> {
        self.send(SessionEvent::Hangup)
    }

    /// The process is going away
    pub fn browser_closing(&self) -> Result<()> {
        self.send(SessionEvent::BrowserClosing)
    }

    /// Start over after the session ended
    pub fn try_again(&self) -> Result<()> {
        self.send(SessionEvent::TryAgain)
    }

    /// Retry capture after a media failure
    pub fn retry_media(&self) -> Result<()> {
        self.send(SessionEvent::RetryMedia)
    }

    /// Application-level activity
    pub fn activity(&self) -> Result<()> {
        self.send(SessionEvent::Activity)
    }

    /// A capture track ended on its own
    pub fn track_ended(&self) -> Result<()> {
        self.send(SessionEvent::TrackEnded)
    }

    /// Stop the driver task
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Runs one session's state machine against real collaborators
pub struct SessionDriver {
    machine: ConnectionStateMachine,
    constraints: MediaConstraints,
    links: Arc<dyn PeerLinkFactory>,
    media: Arc<dyn MediaSource>,
    signaling: Arc<dyn SignalingSink>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    notices: mpsc::UnboundedSender<CallNotice>,
    link: Arc<Mutex<LinkSlot>>,
    stream: Arc<RwLock<Option<MediaStream>>>,
    shutdown: CancellationToken,
    tasks: CancellationToken,
}

impl SessionDriver {
    /// Create a driver, its handle and the stream of caller notices
    pub fn new(
        config: &CallLinkConfig,
        local_id: &str,
        links: Arc<dyn PeerLinkFactory>,
        media: Arc<dyn MediaSource>,
        signaling: Arc<dyn SignalingSink>,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<CallNotice>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let tasks = shutdown.child_token();

        let handle = SessionHandle {
            events: events_tx.clone(),
            shutdown: shutdown.clone(),
        };

        let driver = Self {
            machine: ConnectionStateMachine::new(config, local_id),
            constraints: config.media.clone(),
            links,
            media,
            signaling,
            events_tx,
            events_rx,
            notices,
            link: Arc::new(Mutex::new(LinkSlot::default())),
            stream: Arc::new(RwLock::new(None)),
            shutdown,
            tasks,
        };

        (driver, handle, notices_rx)
    }

    /// Sender for collaborators that post events themselves
    pub fn events(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.events_tx.clone()
    }

    /// Run until [`SessionHandle::shutdown`]
    pub async fn run(mut self) -> Result<()> {
        info!(
            local_id = self.machine.core().local_id(),
            "Session driver started"
        );

        loop {
            let deadline = self.machine.next_deadline();

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    self.drain_queued().await;
                    break;
                }

                event = self.events_rx.recv() => {
                    // The driver holds a sender, so the queue never closes
                    let Some(event) = event else { break };
                    self.machine.handle_event(event, Instant::now());
                }

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.machine.handle_timeout(Instant::now());
                }
            }

            for command in self.machine.drain_commands() {
                self.execute(command).await;
            }
        }

        self.release().await;
        info!("Session driver stopped");
        Ok(())
    }

    /// Feed events that were queued before shutdown, so a hangup or a
    /// closing notice posted just ahead of it still reaches the server
    async fn drain_queued(&mut self) {
        let mut drained = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            drained += 1;
            self.machine.handle_event(event, Instant::now());
        }
        if drained > 0 {
            debug!(drained, "Processing events queued before shutdown");
        }
        for command in self.machine.drain_commands() {
            self.execute(command).await;
        }
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::AcquireMedia => self.acquire_media(),
            Command::StopMedia => {
                // Outcomes of in-flight captures are no longer wanted
                self.tasks.cancel();
                self.tasks = self.shutdown.child_token();
                if let Some(stream) = self.stream.write().await.take() {
                    stream.stop();
                    debug!(stream_id = stream.id(), "Media stopped");
                }
            }
            Command::CreatePeerLink {
                generation,
                relay_only,
            } => {
                self.link.lock().await.wanted = Some(generation);
                self.create_link(generation, relay_only);
            }
            Command::CloseLink { generation } => {
                let entry = {
                    let mut slot = self.link.lock().await;
                    if slot.wanted == Some(generation) {
                        slot.wanted = None;
                    }
                    slot.take(generation)
                };
                if let Some(entry) = entry {
                    entry.close().await;
                }
            }
            Command::Send(signal) => {
                if let Err(e) = self.signaling.send(signal).await {
                    warn!("Failed to send signaling message: {}", e);
                }
            }
            Command::Notify(notice) => {
                if self.notices.send(notice).is_err() {
                    debug!("Notice receiver dropped");
                }
            }
            command => self.run_link_operation(command).await,
        }
    }

    fn acquire_media(&self) {
        let media = self.media.clone();
        let constraints = self.constraints.clone();
        let slot = self.stream.clone();
        let events = self.events_tx.clone();
        let token = self.tasks.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = media.acquire_stream(&constraints) => result,
            };

            let outcome = match result {
                Ok(stream) => {
                    if token.is_cancelled() {
                        stream.stop();
                        return;
                    }
                    let tracks = stream.tracks().len();
                    if let Some(previous) = slot.write().await.replace(stream) {
                        previous.stop();
                    }
                    MediaOutcome::Acquired { tracks }
                }
                Err(e) => MediaOutcome::Failed(e),
            };
            let _ = events.send(SessionEvent::Media(outcome));
        });
    }

    fn create_link(&self, generation: u64, relay_only: bool) {
        let factory = self.links.clone();
        let slot = self.link.clone();
        let stream = self.stream.clone();
        let events = self.events_tx.clone();
        let token = self.tasks.clone();
        let worker = self.shutdown.child_token();
        let sink = LinkEventSink::new(generation, events.clone());

        tokio::spawn(async move {
            let options = LinkOptions {
                generation,
                relay_only,
            };
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = factory.create(options, sink) => result,
            };

            let result = match result {
                Ok(link) => attach(link, &stream).await,
                Err(e) => Err(e),
            };

            let outcome = match result {
                Ok(link) => {
                    let mut slot = slot.lock().await;
                    if slot.wanted != Some(generation) {
                        drop(slot);
                        debug!(generation, "Link superseded while building, closing");
                        close_link(link.as_ref(), generation).await;
                        return;
                    }

                    let (ops, queue) = mpsc::unbounded_channel();
                    tokio::spawn(operation_worker(
                        generation,
                        link.clone(),
                        queue,
                        events.clone(),
                        worker.clone(),
                    ));
                    let previous = slot.current.replace(LinkEntry {
                        generation,
                        link,
                        ops,
                        worker,
                    });
                    drop(slot);
                    if let Some(previous) = previous {
                        debug!(
                            generation = previous.generation,
                            "Replacing link that was never closed"
                        );
                        previous.close().await;
                    }
                    OperationOutcome::LinkCreated
                }
                Err(e) => OperationOutcome::Failed {
                    command: Box::new(Command::CreatePeerLink {
                        generation,
                        relay_only,
                    }),
                    error: e.to_string(),
                },
            };
            let _ = events.send(SessionEvent::Operation {
                generation,
                outcome,
            });
        });
    }

    async fn run_link_operation(&self, command: Command) {
        let Some(generation) = command.generation() else {
            return;
        };
        let Some(queue) = self.link.lock().await.queue(generation) else {
            debug!(generation, ?command, "No link for operation, dropping");
            return;
        };
        if let Err(rejected) = queue.send(command) {
            debug!(generation, command = ?rejected.0, "Link worker gone, dropping operation");
        }
    }

    async fn release(&mut self) {
        self.tasks.cancel();
        let entry = self.link.lock().await.current.take();
        if let Some(entry) = entry {
            debug!(generation = entry.generation, "Closing link on shutdown");
            entry.close().await;
        }
        if let Some(stream) = self.stream.write().await.take() {
            stream.stop();
        }
    }
}

/// Run one link's operations in the order they were issued
///
/// Description changes on a peer connection must not overlap, so each link
/// gets exactly one of these.
async fn operation_worker(
    generation: u64,
    link: Arc<dyn PeerLink>,
    mut queue: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    token: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = token.cancelled() => break,
            command = queue.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = perform(link.as_ref(), command.clone()) => result,
        };
        let outcome = result.unwrap_or_else(|e| OperationOutcome::Failed {
            command: Box::new(command),
            error: e.to_string(),
        });
        if events
            .send(SessionEvent::Operation {
                generation,
                outcome,
            })
            .is_err()
        {
            break;
        }
    }
    debug!(generation, "Link operation worker stopped");
}

async fn close_link(link: &dyn PeerLink, generation: u64) {
    if let Err(e) = link.close().await {
        warn!(generation, "Failed to close link: {}", e);
    }
}

async fn attach(
    link: Arc<dyn PeerLink>,
    stream: &RwLock<Option<MediaStream>>,
) -> Result<Arc<dyn PeerLink>> {
    if let Some(stream) = stream.read().await.as_ref() {
        if let Err(e) = link.attach_stream(stream).await {
            close_link(link.as_ref(), link.generation()).await;
            return Err(e);
        }
    }
    Ok(link)
}

async fn perform(link: &dyn PeerLink, command: Command) -> Result<OperationOutcome> {
    match command {
        Command::CreateOffer {
            ice_restart,
            rebuilt,
            ..
        } => {
            let sdp = link.create_offer(ice_restart).await?;
            Ok(OperationOutcome::OfferCreated {
                sdp,
                ice_restart,
                rebuilt,
            })
        }
        Command::AcceptOffer { sdp, rollback, .. } => {
            let sdp = link.accept_offer(sdp, rollback).await?;
            Ok(OperationOutcome::AnswerCreated { sdp })
        }
        Command::ApplyAnswer { sdp, .. } => {
            link.apply_answer(sdp).await?;
            Ok(OperationOutcome::AnswerApplied)
        }
        Command::AddRemoteCandidate { candidate, .. } => {
            link.add_remote_candidate(candidate).await?;
            Ok(OperationOutcome::CandidateAdded)
        }
        other => Err(Error::InternalError(format!(
            "not a link operation: {:?}",
            other
        ))),
    }
}
