//! Pull replication.
//!
//! A replication pulls documents from a remote source into one collection.
//! It runs as two background tasks:
//!
//! - the **pump** consumes the live [`PullStream`] as soon as the replication
//!   starts and forwards every event into the apply queue;
//! - the **worker** waits for the collection's migration gate, runs the
//!   initial handler loop, then drains the apply queue in arrival order.
//!
//! Batches that arrive while the collection is still migrating or while the
//! initial sync runs stay in the queue; nothing is dropped.
//!
//! Documents go through the collection's write path: modifier, schema
//! validation, conflict resolution under the collection writer, storage,
//! change event bus.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc as stream_channel;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::collection::{into_fields, IncomingDocument};
use crate::fanout::{Fanout, Subscription};
use crate::{
    error::Result, Checkpoint, Collection, CollectionSchema, Document, EngineConfig, Error,
    Fields, RevisionId,
};

/// Meta field carrying the revision of a pulled document.
pub const REVISION_FIELD: &str = "_rev";

/// Meta field flagging a pulled document as deleted.
pub const DELETED_FIELD: &str = "_deleted";

/// One page of documents from the pull source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullBatch {
    /// Raw documents, JSON objects
    pub documents: Vec<serde_json::Value>,
    /// Checkpoint to resume from after this batch
    pub checkpoint: Option<Checkpoint>,
}

impl PullBatch {
    pub fn new(documents: Vec<serde_json::Value>, checkpoint: Option<Checkpoint>) -> Self {
        Self {
            documents,
            checkpoint,
        }
    }

    /// A batch signalling there is nothing more to pull.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Event delivered through a live pull stream.
#[derive(Debug, Clone, PartialEq)]
pub enum PullStreamEvent {
    /// Documents pushed by the remote
    Batch(PullBatch),
    /// The remote lost track; re-run the handler loop from the checkpoint
    Resync,
}

impl From<PullBatch> for PullStreamEvent {
    fn from(batch: PullBatch) -> Self {
        PullStreamEvent::Batch(batch)
    }
}

/// Live source of pull events.
pub struct PullStream {
    events: BoxStream<'static, PullStreamEvent>,
    /// Events sent so far, when the stream is fed by a [`PullStreamSender`]
    sent: Option<Arc<AtomicU64>>,
}

impl PullStream {
    /// Wrap any stream of events.
    pub fn new<S>(events: S) -> Self
    where
        S: Stream<Item = PullStreamEvent> + Send + 'static,
    {
        Self {
            events: events.boxed(),
            sent: None,
        }
    }
}

impl std::fmt::Debug for PullStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullStream")
            .field("counted", &self.sent.is_some())
            .finish()
    }
}

/// Create a channel-backed pull stream.
///
/// The sender counts what it sends, so [`ReplicationHandle::await_in_sync`]
/// also waits for events still in flight.
pub fn pull_stream() -> (PullStreamSender, PullStream) {
    let (tx, rx) = stream_channel::unbounded();
    let sent = Arc::new(AtomicU64::new(0));
    (
        PullStreamSender {
            tx,
            sent: Arc::clone(&sent),
        },
        PullStream {
            events: rx.boxed(),
            sent: Some(sent),
        },
    )
}

/// Sending side of [`pull_stream`]. Never blocks.
#[derive(Clone)]
pub struct PullStreamSender {
    tx: stream_channel::UnboundedSender<PullStreamEvent>,
    sent: Arc<AtomicU64>,
}

impl PullStreamSender {
    /// Push an event to the replication.
    pub fn send(&self, event: impl Into<PullStreamEvent>) -> Result<()> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.tx.unbounded_send(event.into()).map_err(|_| {
            self.sent.fetch_sub(1, Ordering::SeqCst);
            Error::StreamClosed
        })
    }

    /// End the stream.
    pub fn close(&self) {
        self.tx.close_channel();
    }

    /// Number of events sent so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for PullStreamSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullStreamSender")
            .field("sent", &self.sent())
            .finish()
    }
}

type HandlerFn = dyn Fn(Option<Checkpoint>) -> BoxFuture<'static, std::result::Result<PullBatch, String>>
    + Send
    + Sync;

type ModifierFn = dyn Fn(Fields) -> std::result::Result<Fields, String> + Send + Sync;

/// Pull side of a replication.
pub struct PullOptions {
    handler: Arc<HandlerFn>,
    stream: Option<PullStream>,
    modifier: Option<Arc<ModifierFn>>,
}

impl PullOptions {
    /// Pull with `handler`, called with the last saved checkpoint.
    pub fn new<F, Fut, E>(handler: F) -> Self
    where
        F: Fn(Option<Checkpoint>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<PullBatch, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let handler: Arc<HandlerFn> = Arc::new(move |checkpoint| {
            let pulled = handler(checkpoint);
            async move { pulled.await.map_err(|e| e.to_string()) }.boxed()
        });

        Self {
            handler,
            stream: None,
            modifier: None,
        }
    }

    /// Also consume a live stream.
    pub fn stream(mut self, stream: PullStream) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Transform every pulled document before it is validated.
    pub fn modifier<F>(mut self, modifier: F) -> Self
    where
        F: Fn(Fields) -> std::result::Result<Fields, String> + Send + Sync + 'static,
    {
        self.modifier = Some(Arc::new(modifier));
        self
    }
}

impl std::fmt::Debug for PullOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullOptions")
            .field("stream", &self.stream)
            .field("modifier", &self.modifier.is_some())
            .finish()
    }
}

/// Options for [`Collection::replicate`].
#[derive(Debug)]
pub struct ReplicationOptions {
    /// Identifies the replication and its checkpoint row
    pub identifier: String,
    /// Keep consuming the stream after the initial sync
    pub live: bool,
    pub pull: PullOptions,
    /// Retry settings; the database's when absent
    pub config: Option<EngineConfig>,
}

impl ReplicationOptions {
    /// Live replication with the database's retry settings.
    pub fn new(identifier: impl Into<String>, pull: PullOptions) -> Self {
        Self {
            identifier: identifier.into(),
            live: true,
            pull,
            config: None,
        }
    }

    pub fn live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Override the pull retry policy.
    pub fn retry(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        let base = EngineConfig::default();
        self.config = Some(EngineConfig {
            pull_max_attempts: max_attempts.max(1),
            pull_retry_base: base_delay,
            pull_retry_max: base.pull_retry_max.max(base_delay),
        });
        self
    }
}

/// Lifecycle of a replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationStatus {
    /// Finished: non-live after the initial sync, or the stream closed
    Stopped,
    InitialSync,
    /// Applying queued stream events
    Streaming,
    /// Queue drained
    InSync,
    Canceled,
    Failed(Error),
}

impl ReplicationStatus {
    /// No further progress will be made.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplicationStatus::Canceled | ReplicationStatus::Failed(_))
    }
}

/// Snapshot of a replication's progress.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationState {
    pub identifier: String,
    pub live: bool,
    pub status: ReplicationStatus,
    pub last_checkpoint: Option<Checkpoint>,
    /// Events handed to the apply queue
    pub enqueued: u64,
    /// Events the worker finished with
    pub processed: u64,
    /// Events taken from the live stream
    pub stream_events: u64,
    pub initial_done: bool,
}

/// A batch or document the replication could not apply.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationError {
    pub identifier: String,
    pub cause: Error,
    /// The rejected batch, when the whole batch was skipped
    pub batch: Option<PullBatch>,
}

enum QueueItem {
    Event(PullStreamEvent),
    StreamEnded,
}

struct Shared {
    collection: Collection,
    identifier: String,
    live: bool,
    config: EngineConfig,
    state: watch::Sender<ReplicationState>,
    cancel: watch::Sender<bool>,
    queue: mpsc::UnboundedSender<QueueItem>,
    stream_sent: Option<Arc<AtomicU64>>,
    received: Arc<Fanout<Document>>,
    errors: Arc<Fanout<ReplicationError>>,
}

impl Shared {
    /// Update the status unless the replication was canceled.
    fn set_status(&self, status: ReplicationStatus) {
        self.state.send_if_modified(|state| {
            if state.status == ReplicationStatus::Canceled || state.status == status {
                return false;
            }
            state.status = status;
            true
        });
    }

    fn report(&self, cause: Error, batch: Option<&PullBatch>) {
        let error = ReplicationError {
            identifier: self.identifier.clone(),
            cause,
            batch: batch.cloned(),
        };
        self.errors.broadcast(&error);
    }
}

/// Handle to a running replication. Cheap to clone.
#[derive(Clone)]
pub struct ReplicationHandle {
    shared: Arc<Shared>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ReplicationHandle {
    /// Spawn the pump and worker tasks.
    pub(crate) fn start(collection: Collection, options: ReplicationOptions) -> Self {
        let ReplicationOptions {
            identifier,
            live,
            pull,
            config,
        } = options;
        let PullOptions {
            handler,
            stream,
            modifier,
        } = pull;
        let config = config.unwrap_or_else(|| collection.config().clone());
        let stream = stream.filter(|_| live);

        let (queue, queue_rx) = mpsc::unbounded_channel();
        let (cancel, _) = watch::channel(false);
        let (state, _) = watch::channel(ReplicationState {
            identifier: identifier.clone(),
            live,
            status: ReplicationStatus::InitialSync,
            last_checkpoint: collection.checkpoints().load(&identifier),
            enqueued: 0,
            processed: 0,
            stream_events: 0,
            initial_done: false,
        });

        let span = tracing::info_span!(
            "replication",
            collection = %collection.name(),
            identifier = %identifier
        );
        let shared = Arc::new(Shared {
            collection,
            identifier,
            live,
            config,
            state,
            cancel,
            queue,
            stream_sent: stream.as_ref().and_then(|s| s.sent.clone()),
            received: Fanout::new_shared(),
            errors: Fanout::new_shared(),
        });

        let mut tasks = Vec::with_capacity(2);
        if let Some(stream) = stream {
            let pump = run_pump(Arc::clone(&shared), stream.events, shared.cancel.subscribe());
            tasks.push(tokio::spawn(pump.instrument(span.clone())));
        }
        let worker = Worker {
            shared: Arc::clone(&shared),
            handler,
            modifier,
        };
        let cancel_rx = shared.cancel.subscribe();
        tasks.push(tokio::spawn(worker.run(queue_rx, cancel_rx).instrument(span)));

        Self {
            shared,
            tasks: Arc::new(Mutex::new(tasks)),
        }
    }

    /// Replication identifier.
    pub fn identifier(&self) -> &str {
        &self.shared.identifier
    }

    /// Current state snapshot.
    pub fn state(&self) -> ReplicationState {
        self.shared.state.borrow().clone()
    }

    /// Current status.
    pub fn status(&self) -> ReplicationStatus {
        self.shared.state.borrow().status.clone()
    }

    /// Receiver following every state change.
    pub fn watch_status(&self) -> watch::Receiver<ReplicationState> {
        self.shared.state.subscribe()
    }

    /// Every document applied from now on.
    pub fn received(&self) -> Subscription<Document> {
        self.shared.received.subscribe()
    }

    /// Every rejected batch or document from now on.
    pub fn errors(&self) -> Subscription<ReplicationError> {
        self.shared.errors.subscribe()
    }

    /// Stopped, failed or canceled: the identifier may be started again.
    pub fn is_finished(&self) -> bool {
        let status = self.status();
        status == ReplicationStatus::Stopped || status.is_terminal()
    }

    pub(crate) fn same_as(&self, other: &ReplicationHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Signal both tasks to stop without waiting for them.
    pub(crate) fn halt(&self) {
        self.shared.cancel.send_replace(true);
    }

    fn terminal_error(&self, status: ReplicationStatus) -> Error {
        match status {
            ReplicationStatus::Failed(err) => err,
            _ => Error::ReplicationCanceled(self.shared.identifier.clone()),
        }
    }

    /// Wait until the initial handler loop has been applied.
    pub async fn await_initial_replication(&self) -> Result<()> {
        let mut state = self.shared.state.subscribe();
        let reached = state
            .wait_for(|s| s.initial_done || s.status.is_terminal())
            .await
            .map(|s| (s.initial_done, s.status.clone()));

        match reached {
            Ok((true, _)) => Ok(()),
            Ok((false, status)) => Err(self.terminal_error(status)),
            Err(_) => Err(Error::ReplicationCanceled(self.shared.identifier.clone())),
        }
    }

    /// Wait until everything pushed or queued before this call is applied.
    pub async fn await_in_sync(&self) -> Result<()> {
        self.await_initial_replication().await?;

        let mut state = self.shared.state.subscribe();
        let target = {
            let current = state.borrow();
            current.enqueued + self.pending_in_stream(current.stream_events)
        };

        let reached = state
            .wait_for(|s| {
                s.processed >= target
                    || s.status == ReplicationStatus::Stopped
                    || s.status.is_terminal()
            })
            .await
            .map(|s| s.status.clone());

        match reached {
            Ok(status) if status.is_terminal() => Err(self.terminal_error(status)),
            Ok(_) => Ok(()),
            Err(_) => Err(Error::ReplicationCanceled(self.shared.identifier.clone())),
        }
    }

    /// Events sent to a counted stream but not yet taken by the pump.
    fn pending_in_stream(&self, taken: u64) -> u64 {
        self.shared
            .stream_sent
            .as_ref()
            .map_or(0, |sent| sent.load(Ordering::SeqCst).saturating_sub(taken))
    }

    /// Re-run the handler loop from the saved checkpoint.
    ///
    /// Runs after everything already queued.
    pub fn re_sync(&self) {
        if *self.shared.cancel.borrow() {
            return;
        }
        self.shared.state.send_modify(|s| s.enqueued += 1);
        if self
            .shared
            .queue
            .send(QueueItem::Event(PullStreamEvent::Resync))
            .is_err()
        {
            tracing::debug!(identifier = %self.shared.identifier, "Resync ignored, worker stopped");
        }
    }

    /// Stop the replication.
    ///
    /// Returns once both tasks have finished; no write happens afterwards.
    pub async fn cancel(&self) {
        let mut tasks = self.tasks.lock().await;
        let already = self.shared.cancel.send_replace(true);

        for task in tasks.drain(..) {
            if let Err(err) = task.await {
                if err.is_panic() {
                    tracing::error!(identifier = %self.shared.identifier, "Replication task panicked");
                }
            }
        }
        drop(tasks);

        self.shared.state.send_if_modified(|s| {
            let changed = s.status != ReplicationStatus::Canceled;
            s.status = ReplicationStatus::Canceled;
            changed
        });
        self.shared.collection.unregister_replication(self);

        if !already {
            tracing::info!(
                collection = %self.shared.collection.name(),
                identifier = %self.shared.identifier,
                "Replication canceled"
            );
        }
    }
}

impl std::fmt::Debug for ReplicationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationHandle")
            .field("identifier", &self.shared.identifier)
            .field("status", &self.status())
            .finish()
    }
}

/// Resolves once cancellation was requested.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|c| *c).await;
}

async fn run_pump(
    shared: Arc<Shared>,
    mut events: BoxStream<'static, PullStreamEvent>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return,
            next = events.next() => next,
        };

        match next {
            Some(event) => {
                shared.state.send_modify(|s| {
                    s.enqueued += 1;
                    s.stream_events += 1;
                });
                if shared.queue.send(QueueItem::Event(event)).is_err() {
                    return;
                }
            }
            None => {
                tracing::debug!("Pull stream ended");
                let _ = shared.queue.send(QueueItem::StreamEnded);
                return;
            }
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    handler: Arc<HandlerFn>,
    modifier: Option<Arc<ModifierFn>>,
}

impl Worker {
    async fn run(
        self,
        mut queue: mpsc::UnboundedReceiver<QueueItem>,
        mut cancel: watch::Receiver<bool>,
    ) {
        tracing::info!(live = self.shared.live, "Replication started");

        let gate = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return,
            gate = self.shared.collection.ready() => gate,
        };
        if let Err(err) = gate {
            self.fail(err);
            return;
        }

        let initial = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return,
            initial = self.pull_until_drained() => initial,
        };
        if let Err(err) = initial {
            self.fail(err);
            return;
        }
        self.shared.state.send_modify(|s| s.initial_done = true);
        tracing::info!("Initial replication done");

        if !self.shared.live {
            self.shared.set_status(ReplicationStatus::Stopped);
            return;
        }

        let mut stream_closed = false;
        self.settle(stream_closed);

        loop {
            let item = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return,
                item = queue.recv() => item,
            };
            let Some(item) = item else {
                return;
            };

            match item {
                QueueItem::StreamEnded => {
                    tracing::warn!("Pull stream closed");
                    stream_closed = true;
                    self.shared.report(Error::StreamClosed, None);
                }
                QueueItem::Event(event) => {
                    self.shared.set_status(ReplicationStatus::Streaming);
                    let step = async {
                        match event {
                            PullStreamEvent::Batch(batch) => {
                                self.apply_batch(&batch).await;
                                Ok(())
                            }
                            PullStreamEvent::Resync => {
                                tracing::debug!("Resync requested");
                                self.pull_until_drained().await
                            }
                        }
                    };
                    let outcome = tokio::select! {
                        biased;
                        _ = cancelled(&mut cancel) => return,
                        outcome = step => outcome,
                    };
                    if let Err(err) = outcome {
                        self.shared.report(err, None);
                    }
                    self.shared.state.send_modify(|s| s.processed += 1);
                }
            }

            self.settle(stream_closed);
        }
    }

    /// Status after handling a queue item.
    fn settle(&self, stream_closed: bool) {
        let drained = {
            let state = self.shared.state.borrow();
            state.processed >= state.enqueued
        };
        self.shared.set_status(match (drained, stream_closed) {
            (false, _) => ReplicationStatus::Streaming,
            (true, true) => ReplicationStatus::Stopped,
            (true, false) => ReplicationStatus::InSync,
        });
    }

    fn fail(&self, err: Error) {
        tracing::error!(error = %err, "Replication failed");
        self.shared.report(err.clone(), None);
        self.shared.set_status(ReplicationStatus::Failed(err));
    }

    /// Call the handler until the source has nothing newer.
    ///
    /// Ends when a round-trip returns no documents or does not advance the
    /// checkpoint, or when a batch was rejected.
    async fn pull_until_drained(&self) -> Result<()> {
        let checkpoints = self.shared.collection.checkpoints();

        loop {
            let checkpoint = checkpoints.load(&self.shared.identifier);
            let batch = self.pull(checkpoint.clone()).await?;
            let advanced = batch.checkpoint.is_some() && batch.checkpoint != checkpoint;

            if !batch.documents.is_empty() {
                if !self.apply_batch(&batch).await {
                    return Ok(());
                }
            } else if let Some(next) = batch.checkpoint.clone().filter(|_| advanced) {
                self.save_checkpoint(next);
            }

            if batch.documents.is_empty() || !advanced {
                return Ok(());
            }
        }
    }

    /// One handler round-trip, retried with backoff.
    async fn pull(&self, checkpoint: Option<Checkpoint>) -> Result<PullBatch> {
        let max_attempts = self.shared.config.pull_max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match (self.handler)(checkpoint.clone()).await {
                Ok(batch) => {
                    tracing::debug!(
                        documents = batch.documents.len(),
                        attempt,
                        "Pulled batch"
                    );
                    return Ok(batch);
                }
                Err(reason) if attempt >= max_attempts => {
                    return Err(Error::PullHandlerFailed {
                        attempts: attempt,
                        reason,
                    });
                }
                Err(reason) => {
                    let delay = self.shared.config.retry_delay(attempt);
                    tracing::warn!(attempt, ?delay, %reason, "Pull failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Apply a batch through the collection's write path.
    ///
    /// Returns `false` when the batch was rejected; its checkpoint is then
    /// not saved.
    async fn apply_batch(&self, batch: &PullBatch) -> bool {
        let schema = self.shared.collection.schema();
        let mut incoming = Vec::with_capacity(batch.documents.len());

        for raw in &batch.documents {
            match prepare(raw, schema, self.modifier.as_deref()) {
                Ok(document) => incoming.push(document),
                Err(err) => {
                    tracing::warn!(error = %err, "Rejected pulled batch");
                    self.shared.report(err, Some(batch));
                    return false;
                }
            }
        }

        let outcome = match self.shared.collection.apply_remote(incoming).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(error = %err, "Could not apply pulled batch");
                self.shared.report(err, Some(batch));
                return false;
            }
        };

        for document in &outcome.applied {
            self.shared.received.broadcast(document);
        }
        let unresolved = outcome.unresolved.len();
        for err in outcome.unresolved {
            self.shared.report(err, None);
        }
        if let Some(checkpoint) = batch.checkpoint.clone() {
            self.save_checkpoint(checkpoint);
        }

        tracing::debug!(
            documents = batch.documents.len(),
            applied = outcome.applied.len(),
            unresolved,
            "Applied pulled batch"
        );
        true
    }

    fn save_checkpoint(&self, checkpoint: Checkpoint) {
        self.shared
            .collection
            .checkpoints()
            .save(&self.shared.identifier, checkpoint.clone());
        self.shared
            .state
            .send_modify(|s| s.last_checkpoint = Some(checkpoint));
    }
}

/// Strip meta fields, run the modifier and validate one pulled document.
fn prepare(
    raw: &serde_json::Value,
    schema: &CollectionSchema,
    modifier: Option<&ModifierFn>,
) -> Result<IncomingDocument> {
    let mut fields = into_fields(raw.clone())?;

    let revision = match fields.remove(REVISION_FIELD) {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(text)) => Some(text.parse::<RevisionId>()?),
        Some(other) => return Err(Error::InvalidRevision(other.to_string())),
    };
    let deleted = match fields.remove(DELETED_FIELD) {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::Bool(deleted)) => deleted,
        Some(other) => {
            return Err(Error::InvalidPayload(format!(
                "{DELETED_FIELD} must be a boolean, got {other}"
            )));
        }
    };

    let fields = match modifier {
        Some(modifier) => modifier(fields).map_err(Error::BatchModifierRejected)?,
        None => fields,
    };

    let primary_key = schema.primary_key_of(&fields)?.to_string();
    if !deleted {
        schema.validate_payload(&fields)?;
    }

    Ok(IncomingDocument {
        primary_key,
        fields,
        revision,
        deleted,
    })
}
