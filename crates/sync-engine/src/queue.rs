//! Background sync queue
//!
//! Writes made while offline (or that simply don't need to land immediately)
//! are queued here and delivered to the remote store in throttled, atomic
//! batches. The queue:
//!
//! - keeps FIFO order and never mints a new id for an item it retries
//! - runs at most one drain loop at a time
//! - defers a whole batch untouched when no session is active
//! - retries items that cannot be turned into a remote write, then reports
//!   them as permanent failures
//! - re-queues a batch the remote store rejected, backing off exponentially
//!   and eventually marking itself stuck instead of spinning forever

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use parking_lot::Mutex;
use remote_store::{DocumentRef, RefError, RemoteWrite};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage::{LocalStore, LocalStoreExt};
use thiserror::Error;
use tokio::sync::{broadcast, Notify};

use crate::clock::Clock;
use crate::session::SessionContext;
use crate::usage::UsageTracker;

/// Key the pending queue is mirrored under when `persist_queue` is on
pub const QUEUE_KEY: &str = "sync_queue";

/// Key [`SyncConfig::from_store`] reads
pub const CONFIG_KEY: &str = "sync_config";

const EVENT_BUFFER: usize = 64;

/// A queued item could not be turned into a remote write
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Cannot build {operation} for {collection}/{id}: {source}")]
pub struct ConstructionError {
    /// Requested operation
    pub operation: Operation,
    /// Target collection
    pub collection: String,
    /// Target id
    pub id: String,
    /// What was wrong
    #[source]
    pub source: RefError,
}

/// Kind of change made locally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// New document
    Create,
    /// Changed document
    #[default]
    Update,
    /// Removed document
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// A pending mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Kind of change
    pub operation: Operation,
    /// Target collection
    pub collection: String,
    /// Document payload; absent for deletes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Document id, stable across retries
    pub id: String,
    /// When the item was queued, epoch milliseconds
    pub enqueued_at: i64,
    /// Failed delivery attempts so far
    #[serde(default)]
    pub attempts: u32,
}

impl QueueItem {
    /// Build the remote write for this item
    ///
    /// Creates and updates become merging upserts, deletes become deletes.
    pub fn to_write(&self) -> Result<RemoteWrite, ConstructionError> {
        build_write(self.operation, &self.collection, &self.id, self.data.clone())
    }
}

/// Build a remote write for `operation` on `collection/id`
pub(crate) fn build_write(
    operation: Operation,
    collection: &str,
    id: &str,
    data: Option<Value>,
) -> Result<RemoteWrite, ConstructionError> {
    let write = DocumentRef::new(collection, id).and_then(|doc| match operation {
        Operation::Create | Operation::Update => RemoteWrite::upsert(doc, data),
        Operation::Delete => Ok(RemoteWrite::delete(doc)),
    });

    write.map_err(|source| ConstructionError {
        operation,
        collection: collection.to_string(),
        id: id.to_string(),
        source,
    })
}

/// Configuration for the sync queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Maximum items per atomic batch
    pub batch_size: usize,

    /// Pause between batches, in milliseconds
    pub throttle_delay_ms: u64,

    /// Times an item that cannot be built is retried before it is dropped
    pub retry_attempts: u32,

    /// Upper bound on the pause after repeated batch failures, in milliseconds
    pub max_backoff_ms: u64,

    /// Consecutive batch failures before the queue reports itself stuck
    pub stuck_after: u32,

    /// Mirror the pending queue into the local store
    pub persist_queue: bool,

    /// How long the façade waits for a session before carrying on, in milliseconds
    pub readiness_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            throttle_delay_ms: 1000,
            retry_attempts: 3,
            max_backoff_ms: 60_000,
            stuck_after: 5,
            persist_queue: false,
            readiness_timeout_ms: 5_000,
        }
    }
}

impl SyncConfig {
    /// Read configuration from the local store, falling back to defaults
    pub fn from_store(store: &dyn LocalStore) -> Self {
        match store.get(CONFIG_KEY) {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::warn!("Ignoring malformed sync config: {}", e);
                Self::default()
            }),
            Ok(None) => Self::default(),
            Err(e) => {
                tracing::warn!("Failed to read sync config: {}", e);
                Self::default()
            }
        }
    }

    /// Set the batch size
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the pause between batches
    pub fn throttle_delay(mut self, delay: Duration) -> Self {
        self.throttle_delay_ms = millis(delay);
        self
    }

    /// Set the construction retry budget
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Set the backoff cap
    pub fn max_backoff(mut self, cap: Duration) -> Self {
        self.max_backoff_ms = millis(cap);
        self
    }

    /// Set the failure streak that marks the queue stuck
    pub fn stuck_after(mut self, failures: u32) -> Self {
        self.stuck_after = failures.max(1);
        self
    }

    /// Enable or disable queue persistence
    pub fn persist_queue(mut self, enabled: bool) -> Self {
        self.persist_queue = enabled;
        self
    }

    /// Set the session readiness timeout
    pub fn readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout_ms = millis(timeout);
        self
    }

    fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_delay_ms)
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.throttle().saturating_mul(2))
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(Duration::from_millis(self.max_backoff_ms))
            .with_max_elapsed_time(None)
            .build()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// An item dropped after exhausting its retries
#[derive(Debug, Clone, PartialEq)]
pub struct PermanentFailure {
    /// The dropped item
    pub item: QueueItem,
    /// Why it could not be delivered
    pub reason: String,
    /// When it was dropped, epoch milliseconds
    pub failed_at: i64,
}

/// Queue notifications
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A batch reached the remote store
    BatchCommitted {
        /// Writes in the batch
        count: usize,
    },

    /// The remote store rejected a batch; its items were re-queued
    BatchFailed {
        /// Writes in the batch
        count: usize,
        /// Remote error
        error: String,
        /// Failures in a row, this one included
        consecutive_failures: u32,
    },

    /// An item was dropped
    PermanentFailure(PermanentFailure),

    /// No session; the batch went back to the head of the queue
    Deferred {
        /// Items waiting
        queued: usize,
    },

    /// Repeated batch failures; the drain loop stopped
    Stuck {
        /// Failures in a row
        consecutive_failures: u32,
    },

    /// The queue emptied
    Drained,
}

/// Queue snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    /// Items waiting in the queue (not counting a batch in flight)
    pub queue_length: usize,
    /// Whether a drain loop is running
    pub processing: bool,
    /// Whether any change is still unsynced
    pub pending: bool,
    /// Whether repeated batch failures stopped the drain loop
    pub stuck: bool,
    /// Batch failures in a row
    pub consecutive_failures: u32,
    /// Items dropped so far
    pub permanent_failures: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    consecutive_failures: u32,
    stuck: bool,
    permanent_failures: Vec<PermanentFailure>,
    // Bumped by `clear` so an in-flight batch doesn't resurrect cleared items
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOutcome {
    Committed,
    NothingToSend,
    Failed,
    Deferred,
    Stuck,
    Cleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainExit {
    Emptied,
    Deferred,
    Stuck,
    Cleared,
}

/// Throttled, batching queue of pending remote writes
pub struct SyncQueue {
    config: SyncConfig,
    state: Arc<Mutex<QueueState>>,
    processing: Arc<AtomicBool>,
    cleared: Arc<Notify>,
    session: SessionContext,
    usage: Arc<UsageTracker>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn LocalStore>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncQueue {
    /// Create an empty queue
    pub fn new(
        config: SyncConfig,
        session: SessionContext,
        usage: Arc<UsageTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_BUFFER);

        Self {
            config,
            state: Arc::new(Mutex::new(QueueState::default())),
            processing: Arc::new(AtomicBool::new(false)),
            cleared: Arc::new(Notify::new()),
            session,
            usage,
            clock,
            store: None,
            events,
        }
    }

    /// Use `store` to mirror the queue when `persist_queue` is enabled
    pub fn with_store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Subscribe to queue notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Queue configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Session context the queue delivers under
    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Usage tracker commits are recorded in
    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    /// Queue a change and start draining if idle
    ///
    /// Never blocks and never fails. Returns the item's id, generated when
    /// `id` is `None`.
    pub fn enqueue(
        &self,
        operation: Operation,
        collection: impl Into<String>,
        data: Option<Value>,
        id: Option<String>,
    ) -> String {
        let item = QueueItem {
            operation,
            collection: collection.into(),
            data,
            id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            enqueued_at: self.clock.now_ms(),
            attempts: 0,
        };
        let id = item.id.clone();

        tracing::debug!("Queued {} {}/{}", item.operation, item.collection, item.id);
        {
            let mut state = self.state.lock();
            state.items.push_back(item);
            self.persist(&state);
        }

        self.kick();
        id
    }

    /// Start a drain in the background unless one is already running
    ///
    /// Outside a tokio runtime the items simply stay queued until the next
    /// call from inside one.
    pub fn kick(&self) {
        if self.processing.load(Ordering::SeqCst) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let queue = self.clone();
                handle.spawn(async move { queue.drain().await });
            }
            Err(_) => tracing::debug!("No runtime available, drain postponed"),
        }
    }

    /// Deliver queued items until the queue is empty
    ///
    /// Returns immediately if another drain is running. Also stops early when
    /// there is no session, when the queue is cleared, or when repeated batch
    /// failures mark it stuck.
    pub async fn drain(&self) {
        loop {
            if self
                .processing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                tracing::debug!("Drain already running");
                return;
            }

            let exit = self.run_batches().await;
            self.processing.store(false, Ordering::SeqCst);

            match exit {
                // Something may have been queued between the last check and the flag reset,
                // or after a clear while this drain was still committing
                DrainExit::Emptied | DrainExit::Cleared if !self.is_empty() => continue,
                DrainExit::Emptied => {
                    tracing::info!("Sync queue drained");
                    let _ = self.events.send(SyncEvent::Drained);
                }
                DrainExit::Deferred | DrainExit::Stuck | DrainExit::Cleared => {}
            }
            return;
        }
    }

    async fn run_batches(&self) -> DrainExit {
        let mut backoff = self.config.backoff();

        loop {
            let (batch, generation) = self.take_batch();
            if batch.is_empty() {
                return DrainExit::Emptied;
            }

            let pause = match self.deliver(batch, generation).await {
                BatchOutcome::Committed | BatchOutcome::NothingToSend => {
                    backoff.reset();
                    self.config.throttle()
                }
                BatchOutcome::Failed => backoff
                    .next_backoff()
                    .unwrap_or(Duration::from_millis(self.config.max_backoff_ms)),
                BatchOutcome::Deferred => return DrainExit::Deferred,
                BatchOutcome::Stuck => return DrainExit::Stuck,
                BatchOutcome::Cleared => return DrainExit::Cleared,
            };

            if self.is_empty() {
                return DrainExit::Emptied;
            }

            let cleared = self.cleared.notified();
            if self.generation() != generation {
                return DrainExit::Cleared;
            }
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cleared => {}
            }
            if self.generation() != generation {
                return DrainExit::Cleared;
            }
        }
    }

    fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn take_batch(&self) -> (Vec<QueueItem>, u64) {
        let mut state = self.state.lock();
        let count = self.config.batch_size.max(1).min(state.items.len());
        let batch = state.items.drain(..count).collect();
        (batch, state.generation)
    }

    async fn deliver(&self, batch: Vec<QueueItem>, generation: u64) -> BatchOutcome {
        let Some(session) = self.session.current() else {
            let queued = {
                let mut state = self.state.lock();
                for item in batch.into_iter().rev() {
                    state.items.push_front(item);
                }
                state.items.len()
            };
            tracing::warn!("No active session, deferring {} queued items", queued);
            let _ = self.events.send(SyncEvent::Deferred { queued });
            return BatchOutcome::Deferred;
        };

        let mut writes = Vec::with_capacity(batch.len());
        let mut included = Vec::with_capacity(batch.len());
        for item in batch {
            match item.to_write() {
                Ok(write) => {
                    writes.push(write);
                    included.push(item);
                }
                Err(e) => self.construction_failed(item, e),
            }
        }

        if writes.is_empty() {
            self.persist(&self.state.lock());
            return BatchOutcome::NothingToSend;
        }

        let count = writes.len();
        tracing::debug!("Committing batch of {} writes for {}", count, session.user_id());

        match session.remote().batch_write(session.user_id(), writes).await {
            Ok(()) => {
                self.usage.record_writes(count as u64);
                let _ = self.events.send(SyncEvent::BatchCommitted { count });
                {
                    let mut state = self.state.lock();
                    if state.generation != generation {
                        tracing::debug!("Queue cleared during commit, stopping drain");
                        return BatchOutcome::Cleared;
                    }
                    state.consecutive_failures = 0;
                    state.stuck = false;
                    self.persist(&state);
                }
                BatchOutcome::Committed
            }
            Err(e) => {
                let mut state = self.state.lock();
                if state.generation != generation {
                    tracing::debug!("Queue cleared during commit, discarding failed batch");
                    return BatchOutcome::Cleared;
                }

                for mut item in included {
                    item.attempts += 1;
                    state.items.push_back(item);
                }
                state.consecutive_failures += 1;
                let consecutive_failures = state.consecutive_failures;
                let stuck = consecutive_failures >= self.config.stuck_after;
                state.stuck = stuck;
                self.persist(&state);
                drop(state);

                tracing::warn!(
                    "Batch of {} writes failed ({} in a row), re-queued: {}",
                    count,
                    consecutive_failures,
                    e
                );
                let _ = self.events.send(SyncEvent::BatchFailed {
                    count,
                    error: e.to_string(),
                    consecutive_failures,
                });

                if stuck {
                    tracing::error!(
                        "Sync queue stuck after {} failed batches, waiting for a retry",
                        consecutive_failures
                    );
                    let _ = self.events.send(SyncEvent::Stuck { consecutive_failures });
                    BatchOutcome::Stuck
                } else {
                    BatchOutcome::Failed
                }
            }
        }
    }

    fn construction_failed(&self, mut item: QueueItem, error: ConstructionError) {
        if item.attempts < self.config.retry_attempts {
            item.attempts += 1;
            tracing::debug!("{} (attempt {}), retrying later", error, item.attempts);
            self.state.lock().items.push_back(item);
            return;
        }

        tracing::error!("Dropping queued item after {} attempts: {}", item.attempts, error);
        let failure =
            PermanentFailure { item, reason: error.to_string(), failed_at: self.clock.now_ms() };
        self.state.lock().permanent_failures.push(failure.clone());
        let _ = self.events.send(SyncEvent::PermanentFailure(failure));
    }

    /// Snapshot of the queue
    pub fn status(&self) -> QueueStatus {
        let state = self.state.lock();
        let processing = self.processing.load(Ordering::SeqCst);

        QueueStatus {
            queue_length: state.items.len(),
            processing,
            pending: processing || !state.items.is_empty(),
            stuck: state.stuck,
            consecutive_failures: state.consecutive_failures,
            permanent_failures: state.permanent_failures.len(),
        }
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Copy of the queued items, head first
    pub fn items(&self) -> Vec<QueueItem> {
        self.state.lock().items.iter().cloned().collect()
    }

    /// Items dropped after exhausting their retries
    pub fn permanent_failures(&self) -> Vec<PermanentFailure> {
        self.state.lock().permanent_failures.clone()
    }

    /// Empty the queue and stop the running drain
    ///
    /// A drain waiting out a throttle or backoff pause stops at once. One
    /// waiting on a commit stops when the commit returns, and only then
    /// releases the processing flag, so two drains never commit side by side.
    /// Anything queued after the clear is picked up by that same drain.
    pub fn clear(&self) {
        {
            let mut state = self.state.lock();
            state.items.clear();
            state.consecutive_failures = 0;
            state.stuck = false;
            state.generation += 1;
            self.persist(&state);
        }
        self.cleared.notify_waiters();
        tracing::info!("Sync queue cleared");
    }

    /// Reload items persisted by a previous run, ahead of anything queued since
    ///
    /// Returns the number of restored items.
    pub fn restore(&self) -> usize {
        let Some(store) = self.persisting_store() else {
            return 0;
        };

        let restored: Vec<QueueItem> = match store.load(QUEUE_KEY) {
            Ok(Some(items)) => items,
            Ok(None) => return 0,
            Err(e) => {
                tracing::warn!("Failed to restore sync queue: {}", e);
                return 0;
            }
        };

        let count = restored.len();
        {
            let mut state = self.state.lock();
            for item in restored.into_iter().rev() {
                state.items.push_front(item);
            }
            self.persist(&state);
        }

        if count > 0 {
            tracing::info!("Restored {} queued items", count);
        }
        count
    }

    fn persisting_store(&self) -> Option<&Arc<dyn LocalStore>> {
        self.store.as_ref().filter(|_| self.config.persist_queue)
    }

    fn persist(&self, state: &QueueState) {
        let Some(store) = self.persisting_store() else {
            return;
        };

        let result = if state.items.is_empty() {
            store.remove(QUEUE_KEY).map(|_| ())
        } else {
            store.save(QUEUE_KEY, &state.items)
        };

        if let Err(e) = result {
            tracing::warn!("Failed to persist sync queue: {}", e);
        }
    }
}

impl Clone for SyncQueue {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            processing: Arc::clone(&self.processing),
            cleared: Arc::clone(&self.cleared),
            session: self.session.clone(),
            usage: Arc::clone(&self.usage),
            clock: Arc::clone(&self.clock),
            store: self.store.clone(),
            events: self.events.clone(),
        }
    }
}
