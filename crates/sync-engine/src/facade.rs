//! Sync façade
//!
//! The two calls the rest of the app makes after touching the local store:
//! [`SyncFacade::queue_for_sync`] to hand a change to the background queue,
//! and [`SyncFacade::sync_now`] to write it straight through and learn the
//! outcome. The façade also owns the session lifecycle, so signing in wakes
//! the queue and signing out clears it.

use remote_store::{DocumentRef, RemoteError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use storage::LocalStore;
use thiserror::Error;

use crate::clock::Clock;
use crate::queue::{build_write, ConstructionError, Operation, QueueStatus, SyncConfig, SyncQueue};
use crate::session::{Readiness, Session, SessionContext};
use crate::usage::{UsageSnapshot, UsageTracker};

/// Errors returned to callers of the immediate path
#[derive(Debug, Error)]
pub enum SyncError {
    /// No active session
    #[error("No active session")]
    Session,

    /// The remote store rejected the write
    #[error("Delivery failed: {0}")]
    Delivery(#[from] RemoteError),

    /// The change could not be turned into a remote write
    #[error(transparent)]
    Construction(#[from] ConstructionError),
}

/// Result type for façade operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Entry point for pushing local changes to the remote store
#[derive(Clone)]
pub struct SyncFacade {
    queue: SyncQueue,
}

impl SyncFacade {
    /// Wrap an existing queue
    pub fn new(queue: SyncQueue) -> Self {
        Self { queue }
    }

    /// Wire up the engine: usage tracker, session context and queue
    ///
    /// Restores a persisted queue when `persist_queue` is enabled.
    pub fn bootstrap(config: SyncConfig, store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>) -> Self {
        let usage = Arc::new(UsageTracker::load(Arc::clone(&store), Arc::clone(&clock)));
        let queue = SyncQueue::new(config, SessionContext::new(), usage, clock).with_store(store);
        queue.restore();
        Self { queue }
    }

    /// Activate `session` and deliver anything queued while signed out
    pub fn sign_in(&self, session: Session) {
        self.queue.session().activate(session);
        self.queue.kick();
    }

    /// End the session and drop pending changes
    pub fn sign_out(&self) {
        self.queue.session().deactivate();
        self.queue.clear();
    }

    /// Wait for a session, up to the configured readiness timeout
    pub async fn wait_ready(&self) -> Readiness {
        let timeout = Duration::from_millis(self.queue.config().readiness_timeout_ms);
        self.queue.session().wait_ready(timeout).await
    }

    /// Queue an update of `data` in `collection`
    pub fn queue_for_sync(&self, collection: &str, data: Value) -> Option<String> {
        self.queue_for_sync_as(collection, data, Operation::Update)
    }

    /// Queue `operation` on `data` in `collection`
    ///
    /// Without a session this is a logged no-op returning `None`. The
    /// document id is taken from `data["id"]` when present, otherwise the
    /// queue generates one. Returns the id.
    pub fn queue_for_sync_as(
        &self,
        collection: &str,
        data: Value,
        operation: Operation,
    ) -> Option<String> {
        if !self.queue.session().is_active() {
            tracing::warn!("No active session, not queueing {} on {}", operation, collection);
            return None;
        }

        let id = document_id(&data);
        let payload = match operation {
            Operation::Delete => None,
            Operation::Create | Operation::Update => Some(data),
        };
        Some(self.queue.enqueue(operation, collection, payload, id))
    }

    /// Write an update of `data` to `collection` immediately
    pub async fn sync_now(&self, collection: &str, data: Value) -> Result<String> {
        self.sync_now_as(collection, data, Operation::Update).await
    }

    /// Write `operation` on `data` to `collection` immediately, bypassing the queue
    ///
    /// Returns the document id. Creates and updates without an `id` field get
    /// a generated one; deletes without one fail to build.
    pub async fn sync_now_as(
        &self,
        collection: &str,
        data: Value,
        operation: Operation,
    ) -> Result<String> {
        let session = self.queue.session().current().ok_or(SyncError::Session)?;

        let id = match (document_id(&data), operation) {
            (Some(id), _) => id,
            (None, Operation::Delete) => String::new(),
            (None, _) => uuid::Uuid::new_v4().to_string(),
        };
        let payload = match operation {
            Operation::Delete => None,
            Operation::Create | Operation::Update => Some(data),
        };

        let write = build_write(operation, collection, &id, payload)?;
        session.remote().single_write(session.user_id(), write).await?;
        self.queue.usage().record_writes(1);

        tracing::debug!("Synced {} {}/{} directly", operation, collection, id);
        Ok(id)
    }

    /// Read one document from the remote store, counting the read
    pub async fn fetch(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let session = self.queue.session().current().ok_or(SyncError::Session)?;

        let doc = DocumentRef::new(collection, id).map_err(|source| ConstructionError {
            operation: Operation::Update,
            collection: collection.to_string(),
            id: id.to_string(),
            source,
        })?;

        let document = session.remote().read(session.user_id(), &doc).await?;
        self.queue.usage().record_reads(1);
        Ok(document)
    }

    /// Queue snapshot
    pub fn status(&self) -> QueueStatus {
        self.queue.status()
    }

    /// Usage counters
    pub fn usage(&self) -> UsageSnapshot {
        self.queue.usage().snapshot()
    }

    /// The underlying queue
    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }
}

fn document_id(data: &Value) -> Option<String> {
    match data.get("id") {
        Some(Value::String(id)) => Some(id.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}
