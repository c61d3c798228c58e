//! In-process remote store
//!
//! [`MemoryRemote`] behaves like the real backend for the engine's purposes:
//! batches are atomic, upserts merge and get stamped, deletes remove. It also
//! keeps a commit log and accepts scripted failures so retry behaviour can be
//! exercised without a network.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::store::{RemoteError, RemoteStore, Result};
use crate::types::{DocumentRef, RemoteWrite, ServerStamps, WriteKind};

/// One write that reached the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedWrite {
    /// Scope the write was committed under
    pub user_id: String,
    /// Target document
    pub doc: DocumentRef,
    /// Upsert or delete
    pub kind: WriteKind,
}

#[derive(Default)]
struct State {
    documents: HashMap<(String, DocumentRef), Map<String, Value>>,
    log: Vec<CommittedWrite>,
    scripted_failures: VecDeque<RemoteError>,
    outage: Option<RemoteError>,
}

/// In-memory [`RemoteStore`] with fault injection
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
    latency: Option<Duration>,
    batch_calls: AtomicUsize,
    single_calls: AtomicUsize,
    batches_in_flight: AtomicUsize,
    peak_batches_in_flight: AtomicUsize,
}

impl MemoryRemote {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` (tokio time, so paused clocks apply)
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next call with `error`; calls queue up in order
    pub fn fail_next(&self, error: RemoteError) {
        self.state.lock().scripted_failures.push_back(error);
    }

    /// Fail every call with `error` until [`MemoryRemote::end_outage`]
    pub fn start_outage(&self, error: RemoteError) {
        self.state.lock().outage = Some(error);
    }

    /// Stop a sustained outage
    pub fn end_outage(&self) {
        self.state.lock().outage = None;
    }

    /// Every write committed so far, in commit order
    pub fn committed(&self) -> Vec<CommittedWrite> {
        self.state.lock().log.clone()
    }

    /// Number of committed writes
    pub fn committed_count(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Current contents of a document
    pub fn document(&self, user_id: &str, doc: &DocumentRef) -> Option<Map<String, Value>> {
        self.state.lock().documents.get(&(user_id.to_string(), doc.clone())).cloned()
    }

    /// Number of `batch_write` calls, successful or not
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    /// Most `batch_write` calls ever awaiting at the same time
    pub fn peak_concurrent_batches(&self) -> usize {
        self.peak_batches_in_flight.load(Ordering::SeqCst)
    }

    /// Number of `single_write` calls, successful or not
    pub fn single_calls(&self) -> usize {
        self.single_calls.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn take_failure(state: &mut State) -> Option<RemoteError> {
        state.scripted_failures.pop_front().or_else(|| state.outage.clone())
    }

    fn apply(state: &mut State, user_id: &str, write: RemoteWrite, stamps: &ServerStamps) {
        let kind = write.kind();
        let doc = write.doc().clone();
        let key = (user_id.to_string(), doc.clone());

        match write {
            RemoteWrite::Upsert { payload, .. } => {
                let merged = state.documents.entry(key).or_default();
                for (field, value) in stamps.apply(payload) {
                    merged.insert(field, value);
                }
            }
            RemoteWrite::Delete { .. } => {
                state.documents.remove(&key);
            }
        }

        state.log.push(CommittedWrite { user_id: user_id.to_string(), doc, kind });
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn batch_write(&self, user_id: &str, writes: Vec<RemoteWrite>) -> Result<()> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.batches_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_batches_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        self.simulate_latency().await;
        self.batches_in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        if let Some(error) = Self::take_failure(&mut state) {
            tracing::debug!("Rejecting batch of {} writes: {}", writes.len(), error);
            return Err(error);
        }

        let stamps = ServerStamps::now();
        for write in writes {
            Self::apply(&mut state, user_id, write, &stamps);
        }
        Ok(())
    }

    async fn single_write(&self, user_id: &str, write: RemoteWrite) -> Result<()> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let mut state = self.state.lock();
        if let Some(error) = Self::take_failure(&mut state) {
            return Err(error);
        }

        Self::apply(&mut state, user_id, write, &ServerStamps::now());
        Ok(())
    }

    async fn read(&self, user_id: &str, doc: &DocumentRef) -> Result<Option<Value>> {
        self.simulate_latency().await;

        let mut state = self.state.lock();
        if let Some(error) = Self::take_failure(&mut state) {
            return Err(error);
        }

        Ok(state
            .documents
            .get(&(user_id.to_string(), doc.clone()))
            .cloned()
            .map(Value::Object))
    }
}
