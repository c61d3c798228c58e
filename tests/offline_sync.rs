//! Offline sync integration tests
//!
//! End-to-end runs of the engine against an on-disk local store and the
//! in-memory remote: queue while signed out, sign in, drain, survive
//! restarts.

use remote_store::{DocumentRef, MemoryRemote, RemoteError, WriteKind};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use storage::{KvConfig, KvStore, LocalStore};
use sync_engine::{
    Clock, ManualClock, Operation, Session, SyncConfig, SyncError, SyncEvent, SyncFacade, SystemClock,
    UsageSnapshot, UsageTracker,
};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn open_store(dir: &TempDir) -> Arc<KvStore> {
    let path = dir.path().join("local.db").to_string_lossy().to_string();
    Arc::new(KvStore::new(KvConfig::new(path).flush_every_ms(None)).unwrap())
}

async fn wait_for_drain(facade: &SyncFacade, events: &mut tokio::sync::broadcast::Receiver<SyncEvent>) {
    while !facade.queue().is_empty() || facade.status().processing {
        if events.recv().await.unwrap() == SyncEvent::Drained {
            break;
        }
    }
}

/// A change queued with no session waits, then lands exactly once after sign-in
#[tokio::test(start_paused = true)]
async fn test_queue_offline_then_sign_in() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let facade =
        SyncFacade::bootstrap(SyncConfig::default(), open_store(&dir), Arc::new(SystemClock));
    let remote = Arc::new(MemoryRemote::new());

    facade
        .queue()
        .enqueue(Operation::Create, "invoices", Some(json!({"amount": 100})), None);
    // Let the spawned drain run and defer
    tokio::time::sleep(Duration::from_millis(1)).await;

    let status = facade.status();
    assert_eq!(status.queue_length, 1);
    assert!(!status.processing);
    assert_eq!(remote.batch_calls(), 0);

    let mut events = facade.queue().subscribe();
    facade.sign_in(Session::new("owner", remote.clone()));
    wait_for_drain(&facade, &mut events).await;

    let committed = remote.committed();
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].doc.collection(), "invoices");
    assert_eq!(committed[0].kind, WriteKind::Upsert);
    assert_eq!(facade.usage(), UsageSnapshot { reads: 0, writes: 1 });

    let stored = remote.document("owner", &committed[0].doc).unwrap();
    assert_eq!(stored["amount"], json!(100));
    assert!(stored.contains_key("updatedAt"));
    assert!(stored.contains_key("lastSynced"));
}

/// The immediate path refuses to run without a session and leaves the queue alone
#[tokio::test]
async fn test_sync_now_requires_session() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let facade =
        SyncFacade::bootstrap(SyncConfig::default(), open_store(&dir), Arc::new(SystemClock));

    let result = facade
        .sync_now_as("invoices", json!({"amount": 50}), Operation::Delete)
        .await;

    assert!(matches!(result, Err(SyncError::Session)));
    assert_eq!(facade.status().queue_length, 0);
}

/// Many changes, one flaky commit: every document arrives exactly once
#[tokio::test(start_paused = true)]
async fn test_bulk_sync_with_transient_failure() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let facade = SyncFacade::bootstrap(
        SyncConfig::default().batch_size(25),
        open_store(&dir),
        Arc::new(SystemClock),
    );
    let remote = Arc::new(MemoryRemote::new());
    remote.fail_next(RemoteError::Quota("write quota".to_string()));
    facade.sign_in(Session::new("owner", remote.clone()));
    let mut events = facade.queue().subscribe();

    for i in 0..60 {
        facade.queue_for_sync_as(
            "expenses",
            json!({"id": format!("exp-{}", i), "amount": i}),
            Operation::Create,
        );
    }
    wait_for_drain(&facade, &mut events).await;

    let mut ids: Vec<_> = remote.committed().into_iter().map(|c| c.doc.id().to_string()).collect();
    assert_eq!(ids.len(), 60);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 60);
    assert_eq!(facade.usage().writes, 60);
    assert!(!facade.status().stuck);
}

/// Usage counters survive a restart and reset after a day
#[tokio::test]
async fn test_usage_persists_and_resets() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));

    {
        let tracker = UsageTracker::load(store.clone(), clock.clone());
        tracker.record_reads(3);
        tracker.record_writes(5);
    }

    let tracker = UsageTracker::load(store.clone(), clock.clone());
    assert_eq!(tracker.snapshot(), UsageSnapshot { reads: 3, writes: 5 });

    clock.advance(Duration::from_secs(25 * 60 * 60));
    tracker.record_reads(1);
    assert_eq!(tracker.snapshot(), UsageSnapshot { reads: 1, writes: 0 });

    let record = store.get("usage_stats").unwrap().unwrap();
    assert_eq!(record["reads"], json!(1));
    assert_eq!(record["lastReset"], json!(clock.now_ms()));
}

/// Pending changes written while offline are still there after a restart
#[tokio::test(start_paused = true)]
async fn test_persisted_queue_survives_restart() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = SyncConfig::default().persist_queue(true);

    {
        let facade = SyncFacade::bootstrap(config.clone(), open_store(&dir), Arc::new(SystemClock));
        facade
            .queue()
            .enqueue(Operation::Update, "clients", Some(json!({"name": "Acme"})), Some("c-1".to_string()));
        facade.queue().enqueue(Operation::Delete, "clients", None, Some("c-2".to_string()));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(facade.status().queue_length, 2);
    }

    let facade = SyncFacade::bootstrap(config, open_store(&dir), Arc::new(SystemClock));
    assert_eq!(facade.status().queue_length, 2);

    let remote = Arc::new(MemoryRemote::new());
    let mut events = facade.queue().subscribe();
    facade.sign_in(Session::new("owner", remote.clone()));
    wait_for_drain(&facade, &mut events).await;

    let committed = remote.committed();
    assert_eq!(committed.len(), 2);
    assert_eq!(committed[0].doc, DocumentRef::new("clients", "c-1").unwrap());
    assert_eq!(committed[1].kind, WriteKind::Delete);
    assert!(facade.queue().is_empty());
}
