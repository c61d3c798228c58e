//! Remote usage tracking
//!
//! Counts reads and writes made against the remote store so the app can show
//! how close the user is to the backend's daily quota. Counters reset on
//! their own once a day and are persisted after every change; a failed write
//! to the local store is logged and otherwise ignored, since the in-memory
//! counters stay authoritative for the life of the process.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use storage::{LocalStore, LocalStoreExt};

use crate::clock::Clock;

/// Key the stats record is persisted under
pub const USAGE_STATS_KEY: &str = "usage_stats";

/// Counters reset after this much wall-clock time
pub const RESET_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Number of history samples kept
pub const HISTORY_LIMIT: usize = 10;

/// A history sample is taken each time the total crosses a multiple of this
pub const SAMPLE_EVERY: u64 = 10;

/// Point-in-time counters for the usage chart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSample {
    /// Epoch milliseconds
    pub t: i64,
    /// Reads at that time
    pub reads: u64,
    /// Writes at that time
    pub writes: u64,
}

/// Persisted usage record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    /// Remote reads since the last reset
    #[serde(default)]
    pub reads: u64,
    /// Remote writes since the last reset
    #[serde(default)]
    pub writes: u64,
    /// Rolling history, oldest first
    #[serde(default)]
    pub history: Vec<UsageSample>,
    /// When the counters were last reset, epoch milliseconds
    #[serde(default)]
    pub last_reset: i64,
}

impl UsageStats {
    fn fresh(now_ms: i64) -> Self {
        Self { last_reset: now_ms, ..Default::default() }
    }

    fn total(&self) -> u64 {
        self.reads + self.writes
    }
}

/// Current counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Remote reads since the last reset
    pub reads: u64,
    /// Remote writes since the last reset
    pub writes: u64,
}

#[derive(Debug, Clone, Copy)]
enum Counter {
    Reads,
    Writes,
}

/// Tracks remote reads and writes with a daily reset
pub struct UsageTracker {
    stats: Mutex<UsageStats>,
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
}

impl UsageTracker {
    /// Load persisted stats, starting fresh if there are none or they can't be read
    pub fn load(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();

        let stats = match store.load::<UsageStats>(USAGE_STATS_KEY) {
            Ok(Some(mut stats)) => {
                if stats.last_reset == 0 {
                    stats.last_reset = now;
                }
                stats
            }
            Ok(None) => UsageStats::fresh(now),
            Err(e) => {
                tracing::warn!("Failed to load usage stats, starting fresh: {}", e);
                UsageStats::fresh(now)
            }
        };

        Self { stats: Mutex::new(stats), store, clock }
    }

    /// Record `n` remote reads
    pub fn record_reads(&self, n: u64) {
        self.record(Counter::Reads, n);
    }

    /// Record `n` remote writes
    pub fn record_writes(&self, n: u64) {
        self.record(Counter::Writes, n);
    }

    /// Current counters
    pub fn snapshot(&self) -> UsageSnapshot {
        let stats = self.stats.lock();
        UsageSnapshot { reads: stats.reads, writes: stats.writes }
    }

    /// Rolling history, oldest first
    pub fn history(&self) -> Vec<UsageSample> {
        self.stats.lock().history.clone()
    }

    /// The full stats record
    pub fn stats(&self) -> UsageStats {
        self.stats.lock().clone()
    }

    /// Reset counters and history now
    pub fn reset(&self) {
        let now = self.clock.now_ms();
        let stats = {
            let mut stats = self.stats.lock();
            *stats = UsageStats::fresh(now);
            stats.clone()
        };
        tracing::info!("Usage counters reset");
        self.persist(&stats);
    }

    fn record(&self, counter: Counter, n: u64) {
        let now = self.clock.now_ms();

        let stats = {
            let mut stats = self.stats.lock();

            if now - stats.last_reset >= RESET_INTERVAL.as_millis() as i64 {
                tracing::info!(
                    "Usage counters expired (reads={}, writes={}), resetting",
                    stats.reads,
                    stats.writes
                );
                *stats = UsageStats::fresh(now);
            }

            let before = stats.total();
            match counter {
                Counter::Reads => stats.reads += n,
                Counter::Writes => stats.writes += n,
            }

            if before / SAMPLE_EVERY != stats.total() / SAMPLE_EVERY {
                let sample = UsageSample { t: now, reads: stats.reads, writes: stats.writes };
                stats.history.push(sample);
                if stats.history.len() > HISTORY_LIMIT {
                    let excess = stats.history.len() - HISTORY_LIMIT;
                    stats.history.drain(..excess);
                }
            }

            stats.clone()
        };

        self.persist(&stats);
    }

    fn persist(&self, stats: &UsageStats) {
        if let Err(e) = self.store.save(USAGE_STATS_KEY, stats) {
            tracing::warn!("Failed to persist usage stats: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use storage::MemoryStore;

    const START: i64 = 1_700_000_000_000;

    fn tracker() -> (UsageTracker, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(START));
        let tracker = UsageTracker::load(store.clone(), clock.clone());
        (tracker, store, clock)
    }

    #[test]
    fn test_counts_reads_and_writes() {
        let (tracker, _, _) = tracker();

        tracker.record_reads(3);
        tracker.record_writes(5);

        assert_eq!(tracker.snapshot(), UsageSnapshot { reads: 3, writes: 5 });
    }

    #[test]
    fn test_auto_reset_after_a_day() {
        let (tracker, _, clock) = tracker();

        tracker.record_reads(3);
        tracker.record_writes(5);
        clock.advance(Duration::from_secs(25 * 60 * 60));
        tracker.record_reads(1);

        assert_eq!(tracker.snapshot(), UsageSnapshot { reads: 1, writes: 0 });
        assert_eq!(tracker.stats().last_reset, clock.now_ms());
    }

    #[test]
    fn test_no_reset_before_a_day() {
        let (tracker, _, clock) = tracker();

        tracker.record_writes(4);
        clock.advance(Duration::from_secs(23 * 60 * 60));
        tracker.record_writes(1);

        assert_eq!(tracker.snapshot().writes, 5);
        assert_eq!(tracker.stats().last_reset, START);
    }

    #[test]
    fn test_persisted_layout() {
        let (tracker, store, _) = tracker();
        tracker.record_reads(2);

        let record = store.get(USAGE_STATS_KEY).unwrap().unwrap();
        assert_eq!(
            record,
            json!({"reads": 2, "writes": 0, "history": [], "lastReset": START})
        );
    }

    #[test]
    fn test_reload_from_store() {
        let (tracker, store, clock) = tracker();
        tracker.record_reads(7);
        tracker.record_writes(2);

        let reloaded = UsageTracker::load(store, clock);
        assert_eq!(reloaded.snapshot(), UsageSnapshot { reads: 7, writes: 2 });
        assert_eq!(reloaded.stats().last_reset, START);
    }

    #[test]
    fn test_load_tolerates_garbage() {
        let store = Arc::new(MemoryStore::new());
        store.set(USAGE_STATS_KEY, &json!("corrupted")).unwrap();
        let clock = Arc::new(ManualClock::new(START));

        let tracker = UsageTracker::load(store, clock);
        assert_eq!(tracker.snapshot(), UsageSnapshot { reads: 0, writes: 0 });
        assert_eq!(tracker.stats().last_reset, START);
    }

    #[test]
    fn test_persistence_failure_keeps_memory_state() {
        let (tracker, store, _) = tracker();
        store.set_fail_writes(true);

        tracker.record_writes(3);
        assert_eq!(tracker.snapshot().writes, 3);
        assert!(store.get(USAGE_STATS_KEY).unwrap().is_none());
    }

    #[test]
    fn test_history_sampled_every_ten_operations() {
        let (tracker, _, clock) = tracker();

        for _ in 0..9 {
            tracker.record_writes(1);
        }
        assert!(tracker.history().is_empty());

        clock.advance(Duration::from_secs(1));
        tracker.record_reads(1);
        assert_eq!(
            tracker.history(),
            vec![UsageSample { t: START + 1_000, reads: 1, writes: 9 }]
        );

        tracker.record_writes(5);
        assert_eq!(tracker.history().len(), 1);
    }

    #[test]
    fn test_history_bounded() {
        let (tracker, _, clock) = tracker();

        for _ in 0..15 {
            clock.advance(Duration::from_secs(60));
            tracker.record_writes(10);
        }

        let history = tracker.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history.last().unwrap().writes, 150);
        assert_eq!(history.first().unwrap().writes, 60);
    }

    #[test]
    fn test_manual_reset() {
        let (tracker, store, clock) = tracker();
        tracker.record_writes(12);
        clock.advance(Duration::from_secs(5));

        tracker.reset();

        assert_eq!(tracker.snapshot(), UsageSnapshot { reads: 0, writes: 0 });
        assert!(tracker.history().is_empty());
        let persisted: UsageStats = store.load(USAGE_STATS_KEY).unwrap().unwrap();
        assert_eq!(persisted.last_reset, START + 5_000);
    }
}
