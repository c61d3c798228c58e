//! Background sync engine for bizsync
//!
//! This crate owns the write path from the device to the remote document
//! store: a throttled, batching [`SyncQueue`] for deferred writes, the
//! [`SyncFacade`] the rest of the app calls, and a [`UsageTracker`] that counts
//! remote reads and writes against the daily quota.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod facade;
pub mod queue;
pub mod session;
pub mod usage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use facade::{SyncError, SyncFacade};
pub use queue::{
    ConstructionError, Operation, PermanentFailure, QueueItem, QueueStatus, SyncConfig, SyncEvent,
    SyncQueue,
};
pub use session::{Readiness, Session, SessionContext};
pub use usage::{UsageSample, UsageSnapshot, UsageStats, UsageTracker};
