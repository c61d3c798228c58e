//! Remote store capability

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::types::{DocumentRef, RemoteWrite};

/// Errors reported by a remote store
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Transport failure; the request may be retried
    #[error("Network error: {0}")]
    Network(String),

    /// Backend quota exhausted
    #[error("Quota exceeded: {0}")]
    Quota(String),

    /// Backend refused the request
    #[error("Rejected by remote: {0}")]
    Rejected(String),

    /// Credentials missing or expired
    #[error("Not authenticated")]
    Unauthenticated,
}

/// Result type for remote operations
pub type Result<T> = std::result::Result<T, RemoteError>;

/// A document store reachable over the network
///
/// All writes are scoped under `user_id`. Implementations stamp upsert
/// payloads with their own last-updated and last-synced times
/// (see [`ServerStamps`](crate::ServerStamps)); callers never supply them.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Commit all writes atomically: either every write lands or none does
    async fn batch_write(&self, user_id: &str, writes: Vec<RemoteWrite>) -> Result<()>;

    /// Commit a single write
    async fn single_write(&self, user_id: &str, write: RemoteWrite) -> Result<()>;

    /// Read one document
    async fn read(&self, user_id: &str, doc: &DocumentRef) -> Result<Option<Value>>;
}
