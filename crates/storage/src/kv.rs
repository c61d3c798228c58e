//! Key-value store backed by sled
//!
//! This is the on-disk [`LocalStore`] used outside of tests. Records are
//! stored as JSON bytes so they can be inspected and migrated without the
//! engine's types.

use serde_json::Value;
use sled::Db;
use std::sync::Arc;
use thiserror::Error;

use crate::local::{self, LocalStore};

/// Key-value store error types
#[derive(Debug, Error)]
pub enum KvError {
    /// Sled database error
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid key
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Result type for key-value operations
pub type Result<T> = std::result::Result<T, KvError>;

/// Key-value store configuration
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// Database path
    pub path: String,
    /// Cache capacity in bytes
    pub cache_capacity: u64,
    /// Enable compression
    pub use_compression: bool,
    /// Flush interval in milliseconds (None flushes on every write)
    pub flush_every_ms: Option<u64>,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            path: "bizsync_local.db".to_string(),
            cache_capacity: 16 * 1024 * 1024, // 16MB
            use_compression: true,
            flush_every_ms: Some(500),
        }
    }
}

impl KvConfig {
    /// Create a new configuration with a custom path
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), ..Default::default() }
    }

    /// Set cache capacity in bytes
    pub fn cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// Enable or disable compression
    pub fn use_compression(mut self, enabled: bool) -> Self {
        self.use_compression = enabled;
        self
    }

    /// Set flush interval in milliseconds
    pub fn flush_every_ms(mut self, ms: Option<u64>) -> Self {
        self.flush_every_ms = ms;
        self
    }
}

/// Key-value store implementation
pub struct KvStore {
    db: Arc<Db>,
    flush_on_write: bool,
}

impl KvStore {
    /// Open (or create) a store with configuration
    pub fn new(config: KvConfig) -> Result<Self> {
        let mut db_config = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_capacity)
            .use_compression(config.use_compression);

        if let Some(ms) = config.flush_every_ms {
            db_config = db_config.flush_every_ms(Some(ms));
        }

        let db = db_config.open()?;
        tracing::debug!("Opened local store at {}", config.path);

        Ok(Self { db: Arc::new(db), flush_on_write: config.flush_every_ms.is_none() })
    }

    /// Create an in-memory key-value store (for testing)
    pub fn in_memory() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;

        Ok(Self { db: Arc::new(db), flush_on_write: false })
    }

    /// Get a raw JSON record by key
    pub fn get_value(&self, key: &str) -> Result<Option<Value>> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Set a raw JSON record by key
    pub fn set_value(&self, key: &str, value: &Value) -> Result<()> {
        if key.is_empty() {
            return Err(KvError::InvalidKey("key must not be empty".to_string()));
        }

        let bytes = serde_json::to_vec(value)?;
        self.db.insert(key.as_bytes(), bytes)?;
        if self.flush_on_write {
            self.db.flush()?;
        }
        Ok(())
    }

    /// Remove a record by key
    pub fn remove_value(&self, key: &str) -> Result<bool> {
        let removed = self.db.remove(key.as_bytes())?.is_some();
        if removed && self.flush_on_write {
            self.db.flush()?;
        }
        Ok(removed)
    }

    /// Check if a key exists
    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.db.contains_key(key.as_bytes())?)
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the number of keys in the store
    pub fn len(&self) -> usize {
        self.db.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

impl LocalStore for KvStore {
    fn get(&self, key: &str) -> local::Result<Option<Value>> {
        Ok(self.get_value(key)?)
    }

    fn set(&self, key: &str, value: &Value) -> local::Result<()> {
        Ok(self.set_value(key, value)?)
    }

    fn remove(&self, key: &str) -> local::Result<bool> {
        Ok(self.remove_value(key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalStoreExt;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_set_and_get() {
        let store = KvStore::in_memory().unwrap();

        store.set_value("usage_stats", &json!({"reads": 1})).unwrap();
        assert_eq!(store.get_value("usage_stats").unwrap(), Some(json!({"reads": 1})));
        assert!(store.contains("usage_stats").unwrap());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_nonexistent() {
        let store = KvStore::in_memory().unwrap();
        assert_eq!(store.get_value("missing").unwrap(), None);
    }

    #[test]
    fn test_empty_key_rejected() {
        let store = KvStore::in_memory().unwrap();
        let result = store.set_value("", &json!(1));
        assert!(matches!(result, Err(KvError::InvalidKey(_))));
    }

    #[test]
    fn test_remove() {
        let store = KvStore::in_memory().unwrap();
        store.set_value("k", &json!("v")).unwrap();

        assert!(store.remove_value("k").unwrap());
        assert!(!store.remove_value("k").unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_as_local_store() {
        let store = KvStore::in_memory().unwrap();
        let local: &dyn LocalStore = &store;

        local.set("k", &json!([1, 2, 3])).unwrap();
        assert_eq!(local.get("k").unwrap(), Some(json!([1, 2, 3])));

        let typed: Option<Vec<u32>> = store.load("k").unwrap();
        assert_eq!(typed, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("local.db").to_string_lossy().to_string();

        {
            let store = KvStore::new(KvConfig::new(&path).flush_every_ms(None)).unwrap();
            store.set_value("usage_stats", &json!({"writes": 7})).unwrap();
        }

        let store = KvStore::new(KvConfig::new(&path)).unwrap();
        assert_eq!(store.get_value("usage_stats").unwrap(), Some(json!({"writes": 7})));
    }

    #[test]
    fn test_removal_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("local.db").to_string_lossy().to_string();

        {
            let store = KvStore::new(KvConfig::new(&path).flush_every_ms(None)).unwrap();
            store.set("sync_queue", &json!([{"id": "a"}])).unwrap();
            store.set("usage_stats", &json!({"writes": 1})).unwrap();
            assert!(store.remove("sync_queue").unwrap());
            assert!(!store.remove("sync_queue").unwrap());
        }

        let store = KvStore::new(KvConfig::new(&path)).unwrap();
        assert_eq!(store.get("sync_queue").unwrap(), None);
        assert_eq!(store.get("usage_stats").unwrap(), Some(json!({"writes": 1})));
    }

    #[test]
    fn test_config_builder() {
        let config = KvConfig::new("custom.db")
            .cache_capacity(1024)
            .use_compression(false)
            .flush_every_ms(None);

        assert_eq!(config.path, "custom.db");
        assert_eq!(config.cache_capacity, 1024);
        assert!(!config.use_compression);
        assert_eq!(config.flush_every_ms, None);
    }
}
