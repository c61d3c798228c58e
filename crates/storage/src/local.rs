//! Local store capability
//!
//! The sync engine only needs three things from on-device storage: read a
//! record, write a record, and forget a record. This module defines that
//! capability as [`LocalStore`] together with two implementations that do not
//! touch disk: [`MemoryStore`] and the late-bound [`LocalSlot`].

use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::kv::KvError;

/// Local store error types
#[derive(Debug, Error)]
pub enum LocalStoreError {
    /// Underlying key-value store failed
    #[error("KV store error: {0}")]
    Kv(#[from] KvError),

    /// Record could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store refused the operation
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for local store operations
pub type Result<T> = std::result::Result<T, LocalStoreError>;

/// On-device persistent storage as seen by the sync engine
///
/// Values are JSON documents. A missing key is `Ok(None)`, never an error.
pub trait LocalStore: Send + Sync {
    /// Read the record stored under `key`
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Write `value` under `key`, replacing any previous record
    fn set(&self, key: &str, value: &Value) -> Result<()>;

    /// Remove the record under `key`, returning whether one existed
    fn remove(&self, key: &str) -> Result<bool>;
}

/// Typed helpers on top of [`LocalStore`]
pub trait LocalStoreExt: LocalStore {
    /// Read and deserialize a record
    fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Serialize and write a record
    fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, &value)
    }
}

impl<S: LocalStore + ?Sized> LocalStoreExt for S {}

/// In-memory store, used by tests and by sessions that opt out of disk
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Value>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create an empty memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set`/`remove` fail (simulates a full or locked disk)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LocalStoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.records.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &Value) -> Result<()> {
        self.check_writable()?;
        self.records.lock().insert(key.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        self.check_writable()?;
        Ok(self.records.lock().remove(key).is_some())
    }
}

/// A store that may be attached after the engine has started
///
/// Until [`LocalSlot::attach`] is called, reads return `None` and writes are
/// dropped, so early callers see an empty store instead of an error.
#[derive(Default, Clone)]
pub struct LocalSlot {
    inner: Arc<RwLock<Option<Arc<dyn LocalStore>>>>,
}

impl LocalSlot {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the backing store
    pub fn attach(&self, store: Arc<dyn LocalStore>) {
        *self.inner.write() = Some(store);
    }

    /// Detach the backing store, returning it if one was attached
    pub fn detach(&self) -> Option<Arc<dyn LocalStore>> {
        self.inner.write().take()
    }

    /// Whether a backing store is attached
    pub fn is_attached(&self) -> bool {
        self.inner.read().is_some()
    }

    fn backing(&self) -> Option<Arc<dyn LocalStore>> {
        self.inner.read().clone()
    }
}

impl LocalStore for LocalSlot {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.backing() {
            Some(store) => store.get(key),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &Value) -> Result<()> {
        match self.backing() {
            Some(store) => store.set(key, value),
            None => {
                tracing::debug!("Local store not attached, dropping write to {}", key);
                Ok(())
            }
        }
    }

    fn remove(&self, key: &str) -> Result<bool> {
        match self.backing() {
            Some(store) => store.remove(key),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Draft {
        amount: u32,
        client: String,
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.set("invoice:1", &json!({"amount": 100})).unwrap();

        assert_eq!(store.get("invoice:1").unwrap(), Some(json!({"amount": 100})));
        assert_eq!(store.get("invoice:2").unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_memory_store_remove() {
        let store = MemoryStore::new();
        store.set("k", &json!(1)).unwrap();

        assert!(store.remove("k").unwrap());
        assert!(!store.remove("k").unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_memory_store_failing_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);

        let result = store.set("k", &json!(1));
        assert!(matches!(result, Err(LocalStoreError::Unavailable(_))));
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_typed_load_and_save() {
        let store = MemoryStore::new();
        let draft = Draft { amount: 250, client: "Acme".to_string() };

        store.save("draft", &draft).unwrap();
        let loaded: Option<Draft> = store.load("draft").unwrap();
        assert_eq!(loaded, Some(draft));

        let missing: Option<Draft> = store.load("other").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_typed_load_wrong_shape() {
        let store = MemoryStore::new();
        store.set("draft", &json!("not a draft")).unwrap();

        let result: Result<Option<Draft>> = store.load("draft");
        assert!(matches!(result, Err(LocalStoreError::Serialization(_))));
    }

    #[test]
    fn test_slot_before_attach_is_benign() {
        let slot = LocalSlot::new();

        assert!(!slot.is_attached());
        assert_eq!(slot.get("anything").unwrap(), None);
        slot.set("anything", &json!(true)).unwrap();
        assert!(!slot.remove("anything").unwrap());
    }

    #[test]
    fn test_slot_forwards_after_attach() {
        let slot = LocalSlot::new();
        let backing = Arc::new(MemoryStore::new());
        slot.attach(backing.clone());

        slot.set("k", &json!("v")).unwrap();
        assert_eq!(backing.get("k").unwrap(), Some(json!("v")));
        assert_eq!(slot.get("k").unwrap(), Some(json!("v")));

        assert!(slot.detach().is_some());
        assert_eq!(slot.get("k").unwrap(), None);
    }
}
