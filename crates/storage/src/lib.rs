//! Storage layer for bizsync
//!
//! This crate provides the on-device side of the sync engine: a small
//! key-value capability the engine persists into, a sled-backed store that
//! implements it, and the offline asset cache.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod assets;
pub mod kv;
pub mod local;

pub use assets::{
    Asset, AssetCache, AssetCacheConfig, AssetError, AssetFetcher, AssetPolicy, CacheStrategy,
};
pub use kv::{KvConfig, KvError, KvStore};
pub use local::{LocalSlot, LocalStore, LocalStoreError, LocalStoreExt, MemoryStore};
