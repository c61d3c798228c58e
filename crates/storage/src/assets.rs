//! Offline asset cache
//!
//! Serves application assets from a local LRU so the app keeps working when
//! the network is gone. Each request is routed to one of two strategies:
//!
//! - **Network first** for documents and navigations: try the network, fall
//!   back to the cached copy when the fetch fails.
//! - **Stale while revalidate** for static assets: answer from the cache
//!   immediately and refresh the entry in the background.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Asset cache error types
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AssetError {
    /// Fetch failed and nothing was cached
    #[error("Asset unavailable offline: {0}")]
    Unavailable(String),

    /// Fetcher reported an error
    #[error("Fetch failed for {path}: {reason}")]
    Fetch {
        /// Requested path
        path: String,
        /// Fetcher's reason
        reason: String,
    },
}

/// Result type for asset operations
pub type Result<T> = std::result::Result<T, AssetError>;

/// A fetched asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    /// Request path the asset was fetched for
    pub path: String,
    /// Raw body
    pub body: Vec<u8>,
    /// Content type reported by the origin
    pub content_type: Option<String>,
}

impl Asset {
    /// Create an asset
    pub fn new(path: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self { path: path.into(), body: body.into(), content_type: None }
    }

    /// Attach a content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Network side of the asset cache
#[async_trait]
pub trait AssetFetcher: Send + Sync + 'static {
    /// Fetch `path` from the origin
    async fn fetch(&self, path: &str) -> Result<Asset>;
}

/// How a request is served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    /// Network, falling back to cache
    NetworkFirst,
    /// Cache, refreshed in the background
    StaleWhileRevalidate,
}

/// Routes request paths to a [`CacheStrategy`]
#[derive(Debug, Clone)]
pub struct AssetPolicy {
    /// Path prefixes that always go network first (e.g. `/api/`)
    pub network_first_prefixes: Vec<String>,
}

impl Default for AssetPolicy {
    fn default() -> Self {
        Self { network_first_prefixes: vec!["/api/".to_string()] }
    }
}

impl AssetPolicy {
    /// Add a network-first prefix
    pub fn network_first(mut self, prefix: impl Into<String>) -> Self {
        self.network_first_prefixes.push(prefix.into());
        self
    }

    /// Pick the strategy for a path
    ///
    /// Navigations (paths ending in `/`, `.html`, or without an extension)
    /// and configured prefixes go network first; everything else is a static
    /// asset.
    pub fn strategy_for(&self, path: &str) -> CacheStrategy {
        if self.network_first_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            return CacheStrategy::NetworkFirst;
        }

        let last_segment = path.rsplit('/').next().unwrap_or_default();
        if path.ends_with('/') || path.ends_with(".html") || !last_segment.contains('.') {
            CacheStrategy::NetworkFirst
        } else {
            CacheStrategy::StaleWhileRevalidate
        }
    }
}

/// Asset cache configuration
#[derive(Debug, Clone)]
pub struct AssetCacheConfig {
    /// Maximum number of cached assets
    pub max_entries: usize,
    /// Strategy routing
    pub policy: AssetPolicy,
    /// Stale-while-revalidate hits on entries younger than this skip the refresh
    pub revalidate_after: Duration,
}

impl Default for AssetCacheConfig {
    fn default() -> Self {
        Self { max_entries: 256, policy: AssetPolicy::default(), revalidate_after: Duration::ZERO }
    }
}

impl AssetCacheConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum entries
    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// Set the routing policy
    pub fn policy(mut self, policy: AssetPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set how old an entry must be before a hit refreshes it
    pub fn revalidate_after(mut self, age: Duration) -> Self {
        self.revalidate_after = age;
        self
    }
}

#[derive(Debug, Clone)]
struct CachedAsset {
    asset: Asset,
    fetched_at: Instant,
}

type Entries = Arc<Mutex<LruCache<String, CachedAsset>>>;

/// LRU-backed offline asset cache
pub struct AssetCache<F: AssetFetcher> {
    fetcher: Arc<F>,
    entries: Entries,
    // At most one refresh per path
    refreshes: Mutex<HashMap<String, JoinHandle<()>>>,
    config: AssetCacheConfig,
}

impl<F: AssetFetcher> AssetCache<F> {
    /// Create a new asset cache
    pub fn new(fetcher: F, config: AssetCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);

        Self {
            fetcher: Arc::new(fetcher),
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
            refreshes: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Serve a request using the strategy the policy picks for it
    pub async fn get(&self, path: &str) -> Result<Asset> {
        match self.config.policy.strategy_for(path) {
            CacheStrategy::NetworkFirst => self.network_first(path).await,
            CacheStrategy::StaleWhileRevalidate => self.stale_while_revalidate(path).await,
        }
    }

    /// Fetch from the network, falling back to the cache
    pub async fn network_first(&self, path: &str) -> Result<Asset> {
        match self.fetcher.fetch(path).await {
            Ok(asset) => {
                store(&self.entries, path, asset.clone());
                Ok(asset)
            }
            Err(e) => {
                tracing::debug!("Network fetch for {} failed, trying cache: {}", path, e);
                self.cached(path).ok_or_else(|| AssetError::Unavailable(path.to_string()))
            }
        }
    }

    /// Answer from the cache and refresh in the background; fetch on a miss
    ///
    /// Entries younger than `revalidate_after` are served without a refresh,
    /// and a path never has more than one refresh running.
    pub async fn stale_while_revalidate(&self, path: &str) -> Result<Asset> {
        let hit = self.entries.lock().get(path).cloned();
        if let Some(entry) = hit {
            if entry.fetched_at.elapsed() >= self.config.revalidate_after {
                self.revalidate(path);
            }
            return Ok(entry.asset);
        }

        let asset = self.fetcher.fetch(path).await?;
        store(&self.entries, path, asset.clone());
        Ok(asset)
    }

    fn revalidate(&self, path: &str) {
        let mut refreshes = self.refreshes.lock();
        refreshes.retain(|_, handle| !handle.is_finished());
        if refreshes.contains_key(path) {
            return;
        }

        let fetcher = Arc::clone(&self.fetcher);
        let entries = Arc::clone(&self.entries);
        let key = path.to_string();
        let handle = tokio::spawn(async move {
            match fetcher.fetch(&key).await {
                Ok(fresh) => store(&entries, &key, fresh),
                Err(e) => tracing::debug!("Background refresh of {} failed: {}", key, e),
            }
        });
        refreshes.insert(path.to_string(), handle);
    }

    /// Fetch and cache a list of paths up front, returning how many succeeded
    pub async fn precache(&self, paths: &[&str]) -> usize {
        let mut cached = 0;
        for path in paths {
            match self.fetcher.fetch(path).await {
                Ok(asset) => {
                    store(&self.entries, path, asset);
                    cached += 1;
                }
                Err(e) => tracing::warn!("Failed to precache {}: {}", path, e),
            }
        }
        cached
    }

    /// Wait for all background refreshes started so far
    pub async fn settle(&self) {
        let handles = std::mem::take(&mut *self.refreshes.lock());
        for (path, handle) in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Background refresh of {} did not complete: {}", path, e);
            }
        }
    }

    /// Number of background refreshes still running
    pub fn pending_refreshes(&self) -> usize {
        let mut refreshes = self.refreshes.lock();
        refreshes.retain(|_, handle| !handle.is_finished());
        refreshes.len()
    }

    /// Time since `path` was last fetched, if it is cached
    pub fn age(&self, path: &str) -> Option<Duration> {
        self.entries.lock().peek(path).map(|entry| entry.fetched_at.elapsed())
    }

    /// Look up a cached copy without touching the network
    pub fn cached(&self, path: &str) -> Option<Asset> {
        self.entries.lock().get(path).map(|entry| entry.asset.clone())
    }

    /// Drop every cached asset
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of cached assets
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn store(entries: &Entries, path: &str, asset: Asset) {
    entries
        .lock()
        .put(path.to_string(), CachedAsset { asset, fetched_at: Instant::now() });
}
