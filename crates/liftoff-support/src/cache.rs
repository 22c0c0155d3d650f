//! Application cache.
//!
//! [`CacheClient`] is the handle handlers use. It fronts a [`CacheStore`]
//! backend chosen by `cache.backend`:
//! - `memory`: [`MemoryCache`], a concurrent map with per-entry TTL
//! - `null`: [`NullCache`], every lookup misses

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use liftoff_common::{CacheBackend, CacheSettings};

/// Storage backend behind a [`CacheClient`].
pub trait CacheStore: Send + Sync {
    /// Backend name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Fetch a live value.
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Store a value for `ttl`.
    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration);

    /// Remove a value, returning whether it existed.
    fn delete(&self, key: &str) -> bool;

    /// Drop every entry.
    fn clear(&self);

    /// Number of stored entries, expired ones included until purged.
    fn len(&self) -> usize;

    /// Returns `true` if nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Entry {
    value: Vec<u8>,
    // None when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(at) => at > now,
            None => true,
        }
    }
}

/// In-process cache with TTL and an entry bound.
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    max_entries: usize,
}

impl MemoryCache {
    /// Create a cache holding at most `max_entries` values.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    /// Remove expired entries and return how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    fn make_room(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }

        if self.purge_expired() > 0 && self.entries.len() < self.max_entries {
            return;
        }

        // Still full: evict whatever expires soonest.
        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| (entry.expires_at.is_none(), entry.expires_at))
            .map(|entry| entry.key().clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
            debug!(key = %key, "Cache full, evicted entry");
        }
    }
}

impl CacheStore for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .and_then(|entry| entry.is_live(now).then(|| entry.value.clone()));

        if hit.is_none() {
            self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        }
        hit
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        if self.max_entries == 0 {
            return;
        }
        if !self.entries.contains_key(key) {
            self.make_room();
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now().checked_add(ttl),
            },
        );
    }

    fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Backend that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCache;

impl CacheStore for NullCache {
    fn name(&self) -> &'static str {
        "null"
    }

    fn get(&self, _key: &str) -> Option<Vec<u8>> {
        None
    }

    fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) {}

    fn delete(&self, _key: &str) -> bool {
        false
    }

    fn clear(&self) {}

    fn len(&self) -> usize {
        0
    }
}

/// Cheap, cloneable cache handle.
#[derive(Clone)]
pub struct CacheClient {
    store: Arc<dyn CacheStore>,
    default_ttl: Duration,
}

impl CacheClient {
    /// Build the backend selected by `settings`.
    pub fn from_settings(settings: &CacheSettings) -> Self {
        let store: Arc<dyn CacheStore> = match settings.backend {
            CacheBackend::Memory => Arc::new(MemoryCache::new(settings.max_entries)),
            CacheBackend::Null => Arc::new(NullCache),
        };
        Self::new(store, Duration::from_secs(settings.default_ttl_secs))
    }

    /// Wrap an existing backend.
    pub fn new(store: Arc<dyn CacheStore>, default_ttl: Duration) -> Self {
        Self { store, default_ttl }
    }

    /// Backend name.
    pub fn backend(&self) -> &'static str {
        self.store.name()
    }

    /// TTL used by [`set`](Self::set).
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Fetch raw bytes.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.store.get(key)
    }

    /// Store raw bytes with the default TTL.
    pub fn set(&self, key: &str, value: impl Into<Vec<u8>>) {
        self.store.set(key, value.into(), self.default_ttl);
    }

    /// Store raw bytes with an explicit TTL.
    pub fn set_with_ttl(&self, key: &str, value: impl Into<Vec<u8>>, ttl: Duration) {
        self.store.set(key, value.into(), ttl);
    }

    /// Remove a key.
    pub fn delete(&self, key: &str) -> bool {
        self.store.delete(key)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.store.clear();
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Fetch and deserialize a JSON value.
    ///
    /// A stored value that no longer deserializes is treated as a miss.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.store.get(key)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Discarding undecodable cache entry");
                self.store.delete(key);
                None
            }
        }
    }

    /// Serialize and store a JSON value with the default TTL.
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), serde_json::Error> {
        let bytes = serde_json::to_vec(value)?;
        self.store.set(key, bytes, self.default_ttl);
        Ok(())
    }
}

impl fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheClient")
            .field("backend", &self.store.name())
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_set_and_get() {
        let cache = MemoryCache::new(10);
        cache.set("a", b"one".to_vec(), Duration::from_secs(60));
        assert_eq!(cache.get("a").as_deref(), Some(b"one".as_slice()));
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn test_expired_entry_misses_and_is_removed() {
        let cache = MemoryCache::new(10);
        cache.set("a", b"one".to_vec(), Duration::ZERO);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_full_cache_evicts_soonest_expiry() {
        let cache = MemoryCache::new(2);
        cache.set("short", b"1".to_vec(), Duration::from_secs(1));
        cache.set("long", b"2".to_vec(), Duration::from_secs(600));
        cache.set("new", b"3".to_vec(), Duration::from_secs(600));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("short").is_none());
        assert!(cache.get("long").is_some());
        assert!(cache.get("new").is_some());
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        let client = CacheClient::from_settings(&CacheSettings {
            default_ttl_secs: u64::MAX,
            ..Default::default()
        });
        client.set("forever", "kept");
        assert_eq!(client.get("forever").as_deref(), Some(b"kept".as_slice()));

        let cache = MemoryCache::new(1);
        cache.set("forever", b"1".to_vec(), Duration::MAX);
        assert_eq!(cache.purge_expired(), 0);
        assert!(cache.get("forever").is_some());
    }

    #[test]
    fn test_eviction_prefers_finite_expiry() {
        let cache = MemoryCache::new(2);
        cache.set("forever", b"1".to_vec(), Duration::MAX);
        cache.set("hour", b"2".to_vec(), Duration::from_secs(3_600));
        cache.set("new", b"3".to_vec(), Duration::from_secs(60));

        assert!(cache.get("forever").is_some());
        assert!(cache.get("hour").is_none());
        assert!(cache.get("new").is_some());
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = MemoryCache::new(1);
        cache.set("a", b"1".to_vec(), Duration::from_secs(60));
        cache.set("a", b"2".to_vec(), Duration::from_secs(60));
        assert_eq!(cache.get("a").as_deref(), Some(b"2".as_slice()));
    }

    #[test]
    fn test_null_backend_always_misses() {
        let client = CacheClient::from_settings(&CacheSettings {
            backend: CacheBackend::Null,
            ..Default::default()
        });
        client.set("a", "value");
        assert_eq!(client.backend(), "null");
        assert!(client.get("a").is_none());
        assert!(client.is_empty());
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Job {
        id: u32,
        name: String,
    }

    #[test]
    fn test_json_helpers() {
        let client = CacheClient::from_settings(&CacheSettings::default());
        let job = Job {
            id: 3,
            name: "sync".into(),
        };

        client.set_json("job:3", &job).unwrap();
        assert_eq!(client.get_json::<Job>("job:3"), Some(job));
    }

    #[test]
    fn test_undecodable_json_is_a_miss() {
        let client = CacheClient::from_settings(&CacheSettings::default());
        client.set("job:1", "not json");
        assert!(client.get_json::<Job>("job:1").is_none());
        assert!(client.get("job:1").is_none());
    }
}
