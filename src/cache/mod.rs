//! Keyed in-memory caches
//!
//! Each cache namespace is an independent, bounded LRU with per-entry TTL,
//! backed by `DashMap`. Expired entries are evicted lazily on access; when a
//! namespace reaches capacity the least recently used entry is dropped.
//! Caches are advisory: `get` misses are normal, `set` never fails, and no
//! caller may treat cached state as authoritative.

use crate::config::CacheConfig;
use dashmap::DashMap;
use serde_json::Value;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A thread-safe bounded cache with per-entry TTL and LRU eviction.
#[derive(Clone)]
pub struct TtlCache<V> {
    inner: Arc<DashMap<String, Entry<V>>>,
    capacity: usize,
}

struct Entry<V> {
    value: V,
    inserted: Instant,
    last_access: Instant,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    /// Create a cache bounded to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Get a cached value if present and unexpired.
    pub fn get(&self, key: &str) -> Option<V> {
        if let Some(mut entry) = self.inner.get_mut(key) {
            if entry.inserted.elapsed() < entry.ttl {
                entry.last_access = Instant::now();
                return Some(entry.value.clone());
            }
            // Expired — drop the guard before removing
            drop(entry);
            self.inner.remove(key);
        }
        None
    }

    /// Insert or update a value with the given TTL.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        if self.inner.len() >= self.capacity {
            self.evict_lru();
        }
        let now = Instant::now();
        self.inner.insert(
            key.into(),
            Entry {
                value,
                inserted: now,
                last_access: now,
                ttl,
            },
        );
    }

    /// Remove all entries whose key starts with `prefix`.
    pub fn remove_by_prefix(&self, prefix: &str) {
        self.inner.retain(|k, _| !k.starts_with(prefix));
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Current entry count (expired entries included until touched).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn evict_lru(&self) {
        let oldest = self
            .inner
            .iter()
            .min_by_key(|e| e.value().last_access)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.inner.remove(&key);
        }
    }
}

/// The four cache namespaces used by the pipeline, initialized once at
/// startup and passed to collaborators explicitly.
#[derive(Clone)]
pub struct CacheRegistry {
    /// Query embeddings keyed by query text. LRU-bounded, effectively no TTL.
    pub embeddings: TtlCache<Vec<f32>>,
    /// LLM completions keyed by (query, candidate digest) fingerprint.
    pub completions: TtlCache<String>,
    /// Entity resolutions keyed by `platform:entity_type:name`. Invalidated
    /// by prefix on subscription mutation.
    pub resolutions: TtlCache<Value>,
    /// Fetched payloads keyed by generated path.
    pub payloads: TtlCache<Value>,
    completion_ttl: Duration,
    resolution_ttl: Duration,
    payload_ttl: Duration,
}

/// TTL used for embeddings, which only expire by LRU pressure.
const EMBEDDING_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

impl CacheRegistry {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            embeddings: TtlCache::new(config.max_entries),
            completions: TtlCache::new(config.max_entries),
            resolutions: TtlCache::new(config.max_entries),
            payloads: TtlCache::new(config.max_entries),
            completion_ttl: Duration::from_secs(config.completion_ttl_secs),
            resolution_ttl: Duration::from_secs(config.resolution_ttl_secs),
            payload_ttl: Duration::from_secs(config.payload_ttl_secs),
        }
    }

    pub fn set_embedding(&self, query: &str, vector: Vec<f32>) {
        self.embeddings.set(query, vector, EMBEDDING_TTL);
    }

    pub fn set_completion(&self, fingerprint: &str, completion: String) {
        self.completions
            .set(fingerprint, completion, self.completion_ttl);
    }

    pub fn set_resolution(&self, key: &str, outcome: Value) {
        self.resolutions.set(key, outcome, self.resolution_ttl);
    }

    pub fn set_payload(&self, path: &str, payload: Value) {
        self.payloads.set(path, payload, self.payload_ttl);
    }

    /// Drop every cached resolution for a (platform, entity_type) scope.
    /// Called on subscription mutation so later resolutions reflect it.
    pub fn invalidate_resolutions(&self, platform: &str, entity_type: &str) {
        self.resolutions
            .remove_by_prefix(&format!("{platform}:{entity_type}:"));
    }
}

/// Content-addressed fingerprint for cache keys, stable within a process run.
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for part in parts {
        part.hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}
