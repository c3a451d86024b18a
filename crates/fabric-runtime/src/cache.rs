//! TTL cache used to memoize join and pipeline results
//!
//! The fabric only needs `get`/`set` with a TTL, so any key-value store can
//! back it. [`MemoryCache`] keeps entries in a `DashMap` with lazy expiry.
//! Concurrent `set` calls on one key are last-writer-wins; keys are derived
//! deterministically per call, so no cross-entry locking is needed.

use async_trait::async_trait;
use dashmap::DashMap;
use rustc_hash::FxHasher;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use tracing::trace;

/// Errors raised by cache backends.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Cache serialization error: {0}")]
    Serialization(String),
}

/// Key-value store with per-entry TTL.
///
/// Entries written through [`put_json`] are JSON, which encodes NaN and
/// infinite floats as `null`. The join and pipeline engines therefore skip
/// caching any result that holds one.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store `value` under `key`; `None` means no expiry.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// In-process cache backed by a `DashMap`.
#[derive(Default)]
pub struct MemoryCache {
    store: DashMap<String, (Vec<u8>, Option<Instant>)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until they are read or purged.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.store.len();
        self.store
            .retain(|_, (_, expires_at)| expires_at.map_or(true, |exp| exp > now));
        before - self.store.len()
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    /// Remove `key` only if its entry is expired as of `now`. An entry
    /// rewritten after the caller saw it expire is left alone.
    fn evict_expired(&self, key: &str, now: Instant) -> bool {
        self.store
            .remove_if(key, |_, (_, expires_at)| matches!(expires_at, Some(exp) if now >= *exp))
            .is_some()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        match self.store.get(key) {
            Some(entry) => match entry.value() {
                (_, Some(exp)) if now >= *exp => {}
                (value, _) => return Ok(Some(value.clone())),
            },
            None => return Ok(None),
        }
        if self.evict_expired(key, now) {
            trace!(key, "Cache entry expired");
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.store
            .insert(key.to_string(), (value.to_vec(), expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.store.remove(key);
        Ok(())
    }
}

/// Deterministic cache key: `<kind>:<fx hash of the descriptor's JSON>`.
pub fn cache_key(kind: &str, descriptor: &serde_json::Value) -> String {
    let mut hasher = FxHasher::default();
    descriptor.to_string().hash(&mut hasher);
    format!("{}:{:016x}", kind, hasher.finish())
}

/// Read and deserialize a JSON-encoded entry.
pub async fn get_json<T: DeserializeOwned>(
    cache: &dyn Cache,
    key: &str,
) -> Result<Option<T>, CacheError> {
    match cache.get(key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CacheError::Serialization(e.to_string())),
        None => Ok(None),
    }
}

/// Serialize `value` to JSON and store it.
pub async fn put_json<T: Serialize + ?Sized>(
    cache: &dyn Cache,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), CacheError> {
    let bytes = serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
    cache.set(key, &bytes, Some(ttl)).await
}
