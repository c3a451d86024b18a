//! Stream registry: maps stream ids to their sources and defaults
//!
//! Registration happens during setup; afterwards the registry is read-mostly.
//! A `RwLock` gives many concurrent `resolve` calls while a single writer
//! registers or drains.

use crate::error::{FabricError, FabricResult};
use crate::source::StreamSource;
use indexmap::IndexMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, info};

/// A registered stream: its id, source and default execution options.
pub struct StreamRegistration {
    pub id: String,
    pub source: Arc<dyn StreamSource>,
    pub default_batch_size: usize,
    activity: StreamActivity,
}

impl StreamRegistration {
    pub fn activity(&self) -> &StreamActivity {
        &self.activity
    }
}

impl std::fmt::Debug for StreamRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistration")
            .field("id", &self.id)
            .field("source", &self.source.name())
            .field("default_batch_size", &self.default_batch_size)
            .finish()
    }
}

/// Live counters for one stream, updated by the executor around every fetch.
#[derive(Debug, Default)]
pub struct StreamActivity {
    in_flight: AtomicUsize,
    fetches: AtomicU64,
    failures: AtomicU64,
    last_failed: AtomicBool,
    last_finished: Mutex<Option<Instant>>,
}

/// Point-in-time copy of [`StreamActivity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivitySnapshot {
    pub in_flight: usize,
    pub fetches: u64,
    pub failures: u64,
    pub last_failed: bool,
    pub last_finished: Option<Instant>,
}

impl StreamActivity {
    /// Marks a fetch as started. The returned guard keeps the fetch counted
    /// as in flight until it is finished or dropped.
    pub fn begin(&self) -> FetchGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.fetches.fetch_add(1, Ordering::Relaxed);
        FetchGuard { activity: self }
    }

    pub fn snapshot(&self) -> ActivitySnapshot {
        ActivitySnapshot {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            fetches: self.fetches.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_failed: self.last_failed.load(Ordering::SeqCst),
            last_finished: *self
                .last_finished
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn record_outcome(&self, ok: bool) {
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.last_failed.store(!ok, Ordering::SeqCst);
        *self
            .last_finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }
}

/// In-flight marker returned by [`StreamActivity::begin`].
///
/// A guard dropped without [`finish`](Self::finish) (a cancelled fetch) leaves
/// no outcome behind.
pub struct FetchGuard<'a> {
    activity: &'a StreamActivity,
}

impl FetchGuard<'_> {
    pub fn finish(self, ok: bool) {
        self.activity.record_outcome(ok);
    }
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.activity.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Registry of stream sources keyed by stream id.
#[derive(Default)]
pub struct StreamRegistry {
    streams: RwLock<IndexMap<String, Arc<StreamRegistration>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `source` under `id`.
    ///
    /// # Errors
    ///
    /// [`FabricError::DuplicateStream`] if `id` is already registered.
    pub fn register(
        &self,
        id: &str,
        source: Arc<dyn StreamSource>,
        default_batch_size: usize,
    ) -> FabricResult<Arc<StreamRegistration>> {
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        if streams.contains_key(id) {
            return Err(FabricError::DuplicateStream(id.to_string()));
        }

        let registration = Arc::new(StreamRegistration {
            id: id.to_string(),
            source,
            default_batch_size,
            activity: StreamActivity::default(),
        });
        streams.insert(id.to_string(), Arc::clone(&registration));

        info!(
            stream_id = id,
            source = registration.source.name(),
            default_batch_size,
            "Registered stream"
        );
        Ok(registration)
    }

    /// Look up a registration.
    ///
    /// # Errors
    ///
    /// [`FabricError::UnknownStream`] if `id` was never registered.
    pub fn resolve(&self, id: &str) -> FabricResult<Arc<StreamRegistration>> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        streams.get(id).cloned().ok_or_else(|| {
            debug!(stream_id = id, "Unknown stream");
            FabricError::UnknownStream(id.to_string())
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Registered ids in registration order.
    pub fn ids(&self) -> Vec<String> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every registration.
    pub fn drain(&self) -> Vec<Arc<StreamRegistration>> {
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        streams.drain(..).map(|(_, registration)| registration).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    fn source(name: &str) -> Arc<dyn StreamSource> {
        Arc::new(MemorySource::new(name, vec![]))
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = StreamRegistry::new();
        registry.register("users", source("users"), 50).unwrap();

        let reg = registry.resolve("users").unwrap();
        assert_eq!(reg.id, "users");
        assert_eq!(reg.default_batch_size, 50);
        assert_eq!(reg.source.name(), "users");
    }

    #[test]
    fn test_register_duplicate_fails() {
        let registry = StreamRegistry::new();
        registry.register("users", source("users"), 10).unwrap();
        let err = registry.register("users", source("other"), 10).unwrap_err();
        assert!(matches!(err, FabricError::DuplicateStream(ref id) if id == "users"));
        // original registration untouched
        assert_eq!(registry.resolve("users").unwrap().source.name(), "users");
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = StreamRegistry::new();
        let err = registry.resolve("ghost").unwrap_err();
        assert!(matches!(err, FabricError::UnknownStream(ref id) if id == "ghost"));
    }

    #[test]
    fn test_ids_in_registration_order() {
        let registry = StreamRegistry::new();
        registry.register("b", source("b"), 1).unwrap();
        registry.register("a", source("a"), 1).unwrap();
        assert_eq!(registry.ids(), vec!["b".to_string(), "a".to_string()]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_drain_empties_registry() {
        let registry = StreamRegistry::new();
        registry.register("a", source("a"), 1).unwrap();
        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert!(registry.is_empty());
        assert!(registry.drain().is_empty());
    }

    #[test]
    fn test_activity_tracks_in_flight_and_outcome() {
        let activity = StreamActivity::default();
        let guard = activity.begin();
        assert_eq!(activity.snapshot().in_flight, 1);
        guard.finish(false);

        let snap = activity.snapshot();
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.fetches, 1);
        assert_eq!(snap.failures, 1);
        assert!(snap.last_failed);
        assert!(snap.last_finished.is_some());
    }

    #[test]
    fn test_dropped_guard_records_no_outcome() {
        let activity = StreamActivity::default();
        drop(activity.begin());
        let snap = activity.snapshot();
        assert_eq!(snap.in_flight, 0);
        assert!(snap.last_finished.is_none());
    }
}
