//! Release of stream sources held by the registry

use crate::metrics::Metrics;
use crate::registry::StreamRegistry;
use std::sync::Arc;
use tracing::{info, warn};

/// Owns the shutdown path for a [`StreamRegistry`].
#[derive(Clone)]
pub struct ResourceManager {
    registry: Arc<StreamRegistry>,
    metrics: Option<Metrics>,
}

impl ResourceManager {
    pub fn new(registry: Arc<StreamRegistry>) -> Self {
        Self {
            registry,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Close every registered source and empty the registry.
    ///
    /// Close failures are logged and skipped. Calling this again, or on an
    /// empty registry, does nothing. Returns how many registrations were
    /// released.
    pub async fn cleanup(&self) -> usize {
        let registrations = self.registry.drain();
        if let Some(m) = &self.metrics {
            m.set_stream_count(0);
        }
        if registrations.is_empty() {
            return 0;
        }

        for registration in &registrations {
            if let Err(e) = registration.source.close().await {
                warn!(stream_id = %registration.id, error = %e, "Error closing stream source");
            }
        }
        info!(streams = registrations.len(), "Released stream sources");
        registrations.len()
    }
}
