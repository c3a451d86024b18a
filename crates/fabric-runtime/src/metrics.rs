//! Prometheus metrics for the stream fabric

use prometheus::{CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collection for the fabric runtime
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub stream_fetches: CounterVec,
    pub stream_failures: CounterVec,
    pub records_fetched: CounterVec,
    pub cache_lookups: CounterVec,
    pub fetch_latency: HistogramVec,
    pub registered_streams: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let stream_fetches = CounterVec::new(
            Opts::new("fabric_stream_fetches_total", "Source fetches per stream"),
            &["stream"],
        )
        .expect("failed to create stream_fetches counter");

        let stream_failures = CounterVec::new(
            Opts::new("fabric_stream_failures_total", "Failed source fetches per stream"),
            &["stream"],
        )
        .expect("failed to create stream_failures counter");

        let records_fetched = CounterVec::new(
            Opts::new("fabric_records_fetched_total", "Records returned by sources"),
            &["stream"],
        )
        .expect("failed to create records_fetched counter");

        let cache_lookups = CounterVec::new(
            Opts::new("fabric_cache_lookups_total", "Join and pipeline cache lookups"),
            &["kind", "outcome"],
        )
        .expect("failed to create cache_lookups counter");

        let fetch_latency = HistogramVec::new(
            HistogramOpts::new("fabric_fetch_latency_seconds", "Source fetch latency").buckets(
                vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
            ),
            &["stream"],
        )
        .expect("failed to create fetch_latency histogram");

        let registered_streams =
            Gauge::new("fabric_registered_streams", "Number of registered streams")
                .expect("failed to create registered_streams gauge");

        registry
            .register(Box::new(stream_fetches.clone()))
            .expect("failed to register stream_fetches");
        registry
            .register(Box::new(stream_failures.clone()))
            .expect("failed to register stream_failures");
        registry
            .register(Box::new(records_fetched.clone()))
            .expect("failed to register records_fetched");
        registry
            .register(Box::new(cache_lookups.clone()))
            .expect("failed to register cache_lookups");
        registry
            .register(Box::new(fetch_latency.clone()))
            .expect("failed to register fetch_latency");
        registry
            .register(Box::new(registered_streams.clone()))
            .expect("failed to register registered_streams");

        Self {
            registry: Arc::new(registry),
            stream_fetches,
            stream_failures,
            records_fetched,
            cache_lookups,
            fetch_latency,
            registered_streams,
        }
    }

    /// Record a completed source fetch
    pub fn record_fetch(&self, stream: &str, records: usize, latency_secs: f64) {
        self.stream_fetches.with_label_values(&[stream]).inc();
        self.records_fetched
            .with_label_values(&[stream])
            .inc_by(records as f64);
        self.fetch_latency
            .with_label_values(&[stream])
            .observe(latency_secs);
    }

    /// Record a failed source fetch
    pub fn record_failure(&self, stream: &str) {
        self.stream_fetches.with_label_values(&[stream]).inc();
        self.stream_failures.with_label_values(&[stream]).inc();
    }

    /// Record a cache lookup; `kind` is `join` or `pipeline`
    pub fn record_cache(&self, kind: &str, hit: bool) {
        let outcome = if hit { "hit" } else { "miss" };
        self.cache_lookups.with_label_values(&[kind, outcome]).inc();
    }

    /// Set registered stream count
    pub fn set_stream_count(&self, count: usize) {
        self.registered_streams.set(count as f64);
    }

    /// Get Prometheus text output
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
