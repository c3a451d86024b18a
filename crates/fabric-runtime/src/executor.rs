//! Stream executor: fetches registered streams, alone or concurrently
//!
//! Concurrent execution spawns one task per [`StreamConfig`] into a
//! `JoinSet`; a semaphore caps how many source fetches run at once
//! ([`ExecutorConfig::max_concurrency`]). Results always come back in input
//! order, whatever order the tasks complete in.

use crate::config::ExecutorConfig;
use crate::error::{FabricError, FabricResult};
use crate::metrics::Metrics;
use crate::registry::{StreamRegistration, StreamRegistry};
use crate::source::{FetchOptions, Filters};
use fabric_core::{Record, Value};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Per-invocation description of what to read from one stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub stream_id: String,
    #[serde(default)]
    pub filters: Filters,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub options: FetchOptions,
}

impl StreamConfig {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.filters.extend(filters);
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_order(mut self, order: impl Into<String>) -> Self {
        self.options.order = Some(order.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.options.limit = Some(limit);
        self
    }
}

/// Callback invoked once with the full, ordered result list of a successful
/// [`StreamExecutor::execute_concurrently`] call.
pub type CompletionCallback = Box<dyn FnOnce(&[Vec<Record>]) + Send>;

/// Runs stream fetches against the registry.
#[derive(Clone)]
pub struct StreamExecutor {
    registry: Arc<StreamRegistry>,
    config: ExecutorConfig,
    metrics: Option<Metrics>,
}

impl StreamExecutor {
    pub fn new(registry: Arc<StreamRegistry>) -> Self {
        Self {
            registry,
            config: ExecutorConfig::default(),
            metrics: None,
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Lazy, restartable handle on one stream.
    ///
    /// The stream id is resolved immediately; nothing is fetched until the
    /// handle is collected, and every collection fetches again.
    ///
    /// # Errors
    ///
    /// [`FabricError::UnknownStream`] if the stream is not registered.
    pub fn stream(&self, config: StreamConfig) -> FabricResult<RecordStream> {
        let registration = self.registry.resolve(&config.stream_id)?;
        Ok(RecordStream {
            registration,
            config,
            metrics: self.metrics.clone(),
        })
    }

    /// Resolve and materialize one stream.
    pub async fn fetch(&self, config: &StreamConfig) -> FabricResult<Vec<Record>> {
        self.stream(config.clone())?.collect().await
    }

    /// Fetch every config concurrently and return the results in input order.
    ///
    /// Fails fast: the first stream error is returned and sibling tasks are
    /// aborted. `on_complete`, when given, runs exactly once after every
    /// stream has succeeded, with the full result list.
    ///
    /// # Errors
    ///
    /// - [`FabricError::UnknownStream`] before anything is spawned
    /// - [`FabricError::StreamExecution`] for the first failing source
    pub async fn execute_concurrently(
        &self,
        configs: &[StreamConfig],
        on_complete: Option<CompletionCallback>,
    ) -> FabricResult<Vec<Vec<Record>>> {
        let registrations = self.resolve_all(configs)?;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let started = Instant::now();

        let mut tasks = JoinSet::new();
        for (index, (registration, config)) in registrations.into_iter().zip(configs).enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let config = config.clone();
            let metrics = self.metrics.clone();
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => fetch_registered(&registration, &config, metrics.as_ref()).await,
                    Err(e) => Err(FabricError::Task(e.to_string())),
                };
                (index, result)
            });
        }

        let mut slots: Vec<Option<Vec<Record>>> = vec![None; configs.len()];
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined.map_err(|e| FabricError::Task(e.to_string()))?;
            match result {
                Ok(records) => slots[index] = Some(records),
                Err(e) => {
                    warn!(error = %e, "Concurrent execution failed, aborting remaining streams");
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        let results: Vec<Vec<Record>> = slots.into_iter().map(Option::unwrap_or_default).collect();
        debug!(
            streams = results.len(),
            records = results.iter().map(Vec::len).sum::<usize>(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Concurrent execution complete"
        );

        if let Some(callback) = on_complete {
            callback(&results);
        }
        Ok(results)
    }

    /// Like [`execute_concurrently`](Self::execute_concurrently), but every
    /// stream runs to completion and failures stay in their own slot.
    pub async fn execute_settled(&self, configs: &[StreamConfig]) -> Vec<FabricResult<Vec<Record>>> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        let handles: Vec<_> = configs
            .iter()
            .map(|config| {
                let resolved = self.registry.resolve(&config.stream_id);
                let semaphore = Arc::clone(&semaphore);
                let config = config.clone();
                let metrics = self.metrics.clone();
                tokio::spawn(async move {
                    let registration = resolved?;
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| FabricError::Task(e.to_string()))?;
                    fetch_registered(&registration, &config, metrics.as_ref()).await
                })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(e) => Err(FabricError::Task(e.to_string())),
            });
        }
        results
    }

    /// Lazy, restartable handle that yields the stream in fixed-size chunks.
    ///
    /// A `batch_size` of 0 uses the registration's default batch size.
    pub fn batch_process(&self, config: StreamConfig, batch_size: usize) -> FabricResult<RecordBatches> {
        let stream = self.stream(config)?;
        let batch_size = match batch_size {
            0 => match stream.registration.default_batch_size {
                0 => self.config.default_batch_size,
                n => n,
            },
            n => n,
        };
        Ok(stream.batches(batch_size))
    }

    fn resolve_all(&self, configs: &[StreamConfig]) -> FabricResult<Vec<Arc<StreamRegistration>>> {
        configs
            .iter()
            .map(|config| self.registry.resolve(&config.stream_id))
            .collect()
    }
}

/// Fetch one registered stream, tracking activity and metrics.
async fn fetch_registered(
    registration: &StreamRegistration,
    config: &StreamConfig,
    metrics: Option<&Metrics>,
) -> FabricResult<Vec<Record>> {
    let guard = registration.activity().begin();
    let started = Instant::now();
    let result = registration
        .source
        .fetch(&config.filters, config.query.as_deref(), &config.options)
        .await;

    match result {
        Ok(records) => {
            guard.finish(true);
            let elapsed = started.elapsed();
            if let Some(m) = metrics {
                m.record_fetch(&registration.id, records.len(), elapsed.as_secs_f64());
            }
            debug!(
                stream_id = %registration.id,
                records = records.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Fetched stream"
            );
            Ok(records)
        }
        Err(cause) => {
            guard.finish(false);
            if let Some(m) = metrics {
                m.record_failure(&registration.id);
            }
            warn!(stream_id = %registration.id, error = %cause, "Stream fetch failed");
            Err(FabricError::StreamExecution {
                stream_id: registration.id.clone(),
                cause,
            })
        }
    }
}

/// Lazy handle on one stream; see [`StreamExecutor::stream`].
#[derive(Clone)]
pub struct RecordStream {
    registration: Arc<StreamRegistration>,
    config: StreamConfig,
    metrics: Option<Metrics>,
}

impl RecordStream {
    pub fn stream_id(&self) -> &str {
        &self.registration.id
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Fetch the stream from its source.
    pub async fn collect(&self) -> FabricResult<Vec<Record>> {
        fetch_registered(&self.registration, &self.config, self.metrics.as_ref()).await
    }

    pub fn batches(self, batch_size: usize) -> RecordBatches {
        RecordBatches {
            stream: self,
            batch_size: batch_size.max(1),
        }
    }
}

/// Lazy handle yielding a stream in chunks; the last chunk may be shorter.
#[derive(Clone)]
pub struct RecordBatches {
    stream: RecordStream,
    batch_size: usize,
}

impl RecordBatches {
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn collect(&self) -> FabricResult<Vec<Vec<Record>>> {
        let records = self.stream.collect().await?;
        Ok(chunk(records, self.batch_size))
    }

    /// Async stream of batches. The source is only read on first poll.
    pub fn into_stream(self) -> BoxStream<'static, FabricResult<Vec<Record>>> {
        let batch_size = self.batch_size;
        stream::once(async move { self.stream.collect().await })
            .flat_map(move |result| match result {
                Ok(records) => stream::iter(chunk(records, batch_size).into_iter().map(Ok)).boxed(),
                Err(e) => stream::iter(vec![Err(e)]).boxed(),
            })
            .boxed()
    }
}

fn chunk(records: Vec<Record>, size: usize) -> Vec<Vec<Record>> {
    let mut batches = Vec::with_capacity(records.len().div_ceil(size));
    let mut iter = records.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(size).collect());
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use fabric_core::record;

    fn numbers(n: i64) -> Vec<Record> {
        (1..=n).map(|i| record! { "id" => i }).collect()
    }

    #[test]
    fn test_chunk_last_shorter() {
        let batches = chunk(numbers(5), 2);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_chunk_empty() {
        assert!(chunk(vec![], 3).is_empty());
    }

    #[test]
    fn test_stream_config_builders() {
        let config = StreamConfig::new("users")
            .with_filter("active", true)
            .with_query("ada")
            .with_order("id DESC")
            .with_limit(5);
        assert_eq!(config.filters.get("active"), Some(&Value::Bool(true)));
        assert_eq!(config.query.as_deref(), Some("ada"));
        assert_eq!(config.options.limit, Some(5));
    }

    #[tokio::test]
    async fn test_stream_is_lazy_and_restartable() {
        let registry = Arc::new(StreamRegistry::new());
        let source = Arc::new(MemorySource::new("n", numbers(3)));
        registry.register("n", source.clone(), 10).unwrap();
        let executor = StreamExecutor::new(registry);

        let handle = executor.stream(StreamConfig::new("n")).unwrap();
        assert_eq!(source.fetch_count(), 0);
        assert_eq!(handle.collect().await.unwrap().len(), 3);
        assert_eq!(handle.collect().await.unwrap().len(), 3);
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_batch_size_zero_uses_registration_default() {
        let registry = Arc::new(StreamRegistry::new());
        registry
            .register("n", Arc::new(MemorySource::new("n", numbers(7))), 3)
            .unwrap();
        let executor = StreamExecutor::new(registry);

        let batches = executor.batch_process(StreamConfig::new("n"), 0).unwrap();
        assert_eq!(batches.batch_size(), 3);
        let sizes: Vec<usize> = batches.collect().await.unwrap().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn test_batches_into_stream() {
        let registry = Arc::new(StreamRegistry::new());
        registry
            .register("n", Arc::new(MemorySource::new("n", numbers(5))), 2)
            .unwrap();
        let executor = StreamExecutor::new(registry);

        let batches: Vec<_> = executor
            .batch_process(StreamConfig::new("n"), 4)
            .unwrap()
            .into_stream()
            .collect()
            .await;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_activity_updated_by_fetch() {
        let registry = Arc::new(StreamRegistry::new());
        let reg = registry
            .register("n", Arc::new(MemorySource::new("n", numbers(1))), 1)
            .unwrap();
        let executor = StreamExecutor::new(registry);
        executor.fetch(&StreamConfig::new("n")).await.unwrap();

        let snap = reg.activity().snapshot();
        assert_eq!(snap.fetches, 1);
        assert_eq!(snap.in_flight, 0);
        assert!(!snap.last_failed);
    }
}
