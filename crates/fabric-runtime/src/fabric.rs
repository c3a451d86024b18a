//! `StreamFabric`: one entry point wiring the registry, engines, cache and
//! metrics together from a [`FabricConfig`].
//!
//! ```rust,ignore
//! use fabric_runtime::{JoinRequest, JoinSpec, MemorySource, StreamFabric};
//! use std::sync::Arc;
//!
//! let fabric = StreamFabric::new();
//! fabric.register("users", Arc::new(MemorySource::new("users", users)), 0)?;
//! fabric.register("posts", Arc::new(MemorySource::new("posts", posts)), 0)?;
//!
//! let joined = fabric
//!     .join(JoinRequest::new("users", "posts", JoinSpec::left("id", "user_id")))
//!     .await?;
//! fabric.cleanup().await;
//! ```

use crate::aggregation::{AggregateResult, AggregationEngine, AggregationRule};
use crate::cache::{Cache, MemoryCache};
use crate::config::FabricConfig;
use crate::error::FabricResult;
use crate::executor::{CompletionCallback, RecordBatches, RecordStream, StreamConfig, StreamExecutor};
use crate::join::{JoinEngine, JoinRequest};
use crate::metrics::Metrics;
use crate::monitor::{self, MonitorHandle, StreamStats};
use crate::pipeline::{PipelineEngine, PipelineOutput, PipelineStage};
use crate::registry::{StreamRegistration, StreamRegistry};
use crate::resources::ResourceManager;
use crate::source::StreamSource;
use fabric_core::Record;
use std::sync::Arc;
use std::time::Duration;

pub struct StreamFabric {
    config: FabricConfig,
    registry: Arc<StreamRegistry>,
    executor: StreamExecutor,
    joins: JoinEngine,
    aggregation: AggregationEngine,
    pipelines: PipelineEngine,
    resources: ResourceManager,
    metrics: Metrics,
}

impl StreamFabric {
    pub fn new() -> Self {
        Self::with_config(FabricConfig::default())
    }

    /// Build from `config`, with an in-memory cache when caching is enabled.
    pub fn with_config(config: FabricConfig) -> Self {
        let cache: Option<Arc<dyn Cache>> = if config.cache.enabled {
            Some(Arc::new(MemoryCache::new()))
        } else {
            None
        };
        Self::assemble(config, cache)
    }

    /// Build from `config` with a caller-supplied cache backend.
    pub fn with_cache(config: FabricConfig, cache: Arc<dyn Cache>) -> Self {
        let cache = config.cache.enabled.then_some(cache);
        Self::assemble(config, cache)
    }

    fn assemble(config: FabricConfig, cache: Option<Arc<dyn Cache>>) -> Self {
        let registry = Arc::new(StreamRegistry::new());
        let metrics = Metrics::new();
        let executor = StreamExecutor::new(Arc::clone(&registry))
            .with_config(config.executor.clone())
            .with_metrics(metrics.clone());

        let mut joins = JoinEngine::new(executor.clone()).with_metrics(metrics.clone());
        let mut pipelines = PipelineEngine::new(executor.clone())
            .with_aggregation_config(config.aggregation.clone())
            .with_metrics(metrics.clone());
        if let Some(cache) = cache {
            joins = joins.with_cache(Arc::clone(&cache));
            pipelines = pipelines.with_cache(cache);
        }

        Self {
            aggregation: AggregationEngine::new(executor.clone()).with_config(config.aggregation.clone()),
            resources: ResourceManager::new(Arc::clone(&registry)).with_metrics(metrics.clone()),
            config,
            registry,
            executor,
            joins,
            pipelines,
            metrics,
        }
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &StreamExecutor {
        &self.executor
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Register a stream. A `default_batch_size` of 0 takes the executor's
    /// configured default.
    pub fn register(
        &self,
        id: &str,
        source: Arc<dyn StreamSource>,
        default_batch_size: usize,
    ) -> FabricResult<Arc<StreamRegistration>> {
        let batch_size = match default_batch_size {
            0 => self.config.executor.default_batch_size,
            n => n,
        };
        let registration = self.registry.register(id, source, batch_size)?;
        self.metrics.set_stream_count(self.registry.len());
        Ok(registration)
    }

    pub fn resolve(&self, id: &str) -> FabricResult<Arc<StreamRegistration>> {
        self.registry.resolve(id)
    }

    pub fn stream(&self, config: StreamConfig) -> FabricResult<RecordStream> {
        self.executor.stream(config)
    }

    pub async fn execute_concurrently(
        &self,
        configs: &[StreamConfig],
        on_complete: Option<CompletionCallback>,
    ) -> FabricResult<Vec<Vec<Record>>> {
        self.executor.execute_concurrently(configs, on_complete).await
    }

    pub async fn execute_settled(&self, configs: &[StreamConfig]) -> Vec<FabricResult<Vec<Record>>> {
        self.executor.execute_settled(configs).await
    }

    pub fn batch_process(&self, config: StreamConfig, batch_size: usize) -> FabricResult<RecordBatches> {
        self.executor.batch_process(config, batch_size)
    }

    /// Run a join; a request without a TTL takes the configured default TTL.
    pub async fn join(&self, mut request: JoinRequest) -> FabricResult<Vec<Record>> {
        request.cache_ttl = request.cache_ttl.or_else(|| self.config.cache.default_ttl());
        self.joins.join(&request).await
    }

    pub async fn aggregate(
        &self,
        configs: &[StreamConfig],
        rules: &[AggregationRule],
    ) -> FabricResult<AggregateResult> {
        self.aggregation.aggregate(configs, rules).await
    }

    /// Run a pipeline; `None` takes the configured default TTL.
    pub async fn run_pipeline(
        &self,
        stages: &[PipelineStage],
        cache_ttl: Option<Duration>,
    ) -> FabricResult<PipelineOutput> {
        let ttl = cache_ttl.or_else(|| self.config.cache.default_ttl());
        self.pipelines.run(stages, ttl).await
    }

    /// Start a monitor over `stream_ids` using the configured interval.
    pub fn monitor_streams<F>(&self, stream_ids: Vec<String>, on_tick: F) -> MonitorHandle
    where
        F: Fn(&str, &StreamStats) + Send + Sync + 'static,
    {
        monitor::monitor_streams(Arc::clone(&self.registry), stream_ids, &self.config.monitor, on_tick)
    }

    /// Close every source and clear the registry. Safe to call repeatedly.
    pub async fn cleanup(&self) -> usize {
        self.resources.cleanup().await
    }
}

impl Default for StreamFabric {
    fn default() -> Self {
        Self::new()
    }
}
