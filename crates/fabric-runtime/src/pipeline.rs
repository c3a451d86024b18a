//! Staged pipeline execution
//!
//! Stages run strictly in list order over a working set of records. A stage
//! that declares a `stream_id` reads that stream fresh instead of consuming
//! the previous stage's output. An `aggregate` stage, or a custom stage that
//! returns an aggregate, ends the pipeline.

use crate::aggregation::{AggregateResult, AggregationEngine, AggregationRule};
use crate::cache::{self, Cache};
use crate::config::AggregationConfig;
use crate::error::{FabricError, FabricResult};
use crate::executor::{StreamConfig, StreamExecutor};
use crate::join::{join_records, JoinSpec};
use crate::metrics::Metrics;
use crate::source::{matches_filters, Filters};
use async_trait::async_trait;
use fabric_core::{Record, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Filter,
    Transform,
    Join,
    Aggregate,
    Custom,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Filter => "filter",
            OperationKind::Transform => "transform",
            OperationKind::Join => "join",
            OperationKind::Aggregate => "aggregate",
            OperationKind::Custom => "custom",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "filter" => Ok(OperationKind::Filter),
            "transform" => Ok(OperationKind::Transform),
            "join" => Ok(OperationKind::Join),
            "aggregate" => Ok(OperationKind::Aggregate),
            "custom" => Ok(OperationKind::Custom),
            _ => Err(FabricError::UnknownPipelineOperation(s.to_string())),
        }
    }
}

/// Value flowing out of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum PipelineOutput {
    Records(Vec<Record>),
    Aggregate(AggregateResult),
}

impl PipelineOutput {
    pub fn as_records(&self) -> Option<&[Record]> {
        match self {
            PipelineOutput::Records(r) => Some(r),
            PipelineOutput::Aggregate(_) => None,
        }
    }

    pub fn into_records(self) -> Option<Vec<Record>> {
        match self {
            PipelineOutput::Records(r) => Some(r),
            PipelineOutput::Aggregate(_) => None,
        }
    }

    pub fn as_aggregate(&self) -> Option<&AggregateResult> {
        match self {
            PipelineOutput::Aggregate(a) => Some(a),
            PipelineOutput::Records(_) => None,
        }
    }

    pub fn into_aggregate(self) -> Option<AggregateResult> {
        match self {
            PipelineOutput::Aggregate(a) => Some(a),
            PipelineOutput::Records(_) => None,
        }
    }

    /// Records or aggregate fields.
    pub fn len(&self) -> usize {
        match self {
            PipelineOutput::Records(r) => r.len(),
            PipelineOutput::Aggregate(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// False when any record or aggregate value holds a NaN or infinite float.
    pub fn is_finite(&self) -> bool {
        match self {
            PipelineOutput::Records(r) => r.iter().all(Record::is_finite),
            PipelineOutput::Aggregate(a) => a.values().all(Value::is_finite),
        }
    }
}

/// Maps each working record to a new one; the second argument is the stage's
/// whole input.
pub type StageTransformer = Arc<dyn Fn(&Record, &[Record]) -> Record + Send + Sync>;

/// User-supplied stage logic.
#[async_trait]
pub trait CustomStage: Send + Sync {
    async fn run(
        &self,
        executor: &StreamExecutor,
        input: PipelineOutput,
        params: &StageParams,
    ) -> FabricResult<PipelineOutput>;
}

/// [`CustomStage`] from a synchronous closure that does not need the executor.
pub struct FnStage<F>(F);

impl<F> FnStage<F>
where
    F: Fn(PipelineOutput, &StageParams) -> FabricResult<PipelineOutput> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> CustomStage for FnStage<F>
where
    F: Fn(PipelineOutput, &StageParams) -> FabricResult<PipelineOutput> + Send + Sync,
{
    async fn run(
        &self,
        _executor: &StreamExecutor,
        input: PipelineOutput,
        params: &StageParams,
    ) -> FabricResult<PipelineOutput> {
        (self.0)(input, params)
    }
}

/// Parameters of a stage. Each operation reads only the fields it needs.
#[derive(Clone, Default)]
pub struct StageParams {
    /// `filter`: exact-match predicates. Other stages with a `stream_id`
    /// apply them to their fresh read; `aggregate` applies them to the stream
    /// it re-reads.
    pub filters: Filters,
    pub query: Option<String>,
    pub transformer: Option<StageTransformer>,
    pub secondary_stream: Option<String>,
    pub secondary_filters: Filters,
    pub join_conditions: Option<JoinSpec>,
    pub rules: Vec<AggregationRule>,
    /// `aggregate`: aggregate the working records instead of re-reading.
    pub chain: bool,
    pub custom_operation: Option<Arc<dyn CustomStage>>,
    /// Free-form values for custom stages.
    pub extra: IndexMap<String, Value>,
}

impl StageParams {
    fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "filters": self.filters,
            "query": self.query,
            "secondary_stream": self.secondary_stream,
            "secondary_filters": self.secondary_filters,
            "join_conditions": self.join_conditions,
            "rules": self.rules.iter().map(AggregationRule::describe).collect::<Vec<_>>(),
            "chain": self.chain,
            "extra": self.extra,
        })
    }
}

impl fmt::Debug for StageParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageParams")
            .field("filters", &self.filters)
            .field("query", &self.query)
            .field("transformer", &self.transformer.is_some())
            .field("secondary_stream", &self.secondary_stream)
            .field("secondary_filters", &self.secondary_filters)
            .field("join_conditions", &self.join_conditions)
            .field("rules", &self.rules)
            .field("chain", &self.chain)
            .field("custom_operation", &self.custom_operation.is_some())
            .field("extra", &self.extra)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineStage {
    pub id: String,
    pub stream_id: Option<String>,
    pub operation: OperationKind,
    pub params: StageParams,
}

impl PipelineStage {
    pub fn new(id: impl Into<String>, operation: OperationKind) -> Self {
        Self {
            id: id.into(),
            stream_id: None,
            operation,
            params: StageParams::default(),
        }
    }

    /// Build a stage from a textual operation name.
    pub fn parse(id: impl Into<String>, operation: &str) -> FabricResult<Self> {
        Ok(Self::new(id, operation.parse()?))
    }

    /// Read `stream_id` with `filters`.
    pub fn filter(id: impl Into<String>, stream_id: impl Into<String>, filters: Filters) -> Self {
        Self::new(id, OperationKind::Filter)
            .with_stream(stream_id)
            .with_filters(filters)
    }

    /// Filter the working records in memory.
    pub fn filter_working(id: impl Into<String>, filters: Filters) -> Self {
        Self::new(id, OperationKind::Filter).with_filters(filters)
    }

    pub fn transform<F>(id: impl Into<String>, transformer: F) -> Self
    where
        F: Fn(&Record, &[Record]) -> Record + Send + Sync + 'static,
    {
        let mut stage = Self::new(id, OperationKind::Transform);
        stage.params.transformer = Some(Arc::new(transformer));
        stage
    }

    pub fn join(id: impl Into<String>, secondary_stream: impl Into<String>, spec: JoinSpec) -> Self {
        let mut stage = Self::new(id, OperationKind::Join);
        stage.params.secondary_stream = Some(secondary_stream.into());
        stage.params.join_conditions = Some(spec);
        stage
    }

    pub fn aggregate(id: impl Into<String>, rules: Vec<AggregationRule>) -> Self {
        let mut stage = Self::new(id, OperationKind::Aggregate);
        stage.params.rules = rules;
        stage
    }

    pub fn custom(id: impl Into<String>, operation: impl CustomStage + 'static) -> Self {
        let mut stage = Self::new(id, OperationKind::Custom);
        stage.params.custom_operation = Some(Arc::new(operation));
        stage
    }

    pub fn with_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.params.filters.extend(filters);
        self
    }

    pub fn with_secondary_filters(mut self, filters: Filters) -> Self {
        self.params.secondary_filters.extend(filters);
        self
    }

    pub fn chained(mut self) -> Self {
        self.params.chain = true;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.extra.insert(key.into(), value.into());
        self
    }

    fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "stream_id": self.stream_id,
            "operation": self.operation,
            "params": self.params.describe(),
        })
    }

    fn missing(&self, parameter: &str) -> FabricError {
        FabricError::missing_parameter(&self.id, parameter)
    }

    fn fresh_config(&self) -> Option<StreamConfig> {
        self.stream_id.as_ref().map(|stream_id| {
            let mut config = StreamConfig::new(stream_id.clone()).with_filters(self.params.filters.clone());
            config.query = self.params.query.clone();
            config
        })
    }
}

/// Cache key over the ordered stage list. Closures are identified by the id
/// of the stage that owns them.
pub fn pipeline_cache_key(stages: &[PipelineStage]) -> String {
    let descriptor: Vec<_> = stages.iter().map(PipelineStage::describe).collect();
    cache::cache_key("pipeline", &serde_json::Value::Array(descriptor))
}

enum Step {
    Continue(Vec<Record>),
    Finish(AggregateResult),
}

/// Runs pipelines against a [`StreamExecutor`].
#[derive(Clone)]
pub struct PipelineEngine {
    executor: StreamExecutor,
    aggregation: AggregationEngine,
    cache: Option<Arc<dyn Cache>>,
    metrics: Option<Metrics>,
}

impl PipelineEngine {
    pub fn new(executor: StreamExecutor) -> Self {
        Self {
            aggregation: AggregationEngine::new(executor.clone()),
            executor,
            cache: None,
            metrics: None,
        }
    }

    pub fn with_aggregation_config(mut self, config: AggregationConfig) -> Self {
        self.aggregation = self.aggregation.with_config(config);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run `stages` in order.
    ///
    /// With a `cache_ttl` and a cache configured, the whole result is cached
    /// under [`pipeline_cache_key`] and a hit runs no stage at all. A failing
    /// stage aborts the pipeline; nothing partial is returned or cached, and
    /// neither is a result holding NaN or infinite floats.
    pub async fn run(
        &self,
        stages: &[PipelineStage],
        cache_ttl: Option<Duration>,
    ) -> FabricResult<PipelineOutput> {
        let cache_slot = match (cache_ttl, self.cache.as_ref()) {
            (Some(ttl), Some(cache)) => Some((pipeline_cache_key(stages), ttl, cache)),
            _ => None,
        };

        if let Some((key, _, cache)) = &cache_slot {
            let cached: Option<PipelineOutput> = cache::get_json(cache.as_ref(), key).await?;
            if let Some(m) = &self.metrics {
                m.record_cache("pipeline", cached.is_some());
            }
            if let Some(output) = cached {
                debug!(key = %key, "Pipeline cache hit");
                return Ok(output);
            }
        }

        let output = self.execute(stages).await?;

        if let Some((key, ttl, cache)) = &cache_slot {
            if output.is_finite() {
                cache::put_json(cache.as_ref(), key, &output, *ttl).await?;
            } else {
                debug!(key = %key, "Pipeline result holds NaN or infinite floats, not cached");
            }
        }
        Ok(output)
    }

    async fn execute(&self, stages: &[PipelineStage]) -> FabricResult<PipelineOutput> {
        let mut working: Vec<Record> = Vec::new();
        let mut origin: Option<StreamConfig> = None;

        for (position, stage) in stages.iter().enumerate() {
            let started = Instant::now();
            let step = match self.run_stage(stage, working, &mut origin).await {
                Ok(step) => step,
                Err(e) => {
                    warn!(stage = %stage.id, operation = %stage.operation, error = %e, "Pipeline stage failed");
                    return Err(e);
                }
            };

            let elapsed_ms = started.elapsed().as_millis() as u64;
            match step {
                Step::Continue(records) => {
                    debug!(stage = %stage.id, operation = %stage.operation, records = records.len(), elapsed_ms, "Stage complete");
                    working = records;
                }
                Step::Finish(result) => {
                    debug!(stage = %stage.id, operation = %stage.operation, fields = result.len(), elapsed_ms, "Stage complete");
                    let skipped = stages.len() - position - 1;
                    if skipped > 0 {
                        debug!(stage = %stage.id, skipped, "Aggregate output ends the pipeline");
                    }
                    return Ok(PipelineOutput::Aggregate(result));
                }
            }
        }

        Ok(PipelineOutput::Records(working))
    }

    async fn run_stage(
        &self,
        stage: &PipelineStage,
        working: Vec<Record>,
        origin: &mut Option<StreamConfig>,
    ) -> FabricResult<Step> {
        let params = &stage.params;
        match stage.operation {
            OperationKind::Filter => match stage.stream_id {
                Some(_) => self.stage_input(stage, working, origin).await.map(Step::Continue),
                None => Ok(Step::Continue(
                    working
                        .into_iter()
                        .filter(|r| matches_filters(r, &params.filters))
                        .collect(),
                )),
            },
            OperationKind::Transform => {
                let transformer = params.transformer.as_ref().ok_or_else(|| stage.missing("transformer"))?;
                let input = self.stage_input(stage, working, origin).await?;
                Ok(Step::Continue(
                    input.iter().map(|r| transformer(r, &input)).collect(),
                ))
            }
            OperationKind::Join => {
                let spec = params
                    .join_conditions
                    .as_ref()
                    .ok_or_else(|| stage.missing("join_conditions"))?;
                spec.validate()?;
                let secondary_id = params
                    .secondary_stream
                    .as_ref()
                    .ok_or_else(|| stage.missing("secondary_stream"))?;

                let primary = self.stage_input(stage, working, origin).await?;
                let secondary = self
                    .executor
                    .fetch(&StreamConfig::new(secondary_id.clone()).with_filters(params.secondary_filters.clone()))
                    .await?;
                Ok(Step::Continue(join_records(&primary, &secondary, spec)))
            }
            OperationKind::Aggregate => {
                if params.chain {
                    return self.aggregation.evaluate(&working, &params.rules).map(Step::Finish);
                }
                let config = match (stage.fresh_config(), origin.as_ref()) {
                    (Some(config), _) => config,
                    (None, Some(origin)) => origin.clone().with_filters(params.filters.clone()),
                    (None, None) => return Err(stage.missing("stream_id")),
                };
                self.aggregation
                    .aggregate(&[config], &params.rules)
                    .await
                    .map(Step::Finish)
            }
            OperationKind::Custom => {
                let operation = params
                    .custom_operation
                    .as_ref()
                    .ok_or_else(|| stage.missing("custom_operation"))?;
                let input = self.stage_input(stage, working, origin).await?;
                match operation.run(&self.executor, PipelineOutput::Records(input), params).await? {
                    PipelineOutput::Records(records) => Ok(Step::Continue(records)),
                    PipelineOutput::Aggregate(result) => Ok(Step::Finish(result)),
                }
            }
        }
    }

    /// The stage's own stream when it declares one, else the working records.
    async fn stage_input(
        &self,
        stage: &PipelineStage,
        working: Vec<Record>,
        origin: &mut Option<StreamConfig>,
    ) -> FabricResult<Vec<Record>> {
        match stage.fresh_config() {
            Some(config) => {
                let records = self.executor.fetch(&config).await?;
                if origin.is_none() {
                    *origin = Some(config);
                }
                Ok(records)
            }
            None => Ok(working),
        }
    }
}
