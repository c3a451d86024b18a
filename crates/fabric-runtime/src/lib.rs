//! Fabric Runtime - concurrent multi-stream processing
//!
//! Registers named record streams and runs them concurrently, joins and
//! aggregates across them, chains stages into cached pipelines, and monitors
//! them from a background task. [`StreamFabric`] wires everything together.

pub mod aggregation;
pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod fabric;
pub mod join;
pub mod logging;
pub mod metrics;
pub mod monitor;
pub mod pipeline;
pub mod registry;
pub mod resources;
pub mod source;

pub use aggregation::{AggregateResult, AggregationEngine, AggregationKind, AggregationRule};
pub use cache::{Cache, CacheError, MemoryCache};
pub use config::{ConfigError, FabricConfig};
pub use error::{FabricError, FabricResult};
pub use executor::{RecordBatches, RecordStream, StreamConfig, StreamExecutor};
pub use fabric::StreamFabric;
pub use join::{join_records, JoinEngine, JoinRequest, JoinSpec, JoinType};
pub use metrics::Metrics;
pub use monitor::{monitor_streams, MonitorHandle, StreamStats, StreamStatus};
pub use pipeline::{
    CustomStage, FnStage, OperationKind, PipelineEngine, PipelineOutput, PipelineStage, StageParams,
};
pub use registry::{StreamRegistration, StreamRegistry};
pub use resources::ResourceManager;
pub use source::{FetchOptions, Filters, MemorySource, SourceError, StreamSource};

pub use fabric_core::{record, Record, Value};
