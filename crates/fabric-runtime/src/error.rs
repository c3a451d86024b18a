//! Error types for the fabric runtime

use crate::cache::CacheError;
use crate::source::SourceError;

/// Errors surfaced by the registry, executor, join, aggregation and pipeline
/// engines.
///
/// Every failure reaches the immediate caller; successful-but-empty results
/// (an empty join, an aggregate over no records) are never reported as errors.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    /// Resolving a stream id that was never registered.
    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    /// Registering a stream id that is already taken.
    #[error("Stream already registered: {0}")]
    DuplicateStream(String),

    /// A stream source failed during a fetch, alone or in a concurrent batch.
    #[error("Stream '{stream_id}' failed: {cause}")]
    StreamExecution {
        stream_id: String,
        #[source]
        cause: SourceError,
    },

    /// Unrecognised join type or missing key names.
    #[error("Invalid join spec: {0}")]
    InvalidJoinSpec(String),

    /// A rule without the `operation` or `custom_operation` its kind requires,
    /// or an unrecognised rule kind.
    #[error("Invalid aggregation rule: {0}")]
    InvalidAggregationRule(String),

    /// `average` over an empty working set in strict mode with no default.
    #[error("Cannot aggregate field '{field}' over an empty record set")]
    EmptyAggregation { field: String },

    /// A pipeline stage named an operation kind that does not exist.
    #[error("Unknown pipeline operation: {0}")]
    UnknownPipelineOperation(String),

    /// A pipeline stage lacks a parameter its operation needs.
    #[error("Stage '{stage}' is missing parameter '{parameter}'")]
    MissingStageParameter { stage: String, parameter: String },

    /// Cache backend failure or (de)serialization of a cached value.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A source error raised through `?` in user code, e.g. a custom stage.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// A worker task panicked or was cancelled.
    #[error("Task failed: {0}")]
    Task(String),
}

impl FabricError {
    pub fn missing_parameter(stage: &str, parameter: &str) -> Self {
        FabricError::MissingStageParameter {
            stage: stage.to_string(),
            parameter: parameter.to_string(),
        }
    }

    /// Stream id associated with this error, when there is one.
    pub fn stream_id(&self) -> Option<&str> {
        match self {
            FabricError::UnknownStream(id)
            | FabricError::DuplicateStream(id)
            | FabricError::StreamExecution { stream_id: id, .. } => Some(id),
            _ => None,
        }
    }
}

pub type FabricResult<T> = Result<T, FabricError>;
