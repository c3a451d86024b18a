//! Relational joins between two registered streams
//!
//! Both sides are materialized concurrently, the non-driving side is indexed
//! by its join key, and the driving side is probed record by record. All four
//! join types share one merge policy:
//!
//! - matched rows start from the primary record; secondary fields are added
//!   unless the primary already has a field of that name (primary wins). The
//!   secondary join key is not copied, since on a matched row it carries the
//!   same value as the primary key.
//! - primary rows without a match (left/full) get every secondary field set
//!   to null.
//! - secondary rows without a match (right/full) keep their own values, and
//!   every primary field they lack is set to null.
//!
//! `null` and missing keys never match anything, each other included.

use crate::cache::{self, Cache};
use crate::error::{FabricError, FabricResult};
use crate::executor::{StreamConfig, StreamExecutor};
use crate::metrics::Metrics;
use crate::source::Filters;
use fabric_core::{Record, Value, ValueKey};
use indexmap::IndexSet;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Relational join semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinType::Inner => "inner",
            JoinType::Left => "left",
            JoinType::Right => "right",
            JoinType::Full => "full",
        }
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JoinType {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inner" => Ok(JoinType::Inner),
            "left" | "left_outer" => Ok(JoinType::Left),
            "right" | "right_outer" => Ok(JoinType::Right),
            "full" | "full_outer" | "outer" => Ok(JoinType::Full),
            other => Err(FabricError::InvalidJoinSpec(format!(
                "unknown join type '{}'",
                other
            ))),
        }
    }
}

/// Join type plus the key field on each side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JoinSpec {
    #[serde(rename = "type")]
    pub join_type: JoinType,
    pub primary_key: String,
    pub secondary_key: String,
}

impl JoinSpec {
    pub fn new(
        join_type: JoinType,
        primary_key: impl Into<String>,
        secondary_key: impl Into<String>,
    ) -> Self {
        Self {
            join_type,
            primary_key: primary_key.into(),
            secondary_key: secondary_key.into(),
        }
    }

    pub fn inner(primary_key: impl Into<String>, secondary_key: impl Into<String>) -> Self {
        Self::new(JoinType::Inner, primary_key, secondary_key)
    }

    pub fn left(primary_key: impl Into<String>, secondary_key: impl Into<String>) -> Self {
        Self::new(JoinType::Left, primary_key, secondary_key)
    }

    pub fn right(primary_key: impl Into<String>, secondary_key: impl Into<String>) -> Self {
        Self::new(JoinType::Right, primary_key, secondary_key)
    }

    pub fn full(primary_key: impl Into<String>, secondary_key: impl Into<String>) -> Self {
        Self::new(JoinType::Full, primary_key, secondary_key)
    }

    /// Parse the join type from text, e.g. from a config file.
    pub fn parse(
        join_type: &str,
        primary_key: impl Into<String>,
        secondary_key: impl Into<String>,
    ) -> FabricResult<Self> {
        let spec = Self::new(join_type.parse()?, primary_key, secondary_key);
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> FabricResult<()> {
        if self.primary_key.trim().is_empty() {
            return Err(FabricError::InvalidJoinSpec(
                "primary_key must not be empty".to_string(),
            ));
        }
        if self.secondary_key.trim().is_empty() {
            return Err(FabricError::InvalidJoinSpec(
                "secondary_key must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The same join seen from the other side: keys swapped, left and right
    /// exchanged.
    pub fn mirrored(&self) -> Self {
        let join_type = match self.join_type {
            JoinType::Left => JoinType::Right,
            JoinType::Right => JoinType::Left,
            other => other,
        };
        Self::new(join_type, self.secondary_key.clone(), self.primary_key.clone())
    }
}

/// Reshapes each joined record before it is returned or cached.
pub type RecordTransform = Arc<dyn Fn(Record) -> Record + Send + Sync>;

/// Everything one join call needs.
#[derive(Clone)]
pub struct JoinRequest {
    pub primary: StreamConfig,
    pub secondary: StreamConfig,
    pub spec: JoinSpec,
    pub transform: Option<RecordTransform>,
    pub cache_ttl: Option<Duration>,
}

impl JoinRequest {
    pub fn new(primary_id: impl Into<String>, secondary_id: impl Into<String>, spec: JoinSpec) -> Self {
        Self {
            primary: StreamConfig::new(primary_id),
            secondary: StreamConfig::new(secondary_id),
            spec,
            transform: None,
            cache_ttl: None,
        }
    }

    pub fn primary_filters(mut self, filters: Filters) -> Self {
        self.primary = self.primary.with_filters(filters);
        self
    }

    pub fn secondary_filters(mut self, filters: Filters) -> Self {
        self.secondary = self.secondary.with_filters(filters);
        self
    }

    pub fn transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(Record) -> Record + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Cache key over both stream configs and the spec. The transform is not
    /// part of the key: callers caching transformed joins must not reuse the
    /// same inputs with a different transform inside one TTL.
    pub fn cache_key(&self) -> String {
        let descriptor = serde_json::json!({
            "primary": self.primary,
            "secondary": self.secondary,
            "spec": self.spec,
        });
        cache::cache_key("join", &descriptor)
    }
}

impl fmt::Debug for JoinRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinRequest")
            .field("primary", &self.primary)
            .field("secondary", &self.secondary)
            .field("spec", &self.spec)
            .field("transform", &self.transform.is_some())
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

/// Joins registered streams through a [`StreamExecutor`].
#[derive(Clone)]
pub struct JoinEngine {
    executor: StreamExecutor,
    cache: Option<Arc<dyn Cache>>,
    metrics: Option<Metrics>,
}

impl JoinEngine {
    pub fn new(executor: StreamExecutor) -> Self {
        Self {
            executor,
            cache: None,
            metrics: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run a join.
    ///
    /// With a `cache_ttl` and a cache configured, a hit within the TTL returns
    /// the stored result without touching either source. Results holding NaN
    /// or infinite floats are never stored.
    pub async fn join(&self, request: &JoinRequest) -> FabricResult<Vec<Record>> {
        request.spec.validate()?;

        let cache_slot = match (request.cache_ttl, self.cache.as_ref()) {
            (Some(ttl), Some(cache)) => Some((request.cache_key(), ttl, cache)),
            _ => None,
        };

        if let Some((key, _, cache)) = &cache_slot {
            let cached: Option<Vec<Record>> = cache::get_json(cache.as_ref(), key).await?;
            if let Some(m) = &self.metrics {
                m.record_cache("join", cached.is_some());
            }
            if let Some(records) = cached {
                debug!(key = %key, records = records.len(), "Join cache hit");
                return Ok(records);
            }
        }

        let mut sides = self
            .executor
            .execute_concurrently(&[request.primary.clone(), request.secondary.clone()], None)
            .await?;
        let secondary = sides.pop().unwrap_or_default();
        let primary = sides.pop().unwrap_or_default();

        let mut joined = join_records(&primary, &secondary, &request.spec);
        if let Some(transform) = &request.transform {
            joined = joined.into_iter().map(|r| transform(r)).collect();
        }

        debug!(
            primary = %request.primary.stream_id,
            secondary = %request.secondary.stream_id,
            join_type = %request.spec.join_type,
            primary_records = primary.len(),
            secondary_records = secondary.len(),
            joined = joined.len(),
            "Join complete"
        );

        if let Some((key, ttl, cache)) = &cache_slot {
            if joined.iter().all(Record::is_finite) {
                cache::put_json(cache.as_ref(), key, &joined, *ttl).await?;
            } else {
                debug!(key = %key, "Join result holds NaN or infinite floats, not cached");
            }
        }
        Ok(joined)
    }
}

/// Join two materialized record sets.
///
/// Inner, left and full joins are driven by `primary` in its order; full
/// joins then append the unmatched secondary records in their order. Right
/// joins are driven by `secondary`.
pub fn join_records(primary: &[Record], secondary: &[Record], spec: &JoinSpec) -> Vec<Record> {
    let primary_key = spec.primary_key.as_str();
    let secondary_key = spec.secondary_key.as_str();
    let mut out = Vec::with_capacity(primary.len().max(secondary.len()));

    match spec.join_type {
        JoinType::Inner | JoinType::Left | JoinType::Full => {
            let index = build_index(secondary, secondary_key);
            let secondary_fields = field_union(secondary, Some(secondary_key));
            let mut matched = vec![false; secondary.len()];

            for p in primary {
                match lookup(&index, p, primary_key) {
                    Some(positions) => {
                        for &i in positions {
                            matched[i] = true;
                            out.push(merge_matched(p, &secondary[i], secondary_key));
                        }
                    }
                    None if spec.join_type != JoinType::Inner => {
                        out.push(pad_primary(p, &secondary_fields));
                    }
                    None => trace!("Dropping unmatched primary record"),
                }
            }

            if spec.join_type == JoinType::Full {
                let primary_fields = field_union(primary, None);
                out.extend(
                    secondary
                        .iter()
                        .zip(&matched)
                        .filter(|&(_, &was_matched)| !was_matched)
                        .map(|(s, _)| pad_secondary(s, &primary_fields)),
                );
            }
        }
        JoinType::Right => {
            let index = build_index(primary, primary_key);
            let primary_fields = field_union(primary, None);

            for s in secondary {
                match lookup(&index, s, secondary_key) {
                    Some(positions) => {
                        for &i in positions {
                            out.push(merge_matched(&primary[i], s, secondary_key));
                        }
                    }
                    None => out.push(pad_secondary(s, &primary_fields)),
                }
            }
        }
    }

    out
}

type KeyIndex = FxHashMap<ValueKey, Vec<usize>>;

fn build_index(records: &[Record], key: &str) -> KeyIndex {
    let mut index = KeyIndex::default();
    for (i, record) in records.iter().enumerate() {
        if let Some(k) = record.get(key).and_then(Value::key) {
            index.entry(k).or_default().push(i);
        }
    }
    index
}

fn lookup<'a>(index: &'a KeyIndex, record: &Record, key: &str) -> Option<&'a Vec<usize>> {
    record
        .get(key)
        .and_then(Value::key)
        .and_then(|k| index.get(&k))
}

/// Field names in first-appearance order, optionally excluding one.
fn field_union(records: &[Record], exclude: Option<&str>) -> IndexSet<String> {
    let mut fields = IndexSet::new();
    for record in records {
        for key in record.keys() {
            if Some(key) != exclude && !fields.contains(key) {
                fields.insert(key.to_string());
            }
        }
    }
    fields
}

fn merge_matched(primary: &Record, secondary: &Record, secondary_key: &str) -> Record {
    let mut merged = primary.clone();
    for (field, value) in secondary.iter() {
        if field != secondary_key {
            merged = merged.with_field_if_absent(field, value.clone());
        }
    }
    merged
}

fn pad_primary(primary: &Record, secondary_fields: &IndexSet<String>) -> Record {
    let mut padded = primary.clone();
    for field in secondary_fields {
        padded = padded.with_field_if_absent(field.as_str(), Value::Null);
    }
    padded
}

fn pad_secondary(secondary: &Record, primary_fields: &IndexSet<String>) -> Record {
    let mut padded = Record::with_capacity(primary_fields.len() + secondary.len());
    for field in primary_fields {
        let value = secondary.get(field).cloned().unwrap_or(Value::Null);
        padded = padded.with_field(field.as_str(), value);
    }
    for (field, value) in secondary.iter() {
        padded = padded.with_field_if_absent(field, value.clone());
    }
    padded
}
