//! Stream source contract and the in-memory source
//!
//! A [`StreamSource`] is the external collaborator that produces the records of
//! one named entity (a table, a topic, an API collection). The fabric never
//! interprets filters or queries itself when talking to a source: the source
//! owns their semantics. [`MemorySource`] is the reference implementation used
//! for tests and embedding, and the helpers in this module ([`matches_filters`],
//! [`matches_query`], [`sort_records`]) define the semantics it applies.

use async_trait::async_trait;
use fabric_core::{Record, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::trace;

/// Exact-match predicates applied by a source, keyed by field name.
pub type Filters = IndexMap<String, Value>;

/// Ordering and limit options passed to a source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    /// `"field"`, `"field ASC"` or `"field DESC"`
    pub order: Option<String>,
    /// Maximum number of records returned, applied after ordering
    pub limit: Option<usize>,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Errors raised by stream sources.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    /// The fetch itself failed (query error, I/O, decoding).
    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    /// The backing system cannot be reached.
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    /// The source was released by the resource manager.
    #[error("Source closed: {0}")]
    Closed(String),
}

/// Trait for the external collaborators that supply records per stream.
///
/// # Contract
///
/// - `fetch` must be safely callable any number of times (restartable) and
///   return a finite result.
/// - `filters` are exact-match predicates; `query` is an implementation-defined
///   free-text filter; `options` carries ordering and limit.
/// - `close` releases held connections. It must not fail for a source that was
///   already closed.
///
/// # Implementing a Custom Source
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use fabric_core::Record;
/// use fabric_runtime::source::{FetchOptions, Filters, SourceError, StreamSource};
///
/// struct UsersTable {
///     pool: sqlx::PgPool,
/// }
///
/// #[async_trait]
/// impl StreamSource for UsersTable {
///     fn name(&self) -> &str { "users" }
///
///     async fn fetch(
///         &self,
///         filters: &Filters,
///         query: Option<&str>,
///         options: &FetchOptions,
///     ) -> Result<Vec<Record>, SourceError> {
///         // build SQL from filters / query / options
///         todo!()
///     }
///
///     async fn close(&self) -> Result<(), SourceError> {
///         self.pool.close().await;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Returns the name of the entity this source reads.
    fn name(&self) -> &str;

    /// Produce the records matching `filters`, `query` and `options`.
    async fn fetch(
        &self,
        filters: &Filters,
        query: Option<&str>,
        options: &FetchOptions,
    ) -> Result<Vec<Record>, SourceError>;

    /// Lightweight liveness probe used by the stream monitor.
    async fn health(&self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Release held connections and handles.
    async fn close(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// True when every filter matches the record exactly.
///
/// A filter whose value is an array matches when the field equals any element
/// (an `IN` predicate). A `null` filter matches missing and null fields.
pub fn matches_filters(record: &Record, filters: &Filters) -> bool {
    filters.iter().all(|(field, expected)| {
        let actual = record.get(field).unwrap_or(&Value::Null);
        match expected {
            Value::Null => actual.is_null(),
            Value::Array(options) => options.iter().any(|o| values_equal(actual, o)),
            other => values_equal(actual, other),
        }
    })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.key(), b.key()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Case-insensitive substring match over the record's string fields.
pub fn matches_query(record: &Record, query: &str) -> bool {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    record
        .iter()
        .filter_map(|(_, v)| v.as_str())
        .any(|s| s.to_lowercase().contains(&needle))
}

/// Stable sort by an order clause of the form `"field [ASC|DESC]"`.
///
/// Missing fields sort as null, i.e. first in ascending order.
pub fn sort_records(records: &mut [Record], order: &str) {
    let mut parts = order.split_whitespace();
    let Some(field) = parts.next() else {
        return;
    };
    let descending = parts
        .next()
        .map(|dir| dir.eq_ignore_ascii_case("desc"))
        .unwrap_or(false);

    records.sort_by(|a, b| {
        let ord = compare_field(a, b, field);
        if descending {
            ord.reverse()
        } else {
            ord
        }
    });
}

fn compare_field(a: &Record, b: &Record, field: &str) -> Ordering {
    let null = Value::Null;
    let x = a.get(field).unwrap_or(&null);
    let y = b.get(field).unwrap_or(&null);
    x.total_cmp(y)
}

/// In-memory stream source.
///
/// Applies [`matches_filters`], [`matches_query`], [`sort_records`] and the
/// limit, in that order. Counts `fetch` calls so tests can assert how often
/// the fabric went back to the source.
pub struct MemorySource {
    name: String,
    records: RwLock<Vec<Record>>,
    latency: Option<Duration>,
    fetches: AtomicUsize,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            name: name.into(),
            records: RwLock::new(records),
            latency: None,
            fetches: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Delay every fetch by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Replace the backing records.
    pub fn set_records(&self, records: Vec<Record>) {
        *self.records.write().unwrap_or_else(PoisonError::into_inner) = records;
    }

    /// Make subsequent fetches and health probes fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, AtomicOrdering::SeqCst);
    }

    /// Number of times `fetch` has been invoked.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(AtomicOrdering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }

    fn check_open(&self) -> Result<(), SourceError> {
        if self.is_closed() {
            return Err(SourceError::Closed(self.name.clone()));
        }
        if self.failing.load(AtomicOrdering::SeqCst) {
            return Err(SourceError::FetchFailed(format!(
                "{} is configured to fail",
                self.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StreamSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        filters: &Filters,
        query: Option<&str>,
        options: &FetchOptions,
    ) -> Result<Vec<Record>, SourceError> {
        self.fetches.fetch_add(1, AtomicOrdering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.check_open()?;

        let mut selected: Vec<Record> = {
            let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
            records
                .iter()
                .filter(|r| matches_filters(r, filters))
                .filter(|r| query.map(|q| matches_query(r, q)).unwrap_or(true))
                .cloned()
                .collect()
        };

        if let Some(order) = options.order.as_deref() {
            sort_records(&mut selected, order);
        }
        if let Some(limit) = options.limit {
            selected.truncate(limit);
        }

        trace!(source = %self.name, records = selected.len(), "MemorySource fetch");
        Ok(selected)
    }

    async fn health(&self) -> Result<(), SourceError> {
        self.check_open()
    }

    async fn close(&self) -> Result<(), SourceError> {
        self.closed.store(true, AtomicOrdering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_core::record;

    fn users() -> Vec<Record> {
        vec![
            record! { "id" => 1i64, "name" => "Ada", "active" => true },
            record! { "id" => 2i64, "name" => "Bob", "active" => false },
            record! { "id" => 3i64, "name" => "Cy", "active" => true, "team" => Value::Null },
        ]
    }

    fn filters(pairs: Vec<(&str, Value)>) -> Filters {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_matches_filters_exact() {
        let r = record! { "id" => 1i64, "active" => true };
        assert!(matches_filters(&r, &filters(vec![("active", Value::Bool(true))])));
        assert!(!matches_filters(&r, &filters(vec![("active", Value::Bool(false))])));
        assert!(matches_filters(&r, &Filters::new()));
    }

    #[test]
    fn test_matches_filters_in_list() {
        let r = record! { "id" => 2i64 };
        let f = filters(vec![("id", Value::from(vec![1i64, 2i64]))]);
        assert!(matches_filters(&r, &f));
    }

    #[test]
    fn test_matches_filters_null_matches_missing() {
        let r = record! { "id" => 2i64 };
        assert!(matches_filters(&r, &filters(vec![("team", Value::Null)])));
        assert!(!matches_filters(&r, &filters(vec![("id", Value::Null)])));
    }

    #[test]
    fn test_matches_query_case_insensitive() {
        let r = record! { "name" => "Ada Lovelace", "id" => 1i64 };
        assert!(matches_query(&r, "lovelace"));
        assert!(!matches_query(&r, "turing"));
        assert!(matches_query(&r, "  "));
    }

    #[test]
    fn test_sort_records_desc() {
        let mut records = users();
        sort_records(&mut records, "id DESC");
        let ids: Vec<i64> = records.iter().filter_map(|r| r.get_int("id")).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn test_sort_records_missing_first() {
        let mut records = vec![record! { "n" => 2i64 }, record! {}, record! { "n" => 1i64 }];
        sort_records(&mut records, "n");
        assert_eq!(records[0].get("n"), None);
        assert_eq!(records[1].get_int("n"), Some(1));
    }

    #[tokio::test]
    async fn test_memory_source_filters_orders_limits() {
        let source = MemorySource::new("users", users());
        let opts = FetchOptions::new().with_order("id DESC").with_limit(1);
        let out = source
            .fetch(&filters(vec![("active", Value::Bool(true))]), None, &opts)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get_int("id"), Some(3));
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_source_query() {
        let source = MemorySource::new("users", users());
        let out = source
            .fetch(&Filters::new(), Some("bo"), &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get_str("name"), Some("Bob"));
    }

    #[tokio::test]
    async fn test_memory_source_failing_and_closed() {
        let source = MemorySource::new("users", users());
        source.set_failing(true);
        assert!(matches!(
            source
                .fetch(&Filters::new(), None, &FetchOptions::default())
                .await,
            Err(SourceError::FetchFailed(_))
        ));
        assert!(source.health().await.is_err());

        source.set_failing(false);
        source.close().await.unwrap();
        source.close().await.unwrap();
        assert!(source.is_closed());
        assert!(matches!(
            source
                .fetch(&Filters::new(), None, &FetchOptions::default())
                .await,
            Err(SourceError::Closed(_))
        ));
    }
}
