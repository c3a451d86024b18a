//! Records: the unit of data flowing through streams, joins and pipelines

use crate::value::Value;
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};

/// Type alias for IndexMap with FxBuildHasher for faster hashing of record fields.
pub type FxIndexMap<K, V> = IndexMap<K, V, FxBuildHasher>;

/// An ordered mapping of field name to [`Value`].
///
/// Field order is insertion order. A field that was never set is *missing*
/// ([`get`](Self::get) returns `None`); a field explicitly set to
/// [`Value::Null`] is *null* ([`get`](Self::get) returns `Some(&Value::Null)`).
/// Most engines treat both the same way, but the distinction is preserved
/// end to end so callers can tell them apart.
///
/// Records are never mutated once handed out by a source: builder methods take
/// `self` by value and transforms produce new records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: FxIndexMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self {
            fields: IndexMap::with_hasher(FxBuildHasher),
        }
    }

    /// Creates a record with pre-allocated capacity for fields.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: IndexMap::with_capacity_and_hasher(capacity, FxBuildHasher),
        }
    }

    pub fn from_fields(fields: FxIndexMap<String, Value>) -> Self {
        Self { fields }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Returns a copy of this record without `key`, preserving field order.
    pub fn without_field(mut self, key: &str) -> Self {
        self.fields.shift_remove(key);
        self
    }

    /// `None` when the field is missing, `Some(&Value::Null)` when it is null.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Non-null value of `key`, treating missing and null alike.
    pub fn get_present(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).filter(|v| !v.is_null())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// True when the field is missing or explicitly null.
    pub fn is_null(&self, key: &str) -> bool {
        self.get_present(key).is_none()
    }

    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(|v| v.as_float())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(|v| v.as_int())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(|v| v.as_bool())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when no field holds a NaN or infinite float.
    pub fn is_finite(&self) -> bool {
        self.fields.values().all(Value::is_finite)
    }

    pub fn fields(&self) -> &FxIndexMap<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> FxIndexMap<String, Value> {
        self.fields
    }

    /// Sets `key` only when the record does not already carry it.
    pub fn with_field_if_absent(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.entry(key.into()).or_insert_with(|| value.into());
        self
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (k, v) in iter {
            record.fields.insert(k.into(), v.into());
        }
        record
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = indexmap::map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Value::Map(record.fields.into_iter().collect())
    }
}

/// Builds a [`Record`] from `key => value` pairs.
///
/// ```
/// use fabric_core::{record, Value};
///
/// let r = record! { "id" => 1i64, "name" => "A" };
/// assert_eq!(r.get("id"), Some(&Value::Int(1)));
/// ```
#[macro_export]
macro_rules! record {
    () => { $crate::Record::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {
        $crate::Record::new()$(.with_field($key, $value))+
    };
}
