//! Dynamic values carried by records

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Runtime value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
#[derive(Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Value>),
    Map(IndexMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// False when any float inside is NaN or infinite. JSON has no encoding
    /// for those, so such values cannot be cached faithfully.
    pub fn is_finite(&self) -> bool {
        match self {
            Value::Float(f) => f.is_finite(),
            Value::Array(items) => items.iter().all(Value::is_finite),
            Value::Map(m) => m.values().all(Value::is_finite),
            _ => true,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(n) => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Hashable equality key for this value.
    ///
    /// Returns `None` for `Null` and `NaN`: those never compare equal to
    /// anything, themselves included. Integral floats collapse onto `Int` so
    /// that `1` and `1.0` produce the same key.
    pub fn key(&self) -> Option<ValueKey> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(ValueKey::Bool(*b)),
            Value::Int(n) => Some(ValueKey::Int(*n)),
            Value::Float(f) => {
                if f.is_nan() {
                    None
                } else if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 {
                    Some(ValueKey::Int(*f as i64))
                } else {
                    Some(ValueKey::Float(f.to_bits()))
                }
            }
            Value::Str(s) => Some(ValueKey::Str(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(Value::key)
                .collect::<Option<Vec<_>>>()
                .map(ValueKey::Array),
            Value::Map(m) => m
                .iter()
                .map(|(k, v)| v.key().map(|key| (k.clone(), key)))
                .collect::<Option<Vec<_>>>()
                .map(ValueKey::Map),
        }
    }

    /// Total ordering across all values.
    ///
    /// Values of different kinds order as
    /// `null < bool < number < str < array < map`; ints and floats compare
    /// numerically with each other.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                let (x, y) = (a.as_float().unwrap_or(0.0), b.as_float().unwrap_or(0.0));
                // -0.0 == 0.0, matching their shared join key
                x.partial_cmp(&y).unwrap_or_else(|| x.total_cmp(&y))
            }
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.total_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Map(a), Value::Map(b)) => a.len().cmp(&b.len()),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Str(_) => 3,
            Value::Array(_) => 4,
            Value::Map(_) => 5,
        }
    }
}

/// Hashable projection of a non-null [`Value`], used to index join keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKey {
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
    Array(Vec<ValueKey>),
    Map(Vec<(String, ValueKey)>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "\"{}\"", s),
            Value::Array(a) => {
                write!(f, "[")?;
                for (i, v) in a.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(o: Option<T>) -> Self {
        match o {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(m: IndexMap<String, Value>) -> Self {
        Value::Map(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Conversion
    // ==========================================================================

    #[test]
    fn test_is_finite_looks_inside_containers() {
        assert!(Value::Float(1.5).is_finite());
        assert!(!Value::Float(f64::NAN).is_finite());
        assert!(!Value::Array(vec![Value::Int(1), Value::Float(f64::INFINITY)]).is_finite());
        let mut m = IndexMap::new();
        m.insert("x".to_string(), Value::Float(f64::NEG_INFINITY));
        assert!(!Value::Map(m).is_finite());
        assert!(Value::Null.is_finite());
    }

    #[test]
    fn test_as_int_and_float() {
        assert_eq!(Value::Int(42).as_int(), Some(42));
        assert_eq!(Value::Float(3.7).as_int(), Some(3));
        assert_eq!(Value::Int(42).as_float(), Some(42.0));
        assert_eq!(Value::Str("42".into()).as_int(), None);
        assert_eq!(Value::Null.as_float(), None);
    }

    // ==========================================================================
    // Keys
    // ==========================================================================

    #[test]
    fn test_null_has_no_key() {
        assert_eq!(Value::Null.key(), None);
        assert_eq!(Value::Float(f64::NAN).key(), None);
    }

    #[test]
    fn test_integral_float_key_matches_int() {
        assert_eq!(Value::Float(1.0).key(), Value::Int(1).key());
        assert_ne!(Value::Float(1.5).key(), Value::Int(1).key());
    }

    #[test]
    fn test_two_pow_63_does_not_saturate_onto_i64_max() {
        let two_pow_63 = Value::Float(9_223_372_036_854_775_808.0);
        assert_ne!(two_pow_63.key(), Value::Int(i64::MAX).key());
        assert_eq!(Value::Float(-9_223_372_036_854_775_808.0).key(), Value::Int(i64::MIN).key());
    }

    #[test]
    fn test_array_with_null_has_no_key() {
        let v = Value::Array(vec![Value::Int(1), Value::Null]);
        assert_eq!(v.key(), None);
    }

    #[test]
    fn test_str_key_is_case_sensitive() {
        assert_ne!(Value::from("a").key(), Value::from("A").key());
    }

    // ==========================================================================
    // Ordering
    // ==========================================================================

    #[test]
    fn test_total_cmp_numbers_mixed() {
        assert_eq!(Value::Int(2).total_cmp(&Value::Float(1.5)), Ordering::Greater);
        assert_eq!(Value::Float(2.0).total_cmp(&Value::Int(2)), Ordering::Equal);
    }

    #[test]
    fn test_total_cmp_across_kinds() {
        assert_eq!(Value::Null.total_cmp(&Value::Bool(false)), Ordering::Less);
        assert_eq!(Value::Int(100).total_cmp(&Value::from("a")), Ordering::Less);
    }

    #[test]
    fn test_total_cmp_strings() {
        assert_eq!(Value::from("b").total_cmp(&Value::from("a")), Ordering::Greater);
    }

    // ==========================================================================
    // Display / Serde
    // ==========================================================================

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Value::Null), "null");
        assert_eq!(format!("{}", Value::from("hi")), "\"hi\"");
        assert_eq!(
            format!("{}", Value::Array(vec![Value::Int(1), Value::Int(2)])),
            "[1, 2]"
        );
    }

    #[test]
    fn test_json_numbers_keep_int_and_float() {
        let v: Value = serde_json::from_str("[1, 2.5, null, \"x\"]").unwrap();
        assert_eq!(
            v,
            Value::Array(vec![
                Value::Int(1),
                Value::Float(2.5),
                Value::Null,
                Value::from("x")
            ])
        );
    }

    #[test]
    fn test_from_option_none() {
        let v: Value = Option::<i64>::None.into();
        assert_eq!(v, Value::Null);
    }
}
