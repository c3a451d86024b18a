//! Rule-based aggregation over the union of several streams
//!
//! | Kind | Result |
//! |------|--------|
//! | `count` | non-null values of `operation`; `"id"` or `"*"` counts every record |
//! | `sum` | sum of `operation`, null/missing as 0; `Int` when every value is an int |
//! | `average` | mean of the numeric values of `operation` |
//! | `max` / `min` | extreme value of `operation` under [`Value::total_cmp`], nulls ignored |
//! | `custom` | whatever `custom_operation` returns for the working set |
//!
//! Rules are evaluated independently of each other, in list order, and the
//! result map keeps that order.

use crate::config::AggregationConfig;
use crate::error::{FabricError, FabricResult};
use crate::executor::{StreamConfig, StreamExecutor};
use fabric_core::{Record, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Field name to computed value, in rule order.
pub type AggregateResult = IndexMap<String, Value>;

/// Computes one value from the whole working set.
pub type CustomAggregate = Arc<dyn Fn(&[Record]) -> Value + Send + Sync>;

/// `operation` value that makes `count` count every record.
pub const COUNT_ALL: &str = "*";

/// Record id field. `count` over it counts every record, id or not.
pub const ID_FIELD: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationKind {
    Count,
    Sum,
    Average,
    Max,
    Min,
    Custom,
}

impl AggregationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationKind::Count => "count",
            AggregationKind::Sum => "sum",
            AggregationKind::Average => "average",
            AggregationKind::Max => "max",
            AggregationKind::Min => "min",
            AggregationKind::Custom => "custom",
        }
    }
}

impl fmt::Display for AggregationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationKind {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "count" => Ok(AggregationKind::Count),
            "sum" => Ok(AggregationKind::Sum),
            "average" | "avg" | "mean" => Ok(AggregationKind::Average),
            "max" => Ok(AggregationKind::Max),
            "min" => Ok(AggregationKind::Min),
            "custom" => Ok(AggregationKind::Custom),
            other => Err(FabricError::InvalidAggregationRule(format!(
                "unknown aggregation type '{}'",
                other
            ))),
        }
    }
}

/// One output field of an aggregation.
#[derive(Clone)]
pub struct AggregationRule {
    pub kind: AggregationKind,
    /// Name of the output field.
    pub field: String,
    /// Source field read by every kind except `custom`.
    pub operation: Option<String>,
    pub custom_operation: Option<CustomAggregate>,
    /// Returned instead of computing anything when the working set is empty.
    /// Ignored by `custom`, which always runs.
    pub default: Option<Value>,
}

impl AggregationRule {
    pub fn new(kind: AggregationKind, field: impl Into<String>) -> Self {
        Self {
            kind,
            field: field.into(),
            operation: None,
            custom_operation: None,
            default: None,
        }
    }

    pub fn count(field: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::new(AggregationKind::Count, field).with_operation(operation)
    }

    pub fn sum(field: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::new(AggregationKind::Sum, field).with_operation(operation)
    }

    pub fn average(field: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::new(AggregationKind::Average, field).with_operation(operation)
    }

    pub fn max(field: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::new(AggregationKind::Max, field).with_operation(operation)
    }

    pub fn min(field: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::new(AggregationKind::Min, field).with_operation(operation)
    }

    pub fn custom<F>(field: impl Into<String>, operation: F) -> Self
    where
        F: Fn(&[Record]) -> Value + Send + Sync + 'static,
    {
        let mut rule = Self::new(AggregationKind::Custom, field);
        rule.custom_operation = Some(Arc::new(operation));
        rule
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn validate(&self) -> FabricResult<()> {
        if self.field.trim().is_empty() {
            return Err(FabricError::InvalidAggregationRule(format!(
                "{} rule has an empty output field",
                self.kind
            )));
        }
        match self.kind {
            AggregationKind::Custom if self.custom_operation.is_none() => {
                Err(FabricError::InvalidAggregationRule(format!(
                    "custom rule '{}' requires custom_operation",
                    self.field
                )))
            }
            AggregationKind::Custom => Ok(()),
            kind => match self.operation.as_deref() {
                Some(op) if !op.trim().is_empty() => Ok(()),
                _ => Err(FabricError::InvalidAggregationRule(format!(
                    "{} rule '{}' requires operation",
                    kind, self.field
                ))),
            },
        }
    }

    /// Serializable description used in cache keys. Custom operations are
    /// identified by their output field only.
    pub fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.kind,
            "field": self.field,
            "operation": self.operation,
            "default": self.default,
        })
    }

    /// Compute this rule over `records`. The rule must already be valid.
    pub fn apply(&self, records: &[Record], strict_empty_average: bool) -> FabricResult<Value> {
        if self.kind == AggregationKind::Custom {
            return match &self.custom_operation {
                Some(op) => Ok(op(records)),
                None => Err(FabricError::InvalidAggregationRule(format!(
                    "custom rule '{}' requires custom_operation",
                    self.field
                ))),
            };
        }

        if records.is_empty() {
            if let Some(default) = &self.default {
                return Ok(default.clone());
            }
        }

        let operation = self.operation.as_deref().unwrap_or_default();
        let value = match self.kind {
            AggregationKind::Count => count(records, operation),
            AggregationKind::Sum => sum(records, operation),
            AggregationKind::Average => match average(records, operation) {
                Some(avg) => Value::Float(avg),
                None if records.is_empty() && strict_empty_average => {
                    return Err(FabricError::EmptyAggregation {
                        field: self.field.clone(),
                    })
                }
                None => self.default.clone().unwrap_or(Value::Float(0.0)),
            },
            AggregationKind::Max => extreme(records, operation, std::cmp::Ordering::Greater),
            AggregationKind::Min => extreme(records, operation, std::cmp::Ordering::Less),
            AggregationKind::Custom => Value::Null,
        };
        Ok(value)
    }
}

impl fmt::Debug for AggregationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationRule")
            .field("kind", &self.kind)
            .field("field", &self.field)
            .field("operation", &self.operation)
            .field("custom_operation", &self.custom_operation.is_some())
            .field("default", &self.default)
            .finish()
    }
}

fn present<'a>(records: &'a [Record], field: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
    records
        .iter()
        .filter_map(move |r| r.get(field))
        .filter(|v| !v.is_null())
}

fn count(records: &[Record], field: &str) -> Value {
    if field == COUNT_ALL || field == ID_FIELD {
        return Value::Int(records.len() as i64);
    }
    Value::Int(present(records, field).count() as i64)
}

fn sum(records: &[Record], field: &str) -> Value {
    let mut int_sum: Option<i64> = Some(0);
    let mut float_sum = 0.0;
    for value in present(records, field) {
        match value {
            Value::Int(n) => {
                int_sum = int_sum.and_then(|s| s.checked_add(*n));
                float_sum += *n as f64;
            }
            Value::Float(f) => {
                int_sum = None;
                float_sum += f;
            }
            _ => {}
        }
    }
    match int_sum {
        Some(n) => Value::Int(n),
        None => Value::Float(float_sum),
    }
}

fn average(records: &[Record], field: &str) -> Option<f64> {
    let (total, n) = present(records, field)
        .filter_map(Value::as_float)
        .filter(|f| !f.is_nan())
        .fold((0.0, 0usize), |(total, n), f| (total + f, n + 1));
    (n > 0).then(|| total / n as f64)
}

fn extreme(records: &[Record], field: &str, keep: std::cmp::Ordering) -> Value {
    present(records, field)
        .fold(None::<&Value>, |best, v| match best {
            Some(b) if v.total_cmp(b) != keep => Some(b),
            _ => Some(v),
        })
        .cloned()
        .unwrap_or(Value::Null)
}

/// Validate every rule, then evaluate them over `records`.
pub fn evaluate_rules(
    records: &[Record],
    rules: &[AggregationRule],
    strict_empty_average: bool,
) -> FabricResult<AggregateResult> {
    for rule in rules {
        rule.validate()?;
    }
    let mut result = AggregateResult::with_capacity(rules.len());
    for rule in rules {
        let value = rule.apply(records, strict_empty_average)?;
        result.insert(rule.field.clone(), value);
    }
    Ok(result)
}

/// Aggregates registered streams through a [`StreamExecutor`].
#[derive(Clone)]
pub struct AggregationEngine {
    executor: StreamExecutor,
    config: AggregationConfig,
}

impl AggregationEngine {
    pub fn new(executor: StreamExecutor) -> Self {
        Self {
            executor,
            config: AggregationConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AggregationConfig) -> Self {
        self.config = config;
        self
    }

    /// Fetch every config concurrently and aggregate over all their records.
    ///
    /// Rules are validated before anything is fetched.
    pub async fn aggregate(
        &self,
        configs: &[StreamConfig],
        rules: &[AggregationRule],
    ) -> FabricResult<AggregateResult> {
        for rule in rules {
            rule.validate()?;
        }
        let records: Vec<Record> = self
            .executor
            .execute_concurrently(configs, None)
            .await?
            .into_iter()
            .flatten()
            .collect();
        let result = self.evaluate(&records, rules)?;
        debug!(
            streams = configs.len(),
            records = records.len(),
            rules = rules.len(),
            "Aggregation complete"
        );
        Ok(result)
    }

    /// Aggregate records that are already materialized.
    pub fn evaluate(&self, records: &[Record], rules: &[AggregationRule]) -> FabricResult<AggregateResult> {
        evaluate_rules(records, rules, self.config.strict_empty_average)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_core::record;

    fn readings() -> Vec<Record> {
        vec![
            record! { "id" => 1i64, "value" => 10i64 },
            record! { "id" => 2i64, "value" => 2.5 },
            record! { "id" => 3i64, "value" => Value::Null },
            record! { "id" => 4i64 },
        ]
    }

    // ==========================================================================
    // Built-in kinds
    // ==========================================================================

    #[test]
    fn test_count_ignores_nulls() {
        let out = evaluate_rules(&readings(), &[AggregationRule::count("n", "value")], false).unwrap();
        assert_eq!(out["n"], Value::Int(2));
    }

    #[test]
    fn test_count_all() {
        let out = evaluate_rules(&readings(), &[AggregationRule::count("n", COUNT_ALL)], false).unwrap();
        assert_eq!(out["n"], Value::Int(4));
    }

    #[test]
    fn test_count_over_id_counts_every_record() {
        let records = vec![
            record! { "id" => 1i64 },
            record! { "title" => "no id" },
            record! { "id" => Value::Null },
        ];
        let rules = [AggregationRule::count("total", ID_FIELD)];
        let out = evaluate_rules(&records, &rules, false).unwrap();
        assert_eq!(out["total"], Value::Int(3));
    }

    #[test]
    fn test_sum_int_and_mixed() {
        let ints = vec![record! { "v" => 1i64 }, record! { "v" => 2i64 }, record! { "x" => 9i64 }];
        let out = evaluate_rules(&ints, &[AggregationRule::sum("s", "v")], false).unwrap();
        assert_eq!(out["s"], Value::Int(3));

        let out = evaluate_rules(&readings(), &[AggregationRule::sum("s", "value")], false).unwrap();
        assert_eq!(out["s"], Value::Float(12.5));
    }

    #[test]
    fn test_sum_overflow_falls_back_to_float() {
        let records = vec![record! { "v" => i64::MAX }, record! { "v" => 1i64 }];
        let out = evaluate_rules(&records, &[AggregationRule::sum("s", "v")], false).unwrap();
        assert!(matches!(out["s"], Value::Float(_)));
    }

    #[test]
    fn test_average() {
        let out = evaluate_rules(&readings(), &[AggregationRule::average("avg", "value")], false).unwrap();
        assert_eq!(out["avg"], Value::Float(6.25));
    }

    #[test]
    fn test_max_and_min() {
        let rules = [AggregationRule::max("hi", "value"), AggregationRule::min("lo", "value")];
        let out = evaluate_rules(&readings(), &rules, false).unwrap();
        assert_eq!(out["hi"], Value::Int(10));
        assert_eq!(out["lo"], Value::Float(2.5));
    }

    #[test]
    fn test_max_of_all_null_is_null() {
        let records = vec![record! { "v" => Value::Null }, record! { "w" => 1i64 }];
        let out = evaluate_rules(&records, &[AggregationRule::max("m", "v")], false).unwrap();
        assert_eq!(out["m"], Value::Null);
    }

    #[test]
    fn test_custom_gets_whole_working_set() {
        let rule = AggregationRule::custom("ids", |records| {
            Value::Array(records.iter().filter_map(|r| r.get("id").cloned()).collect())
        });
        let out = evaluate_rules(&readings(), &[rule], false).unwrap();
        assert_eq!(
            out["ids"],
            Value::from(vec![1i64, 2, 3, 4])
        );
    }

    // ==========================================================================
    // Empty input
    // ==========================================================================

    #[test]
    fn test_empty_input_defaults() {
        let rules = [
            AggregationRule::count("n", "id"),
            AggregationRule::sum("s", "v"),
            AggregationRule::average("a", "v"),
            AggregationRule::max("m", "v"),
        ];
        let out = evaluate_rules(&[], &rules, false).unwrap();
        assert_eq!(out["n"], Value::Int(0));
        assert_eq!(out["s"], Value::Int(0));
        assert_eq!(out["a"], Value::Float(0.0));
        assert_eq!(out["m"], Value::Null);
    }

    #[test]
    fn test_strict_empty_average() {
        let err = evaluate_rules(&[], &[AggregationRule::average("a", "v")], true).unwrap_err();
        assert!(matches!(err, FabricError::EmptyAggregation { ref field } if field == "a"));

        let out = evaluate_rules(
            &[],
            &[AggregationRule::average("a", "v").with_default(Value::Null)],
            true,
        )
        .unwrap();
        assert_eq!(out["a"], Value::Null);
    }

    #[test]
    fn test_rule_default_only_applies_to_empty_input() {
        let rule = AggregationRule::sum("s", "value").with_default(-1i64);
        assert_eq!(rule.apply(&[], false).unwrap(), Value::Int(-1));
        assert_eq!(rule.apply(&readings(), false).unwrap(), Value::Float(12.5));
    }

    // ==========================================================================
    // Validation
    // ==========================================================================

    #[test]
    fn test_missing_operation_is_invalid() {
        let rule = AggregationRule::new(AggregationKind::Sum, "s");
        assert!(matches!(
            rule.validate(),
            Err(FabricError::InvalidAggregationRule(_))
        ));
        let custom = AggregationRule::new(AggregationKind::Custom, "c");
        assert!(custom.validate().is_err());
    }

    #[test]
    fn test_invalid_rule_fails_whole_evaluation() {
        let rules = [
            AggregationRule::count("n", "id"),
            AggregationRule::new(AggregationKind::Max, "m"),
        ];
        assert!(evaluate_rules(&readings(), &rules, false).is_err());
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("avg".parse::<AggregationKind>().unwrap(), AggregationKind::Average);
        assert_eq!("MIN".parse::<AggregationKind>().unwrap(), AggregationKind::Min);
        assert!(matches!(
            "median".parse::<AggregationKind>(),
            Err(FabricError::InvalidAggregationRule(_))
        ));
    }

    #[test]
    fn test_result_keeps_rule_order() {
        let rules = [
            AggregationRule::max("z", "value"),
            AggregationRule::count("a", "id"),
        ];
        let out = evaluate_rules(&readings(), &rules, false).unwrap();
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["z", "a"]);
    }
}
