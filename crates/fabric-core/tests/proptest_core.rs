//! Property-based tests for values and records.
//!
//! Covers: consistency between join keys and the total ordering, ordering
//! antisymmetry, and JSON fidelity of records.

use fabric_core::{Record, Value};
use proptest::prelude::*;
use std::cmp::Ordering;

fn arb_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-50i64..50).prop_map(Value::Int),
        (-50i64..50).prop_map(|n| Value::Float(n as f64)),
        any::<f64>()
            .prop_filter("must be finite", |f| f.is_finite())
            .prop_map(Value::Float),
        "[a-c]{0,3}".prop_map(Value::Str),
    ]
}

fn arb_value() -> impl Strategy<Value = Value> {
    arb_scalar().prop_recursive(2, 16, 4, |inner| {
        prop::collection::vec(inner, 0..4).prop_map(Value::Array)
    })
}

fn arb_record() -> impl Strategy<Value = Record> {
    prop::collection::vec(("[a-z][a-z0-9_]{0,8}", arb_value()), 0..6)
        .prop_map(|fields| fields.into_iter().collect())
}

proptest! {
    /// Equal join keys imply equal ordering.
    #[test]
    fn equal_keys_compare_equal(a in arb_value(), b in arb_value()) {
        if let (Some(ka), Some(kb)) = (a.key(), b.key()) {
            if ka == kb {
                prop_assert_eq!(a.total_cmp(&b), Ordering::Equal);
            }
        }
    }

    /// Null never produces a key, so it never joins.
    #[test]
    fn null_inside_array_has_no_key(items in prop::collection::vec(arb_scalar(), 0..4)) {
        let mut with_null = items.clone();
        with_null.push(Value::Null);
        prop_assert!(Value::Array(with_null).key().is_none());
    }

    #[test]
    fn total_cmp_is_antisymmetric(a in arb_value(), b in arb_value()) {
        prop_assert_eq!(a.total_cmp(&b), b.total_cmp(&a).reverse());
    }

    /// Records survive JSON with field order and int/float kinds intact.
    #[test]
    fn record_json_keeps_order_and_kinds(record in arb_record()) {
        let json = serde_json::to_string(&record).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back.keys().collect::<Vec<_>>(), record.keys().collect::<Vec<_>>());
        for (key, value) in record.iter() {
            let restored = back.get(key).unwrap();
            prop_assert_eq!(std::mem::discriminant(restored), std::mem::discriminant(value));
        }
    }
}
