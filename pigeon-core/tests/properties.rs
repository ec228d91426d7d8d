//! Property-based checks for the two invariants the rest of the store leans
//! on without re-verifying: that `objectHash` is a pure function of a
//! value's contents (not its construction order), and that canonical CBOR
//! round-trips every `StructuredValue` shape losslessly.

use chrono::{TimeZone, Utc};
use pigeon_core::codec::cbor;
use pigeon_core::hash::object_hash;
use pigeon_core::value::StructuredValue;
use proptest::prelude::*;
use std::collections::BTreeMap;

fn leaf() -> impl Strategy<Value = StructuredValue> {
    prop_oneof![
        Just(StructuredValue::Null),
        any::<bool>().prop_map(StructuredValue::Bool),
        any::<i64>().prop_map(StructuredValue::Int),
        any::<f64>().prop_filter("finite", |f| f.is_finite()).prop_map(StructuredValue::Float),
        ".*".prop_map(StructuredValue::string),
        proptest::collection::vec(any::<u8>(), 0..16).prop_map(StructuredValue::Bytes),
        (0i64..2_000_000_000i64).prop_map(|secs| {
            StructuredValue::Timestamp(Utc.timestamp_opt(secs, 0).unwrap())
        }),
    ]
}

fn structured_value() -> impl Strategy<Value = StructuredValue> {
    leaf().prop_recursive(4, 64, 8, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..6).prop_map(StructuredValue::Array),
            proptest::collection::btree_map("[a-z]{1,8}", inner, 0..6).prop_map(StructuredValue::Mapping),
        ]
    })
}

proptest! {
    #[test]
    fn object_hash_is_stable_across_repeated_calls(v in structured_value()) {
        let a = object_hash(&v).unwrap();
        let b = object_hash(&v).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn object_hash_ignores_construction_order(
        entries in proptest::collection::btree_map("[a-z]{1,6}", any::<i64>(), 1..8)
    ) {
        let pairs: Vec<(String, i64)> = entries.into_iter().collect();
        let forward: BTreeMap<String, StructuredValue> = pairs
            .iter()
            .map(|(k, v)| (k.clone(), StructuredValue::Int(*v)))
            .collect();
        let reversed: BTreeMap<String, StructuredValue> = pairs
            .iter()
            .rev()
            .map(|(k, v)| (k.clone(), StructuredValue::Int(*v)))
            .collect();
        let a = object_hash(&StructuredValue::Mapping(forward)).unwrap();
        let b = object_hash(&StructuredValue::Mapping(reversed)).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn canonical_cbor_round_trips(v in structured_value()) {
        let bytes = cbor::encode_canonical(&v).unwrap();
        let back = cbor::decode(&bytes).unwrap();
        prop_assert_eq!(v, back);
    }
}
