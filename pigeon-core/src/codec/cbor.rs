//! The canonical CBOR codec: the one codec whose output is hashed
//! (`objectHash`) and whose bytes are therefore required to be a
//! deterministic function of the value — sorted map keys, shortest-form
//! integers, no indefinite-length items, tag 0 timestamps, and a hard
//! distinction between byte-strings and text.

use crate::error::{CoreError, Result};
use crate::value::StructuredValue;
use serde_cbor::Value as Cbor;
use std::collections::BTreeMap;

const TAG_STANDARD_DATETIME: u64 = 0;

fn to_cbor(value: &StructuredValue) -> Cbor {
    match value {
        StructuredValue::Null => Cbor::Null,
        StructuredValue::Bool(b) => Cbor::Bool(*b),
        StructuredValue::Int(i) => Cbor::Integer(*i as i128),
        StructuredValue::Float(f) => Cbor::Float(*f),
        StructuredValue::String(s) => Cbor::Text(s.clone()),
        StructuredValue::Bytes(b) => Cbor::Bytes(b.clone()),
        StructuredValue::Array(items) => Cbor::Array(items.iter().map(to_cbor).collect()),
        StructuredValue::Mapping(map) => {
            // `BTreeMap<String, _>` already iterates in sorted key order;
            // rebuilding a `BTreeMap<Cbor, Cbor>` from Text keys preserves
            // that order since Cbor's Ord agrees with string order within
            // the Text variant.
            let mut out = BTreeMap::new();
            for (k, v) in map {
                out.insert(Cbor::Text(k.clone()), to_cbor(v));
            }
            Cbor::Map(out)
        }
        StructuredValue::Timestamp(ts) => Cbor::Tag(
            TAG_STANDARD_DATETIME,
            Box::new(Cbor::Text(ts.to_rfc3339())),
        ),
    }
}

fn from_cbor(value: Cbor) -> Result<StructuredValue> {
    Ok(match value {
        Cbor::Null => StructuredValue::Null,
        Cbor::Bool(b) => StructuredValue::Bool(b),
        Cbor::Integer(i) => StructuredValue::Int(i as i64),
        Cbor::Float(f) => StructuredValue::Float(f),
        Cbor::Text(s) => StructuredValue::String(s),
        Cbor::Bytes(b) => StructuredValue::Bytes(b),
        Cbor::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(from_cbor(item)?);
            }
            StructuredValue::Array(out)
        }
        Cbor::Map(map) => {
            let mut out = BTreeMap::new();
            for (k, v) in map {
                let key = match k {
                    Cbor::Text(s) => s,
                    other => {
                        return Err(CoreError::Codec(format!(
                            "non-string map key in canonical CBOR: {other:?}"
                        )))
                    }
                };
                out.insert(key, from_cbor(v)?);
            }
            StructuredValue::Mapping(out)
        }
        Cbor::Tag(TAG_STANDARD_DATETIME, inner) => match *inner {
            Cbor::Text(s) => {
                let ts = chrono::DateTime::parse_from_rfc3339(&s)
                    .map_err(|e| CoreError::Codec(format!("invalid tag-0 timestamp: {e}")))?;
                StructuredValue::Timestamp(ts.with_timezone(&chrono::Utc))
            }
            other => {
                return Err(CoreError::Codec(format!(
                    "tag 0 must wrap a text string, got {other:?}"
                )))
            }
        },
        Cbor::Tag(tag, _) => {
            return Err(CoreError::Codec(format!("unsupported CBOR tag: {tag}")))
        }
        other => return Err(CoreError::Codec(format!("unsupported CBOR value: {other:?}"))),
    })
}

/// Encodes a value with the canonical (hash-stable) rules.
pub fn encode_canonical(value: &StructuredValue) -> Result<Vec<u8>> {
    serde_cbor::to_vec(&to_cbor(value)).map_err(|e| CoreError::Codec(e.to_string()))
}

/// Decodes canonical (or any well-formed) CBOR bytes into a value.
pub fn decode(bytes: &[u8]) -> Result<StructuredValue> {
    let value: Cbor = serde_cbor::from_slice(bytes).map_err(|e| CoreError::Codec(e.to_string()))?;
    from_cbor(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn round_trips_basic_values() {
        let v = StructuredValue::mapping([
            ("a".to_string(), StructuredValue::Int(1)),
            ("b".to_string(), StructuredValue::string("two")),
            (
                "c".to_string(),
                StructuredValue::Bytes(vec![0xde, 0xad, 0xbe, 0xef]),
            ),
        ]);
        let bytes = encode_canonical(&v).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn encoding_is_deterministic_regardless_of_insertion_order() {
        let a = StructuredValue::mapping([
            ("z".to_string(), StructuredValue::Int(1)),
            ("a".to_string(), StructuredValue::Int(2)),
        ]);
        let b = StructuredValue::mapping([
            ("a".to_string(), StructuredValue::Int(2)),
            ("z".to_string(), StructuredValue::Int(1)),
        ]);
        assert_eq!(encode_canonical(&a).unwrap(), encode_canonical(&b).unwrap());
    }

    #[test]
    fn timestamp_round_trips_through_tag_zero() {
        let ts = chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let v = StructuredValue::Timestamp(ts);
        let bytes = encode_canonical(&v).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn bytes_and_text_are_distinct() {
        let text = StructuredValue::string("hello");
        let bytes = StructuredValue::Bytes(b"hello".to_vec());
        assert_ne!(encode_canonical(&text).unwrap(), encode_canonical(&bytes).unwrap());
    }
}
