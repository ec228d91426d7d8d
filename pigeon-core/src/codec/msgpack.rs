//! MessagePack codec, via `rmpv::Value` to preserve the bin/str distinction
//! that a plain serde round-trip through `serde_json::Value` would lose.

use crate::error::{CoreError, Result};
use crate::value::StructuredValue;
use rmpv::Value as Msg;
use std::collections::BTreeMap;

fn to_msgpack(value: &StructuredValue) -> Msg {
    match value {
        StructuredValue::Null => Msg::Nil,
        StructuredValue::Bool(b) => Msg::Boolean(*b),
        StructuredValue::Int(i) => Msg::from(*i),
        StructuredValue::Float(f) => Msg::F64(*f),
        StructuredValue::String(s) => Msg::String(s.clone().into()),
        StructuredValue::Bytes(b) => Msg::Binary(b.clone()),
        StructuredValue::Array(items) => Msg::Array(items.iter().map(to_msgpack).collect()),
        StructuredValue::Mapping(map) => Msg::Map(
            map.iter()
                .map(|(k, v)| (Msg::String(k.clone().into()), to_msgpack(v)))
                .collect(),
        ),
        StructuredValue::Timestamp(ts) => Msg::String(ts.to_rfc3339().into()),
    }
}

fn from_msgpack(value: Msg) -> Result<StructuredValue> {
    Ok(match value {
        Msg::Nil => StructuredValue::Null,
        Msg::Boolean(b) => StructuredValue::Bool(b),
        Msg::Integer(i) => i
            .as_i64()
            .map(StructuredValue::Int)
            .ok_or_else(|| CoreError::Codec("integer out of i64 range".into()))?,
        Msg::F32(f) => StructuredValue::Float(f as f64),
        Msg::F64(f) => StructuredValue::Float(f),
        Msg::String(s) => StructuredValue::String(
            s.into_str()
                .ok_or_else(|| CoreError::Codec("non-utf8 msgpack string".into()))?,
        ),
        Msg::Binary(b) => StructuredValue::Bytes(b),
        Msg::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(from_msgpack(item)?);
            }
            StructuredValue::Array(out)
        }
        Msg::Map(entries) => {
            let mut out = BTreeMap::new();
            for (k, v) in entries {
                let key = k
                    .as_str()
                    .ok_or_else(|| CoreError::Codec("non-string msgpack map key".into()))?
                    .to_string();
                out.insert(key, from_msgpack(v)?);
            }
            StructuredValue::Mapping(out)
        }
        other => return Err(CoreError::Codec(format!("unsupported msgpack value: {other:?}"))),
    })
}

pub fn encode(value: &StructuredValue) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &to_msgpack(value))
        .map_err(|e| CoreError::Codec(e.to_string()))?;
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> Result<StructuredValue> {
    let mut cursor = bytes;
    let value = rmpv::decode::read_value(&mut cursor).map_err(|e| CoreError::Codec(e.to_string()))?;
    from_msgpack(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mixed_value() {
        let v = StructuredValue::mapping([
            ("n".to_string(), StructuredValue::Int(-7)),
            ("bytes".to_string(), StructuredValue::Bytes(vec![9, 8, 7])),
            ("s".to_string(), StructuredValue::string("hi")),
        ]);
        let bytes = encode(&v).unwrap();
        assert_eq!(decode(&bytes).unwrap(), v);
    }
}
