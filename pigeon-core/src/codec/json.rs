//! JSON codec. JSON has no native byte-string type, so binary data is
//! represented either as a Node-Buffer-shaped object
//! (`{"type":"Buffer","data":[...]}`, the default on encode) or as
//! `{"$base64": "..."}`; both are accepted on decode.

use crate::error::{CoreError, Result};
use crate::value::StructuredValue;
use serde_json::{Map, Number, Value as Json};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinaryEncoding {
    #[default]
    Buffer,
    Base64,
}

fn to_json(value: &StructuredValue, binary: BinaryEncoding) -> Json {
    match value {
        StructuredValue::Null => Json::Null,
        StructuredValue::Bool(b) => Json::Bool(*b),
        StructuredValue::Int(i) => Json::Number(Number::from(*i)),
        StructuredValue::Float(f) => {
            Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null)
        }
        StructuredValue::String(s) => Json::String(s.clone()),
        StructuredValue::Bytes(bytes) => match binary {
            BinaryEncoding::Buffer => {
                let mut obj = Map::new();
                obj.insert("type".into(), Json::String("Buffer".into()));
                obj.insert(
                    "data".into(),
                    Json::Array(bytes.iter().map(|b| Json::Number(Number::from(*b))).collect()),
                );
                Json::Object(obj)
            }
            BinaryEncoding::Base64 => {
                use base64::Engine;
                let mut obj = Map::new();
                obj.insert(
                    "$base64".into(),
                    Json::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
                );
                Json::Object(obj)
            }
        },
        StructuredValue::Array(items) => {
            Json::Array(items.iter().map(|v| to_json(v, binary)).collect())
        }
        StructuredValue::Mapping(map) => {
            let mut obj = Map::new();
            for (k, v) in map {
                obj.insert(k.clone(), to_json(v, binary));
            }
            Json::Object(obj)
        }
        StructuredValue::Timestamp(ts) => Json::String(ts.to_rfc3339()),
    }
}

fn from_json(value: Json) -> Result<StructuredValue> {
    Ok(match value {
        Json::Null => StructuredValue::Null,
        Json::Bool(b) => StructuredValue::Bool(b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                StructuredValue::Int(i)
            } else {
                StructuredValue::Float(n.as_f64().ok_or_else(|| {
                    CoreError::Codec(format!("unrepresentable JSON number: {n}"))
                })?)
            }
        }
        Json::String(s) => StructuredValue::String(s),
        Json::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(from_json(item)?);
            }
            StructuredValue::Array(out)
        }
        Json::Object(obj) => {
            if let Some(bytes) = decode_buffer_shape(&obj)? {
                return Ok(StructuredValue::Bytes(bytes));
            }
            if let Some(bytes) = decode_base64_shape(&obj)? {
                return Ok(StructuredValue::Bytes(bytes));
            }
            let mut out = BTreeMap::new();
            for (k, v) in obj {
                out.insert(k, from_json(v)?);
            }
            StructuredValue::Mapping(out)
        }
    })
}

fn decode_buffer_shape(obj: &Map<String, Json>) -> Result<Option<Vec<u8>>> {
    let is_buffer = matches!(obj.get("type"), Some(Json::String(s)) if s == "Buffer");
    if !is_buffer {
        return Ok(None);
    }
    let Some(Json::Array(data)) = obj.get("data") else {
        return Ok(None);
    };
    let mut bytes = Vec::with_capacity(data.len());
    for n in data {
        let byte = n
            .as_u64()
            .filter(|v| *v <= 255)
            .ok_or_else(|| CoreError::Codec("Buffer.data entry out of byte range".into()))?;
        bytes.push(byte as u8);
    }
    Ok(Some(bytes))
}

fn decode_base64_shape(obj: &Map<String, Json>) -> Result<Option<Vec<u8>>> {
    let Some(Json::String(b64)) = obj.get("$base64") else {
        return Ok(None);
    };
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| CoreError::Codec(format!("invalid base64: {e}")))?;
    Ok(Some(bytes))
}

pub fn encode(value: &StructuredValue) -> Result<Vec<u8>> {
    encode_with(value, BinaryEncoding::default())
}

pub fn encode_with(value: &StructuredValue, binary: BinaryEncoding) -> Result<Vec<u8>> {
    serde_json::to_vec(&to_json(value, binary)).map_err(|e| CoreError::Codec(e.to_string()))
}

pub fn decode(bytes: &[u8]) -> Result<StructuredValue> {
    let value: Json = serde_json::from_slice(bytes).map_err(|e| CoreError::Codec(e.to_string()))?;
    from_json(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalars_and_nesting() {
        let v = StructuredValue::mapping([
            ("n".to_string(), StructuredValue::Int(42)),
            ("s".to_string(), StructuredValue::string("hi")),
            (
                "arr".to_string(),
                StructuredValue::Array(vec![StructuredValue::Bool(true), StructuredValue::Null]),
            ),
        ]);
        let bytes = encode(&v).unwrap();
        assert_eq!(decode(&bytes).unwrap(), v);
    }

    #[test]
    fn binary_round_trips_via_buffer_shape() {
        let v = StructuredValue::Bytes(vec![1, 2, 3, 255]);
        let bytes = encode(&v).unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("\"Buffer\""));
        assert_eq!(decode(&bytes).unwrap(), v);
    }

    #[test]
    fn binary_round_trips_via_base64_shape() {
        let v = StructuredValue::Bytes(vec![1, 2, 3, 255]);
        let bytes = encode_with(&v, BinaryEncoding::Base64).unwrap();
        assert_eq!(decode(&bytes).unwrap(), v);
    }
}
