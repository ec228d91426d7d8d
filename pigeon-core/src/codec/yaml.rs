//! YAML codec. YAML has no native binary scalar, so binary data is encoded
//! the same way the JSON codec's base64 form does: `{"$base64": "..."}`.

use crate::codec::json::BinaryEncoding;
use crate::error::{CoreError, Result};
use crate::value::StructuredValue;
use serde_yaml::Value as Yaml;
use std::collections::BTreeMap;

fn to_yaml(value: &StructuredValue) -> Yaml {
    match value {
        StructuredValue::Null => Yaml::Null,
        StructuredValue::Bool(b) => Yaml::Bool(*b),
        StructuredValue::Int(i) => Yaml::Number((*i).into()),
        StructuredValue::Float(f) => Yaml::Number((*f).into()),
        StructuredValue::String(s) => Yaml::String(s.clone()),
        StructuredValue::Bytes(b) => {
            use base64::Engine;
            let mut map = serde_yaml::Mapping::new();
            map.insert(
                Yaml::String("$base64".into()),
                Yaml::String(base64::engine::general_purpose::STANDARD.encode(b)),
            );
            Yaml::Mapping(map)
        }
        StructuredValue::Array(items) => Yaml::Sequence(items.iter().map(to_yaml).collect()),
        StructuredValue::Mapping(map) => {
            let mut out = serde_yaml::Mapping::new();
            for (k, v) in map {
                out.insert(Yaml::String(k.clone()), to_yaml(v));
            }
            Yaml::Mapping(out)
        }
        StructuredValue::Timestamp(ts) => Yaml::String(ts.to_rfc3339()),
    }
}

fn from_yaml(value: Yaml) -> Result<StructuredValue> {
    Ok(match value {
        Yaml::Null => StructuredValue::Null,
        Yaml::Bool(b) => StructuredValue::Bool(b),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                StructuredValue::Int(i)
            } else {
                StructuredValue::Float(
                    n.as_f64()
                        .ok_or_else(|| CoreError::Codec("unrepresentable YAML number".into()))?,
                )
            }
        }
        Yaml::String(s) => StructuredValue::String(s),
        Yaml::Sequence(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(from_yaml(item)?);
            }
            StructuredValue::Array(out)
        }
        Yaml::Mapping(map) => {
            if map.len() == 1 {
                if let Some(Yaml::String(b64)) = map.get(Yaml::String("$base64".into())) {
                    use base64::Engine;
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(b64)
                        .map_err(|e| CoreError::Codec(format!("invalid base64: {e}")))?;
                    return Ok(StructuredValue::Bytes(bytes));
                }
            }
            let mut out = BTreeMap::new();
            for (k, v) in map {
                let key = k
                    .as_str()
                    .ok_or_else(|| CoreError::Codec("non-string YAML map key".into()))?
                    .to_string();
                out.insert(key, from_yaml(v)?);
            }
            StructuredValue::Mapping(out)
        }
        other => return Err(CoreError::Codec(format!("unsupported YAML value: {other:?}"))),
    })
}

pub fn encode(value: &StructuredValue) -> Result<Vec<u8>> {
    serde_yaml::to_string(&to_yaml(value))
        .map(|s| s.into_bytes())
        .map_err(|e| CoreError::Codec(e.to_string()))
}

/// Binary encoding mode is always base64 for YAML; the parameter exists so
/// the registry can treat every text codec uniformly.
pub fn encode_with(value: &StructuredValue, _binary: BinaryEncoding) -> Result<Vec<u8>> {
    encode(value)
}

pub fn decode(bytes: &[u8]) -> Result<StructuredValue> {
    let value: Yaml = serde_yaml::from_slice(bytes).map_err(|e| CoreError::Codec(e.to_string()))?;
    from_yaml(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_nested_value() {
        let v = StructuredValue::mapping([
            ("n".to_string(), StructuredValue::Int(3)),
            ("bytes".to_string(), StructuredValue::Bytes(vec![1, 2, 3])),
        ]);
        let bytes = encode(&v).unwrap();
        assert_eq!(decode(&bytes).unwrap(), v);
    }
}
