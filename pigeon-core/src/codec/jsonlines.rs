//! JSON-Lines codec: a [`StructuredValue::Array`] where each element is
//! encoded as one JSON line. Used for streaming record dumps.

use crate::codec::json;
use crate::error::{CoreError, Result};
use crate::value::StructuredValue;

pub fn encode(value: &StructuredValue) -> Result<Vec<u8>> {
    let items = value
        .as_array()
        .ok_or_else(|| CoreError::Codec("JSON-Lines codec requires an array value".into()))?;
    let mut out = Vec::new();
    for item in items {
        out.extend(json::encode(item)?);
        out.push(b'\n');
    }
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<StructuredValue> {
    let text = std::str::from_utf8(bytes).map_err(|e| CoreError::Codec(e.to_string()))?;
    let mut items = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        items.push(json::decode(line.as_bytes())?);
    }
    Ok(StructuredValue::Array(items))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_array_of_records() {
        let v = StructuredValue::Array(vec![
            StructuredValue::mapping([("id".to_string(), StructuredValue::Int(1))]),
            StructuredValue::mapping([("id".to_string(), StructuredValue::Int(2))]),
        ]);
        let bytes = encode(&v).unwrap();
        assert_eq!(bytes.iter().filter(|&&b| b == b'\n').count(), 2);
        assert_eq!(decode(&bytes).unwrap(), v);
    }
}
