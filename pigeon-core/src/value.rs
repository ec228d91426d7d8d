//! The recursive, tagged value every codec and store exchanges:
//! [`StructuredValue`]. Must round-trip losslessly through the canonical
//! CBOR codec, since `objectHash` is defined over that encoding.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// A HashURL reference: `hash://sha256/<hex>[?type=<mime>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashUrl {
    pub hash_hex: String,
    pub media_type: Option<String>,
}

impl HashUrl {
    pub fn new(hash_hex: impl Into<String>, media_type: Option<String>) -> Self {
        HashUrl {
            hash_hex: hash_hex.into().to_lowercase(),
            media_type,
        }
    }

    pub fn to_uri(&self) -> String {
        match &self.media_type {
            Some(mt) => format!("hash://sha256/{}?type={}", self.hash_hex, mt),
            None => format!("hash://sha256/{}", self.hash_hex),
        }
    }

    /// Parses a `hash://sha256/<hex>[?type=...]` URI, case-insensitive on
    /// hex, normalizing to lowercase.
    pub fn parse(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix("hash://sha256/")?;
        let (hex_part, query) = match rest.split_once('?') {
            Some((h, q)) => (h, Some(q)),
            None => (rest, None),
        };
        if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let media_type = query.and_then(|q| {
            q.split('&').find_map(|kv| {
                let (k, v) = kv.split_once('=')?;
                (k == "type").then(|| v.to_string())
            })
        });
        Some(HashUrl::new(hex_part, media_type))
    }
}

/// The value model every codec round-trips. Ordering in `Mapping` is
/// insertion order (a `BTreeMap<String, _>` here is used purely as a
/// deterministic container — canonical sort order for hashing is applied at
/// the CBOR-encoding boundary, not baked into this type).
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<StructuredValue>),
    Mapping(BTreeMap<String, StructuredValue>),
    Timestamp(DateTime<Utc>),
}

impl StructuredValue {
    pub fn string(s: impl Into<String>) -> Self {
        StructuredValue::String(s.into())
    }

    pub fn mapping(pairs: impl IntoIterator<Item = (String, StructuredValue)>) -> Self {
        StructuredValue::Mapping(pairs.into_iter().collect())
    }

    pub fn as_mapping(&self) -> Option<&BTreeMap<String, StructuredValue>> {
        match self {
            StructuredValue::Mapping(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StructuredValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[StructuredValue]> {
        match self {
            StructuredValue::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Recursively walks the value collecting every string that parses as a
    /// `hash://sha256/...` HashURL.
    pub fn list_hash_urls(&self) -> Vec<HashUrl> {
        let mut out = Vec::new();
        self.walk_hash_urls(&mut out);
        out
    }

    fn walk_hash_urls(&self, out: &mut Vec<HashUrl>) {
        match self {
            StructuredValue::String(s) => {
                if let Some(url) = HashUrl::parse(s) {
                    out.push(url);
                }
            }
            StructuredValue::Array(items) => {
                for item in items {
                    item.walk_hash_urls(out);
                }
            }
            StructuredValue::Mapping(map) => {
                for value in map.values() {
                    value.walk_hash_urls(out);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_url_round_trips() {
        let url = HashUrl::new(
            "a".repeat(64),
            Some("application/octet-stream".to_string()),
        );
        let uri = url.to_uri();
        let parsed = HashUrl::parse(&uri).unwrap();
        assert_eq!(url, parsed);
    }

    #[test]
    fn hash_url_case_insensitive_hex() {
        let uri = format!("hash://sha256/{}", "A".repeat(64));
        let parsed = HashUrl::parse(&uri).unwrap();
        assert_eq!(parsed.hash_hex, "a".repeat(64));
    }

    #[test]
    fn list_hash_urls_walks_nested_structures() {
        let url = format!("hash://sha256/{}", "b".repeat(64));
        let v = StructuredValue::mapping([(
            "links".to_string(),
            StructuredValue::Array(vec![StructuredValue::string(url.clone())]),
        )]);
        let found = v.list_hash_urls();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].to_uri(), url);
    }
}
