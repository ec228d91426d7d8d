//! The codec registry. `cbor` is canonical — the one codec whose
//! output is hashed — and every store that needs content addressing goes
//! through [`cbor::encode_canonical`] directly rather than the registry.
//! The registry exists for the read-path / HTTP-adjacent concern of
//! picking a codec by media type, file extension, or filename.

pub mod cbor;
pub mod json;
pub mod jsonlines;
pub mod msgpack;
pub mod xml;
pub mod yaml;

use crate::error::{CoreError, Result};
use crate::value::StructuredValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Cbor,
    Json,
    MessagePack,
    Yaml,
    Xml,
    JsonLines,
}

impl Codec {
    pub const ALL: [Codec; 6] = [
        Codec::Cbor,
        Codec::Json,
        Codec::MessagePack,
        Codec::Yaml,
        Codec::Xml,
        Codec::JsonLines,
    ];

    pub fn media_types(&self) -> &'static [&'static str] {
        match self {
            Codec::Cbor => &["application/cbor"],
            Codec::Json => &["application/json"],
            Codec::MessagePack => &["application/msgpack", "application/x-msgpack"],
            Codec::Yaml => &["application/yaml", "text/yaml"],
            Codec::Xml => &["application/xml", "text/xml"],
            Codec::JsonLines => &["application/jsonlines", "application/x-ndjson"],
        }
    }

    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            Codec::Cbor => &["cbor"],
            Codec::Json => &["json"],
            Codec::MessagePack => &["msgpack", "mp"],
            Codec::Yaml => &["yaml", "yml"],
            Codec::Xml => &["xml"],
            Codec::JsonLines => &["jsonl", "ndjson"],
        }
    }

    pub fn encode(&self, value: &StructuredValue) -> Result<Vec<u8>> {
        match self {
            Codec::Cbor => cbor::encode_canonical(value),
            Codec::Json => json::encode(value),
            Codec::MessagePack => msgpack::encode(value),
            Codec::Yaml => yaml::encode(value),
            Codec::Xml => xml::encode(value),
            Codec::JsonLines => jsonlines::encode(value),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<StructuredValue> {
        match self {
            Codec::Cbor => cbor::decode(bytes),
            Codec::Json => json::decode(bytes),
            Codec::MessagePack => msgpack::decode(bytes),
            Codec::Yaml => yaml::decode(bytes),
            Codec::Xml => xml::decode(bytes),
            Codec::JsonLines => jsonlines::decode(bytes),
        }
    }
}

/// `for(query)`: resolve a codec by media type, file extension, or filename.
pub fn for_query(query: &str) -> Result<Codec> {
    let q = query
        .split_once(';')
        .map(|(media_type, _params)| media_type)
        .unwrap_or(query)
        .trim()
        .to_lowercase();
    let candidate = q
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_string())
        .unwrap_or(q);
    for codec in Codec::ALL {
        if codec.media_types().iter().any(|m| *m == candidate)
            || codec.extensions().iter().any(|e| *e == candidate)
        {
            return Ok(codec);
        }
    }
    Err(CoreError::Codec(format!("no codec registered for {query}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_by_media_type() {
        assert_eq!(for_query("application/json").unwrap(), Codec::Json);
    }

    #[test]
    fn resolves_by_media_type_with_parameters() {
        assert_eq!(
            for_query("application/json; charset=utf-8").unwrap(),
            Codec::Json
        );
    }

    #[test]
    fn resolves_by_extension() {
        assert_eq!(for_query("yml").unwrap(), Codec::Yaml);
    }

    #[test]
    fn resolves_by_filename() {
        assert_eq!(for_query("records.ndjson").unwrap(), Codec::JsonLines);
    }

    #[test]
    fn unknown_query_errors() {
        assert!(for_query("application/does-not-exist").is_err());
    }
}
