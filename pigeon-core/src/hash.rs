//! SHA-256 content hashes and the canonical hashing of [`StructuredValue`]s.
//!
//! Every content-addressed store in this crate keys on these hashes, and
//! the `hash://sha256/` URI scheme renders them.

use crate::codec::cbor;
use crate::error::{CoreError, Result};
use crate::value::StructuredValue;
use sha2::{Digest, Sha256};
use std::fmt;

pub const HASH_BYTES: usize = 32;

/// A 32-byte SHA-256 hash, stored raw internally and rendered as lowercase
/// hex externally.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; HASH_BYTES]);

impl Hash {
    pub fn from_bytes(bytes: [u8; HASH_BYTES]) -> Self {
        Hash(bytes)
    }

    pub fn of_bytes(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut out = [0u8; HASH_BYTES];
        out.copy_from_slice(&digest);
        Hash(out)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a lowercase- or uppercase-hex-encoded 64 character hash.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != HASH_BYTES * 2 {
            return Err(CoreError::validation(format!(
                "hash must be {} hex chars, got {}",
                HASH_BYTES * 2,
                s.len()
            )));
        }
        let bytes = hex::decode(s)
            .map_err(|_| CoreError::validation(format!("invalid hex in hash: {s}")))?;
        let mut out = [0u8; HASH_BYTES];
        out.copy_from_slice(&bytes);
        Ok(Hash(out))
    }

    /// Shard path component: first byte as 2 hex chars.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Remaining hex after the shard prefix, used as the filename stem.
    pub fn shard_rest(&self) -> String {
        hex::encode(&self.0[1..])
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// `objectHash(value)`: canonical-CBOR-encode the value, then SHA-256 it.
pub fn object_hash(value: &StructuredValue) -> Result<Hash> {
    let bytes = cbor::encode_canonical(value)?;
    Ok(Hash::of_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let h = Hash::of_bytes(b"hello world");
        let hex = h.to_hex();
        assert_eq!(hex.len(), 64);
        let back = Hash::from_hex(&hex).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn shard_prefix_is_two_hex_chars() {
        let h = Hash::of_bytes(b"anything");
        assert_eq!(h.shard_prefix().len(), 2);
        assert_eq!(h.shard_prefix().len() + h.shard_rest().len(), 64);
    }

    #[test]
    fn object_hash_is_stable() {
        let v = StructuredValue::string("hello");
        let a = object_hash(&v).unwrap();
        let b = object_hash(&v).unwrap();
        assert_eq!(a, b);
    }
}
