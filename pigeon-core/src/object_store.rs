//! Wraps [`BlobStore`] with the canonical CBOR codec so callers read and
//! write [`StructuredValue`]s directly, addressed by [`hash::object_hash`].

use crate::blob_store::BlobStore;
use crate::codec::cbor;
use crate::error::Result;
use crate::hash::Hash;
use crate::value::StructuredValue;
use std::collections::HashSet;
use std::path::PathBuf;

pub struct ObjectStore {
    blobs: BlobStore,
    paranoid: bool,
}

impl ObjectStore {
    pub fn open(root: impl Into<PathBuf>, paranoid: bool) -> Result<Self> {
        Ok(ObjectStore {
            blobs: BlobStore::open_with_extension(root, "cbor")?,
            paranoid,
        })
    }

    pub fn write(&self, value: &StructuredValue) -> Result<Hash> {
        let bytes = cbor::encode_canonical(value)?;
        self.blobs.write(&bytes)
    }

    pub fn read(&self, hash: &Hash) -> Result<StructuredValue> {
        let bytes = self.blobs.read(hash)?;
        let value = cbor::decode(&bytes)?;
        if self.paranoid {
            let recomputed = crate::hash::object_hash(&value)?;
            if recomputed != *hash {
                return Err(crate::error::CoreError::validation(format!(
                    "object {hash} failed paranoid hash check, recomputed {recomputed}"
                )));
            }
        }
        Ok(value)
    }

    pub fn exists(&self, hash: &Hash) -> bool {
        self.blobs.exists(hash)
    }

    pub fn delete(&self, hash: &Hash) -> Result<()> {
        self.blobs.delete(hash)
    }

    pub fn retain(&self, keep: &HashSet<Hash>) -> Result<()> {
        self.blobs.retain(keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path(), false).unwrap();
        let value = StructuredValue::mapping([("k".to_string(), StructuredValue::Int(1))]);
        let hash = store.write(&value).unwrap();
        assert_eq!(store.read(&hash).unwrap(), value);
    }

    #[test]
    fn hash_matches_object_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path(), false).unwrap();
        let value = StructuredValue::string("hi");
        let hash = store.write(&value).unwrap();
        assert_eq!(hash, crate::hash::object_hash(&value).unwrap());
    }

    #[test]
    fn paranoid_mode_accepts_valid_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path(), true).unwrap();
        let value = StructuredValue::Int(7);
        let hash = store.write(&value).unwrap();
        assert_eq!(store.read(&hash).unwrap(), value);
    }
}
