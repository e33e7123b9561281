//! Blob storage handle.
//!
//! Binary attachments (images and the like) are kept out of the document;
//! blocks only reference them by key, e.g. an image block's `sourceId`.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::error::StoreResult;

/// Key/value store for binary attachments.
pub trait BlobStorage: Send + Sync {
    /// Fetch a blob.
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Store a blob under `key`, replacing any previous content.
    fn set(&self, key: &str, data: &[u8]) -> StoreResult<()>;

    /// Delete a blob. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// All stored keys, sorted.
    fn list(&self) -> StoreResult<Vec<String>>;
}

/// In-memory blob storage.
#[derive(Debug, Default)]
pub struct MemoryBlobStorage {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStorage for MemoryBlobStorage {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let blobs = MemoryBlobStorage::new();
        blobs.set("img", b"png").unwrap();
        assert_eq!(blobs.get("img").unwrap(), Some(b"png".to_vec()));

        blobs.delete("img").unwrap();
        assert!(blobs.get("img").unwrap().is_none());
        blobs.delete("img").unwrap();
    }

    #[test]
    fn test_list_is_sorted() {
        let blobs = MemoryBlobStorage::new();
        blobs.set("b", b"2").unwrap();
        blobs.set("a", b"1").unwrap();
        assert_eq!(blobs.list().unwrap(), vec!["a", "b"]);
    }
}
