//! Storage abstraction for CRDT persistence.
//!
//! This module defines the [`CrdtStorage`] trait, which abstracts over
//! backends that persist a workspace document, and [`MemoryStorage`], an
//! in-memory implementation for tests and development.
//!
//! # Storage Model
//!
//! The storage maintains two kinds of data per document name:
//! 1. **Snapshot**: the compacted full state of the document
//! 2. **Update log**: incremental updates appended since the snapshot
//!
//! Loading a workspace applies the snapshot first and then every logged
//! update in order.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

/// Origin of a CRDT update, used to distinguish local from remote changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOrigin {
    /// Update originated from a local edit
    Local,

    /// Update received from a remote peer
    Remote,

    /// Update from an initial sync handshake or a storage load
    Sync,
}

impl std::fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateOrigin::Local => write!(f, "local"),
            UpdateOrigin::Remote => write!(f, "remote"),
            UpdateOrigin::Sync => write!(f, "sync"),
        }
    }
}

impl std::str::FromStr for UpdateOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(UpdateOrigin::Local),
            "remote" => Ok(UpdateOrigin::Remote),
            "sync" => Ok(UpdateOrigin::Sync),
            _ => Err(format!("Unknown update origin: {}", s)),
        }
    }
}

/// A logged CRDT update.
#[derive(Debug, Clone)]
pub struct CrdtUpdate {
    /// Unique identifier for this update
    pub update_id: i64,

    /// Name of the document this update belongs to
    pub doc_name: String,

    /// Binary yrs update (v1 encoding)
    pub data: Vec<u8>,

    /// Unix timestamp when this update was logged (milliseconds)
    pub timestamp: i64,

    /// Origin of this update
    pub origin: UpdateOrigin,
}

/// Trait for CRDT document storage backends.
pub trait CrdtStorage: Send + Sync {
    /// Load the snapshot of a document.
    ///
    /// Returns `None` if the document doesn't exist.
    fn load_doc(&self, name: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Save the snapshot of a document, replacing any existing one.
    fn save_doc(&self, name: &str, state: &[u8]) -> StoreResult<()>;

    /// Delete a document and all its updates.
    fn delete_doc(&self, name: &str) -> StoreResult<()>;

    /// List all document names in storage.
    fn list_docs(&self) -> StoreResult<Vec<String>>;

    /// Append an update to the log. Returns the new update id.
    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> StoreResult<i64>;

    /// All updates logged after `since_id`.
    fn get_updates_since(&self, name: &str, since_id: i64) -> StoreResult<Vec<CrdtUpdate>>;

    /// All logged updates of a document.
    fn get_all_updates(&self, name: &str) -> StoreResult<Vec<CrdtUpdate>> {
        self.get_updates_since(name, 0)
    }

    /// Drop all but the most recent `keep_updates` log entries.
    ///
    /// Callers save a fresh snapshot first so nothing is lost.
    fn compact(&self, name: &str, keep_updates: usize) -> StoreResult<()>;

    /// Latest update id of a document, 0 when the log is empty.
    fn get_latest_update_id(&self, name: &str) -> StoreResult<i64>;
}

/// In-memory CRDT storage.
///
/// Thread-safe via `RwLock`; data is lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    /// Document snapshots (name -> binary state)
    docs: RwLock<HashMap<String, Vec<u8>>>,

    /// Update logs (name -> list of updates)
    updates: RwLock<HashMap<String, Vec<CrdtUpdate>>>,

    /// Last handed-out update id
    last_id: RwLock<i64>,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_update_id(&self) -> i64 {
        let mut id = self.last_id.write().unwrap_or_else(PoisonError::into_inner);
        *id += 1;
        *id
    }
}

impl CrdtStorage for MemoryStorage {
    fn load_doc(&self, name: &str) -> StoreResult<Option<Vec<u8>>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.get(name).cloned())
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> StoreResult<()> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        docs.insert(name.to_string(), state.to_vec());
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> StoreResult<()> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        let mut updates = self.updates.write().unwrap_or_else(PoisonError::into_inner);
        docs.remove(name);
        updates.remove(name);
        Ok(())
    }

    fn list_docs(&self) -> StoreResult<Vec<String>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let updates = self.updates.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = docs.keys().chain(updates.keys()).cloned().collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> StoreResult<i64> {
        let id = self.next_update_id();
        let stored = CrdtUpdate {
            update_id: id,
            doc_name: name.to_string(),
            data: update.to_vec(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            origin,
        };

        let mut updates = self.updates.write().unwrap_or_else(PoisonError::into_inner);
        updates.entry(name.to_string()).or_default().push(stored);

        Ok(id)
    }

    fn get_updates_since(&self, name: &str, since_id: i64) -> StoreResult<Vec<CrdtUpdate>> {
        let updates = self.updates.read().unwrap_or_else(PoisonError::into_inner);
        let doc_updates = updates.get(name).map(|u| u.as_slice()).unwrap_or(&[]);

        Ok(doc_updates
            .iter()
            .filter(|u| u.update_id > since_id)
            .cloned()
            .collect())
    }

    fn compact(&self, name: &str, keep_updates: usize) -> StoreResult<()> {
        let mut updates = self.updates.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(doc_updates) = updates.get_mut(name)
            && doc_updates.len() > keep_updates
        {
            let drain_count = doc_updates.len() - keep_updates;
            doc_updates.drain(0..drain_count);
        }

        Ok(())
    }

    fn get_latest_update_id(&self, name: &str) -> StoreResult<i64> {
        let updates = self.updates.read().unwrap_or_else(PoisonError::into_inner);
        Ok(updates
            .get(name)
            .and_then(|u| u.last())
            .map(|u| u.update_id)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_doc() {
        let storage = MemoryStorage::new();
        let data = b"test document state";

        storage.save_doc("test", data).unwrap();
        let loaded = storage.load_doc("test").unwrap();

        assert_eq!(loaded, Some(data.to_vec()));
    }

    #[test]
    fn test_load_nonexistent_doc() {
        let storage = MemoryStorage::new();
        assert!(storage.load_doc("nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_delete_doc() {
        let storage = MemoryStorage::new();
        storage.save_doc("test", b"data").unwrap();
        storage
            .append_update("test", b"update", UpdateOrigin::Local)
            .unwrap();

        storage.delete_doc("test").unwrap();

        assert!(storage.load_doc("test").unwrap().is_none());
        assert!(storage.get_all_updates("test").unwrap().is_empty());
        assert!(storage.list_docs().unwrap().is_empty());
    }

    #[test]
    fn test_append_and_get_updates() {
        let storage = MemoryStorage::new();

        let id1 = storage
            .append_update("test", b"update1", UpdateOrigin::Local)
            .unwrap();
        let id2 = storage
            .append_update("test", b"update2", UpdateOrigin::Remote)
            .unwrap();

        assert!(id1 < id2);

        let all = storage.get_all_updates("test").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].origin, UpdateOrigin::Remote);

        let since = storage.get_updates_since("test", id1).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].update_id, id2);
    }

    #[test]
    fn test_compact_keeps_latest() {
        let storage = MemoryStorage::new();
        for i in 0..10 {
            storage
                .append_update("test", format!("update{}", i).as_bytes(), UpdateOrigin::Local)
                .unwrap();
        }

        storage.compact("test", 3).unwrap();

        let remaining = storage.get_all_updates("test").unwrap();
        assert_eq!(remaining.len(), 3);
        assert_eq!(remaining[2].data, b"update9".to_vec());
        assert_eq!(
            storage.get_latest_update_id("test").unwrap(),
            remaining[2].update_id
        );
    }

    #[test]
    fn test_origin_round_trips_through_str() {
        for origin in [UpdateOrigin::Local, UpdateOrigin::Remote, UpdateOrigin::Sync] {
            assert_eq!(origin.to_string().parse::<UpdateOrigin>(), Ok(origin));
        }
    }
}
