//! A logical namespace bound to one root map of the shared document.
//!
//! # Structure
//!
//! Every space of a workspace lives in the same yrs [`Doc`] under its own
//! root map:
//!
//! ```text
//! Y.Doc
//! ├── Y.Map "space:meta"      (workspace metadata)
//! ├── Y.Array "meta:pages"    (page index, owned by the meta store)
//! ├── Y.Map "meta:versions"   (flavour version ledger)
//! ├── Y.Map "space:page0"     (blocks of page0)
//! └── Y.Map "space:page1"     ...
//! ```
//!
//! # Commit, then notify
//!
//! [`Space::observe`] installs a deep observer that only classifies and
//! queues what changed. Owners drain the queue with
//! [`Space::take_batches`] once the transaction has committed and the new
//! state is readable, then reconcile their typed projection and fire
//! signals. Nothing reacts from inside the observer callback.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use yrs::{
    Any, ArrayPrelim, ArrayRef, DeepObservable, Doc, Map, MapRef, Origin, Out,
    Subscription, Transact, Transaction, TransactionMut,
};

use crate::error::{StoreError, StoreResult};
use crate::events::{ChangeBatch, classify};
use crate::ids::ActorId;
use crate::value::out_to_json;

/// Prefix of every space's root map name.
pub const SPACE_PREFIX: &str = "space:";

/// Root map name of the space with the given id.
pub fn space_map_name(id: &str) -> String {
    format!("{SPACE_PREFIX}{id}")
}

type BatchQueue = Arc<Mutex<VecDeque<ChangeBatch>>>;

/// One root map of the shared document plus its pending change batches.
pub struct Space {
    id: String,
    doc: Doc,
    map: MapRef,
    actor: ActorId,
    origin: Origin,
    pending: BatchQueue,
    subscription: Option<Subscription>,
}

impl Space {
    /// Bind `id` to its root map in `doc`.
    ///
    /// Must not be called while a transaction on `doc` is open.
    pub fn new(doc: &Doc, id: impl Into<String>, actor: ActorId) -> Self {
        let id = id.into();
        let map = doc.get_or_insert_map(space_map_name(&id).as_str());
        let origin = actor.origin();
        Self {
            id,
            doc: doc.clone(),
            map,
            actor,
            origin,
            pending: Arc::new(Mutex::new(VecDeque::new())),
            subscription: None,
        }
    }

    /// Logical id of this space.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The shared document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// The raw root map.
    pub fn map(&self) -> &MapRef {
        &self.map
    }

    /// Actor tagging this space's transactions.
    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    /// Run `f` inside one transaction tagged with the actor origin.
    ///
    /// Fails with [`StoreError::State`] when another transaction on the
    /// document is still open. Writes made by `f` before it returns an error
    /// are committed along with the rest, so callers validate first and write
    /// last.
    pub fn transact<R, F>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut TransactionMut, &MapRef) -> StoreResult<R>,
    {
        let mut txn = self
            .doc
            .try_transact_mut_with(self.origin.clone())
            .map_err(|e| {
                StoreError::State(format!("space '{}' cannot open a transaction: {e}", self.id))
            })?;
        f(&mut txn, &self.map)
    }

    /// Run `f` inside a read-only transaction.
    pub fn read<R, F>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&Transaction, &MapRef) -> R,
    {
        let txn = self.doc.try_transact().map_err(|e| {
            StoreError::State(format!("space '{}' cannot read: {e}", self.id))
        })?;
        Ok(f(&txn, &self.map))
    }

    /// Whether the root map has no entries.
    pub fn is_empty(&self) -> StoreResult<bool> {
        self.read(|txn, map| map.len(txn) == 0)
    }

    /// Flat JSON view of the whole root map.
    pub fn to_json(&self) -> StoreResult<Value> {
        self.read(|txn, map| out_to_json(txn, &Out::YMap(map.clone())))
    }

    // ==================== Lazy fields ====================

    /// The array under `key`, created from `init` when missing.
    pub fn array_or_init<F>(txn: &mut TransactionMut, map: &MapRef, key: &str, init: F) -> ArrayRef
    where
        F: FnOnce() -> ArrayPrelim,
    {
        match map.get(txn, key) {
            Some(Out::YArray(array)) => array,
            _ => map.insert(txn, key, init()),
        }
    }

    /// The plain value under `key`, written from `init` when missing.
    pub fn value_or_init<F>(txn: &mut TransactionMut, map: &MapRef, key: &str, init: F) -> Any
    where
        F: FnOnce() -> Any,
    {
        match map.get(txn, key) {
            Some(Out::Any(value)) => value,
            _ => {
                let value = init();
                map.insert(txn, key, value.clone());
                value
            }
        }
    }

    // ==================== Observation ====================

    /// Start queueing a classified [`ChangeBatch`] per committed transaction.
    pub fn observe(&mut self) {
        if self.subscription.is_some() {
            return;
        }
        let queue = Arc::clone(&self.pending);
        let local_origin = self.origin.clone();
        let subscription = self.map.observe_deep(move |txn, events| {
            let local = txn.origin() == Some(&local_origin);
            let batch = classify(txn, events, local);
            if !batch.is_empty() {
                queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back(batch);
            }
        });
        self.subscription = Some(subscription);
    }

    /// Stop observing and drop anything still queued.
    pub fn unobserve(&mut self) {
        self.subscription = None;
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Whether an observer is installed.
    pub fn is_observing(&self) -> bool {
        self.subscription.is_some()
    }

    /// Whether committed batches are waiting to be reconciled.
    pub fn has_pending(&self) -> bool {
        !self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Drain queued batches in delivery order.
    pub fn take_batches(&self) -> Vec<ChangeBatch> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space")
            .field("id", &self.id)
            .field("actor", &self.actor)
            .field("observing", &self.subscription.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChangeEvent;

    fn space(doc: &Doc, id: &str) -> Space {
        Space::new(doc, id, ActorId::new("alice"))
    }

    #[test]
    fn test_spaces_share_one_doc() {
        let doc = Doc::new();
        let a = space(&doc, "a");
        let b = space(&doc, "b");

        a.transact(|txn, map| {
            map.insert(txn, "x", 1.0);
            Ok(())
        })
        .unwrap();

        assert!(!a.is_empty().unwrap());
        assert!(b.is_empty().unwrap());
    }

    #[test]
    fn test_nested_transaction_is_state_error() {
        let doc = Doc::new();
        let a = space(&doc, "a");
        let _open = doc.transact_mut();

        let err = a.transact(|_, _| Ok(())).unwrap_err();
        assert!(matches!(err, StoreError::State(_)));
    }

    #[test]
    fn test_lazy_fields_initialize_once() {
        let doc = Doc::new();
        let a = space(&doc, "a");

        let first = a
            .transact(|txn, map| {
                Ok(Space::value_or_init(txn, map, "name", || Any::from("one")))
            })
            .unwrap();
        let second = a
            .transact(|txn, map| {
                Ok(Space::value_or_init(txn, map, "name", || Any::from("two")))
            })
            .unwrap();

        assert_eq!(first, Any::from("one"));
        assert_eq!(second, Any::from("one"));
    }

    #[test]
    fn test_batches_queue_until_drained() {
        let doc = Doc::new();
        let mut a = space(&doc, "a");
        a.observe();

        a.transact(|txn, map| {
            map.insert(txn, "x", 1.0);
            map.insert(txn, "y", 2.0);
            Ok(())
        })
        .unwrap();

        assert!(a.has_pending());
        let batches = a.take_batches();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].local);
        assert_eq!(batches[0].events.len(), 2);
        assert!(!a.has_pending());
    }

    #[test]
    fn test_foreign_origin_is_not_local() {
        let doc = Doc::new();
        let mut a = space(&doc, "a");
        a.observe();

        {
            let map = a.map().clone();
            let mut txn = doc.transact_mut_with(ActorId::new("bob").origin());
            map.insert(&mut txn, "x", 1.0);
        }

        let batches = a.take_batches();
        assert!(!batches[0].local);
        assert!(matches!(&batches[0].events[0], ChangeEvent::MapAdd { key, .. } if key == "x"));
    }

    #[test]
    fn test_unobserve_stops_queueing() {
        let doc = Doc::new();
        let mut a = space(&doc, "a");
        a.observe();
        a.unobserve();

        a.transact(|txn, map| {
            map.insert(txn, "x", 1.0);
            Ok(())
        })
        .unwrap();

        assert!(!a.has_pending());
    }
}
