//! Undo/redo for one page.
//!
//! [`History`] wraps a yrs [`UndoManager`] scoped to a page's block map and
//! to the local actor's origin, so only local edits become undo steps. Each
//! stack item gets the local [`Cursor`] at the time it was recorded; popping
//! the item hands that cursor back to the awareness adapter.
//!
//! Edits keep merging into the open stack item until [`History::capture_sync`]
//! closes it (or the capture window runs out).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use yrs::undo::{EventKind, Options};
use yrs::{Doc, MapRef, Subscription, UndoManager};

use crate::awareness::{AwarenessAdapter, Cursor};
use crate::ids::ActorId;

/// Which stack a history change concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "lowercase")]
pub enum StackKind {
    /// The undo stack
    Undo,
    /// The redo stack
    Redo,
}

/// A change to one of the history stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(tag = "type", content = "stack")]
pub enum HistoryChange {
    /// A stack item was recorded
    Added(StackKind),
    /// A stack item was undone or redone
    Popped(StackKind),
    /// Both stacks were cleared
    Cleared,
}

impl From<EventKind> for StackKind {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Undo => StackKind::Undo,
            EventKind::Redo => StackKind::Redo,
        }
    }
}

#[derive(Default)]
struct CursorStacks {
    undo: Vec<Option<Cursor>>,
    redo: Vec<Option<Cursor>>,
}

impl CursorStacks {
    fn stack(&mut self, kind: StackKind) -> &mut Vec<Option<Cursor>> {
        match kind {
            StackKind::Undo => &mut self.undo,
            StackKind::Redo => &mut self.redo,
        }
    }
}

#[derive(Default)]
struct Shared {
    cursors: Mutex<CursorStacks>,
    changes: Mutex<Vec<HistoryChange>>,
    replaying: AtomicBool,
}

impl Shared {
    fn record(&self, change: HistoryChange) {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(change);
    }
}

/// Undo/redo manager of one page.
pub struct History {
    manager: UndoManager,
    shared: Arc<Shared>,
    _added: Subscription,
    _popped: Subscription,
}

impl History {
    /// Track local edits of `scope`.
    pub fn new(
        doc: &Doc,
        scope: &MapRef,
        actor: &ActorId,
        awareness: Arc<dyn AwarenessAdapter>,
        capture_timeout_ms: u64,
    ) -> Self {
        let options = Options {
            capture_timeout_millis: capture_timeout_ms,
            ..Default::default()
        };
        let mut manager = UndoManager::with_scope_and_options(doc, scope, options);
        manager.include_origin(actor.origin());

        let shared = Arc::new(Shared::default());

        let added = {
            let shared = Arc::clone(&shared);
            let awareness = Arc::clone(&awareness);
            manager.observe_item_added(move |_txn, event| {
                let kind = StackKind::from(event.kind());
                let mut cursors = shared.cursors.lock().unwrap_or_else(PoisonError::into_inner);
                // A fresh local edit drops the redo stack; undo and redo only move items.
                if kind == StackKind::Undo && !shared.replaying.load(Ordering::SeqCst) {
                    cursors.redo.clear();
                }
                cursors.stack(kind).push(awareness.local_cursor());
                drop(cursors);
                shared.record(HistoryChange::Added(kind));
            })
        };

        let popped = {
            let shared = Arc::clone(&shared);
            manager.observe_item_popped(move |_txn, event| {
                let kind = StackKind::from(event.kind());
                let cursor = shared
                    .cursors
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .stack(kind)
                    .pop()
                    .flatten();
                if cursor.is_some() {
                    awareness.set_local_cursor(cursor);
                }
                shared.record(HistoryChange::Popped(kind));
            })
        };

        Self {
            manager,
            shared,
            _added: added,
            _popped: popped,
        }
    }

    /// Whether an undo step is available.
    pub fn can_undo(&self) -> bool {
        self.manager.can_undo()
    }

    /// Whether a redo step is available.
    pub fn can_redo(&self) -> bool {
        self.manager.can_redo()
    }

    /// Undo the latest step. Returns whether anything changed.
    pub fn undo(&mut self) -> bool {
        self.replay(|manager| manager.undo_blocking())
    }

    /// Redo the latest undone step. Returns whether anything changed.
    pub fn redo(&mut self) -> bool {
        self.replay(|manager| manager.redo_blocking())
    }

    fn replay(&mut self, f: impl FnOnce(&mut UndoManager) -> bool) -> bool {
        self.shared.replaying.store(true, Ordering::SeqCst);
        let changed = f(&mut self.manager);
        self.shared.replaying.store(false, Ordering::SeqCst);
        changed
    }

    /// Close the open stack item; the next edit starts a new undo step.
    pub fn capture_sync(&mut self) {
        self.manager.reset();
    }

    /// Drop both stacks.
    pub fn clear(&mut self) {
        self.manager.clear();
        let mut cursors = self
            .shared
            .cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        cursors.undo.clear();
        cursors.redo.clear();
        drop(cursors);
        self.shared.record(HistoryChange::Cleared);
    }

    /// Drain stack changes recorded since the last call.
    pub fn take_changes(&self) -> Vec<HistoryChange> {
        std::mem::take(
            &mut *self
                .shared
                .changes
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

impl std::fmt::Debug for History {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("History")
            .field("can_undo", &self.can_undo())
            .field("can_redo", &self.can_redo())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::LocalAwareness;
    use yrs::{Map, Transact};

    fn setup() -> (Doc, MapRef, ActorId, Arc<LocalAwareness>, History) {
        let doc = Doc::new();
        let map = doc.get_or_insert_map("space:page0");
        let actor = ActorId::new("alice");
        let awareness = Arc::new(LocalAwareness::new());
        let history = History::new(&doc, &map, &actor, awareness.clone(), 60_000);
        (doc, map, actor, awareness, history)
    }

    fn write(doc: &Doc, map: &MapRef, actor: &ActorId, key: &str) {
        let mut txn = doc.transact_mut_with(actor.origin());
        map.insert(&mut txn, key, true);
    }

    #[test]
    fn test_undo_and_redo_local_edit() {
        let (doc, map, actor, _awareness, mut history) = setup();

        write(&doc, &map, &actor, "a");
        assert!(history.can_undo());
        assert!(history.undo());
        assert!(map.get(&doc.transact(), "a").is_none());

        assert!(history.can_redo());
        assert!(history.redo());
        assert!(map.get(&doc.transact(), "a").is_some());
    }

    #[test]
    fn test_remote_edits_are_not_tracked() {
        let (doc, map, _actor, _awareness, history) = setup();

        write(&doc, &map, &ActorId::new("bob"), "a");
        assert!(!history.can_undo());
    }

    #[test]
    fn test_capture_sync_splits_steps() {
        let (doc, map, actor, _awareness, mut history) = setup();

        write(&doc, &map, &actor, "a");
        history.capture_sync();
        write(&doc, &map, &actor, "b");

        history.undo();
        let txn = doc.transact();
        assert!(map.get(&txn, "a").is_some());
        assert!(map.get(&txn, "b").is_none());
    }

    #[test]
    fn test_cursor_restored_on_undo() {
        let (doc, map, actor, awareness, mut history) = setup();

        awareness.set_local_cursor(Some(Cursor::caret("b1", 4)));
        write(&doc, &map, &actor, "a");
        awareness.set_local_cursor(Some(Cursor::caret("b9", 0)));

        history.undo();
        assert_eq!(awareness.local_cursor(), Some(Cursor::caret("b1", 4)));
    }

    #[test]
    fn test_changes_are_recorded() {
        let (doc, map, actor, _awareness, mut history) = setup();

        write(&doc, &map, &actor, "a");
        history.undo();
        history.clear();

        let changes = history.take_changes();
        assert_eq!(changes.first(), Some(&HistoryChange::Added(StackKind::Undo)));
        assert!(changes.contains(&HistoryChange::Popped(StackKind::Undo)));
        assert_eq!(changes.last(), Some(&HistoryChange::Cleared));
        assert!(!history.can_undo());
        assert!(history.take_changes().is_empty());
    }
}
