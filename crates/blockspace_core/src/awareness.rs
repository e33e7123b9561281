//! Presence and permission state consulted by pages.
//!
//! Pages ask the [`AwarenessAdapter`] whether they are read-only before every
//! mutation, capture the local cursor when an undo step is recorded and put
//! it back when the step is undone or redone. Presence transport is not part
//! of this crate; [`LocalAwareness`] keeps everything in process.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// A selection inside one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    /// Block holding the selection
    pub block_id: String,
    /// Start offset
    pub index: u32,
    /// Selected length, 0 for a caret
    pub length: u32,
}

impl Cursor {
    /// A caret at `index` in `block_id`.
    pub fn caret(block_id: impl Into<String>, index: u32) -> Self {
        Self {
            block_id: block_id.into(),
            index,
            length: 0,
        }
    }
}

/// Per-workspace presence state.
pub trait AwarenessAdapter: Send + Sync {
    /// Whether mutations of `page_id` are currently forbidden.
    fn is_readonly(&self, page_id: &str) -> bool;

    /// Toggle read-only mode of a page.
    fn set_readonly(&self, page_id: &str, read_only: bool);

    /// The local selection, if any.
    fn local_cursor(&self) -> Option<Cursor>;

    /// Replace the local selection.
    fn set_local_cursor(&self, cursor: Option<Cursor>);

    /// Selections of remote actors, keyed by actor id.
    fn remote_cursors(&self) -> IndexMap<String, Cursor>;

    /// Record or clear a remote actor's selection.
    fn set_remote_cursor(&self, actor: &str, cursor: Option<Cursor>);
}

/// In-process awareness state.
///
/// Per-page read-only flags override the workspace-wide default.
#[derive(Debug, Default)]
pub struct LocalAwareness {
    read_only_all: bool,
    read_only_pages: RwLock<HashMap<String, bool>>,
    local_cursor: RwLock<Option<Cursor>>,
    remote_cursors: RwLock<IndexMap<String, Cursor>>,
}

impl LocalAwareness {
    /// Fresh state: writable, no cursors.
    pub fn new() -> Self {
        Self::default()
    }

    /// State where every page starts read-only.
    pub fn read_only() -> Self {
        Self {
            read_only_all: true,
            ..Self::default()
        }
    }
}

impl AwarenessAdapter for LocalAwareness {
    fn is_readonly(&self, page_id: &str) -> bool {
        self.read_only_pages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(page_id)
            .copied()
            .unwrap_or(self.read_only_all)
    }

    fn set_readonly(&self, page_id: &str, read_only: bool) {
        self.read_only_pages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(page_id.to_string(), read_only);
    }

    fn local_cursor(&self) -> Option<Cursor> {
        self.local_cursor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_local_cursor(&self, cursor: Option<Cursor>) {
        *self
            .local_cursor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = cursor;
    }

    fn remote_cursors(&self) -> IndexMap<String, Cursor> {
        self.remote_cursors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_remote_cursor(&self, actor: &str, cursor: Option<Cursor>) {
        let mut cursors = self
            .remote_cursors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match cursor {
            Some(cursor) => {
                cursors.insert(actor.to_string(), cursor);
            }
            None => {
                cursors.shift_remove(actor);
            }
        }
    }
}
