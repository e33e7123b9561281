//! Classified change events.
//!
//! Deep-observe callbacks from yrs hand out borrowed, transaction-bound event
//! objects. [`classify`] turns them into the closed, owned [`ChangeEvent`]
//! set before any reconciliation logic sees them, so stores match on plain
//! variants instead of probing event shapes.
//!
//! Paths are relative to the observed root map: an event on a page's block
//! map has an empty path, a field change on block `b1` has the path
//! `[Key("b1")]`, and a splice of its children array has the path
//! `[Key("b1"), Key("sys:children")]`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;
use yrs::types::{Change, Delta, EntryChange, Event, Events};
use yrs::{Out, ReadTxn, TransactionMut};

use crate::value::{out_as_string, out_to_json};

/// One step of a path from the observed root to an event target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum PathSegment {
    /// Map key
    Key(String),
    /// Sequence index
    Index(u32),
}

impl PathSegment {
    /// The key, if this segment is one.
    pub fn as_key(&self) -> Option<&str> {
        match self {
            PathSegment::Key(key) => Some(key),
            PathSegment::Index(_) => None,
        }
    }
}

/// A single step of a sequence splice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum SpliceOp {
    /// Skip over existing items
    Retain(u32),
    /// Items inserted at the current position
    Insert(Vec<Value>),
    /// Items deleted at the current position
    Delete(u32),
}

/// A single step of a text delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum TextOp {
    /// Skip over existing characters
    Retain(u32),
    /// Text inserted at the current position
    Insert(String),
    /// Non-string content embedded in the text
    Embed(Value),
    /// Characters deleted at the current position
    Delete(u32),
}

/// A classified change to the observed root or one of its descendants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(tag = "type")]
pub enum ChangeEvent {
    /// A key was added to the map at `path`.
    MapAdd {
        /// Path to the map
        path: Vec<PathSegment>,
        /// Added key
        key: String,
        /// New value
        value: Value,
    },
    /// A key of the map at `path` was overwritten.
    MapUpdate {
        /// Path to the map
        path: Vec<PathSegment>,
        /// Overwritten key
        key: String,
        /// Previous value
        old: Value,
        /// New value
        value: Value,
    },
    /// A key was removed from the map at `path`.
    MapDelete {
        /// Path to the map
        path: Vec<PathSegment>,
        /// Removed key
        key: String,
        /// Value before removal
        old: Value,
    },
    /// The sequence at `path` was spliced.
    SequenceSplice {
        /// Path to the array
        path: Vec<PathSegment>,
        /// Retain/insert/delete steps
        ops: Vec<SpliceOp>,
    },
    /// The text at `path` changed.
    TextDelta {
        /// Path to the text
        path: Vec<PathSegment>,
        /// Delta in document offsets
        ops: Vec<TextOp>,
    },
    /// An event of a kind no store handles (XML, weak links).
    Unsupported {
        /// Path to the container
        path: Vec<PathSegment>,
        /// yrs event kind
        kind: String,
    },
}

impl ChangeEvent {
    /// Path from the observed root to the changed container.
    pub fn path(&self) -> &[PathSegment] {
        match self {
            ChangeEvent::MapAdd { path, .. }
            | ChangeEvent::MapUpdate { path, .. }
            | ChangeEvent::MapDelete { path, .. }
            | ChangeEvent::SequenceSplice { path, .. }
            | ChangeEvent::TextDelta { path, .. }
            | ChangeEvent::Unsupported { path, .. } => path,
        }
    }

    /// Key touched by a map event.
    pub fn key(&self) -> Option<&str> {
        match self {
            ChangeEvent::MapAdd { key, .. }
            | ChangeEvent::MapUpdate { key, .. }
            | ChangeEvent::MapDelete { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Whether the event touches the container at `prefix` or anything below it.
    pub fn touches(&self, prefix: &[PathSegment], key: &str) -> bool {
        let path = self.path();
        if path == prefix {
            return self.key() == Some(key);
        }
        path.len() > prefix.len()
            && path.starts_with(prefix)
            && path[prefix.len()].as_key() == Some(key)
    }
}

/// All classified events of one committed transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    /// Events in the order yrs delivered them
    pub events: Vec<ChangeEvent>,
    /// Whether the transaction carried the local actor's origin
    pub local: bool,
}

impl ChangeBatch {
    /// Whether the batch has no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Classify every event of a deep-observe callback.
pub fn classify(txn: &TransactionMut, events: &Events, local: bool) -> ChangeBatch {
    let mut classified = Vec::new();
    for event in events.iter() {
        classify_event(txn, event, &mut classified);
    }
    ChangeBatch {
        events: classified,
        local,
    }
}

fn classify_event(txn: &TransactionMut, event: &Event, out: &mut Vec<ChangeEvent>) {
    let path: Vec<PathSegment> = event
        .path()
        .into_iter()
        .map(|segment| match segment {
            yrs::types::PathSegment::Key(key) => PathSegment::Key(key.to_string()),
            yrs::types::PathSegment::Index(index) => PathSegment::Index(index),
        })
        .collect();

    match event {
        Event::Map(map_event) => {
            // Sort keys so a batch classifies identically on every replica.
            let mut keys: Vec<_> = map_event.keys(txn).iter().collect();
            keys.sort_by(|a, b| a.0.cmp(b.0));
            for (key, change) in keys {
                let key = key.to_string();
                let path = path.clone();
                out.push(match change {
                    EntryChange::Inserted(value) => ChangeEvent::MapAdd {
                        path,
                        key,
                        value: snapshot(txn, value),
                    },
                    EntryChange::Updated(old, value) => ChangeEvent::MapUpdate {
                        path,
                        key,
                        old: snapshot(txn, old),
                        value: snapshot(txn, value),
                    },
                    EntryChange::Removed(old) => ChangeEvent::MapDelete {
                        path,
                        key,
                        old: snapshot(txn, old),
                    },
                });
            }
        }
        Event::Array(array_event) => {
            let ops = array_event
                .delta(txn)
                .iter()
                .map(|change| match change {
                    Change::Added(items) => {
                        SpliceOp::Insert(items.iter().map(|item| snapshot(txn, item)).collect())
                    }
                    Change::Removed(len) => SpliceOp::Delete(*len),
                    Change::Retain(len) => SpliceOp::Retain(*len),
                })
                .collect();
            out.push(ChangeEvent::SequenceSplice { path, ops });
        }
        Event::Text(text_event) => {
            let ops = text_event
                .delta(txn)
                .iter()
                .map(|delta| match delta {
                    Delta::Inserted(value, _) => match out_as_string(txn, value) {
                        Some(text) => TextOp::Insert(text),
                        None => TextOp::Embed(snapshot(txn, value)),
                    },
                    Delta::Deleted(len) => TextOp::Delete(*len),
                    Delta::Retain(len, _) => TextOp::Retain(*len),
                })
                .collect();
            out.push(ChangeEvent::TextDelta { path, ops });
        }
        _ => out.push(ChangeEvent::Unsupported {
            path,
            kind: "xml".to_string(),
        }),
    }
}

/// Owned JSON view of a value, valid after the transaction ends.
fn snapshot<T: ReadTxn>(txn: &T, value: &Out) -> Value {
    out_to_json(txn, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use yrs::{Array, ArrayPrelim, DeepObservable, Doc, Map, MapPrelim, Text, TextPrelim, Transact};

    fn capture(root: &yrs::MapRef) -> (Arc<Mutex<Vec<ChangeBatch>>>, yrs::Subscription) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let sub = root.observe_deep(move |txn, events| {
            sink.lock().unwrap().push(classify(txn, events, false));
        });
        (batches, sub)
    }

    #[test]
    fn test_top_level_add_has_empty_path() {
        let doc = Doc::new();
        let root = doc.get_or_insert_map("space:page0");
        let (batches, _sub) = capture(&root);

        {
            let mut txn = doc.transact_mut();
            let block = root.insert(&mut txn, "b1", MapPrelim::default());
            block.insert(&mut txn, "sys:id", "b1");
        }

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let event = &batches[0].events[0];
        assert!(matches!(event, ChangeEvent::MapAdd { key, path, .. } if key == "b1" && path.is_empty()));
    }

    #[test]
    fn test_nested_changes_carry_paths() {
        let doc = Doc::new();
        let root = doc.get_or_insert_map("space:page0");
        let (children, title) = {
            let mut txn = doc.transact_mut();
            let block = root.insert(&mut txn, "b1", MapPrelim::default());
            let children = block.insert(&mut txn, "sys:children", ArrayPrelim::default());
            let title = block.insert(&mut txn, "prop:title", TextPrelim::new("hi"));
            (children, title)
        };
        let (batches, _sub) = capture(&root);

        {
            let mut txn = doc.transact_mut();
            children.push_back(&mut txn, "c1");
        }
        {
            let mut txn = doc.transact_mut();
            title.insert(&mut txn, 2, "!");
        }

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(
            batches[0].events[0],
            ChangeEvent::SequenceSplice {
                path: vec![
                    PathSegment::Key("b1".into()),
                    PathSegment::Key("sys:children".into())
                ],
                ops: vec![SpliceOp::Insert(vec![Value::String("c1".into())])],
            }
        );
        assert_eq!(
            batches[1].events[0],
            ChangeEvent::TextDelta {
                path: vec![
                    PathSegment::Key("b1".into()),
                    PathSegment::Key("prop:title".into())
                ],
                ops: vec![TextOp::Retain(2), TextOp::Insert("!".into())],
            }
        );
    }

    #[test]
    fn test_touches_matches_key_and_descendants() {
        let add = ChangeEvent::MapAdd {
            path: vec![],
            key: "pages".into(),
            value: Value::Null,
        };
        let nested = ChangeEvent::MapUpdate {
            path: vec![PathSegment::Key("pages".into()), PathSegment::Index(0)],
            key: "title".into(),
            old: Value::Null,
            value: Value::Null,
        };
        let other = ChangeEvent::MapAdd {
            path: vec![],
            key: "name".into(),
            value: Value::Null,
        };

        assert!(add.touches(&[], "pages"));
        assert!(nested.touches(&[], "pages"));
        assert!(!other.touches(&[], "pages"));
    }
}
