//! Typed block model.
//!
//! A [`Block`] is the in-memory projection of one block map. Persisted
//! fields use a flat key layout inside the block's `Y.Map`:
//!
//! ```text
//! Y.Map "<block id>"
//! ├── "sys:id"        → "<block id>"
//! ├── "sys:flavour"   → "paragraph"
//! ├── "sys:children"  → Y.Array ["<child id>", ...]
//! ├── "prop:text"     → Y.Text "hello"      (schema-declared text prop)
//! ├── "prop:type"     → "text"               (any JSON value)
//! └── "meta:tags"     → ["a", "b"]
//! ```

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;
use yrs::{Map, MapRef, Out, ReadTxn, TextPrelim, TransactionMut};

use crate::value::{json_to_any, out_as_id_list, out_as_string, out_to_json};

/// Field holding the block id.
pub const SYS_ID: &str = "sys:id";
/// Field holding the block flavour.
pub const SYS_FLAVOUR: &str = "sys:flavour";
/// Field holding the ordered child id list.
pub const SYS_CHILDREN: &str = "sys:children";
/// Prefix of property fields.
pub const PROP_PREFIX: &str = "prop:";
/// Prefix of side-table fields.
pub const META_PREFIX: &str = "meta:";

/// Property bag passed to block mutations.
pub type Props = IndexMap<String, Value>;

/// Placement of a block relative to a target sibling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    /// Directly before the target
    Before,
    /// Directly after the target
    After,
}

/// A typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(untagged)]
pub enum Prop {
    /// Plain JSON value
    Json(Value),
    /// Content of a collaborative text
    Text(String),
}

impl Prop {
    /// JSON view of the value.
    pub fn to_json(&self) -> Value {
        match self {
            Prop::Json(value) => value.clone(),
            Prop::Text(text) => Value::String(text.clone()),
        }
    }

    /// The text content, if this is a text prop.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Prop::Text(text) => Some(text),
            Prop::Json(_) => None,
        }
    }
}

/// In-memory projection of one block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Block {
    /// Block id
    pub id: String,
    /// Schema flavour
    pub flavour: String,
    /// Properties, without the `prop:` prefix
    pub props: IndexMap<String, Prop>,
    /// Side tables, without the `meta:` prefix
    pub meta: IndexMap<String, Value>,
    children: Vec<String>,
    #[serde(skip)]
    child_index: HashMap<String, usize>,
}

impl Block {
    /// Create an empty block.
    pub fn new(id: impl Into<String>, flavour: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            flavour: flavour.into(),
            props: IndexMap::new(),
            meta: IndexMap::new(),
            children: Vec::new(),
            child_index: HashMap::new(),
        }
    }

    /// Ordered child ids.
    pub fn children(&self) -> &[String] {
        &self.children
    }

    /// Replace the child list and rebuild the position index.
    pub fn set_children(&mut self, children: Vec<String>) {
        self.child_index = children
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        self.children = children;
    }

    /// Position of `child` in this block's child list.
    pub fn child_position(&self, child: &str) -> Option<usize> {
        self.child_index.get(child).copied()
    }

    /// Whether `child` is listed as a child.
    pub fn has_child(&self, child: &str) -> bool {
        self.child_index.contains_key(child)
    }

    /// A property by name.
    pub fn prop(&self, name: &str) -> Option<&Prop> {
        self.props.get(name)
    }

    /// Text content of a text property.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.props.get(name).and_then(Prop::as_text)
    }

    /// All properties as JSON.
    pub fn props_json(&self) -> Props {
        self.props
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }

    /// Read a block out of its raw field map.
    ///
    /// Returns `None` when the map has no flavour yet. A `sys:id` that does
    /// not match `id` is logged and the map key wins.
    pub fn read<T: ReadTxn>(txn: &T, id: &str, fields: &MapRef) -> Option<Block> {
        let flavour = fields
            .get(txn, SYS_FLAVOUR)
            .and_then(|v| out_as_string(txn, &v))?;

        match fields.get(txn, SYS_ID).and_then(|v| out_as_string(txn, &v)) {
            Some(stored) if stored != id => {
                log::warn!("block '{id}' stores mismatched sys:id '{stored}'");
            }
            None => log::warn!("block '{id}' has no sys:id"),
            _ => {}
        }

        let mut block = Block::new(id, flavour);

        let mut entries: Vec<(String, Out)> = fields
            .iter(txn)
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (key, value) in entries {
            if key == SYS_CHILDREN {
                block.set_children(out_as_id_list(txn, &value));
            } else if let Some(name) = key.strip_prefix(PROP_PREFIX) {
                block.props.insert(name.to_string(), read_prop(txn, &value));
            } else if let Some(name) = key.strip_prefix(META_PREFIX) {
                block.meta.insert(name.to_string(), out_to_json(txn, &value));
            }
        }

        Some(block)
    }
}

/// Read one property value.
pub(crate) fn read_prop<T: ReadTxn>(txn: &T, value: &Out) -> Prop {
    match value {
        Out::YText(text) => Prop::Text(yrs::GetString::get_string(text, txn)),
        other => Prop::Json(out_to_json(txn, other)),
    }
}

/// Write one property into a block map, as `Y.Text` when `as_text` is set.
pub(crate) fn write_prop(
    txn: &mut TransactionMut,
    fields: &MapRef,
    name: &str,
    value: &Value,
    as_text: bool,
) {
    let key = format!("{PROP_PREFIX}{name}");
    if as_text {
        let content = match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        fields.insert(txn, key, TextPrelim::new(content));
    } else {
        fields.insert(txn, key, json_to_any(value));
    }
}

/// Write one side-table entry into a block map.
pub(crate) fn write_meta(txn: &mut TransactionMut, fields: &MapRef, name: &str, value: &Value) {
    fields.insert(txn, format!("{META_PREFIX}{name}"), json_to_any(value));
}
