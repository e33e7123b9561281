//! Block tree store of one page.
//!
//! A [`Page`] projects the flat id → block-fields map of its space into a
//! rooted tree of typed [`Block`]s, mutates it through single transactions and
//! reconciles every committed change batch (local, remote or undo) back into
//! the projection through one code path.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──sync_from_existing_doc──▶ Synced ──dispose──▶ Disposed
//! ```
//!
//! `sync_from_existing_doc` runs the version gate, materializes every block,
//! installs the observer and creates the undo history. It may be attempted
//! once; a page whose sync failed stays unusable.
//!
//! # Reconciliation
//!
//! Each batch is sorted into removals, children changes, additions, field
//! updates and text deltas, applied in that order. New blocks are discovered
//! with a worklist walk over `sys:children`; ids listed but not present yet
//! are skipped until their own add event arrives. The first parentless
//! non-auxiliary block becomes the root; a parentless block of the auxiliary
//! flavour fills the auxiliary root slot.
//!
//! Materialization goes through the [`SchemaRegistry`]: blocks of an
//! unregistered flavour are logged and left out of the projection, and
//! declared props the document does not carry read as their schema defaults.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;
use yrs::{
    Array, ArrayPrelim, ArrayRef, Doc, GetString, Map, MapPrelim, MapRef, Out, ReadTxn, Text,
    TextRef, Transact, TransactionMut,
};

use crate::awareness::AwarenessAdapter;
use crate::block::{
    Block, META_PREFIX, PROP_PREFIX, Placement, Prop, Props, SYS_CHILDREN, SYS_FLAVOUR, SYS_ID,
    write_meta, write_prop,
};
use crate::error::{StoreError, StoreResult};
use crate::events::{ChangeBatch, ChangeEvent, PathSegment, TextOp};
use crate::history::History;
use crate::ids::{ActorId, IdGenerator};
use crate::indexer::ContentIndexer;
use crate::meta::{VersionLedger, ledger_map, stamp_flavour};
use crate::schema::{BlockRole, BlockSchema, SchemaRegistry};
use crate::signal::Signal;
use crate::space::Space;
use crate::value::out_as_string;

/// Collaborators shared by every store of a workspace.
#[derive(Clone)]
pub struct StoreContext {
    /// Origin of local transactions
    pub actor: ActorId,
    /// Flavour registry
    pub registry: Arc<SchemaRegistry>,
    /// Block id source
    pub id_generator: Arc<dyn IdGenerator>,
    /// Read-only state and cursors
    pub awareness: Arc<dyn AwarenessAdapter>,
    /// Content indexing sink
    pub indexer: Arc<dyn ContentIndexer>,
    /// Flavour of the auxiliary root slot
    pub aux_root_flavour: String,
    /// Undo grouping window
    pub capture_timeout_ms: u64,
}

impl std::fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreContext")
            .field("actor", &self.actor)
            .field("aux_root_flavour", &self.aux_root_flavour)
            .finish()
    }
}

/// Lifecycle state of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Constructed, not yet synced
    Uninitialized,
    /// Projection live
    Synced,
    /// Terminal
    Disposed,
}

/// Where the children of a deleted block go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildrenPolicy {
    /// Prepend them to the deleted block's parent
    Parent,
    /// Append them to this block
    To(String),
    /// Delete the whole subtree
    Delete,
}

/// A block to create.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSpec {
    /// Flavour name
    pub flavour: String,
    /// Initial props, merged over the schema defaults
    pub props: Props,
}

impl BlockSpec {
    /// A block with default props.
    pub fn new(flavour: impl Into<String>) -> Self {
        Self {
            flavour: flavour.into(),
            props: Props::new(),
        }
    }

    /// Set one prop.
    pub fn with_prop(mut self, name: impl Into<String>, value: Value) -> Self {
        self.props.insert(name.into(), value);
        self
    }
}

/// A partial update of one block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockUpdate {
    /// Props to merge
    pub props: Props,
    /// Side-table entries to merge
    pub meta: IndexMap<String, Value>,
    /// Full replacement of the child list
    pub children: Option<Vec<String>>,
}

impl BlockUpdate {
    /// An update of props only.
    pub fn props(props: Props) -> Self {
        Self {
            props,
            ..Self::default()
        }
    }
}

/// Payload of `root_added`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct RootAdded {
    /// Primary root id
    pub root: Option<String>,
    /// Auxiliary root id
    pub aux: Option<String>,
}

/// Payload of `props_updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PropsUpdated {
    /// Block id
    pub id: String,
    /// Changed field names, with their `prop:`/`meta:` prefix
    pub keys: Vec<String>,
    /// Current props
    pub props: IndexMap<String, Value>,
    /// Current side tables
    pub meta: IndexMap<String, Value>,
}

/// Payload of `children_updated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ChildrenUpdated {
    /// Block id
    pub id: String,
    /// Current child ids
    pub children: Vec<String>,
}

/// Payload of `text_updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TextUpdated {
    /// Block id
    pub id: String,
    /// Prop name
    pub prop: String,
    /// Delta in document offsets
    pub ops: Vec<TextOp>,
    /// Current text
    pub text: String,
}

/// A notification produced by reconciliation, fired once the pass is done.
enum Notice {
    BlockAdded(String),
    BlockDeleted(String),
    RootAdded,
    RootDeleted(String),
    Props(PropsUpdated),
    Children(ChildrenUpdated),
    Text(TextUpdated),
}

/// Batch events sorted by what they touch.
#[derive(Default)]
struct Sorted {
    removed: Vec<String>,
    added: Vec<String>,
    children: Vec<String>,
    fields: IndexMap<String, Vec<String>>,
    texts: Vec<(String, String, Vec<TextOp>)>,
}

impl Sorted {
    fn push_unique(list: &mut Vec<String>, id: &str) {
        if !list.iter().any(|existing| existing == id) {
            list.push(id.to_string());
        }
    }

    fn from_batch(batch: ChangeBatch) -> Self {
        let mut sorted = Sorted::default();
        for event in batch.events {
            match event {
                ChangeEvent::MapAdd { path, key, .. } if path.is_empty() => {
                    Self::push_unique(&mut sorted.added, &key);
                }
                ChangeEvent::MapDelete { path, key, .. } if path.is_empty() => {
                    Self::push_unique(&mut sorted.removed, &key);
                }
                ChangeEvent::MapUpdate { path, key, .. } if path.is_empty() => {
                    // A replaced block map is a delete followed by an add.
                    Self::push_unique(&mut sorted.removed, &key);
                    Self::push_unique(&mut sorted.added, &key);
                }
                ChangeEvent::MapAdd { path, key, .. }
                | ChangeEvent::MapUpdate { path, key, .. }
                | ChangeEvent::MapDelete { path, key, .. }
                    if path.len() == 1 =>
                {
                    let Some(id) = path[0].as_key() else {
                        log::warn!("skipping map event at unexpected path {path:?}");
                        continue;
                    };
                    if key == SYS_CHILDREN {
                        Self::push_unique(&mut sorted.children, id);
                    } else if key.starts_with(PROP_PREFIX) || key.starts_with(META_PREFIX) {
                        sorted.fields.entry(id.to_string()).or_default().push(key);
                    } else {
                        log::warn!("block '{id}' changed reserved field '{key}'; ignored");
                    }
                }
                ChangeEvent::SequenceSplice { path, .. } => match path.as_slice() {
                    [PathSegment::Key(id), PathSegment::Key(field)] if field == SYS_CHILDREN => {
                        Self::push_unique(&mut sorted.children, id);
                    }
                    _ => log::warn!("skipping sequence splice at {path:?}"),
                },
                ChangeEvent::TextDelta { path, ops } => match path.as_slice() {
                    [PathSegment::Key(id), PathSegment::Key(field)] => {
                        match field.strip_prefix(PROP_PREFIX) {
                            Some(prop) => sorted.texts.push((id.clone(), prop.to_string(), ops)),
                            None => log::warn!("skipping text delta on '{field}' of '{id}'"),
                        }
                    }
                    _ => log::warn!("skipping text delta at {path:?}"),
                },
                other => log::warn!("skipping unsupported change {other:?}"),
            }
        }
        sorted
    }
}

fn block_fields<T: ReadTxn>(txn: &T, map: &MapRef, id: &str) -> Option<MapRef> {
    match map.get(txn, id) {
        Some(Out::YMap(fields)) => Some(fields),
        _ => None,
    }
}

fn read_block<T: ReadTxn>(txn: &T, map: &MapRef, id: &str) -> Option<Block> {
    block_fields(txn, map, id).and_then(|fields| Block::read(txn, id, &fields))
}

/// Id of a block whose `sys:children` lists `id`.
fn listed_by<T: ReadTxn>(txn: &T, map: &MapRef, id: &str) -> Option<String> {
    map.iter(txn).find_map(|(key, value)| match value {
        Out::YMap(fields) => match fields.get(txn, SYS_CHILDREN) {
            Some(Out::YArray(children)) if position_in(txn, &children, id).is_some() => {
                Some(key.to_string())
            }
            _ => None,
        },
        _ => None,
    })
}

fn children_array(txn: &mut TransactionMut, map: &MapRef, id: &str) -> StoreResult<ArrayRef> {
    let fields = block_fields(txn, map, id).ok_or_else(|| StoreError::not_found("block", id))?;
    Ok(Space::array_or_init(
        txn,
        &fields,
        SYS_CHILDREN,
        ArrayPrelim::default,
    ))
}

fn position_in<T: ReadTxn>(txn: &T, array: &ArrayRef, id: &str) -> Option<u32> {
    array
        .iter(txn)
        .position(|item| out_as_string(txn, &item).as_deref() == Some(id))
        .map(|i| i as u32)
}

fn text_field<T: ReadTxn>(txn: &T, map: &MapRef, id: &str, prop: &str) -> StoreResult<TextRef> {
    let fields = block_fields(txn, map, id).ok_or_else(|| StoreError::not_found("block", id))?;
    match fields.get(txn, &format!("{PROP_PREFIX}{prop}")) {
        Some(Out::YText(text)) => Ok(text),
        _ => Err(StoreError::Structural(format!(
            "'{prop}' of block '{id}' is not a text prop"
        ))),
    }
}

/// Byte offset of the `chars`-th character of `s`.
fn byte_offset(s: &str, chars: usize) -> Option<usize> {
    if chars == s.chars().count() {
        return Some(s.len());
    }
    s.char_indices().nth(chars).map(|(offset, _)| offset)
}

/// Fill declared props missing from `block` with the schema defaults.
fn fill_defaults(block: &mut Block, schema: &BlockSchema) {
    for (name, value) in schema.initial_props(&Props::new()) {
        if block.props.contains_key(&name) {
            continue;
        }
        let prop = if schema.is_text_prop(&name) {
            Prop::Text(value.as_str().unwrap_or_default().to_string())
        } else {
            Prop::Json(value)
        };
        block.props.insert(name, prop);
    }
}

/// Rewrite `text` from `current` to `new` with one delete and one insert.
fn apply_text_diff(txn: &mut TransactionMut, text: &TextRef, current: &str, new: &str) {
    if current == new {
        return;
    }
    let current_chars: Vec<char> = current.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let common_prefix = current_chars
        .iter()
        .zip(new_chars.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let remaining_current = current_chars.len() - common_prefix;
    let remaining_new = new_chars.len() - common_prefix;
    let common_suffix = current_chars[common_prefix..]
        .iter()
        .rev()
        .zip(new_chars[common_prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .take(remaining_current.min(remaining_new))
        .count();

    let start: usize = current_chars[..common_prefix]
        .iter()
        .map(|c| c.len_utf8())
        .sum();
    let delete_len: usize = current_chars[common_prefix..current_chars.len() - common_suffix]
        .iter()
        .map(|c| c.len_utf8())
        .sum();
    let insert: String = new_chars[common_prefix..new_chars.len() - common_suffix]
        .iter()
        .collect();

    if delete_len > 0 {
        text.remove_range(txn, start as u32, delete_len as u32);
    }
    if !insert.is_empty() {
        text.insert(txn, start as u32, &insert);
    }
}

/// Block tree store of one page.
pub struct Page {
    space: Space,
    ledger: MapRef,
    ctx: StoreContext,
    state: PageState,
    sync_attempted: bool,
    blocks: IndexMap<String, Block>,
    parents: HashMap<String, String>,
    root: Option<String>,
    aux_root: Option<String>,
    history: Option<History>,
    /// Root slots were filled
    pub root_added: Signal<RootAdded>,
    /// A root slot was vacated
    pub root_deleted: Signal<String>,
    /// A block was materialized
    pub block_added: Signal<String>,
    /// A block was removed
    pub block_deleted: Signal<String>,
    /// Props or side tables of a block changed
    pub props_updated: Signal<PropsUpdated>,
    /// The child list of a block changed
    pub children_updated: Signal<ChildrenUpdated>,
    /// A text prop changed
    pub text_updated: Signal<TextUpdated>,
    /// The undo or redo stack changed
    pub history_updated: Signal<()>,
    /// The page was disposed
    pub disposed: Signal<()>,
}

impl Page {
    /// Bind page `id` of `doc`. The page stays uninitialized until synced.
    pub fn new(doc: &Doc, id: impl Into<String>, ctx: StoreContext) -> Self {
        let space = Space::new(doc, id, ctx.actor.clone());
        Self {
            space,
            ledger: ledger_map(doc),
            ctx,
            state: PageState::Uninitialized,
            sync_attempted: false,
            blocks: IndexMap::new(),
            parents: HashMap::new(),
            root: None,
            aux_root: None,
            history: None,
            root_added: Signal::new(),
            root_deleted: Signal::new(),
            block_added: Signal::new(),
            block_deleted: Signal::new(),
            props_updated: Signal::new(),
            children_updated: Signal::new(),
            text_updated: Signal::new(),
            history_updated: Signal::new(),
            disposed: Signal::new(),
        }
    }

    /// Page id.
    pub fn id(&self) -> &str {
        self.space.id()
    }

    /// Lifecycle state.
    pub fn state(&self) -> PageState {
        self.state
    }

    /// The underlying space.
    pub fn space(&self) -> &Space {
        &self.space
    }

    /// Whether mutations are currently forbidden.
    pub fn is_readonly(&self) -> bool {
        self.ctx.awareness.is_readonly(self.id())
    }

    // ==================== Lifecycle ====================

    /// Run the version gate and materialize the tree.
    ///
    /// An empty page stamps the ledger, an existing one validates it; both
    /// happen before any block is read.
    pub fn sync_from_existing_doc(&mut self, ledger: &mut dyn VersionLedger) -> StoreResult<()> {
        match self.state {
            PageState::Disposed => {
                return Err(StoreError::State(format!("page '{}' is disposed", self.id())));
            }
            PageState::Synced => {
                return Err(StoreError::State(format!("page '{}' is already synced", self.id())));
            }
            PageState::Uninitialized if self.sync_attempted => {
                return Err(StoreError::State(format!(
                    "page '{}' failed to sync and cannot be synced again",
                    self.id()
                )));
            }
            PageState::Uninitialized => {}
        }
        self.sync_attempted = true;

        if self.space.is_empty()? {
            ledger.write_version(&self.ctx.registry)?;
        } else {
            ledger.validate_version(&self.ctx.registry)?;
        }

        self.materialize_all()?;
        self.space.observe();
        self.history = Some(History::new(
            self.space.doc(),
            self.space.map(),
            &self.ctx.actor,
            Arc::clone(&self.ctx.awareness),
            self.ctx.capture_timeout_ms,
        ));
        self.state = PageState::Synced;

        log::debug!(
            "page '{}' synced with {} blocks",
            self.id(),
            self.blocks.len()
        );
        for block in self.blocks.values() {
            self.ctx.indexer.index_block(self.id(), block);
        }
        if self.root.is_some() || self.aux_root.is_some() {
            self.root_added.emit(&self.root_payload());
        }
        Ok(())
    }

    /// Unsubscribe everything and drop the projection.
    pub fn dispose(&mut self) {
        if self.state == PageState::Disposed {
            return;
        }
        self.space.unobserve();
        self.history = None;
        self.blocks.clear();
        self.parents.clear();
        self.root = None;
        self.aux_root = None;
        self.state = PageState::Disposed;
        log::debug!("page '{}' disposed", self.id());

        self.disposed.emit(&());
        self.root_added.dispose();
        self.root_deleted.dispose();
        self.block_added.dispose();
        self.block_deleted.dispose();
        self.props_updated.dispose();
        self.children_updated.dispose();
        self.text_updated.dispose();
        self.history_updated.dispose();
        self.disposed.dispose();
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.is_readonly() {
            return Err(StoreError::ReadOnly(self.id().to_string()));
        }
        match self.state {
            PageState::Synced => Ok(()),
            PageState::Uninitialized => Err(StoreError::State(format!(
                "page '{}' is not synced",
                self.id()
            ))),
            PageState::Disposed => Err(StoreError::State(format!(
                "page '{}' is disposed",
                self.id()
            ))),
        }
    }

    fn existing(&self, id: &str) -> StoreResult<&Block> {
        self.blocks
            .get(id)
            .ok_or_else(|| StoreError::not_found("block", id))
    }

    // ==================== Mutations ====================

    /// Add one block under `parent` at `index` (default: end).
    pub fn add_block(
        &mut self,
        flavour: &str,
        props: Props,
        parent: Option<&str>,
        index: Option<usize>,
    ) -> StoreResult<String> {
        let spec = BlockSpec {
            flavour: flavour.to_string(),
            props,
        };
        let mut ids = self.add_blocks(vec![spec], parent, index)?;
        ids.pop()
            .ok_or_else(|| StoreError::State("no block was created".into()))
    }

    /// Add consecutive siblings in one transaction.
    pub fn add_blocks(
        &mut self,
        specs: Vec<BlockSpec>,
        parent: Option<&str>,
        index: Option<usize>,
    ) -> StoreResult<Vec<String>> {
        self.check_writable()?;
        if specs.is_empty() {
            return Ok(Vec::new());
        }

        let (parent_flavour, len) = match parent {
            Some(parent) => {
                let block = self.existing(parent)?;
                (Some(block.flavour.clone()), block.children().len())
            }
            None => (None, 0),
        };

        let schemas = specs
            .iter()
            .map(|spec| {
                self.ctx
                    .registry
                    .validate(&spec.flavour, parent_flavour.as_deref())
            })
            .collect::<StoreResult<Vec<_>>>()?;

        if parent.is_none() {
            if specs.len() > 1 {
                return Err(StoreError::Structural(
                    "only one parentless block can be added at a time".into(),
                ));
            }
            self.check_root_slot(&schemas[0])?;
        }

        let index = index.unwrap_or(len);
        if parent.is_some() && index > len {
            return Err(StoreError::Structural(format!(
                "index {index} is out of bounds (len {len})"
            )));
        }

        let ids = self.allocate_ids(specs.len())?;
        let ledger = &self.ledger;
        self.space.transact(|txn, map| {
            for ((spec, schema), id) in specs.iter().zip(&schemas).zip(&ids) {
                write_block(txn, map, id, schema, &spec.props);
            }
            for schema in &schemas {
                if stamp_flavour(txn, ledger, &schema.flavour, schema.version) {
                    log::debug!("ledger records '{}' v{}", schema.flavour, schema.version);
                }
            }
            if let Some(parent) = parent {
                let children = children_array(txn, map, parent)?;
                for (offset, id) in ids.iter().enumerate() {
                    children.insert(txn, (index + offset) as u32, id.as_str());
                }
            }
            Ok(())
        })?;

        self.process_pending()?;
        Ok(ids)
    }

    fn check_root_slot(&self, schema: &BlockSchema) -> StoreResult<()> {
        if schema.flavour == self.ctx.aux_root_flavour {
            if self.root.is_none() {
                return Err(StoreError::Structural(format!(
                    "'{}' needs a root to accompany",
                    schema.flavour
                )));
            }
            if self.aux_root.is_some() {
                return Err(StoreError::Structural(
                    "page already has an auxiliary root".into(),
                ));
            }
            return Ok(());
        }
        if schema.role != BlockRole::Root {
            return Err(StoreError::Structural(format!(
                "'{}' needs a parent",
                schema.flavour
            )));
        }
        if self.root.is_some() {
            return Err(StoreError::Structural("page already has a root".into()));
        }
        Ok(())
    }

    fn allocate_ids(&self, count: usize) -> StoreResult<Vec<String>> {
        let taken: HashSet<String> = self
            .space
            .read(|txn, map| map.keys(txn).map(str::to_string).collect())?;
        let mut ids: Vec<String> = Vec::with_capacity(count);
        let mut attempts = 0;
        while ids.len() < count {
            attempts += 1;
            if attempts > count * 1000 {
                return Err(StoreError::State(
                    "id generator keeps returning ids that are in use".into(),
                ));
            }
            let id = self.ctx.id_generator.next_id();
            if !taken.contains(&id) && !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Add a block next to `target`.
    pub fn insert_block(
        &mut self,
        flavour: &str,
        props: Props,
        target: &str,
        placement: Placement,
    ) -> StoreResult<String> {
        self.check_writable()?;
        let parent = self
            .parents
            .get(target)
            .cloned()
            .ok_or_else(|| StoreError::Structural(format!("block '{target}' has no parent")))?;
        let position = self
            .existing(&parent)?
            .child_position(target)
            .ok_or_else(|| StoreError::not_found("block", target))?;
        let index = match placement {
            Placement::Before => position,
            Placement::After => position + 1,
        };
        self.add_block(flavour, props, Some(parent.as_str()), Some(index))
    }

    /// Merge props and side tables, or replace the child list.
    ///
    /// A child list replacement rewrites the whole `sys:children` array.
    pub fn update_block(&mut self, id: &str, update: BlockUpdate) -> StoreResult<()> {
        self.check_writable()?;
        let block = self.existing(id)?;
        let schema = self.ctx.registry.get(&block.flavour);

        if let Some(children) = &update.children {
            let mut seen = HashSet::new();
            for child in children {
                if !seen.insert(child.as_str()) {
                    return Err(StoreError::Structural(format!("'{child}' is listed twice")));
                }
                if self.root.as_deref() == Some(child.as_str())
                    || self.aux_root.as_deref() == Some(child.as_str())
                {
                    return Err(StoreError::Structural(format!(
                        "root block '{child}' cannot become a child"
                    )));
                }
                if child == id || self.is_ancestor(child, id) {
                    return Err(StoreError::Structural(format!(
                        "'{child}' cannot become a child of its descendant '{id}'"
                    )));
                }
                let child_block = self.existing(child)?;
                if let Some(parent) = self.parents.get(child)
                    && parent != id
                {
                    return Err(StoreError::Structural(format!(
                        "'{child}' already belongs to '{parent}'"
                    )));
                }
                self.ctx
                    .registry
                    .validate(&child_block.flavour, Some(block.flavour.as_str()))?;
            }
        }

        self.space.transact(|txn, map| {
            let fields =
                block_fields(txn, map, id).ok_or_else(|| StoreError::not_found("block", id))?;
            for (name, value) in &update.props {
                let as_text = schema.as_ref().is_some_and(|s| s.is_text_prop(name));
                let existing = fields.get(txn, &format!("{PROP_PREFIX}{name}"));
                match (as_text, existing, value) {
                    (true, Some(Out::YText(text)), Value::String(new)) => {
                        let current = text.get_string(txn);
                        apply_text_diff(txn, &text, &current, new);
                    }
                    _ => write_prop(txn, &fields, name, value, as_text),
                }
            }
            for (name, value) in &update.meta {
                write_meta(txn, &fields, name, value);
            }
            if let Some(children) = &update.children {
                let array = fields.insert(txn, SYS_CHILDREN, ArrayPrelim::default());
                for child in children {
                    array.push_back(txn, child.as_str());
                }
            }
            Ok(())
        })?;

        self.process_pending()
    }

    /// Merge props, logging instead of failing.
    pub fn set_props(&mut self, id: &str, props: Props) {
        if let Err(e) = self.update_block(id, BlockUpdate::props(props)) {
            log::warn!("set_props on '{id}' in page '{}' skipped: {e}", self.id());
        }
    }

    /// Insert text into a text prop at a character index.
    pub fn insert_text(&mut self, id: &str, prop: &str, index: usize, content: &str) -> StoreResult<()> {
        self.check_writable()?;
        self.existing(id)?;
        self.space.transact(|txn, map| {
            let text = text_field(txn, map, id, prop)?;
            let current = text.get_string(txn);
            let offset = byte_offset(&current, index).ok_or_else(|| {
                StoreError::Structural(format!("text index {index} is out of bounds"))
            })?;
            text.insert(txn, offset as u32, content);
            Ok(())
        })?;
        self.process_pending()
    }

    /// Delete `len` characters of a text prop starting at a character index.
    pub fn delete_text(&mut self, id: &str, prop: &str, index: usize, len: usize) -> StoreResult<()> {
        self.check_writable()?;
        self.existing(id)?;
        self.space.transact(|txn, map| {
            let text = text_field(txn, map, id, prop)?;
            let current = text.get_string(txn);
            let (Some(start), Some(end)) =
                (byte_offset(&current, index), byte_offset(&current, index + len))
            else {
                return Err(StoreError::Structural(format!(
                    "text range {index}..{} is out of bounds",
                    index + len
                )));
            };
            if end > start {
                text.remove_range(txn, start as u32, (end - start) as u32);
            }
            Ok(())
        })?;
        self.process_pending()
    }

    /// Move one block next to `target`.
    pub fn move_block(&mut self, id: &str, target: &str, placement: Placement) -> StoreResult<()> {
        self.move_blocks(&[id], target, placement)
    }

    /// Move blocks, in the given order, next to `target` in one transaction.
    pub fn move_blocks(&mut self, ids: &[&str], target: &str, placement: Placement) -> StoreResult<()> {
        self.check_writable()?;
        if ids.is_empty() {
            return Ok(());
        }
        self.existing(target)?;
        let new_parent = self
            .parents
            .get(target)
            .cloned()
            .ok_or_else(|| StoreError::Structural(format!("block '{target}' has no parent")))?;
        let new_parent_flavour = self.existing(&new_parent)?.flavour.clone();

        let mut moves: Vec<(String, String)> = Vec::with_capacity(ids.len());
        for &id in ids {
            let block = self.existing(id)?;
            if id == target {
                return Err(StoreError::Structural(format!(
                    "block '{id}' cannot be moved relative to itself"
                )));
            }
            if self.is_ancestor(id, target) {
                return Err(StoreError::Structural(format!(
                    "block '{id}' cannot be moved into its own subtree"
                )));
            }
            if moves.iter().any(|(moved, _)| moved == id) {
                return Err(StoreError::Structural(format!("'{id}' is listed twice")));
            }
            let parent = self
                .parents
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::Structural(format!("root block '{id}' cannot move")))?;
            self.ctx
                .registry
                .validate(&block.flavour, Some(new_parent_flavour.as_str()))?;
            moves.push((id.to_string(), parent));
        }

        self.space.transact(|txn, map| {
            for (id, parent) in &moves {
                let children = children_array(txn, map, parent)?;
                if let Some(position) = position_in(txn, &children, id) {
                    children.remove(txn, position);
                }
            }
            let children = children_array(txn, map, &new_parent)?;
            let position = position_in(txn, &children, target)
                .ok_or_else(|| StoreError::not_found("block", target))?;
            let index = match placement {
                Placement::Before => position,
                Placement::After => position + 1,
            };
            for (offset, (id, _)) in moves.iter().enumerate() {
                children.insert(txn, index + offset as u32, id.as_str());
            }
            Ok(())
        })?;

        self.process_pending()
    }

    /// Delete a block, handing its children over according to `policy`.
    pub fn delete_block(&mut self, id: &str, policy: ChildrenPolicy) -> StoreResult<()> {
        self.check_writable()?;
        let block = self.existing(id)?;
        let parent = self.parents.get(id).cloned();
        let children: Vec<String> = block.children().to_vec();

        let mut doomed = vec![id.to_string()];
        match &policy {
            ChildrenPolicy::Parent => {
                if parent.is_none() && !children.is_empty() {
                    return Err(StoreError::Structural(format!(
                        "block '{id}' has no parent to take its children"
                    )));
                }
                if let Some(parent) = &parent {
                    let parent_flavour = &self.existing(parent)?.flavour;
                    for child in &children {
                        if let Some(child_block) = self.blocks.get(child) {
                            self.ctx
                                .registry
                                .validate(&child_block.flavour, Some(parent_flavour.as_str()))?;
                        }
                    }
                }
            }
            ChildrenPolicy::To(target) => {
                let target_block = self.existing(target)?;
                if target == id || self.is_ancestor(id, target) {
                    return Err(StoreError::Structural(format!(
                        "children of '{id}' cannot move into its own subtree"
                    )));
                }
                for child in &children {
                    if let Some(child_block) = self.blocks.get(child) {
                        self.ctx
                            .registry
                            .validate(&child_block.flavour, Some(target_block.flavour.as_str()))?;
                    }
                }
            }
            ChildrenPolicy::Delete => doomed = self.subtree(id),
        }

        self.space.transact(|txn, map| {
            if let Some(parent) = &parent {
                let siblings = children_array(txn, map, parent)?;
                if let Some(position) = position_in(txn, &siblings, id) {
                    siblings.remove(txn, position);
                }
                if policy == ChildrenPolicy::Parent {
                    for (offset, child) in children.iter().enumerate() {
                        siblings.insert(txn, offset as u32, child.as_str());
                    }
                }
            }
            if let ChildrenPolicy::To(target) = &policy {
                let adopted = children_array(txn, map, target)?;
                for child in &children {
                    adopted.push_back(txn, child.as_str());
                }
            }
            for doomed_id in &doomed {
                map.remove(txn, doomed_id);
            }
            Ok(())
        })?;

        self.process_pending()
    }

    /// Remove every block.
    pub fn clear(&mut self) -> StoreResult<()> {
        self.check_writable()?;
        self.remove_all_blocks()?;
        self.process_pending()
    }

    /// Remove every block regardless of lifecycle state.
    pub(crate) fn remove_all_blocks(&self) -> StoreResult<()> {
        self.space.transact(|txn, map| {
            let keys: Vec<String> = map.keys(txn).map(str::to_string).collect();
            for key in keys {
                map.remove(txn, &key);
            }
            Ok(())
        })
    }

    // ==================== History ====================

    /// Undo the latest local step, logging instead of failing.
    pub fn undo(&mut self) {
        if let Err(e) = self.check_writable() {
            log::warn!("undo skipped: {e}");
            return;
        }
        if let Some(history) = self.history.as_mut() {
            history.undo();
        }
        if let Err(e) = self.process_pending() {
            log::warn!("reconciling undo of page '{}' failed: {e}", self.id());
        }
    }

    /// Redo the latest undone step, logging instead of failing.
    pub fn redo(&mut self) {
        if let Err(e) = self.check_writable() {
            log::warn!("redo skipped: {e}");
            return;
        }
        if let Some(history) = self.history.as_mut() {
            history.redo();
        }
        if let Err(e) = self.process_pending() {
            log::warn!("reconciling redo of page '{}' failed: {e}", self.id());
        }
    }

    /// Whether an undo step is available.
    pub fn can_undo(&self) -> bool {
        self.history.as_ref().is_some_and(History::can_undo)
    }

    /// Whether a redo step is available.
    pub fn can_redo(&self) -> bool {
        self.history.as_ref().is_some_and(History::can_redo)
    }

    /// Close the open undo step.
    pub fn capture_sync(&mut self) {
        if let Some(history) = self.history.as_mut() {
            history.capture_sync();
        }
    }

    /// Drop both history stacks.
    pub fn reset_history(&mut self) {
        if let Some(history) = self.history.as_mut() {
            history.clear();
        }
        self.flush_history();
    }

    fn flush_history(&self) {
        if let Some(history) = &self.history
            && !history.take_changes().is_empty()
        {
            self.history_updated.emit(&());
        }
    }

    // ==================== Queries ====================

    /// The primary root.
    pub fn root(&self) -> Option<&Block> {
        self.root.as_deref().and_then(|id| self.blocks.get(id))
    }

    /// The auxiliary root.
    pub fn aux_root(&self) -> Option<&Block> {
        self.aux_root.as_deref().and_then(|id| self.blocks.get(id))
    }

    /// A block by id.
    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    /// All blocks in discovery order.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    /// Materialized children of a block, in order.
    pub fn children(&self, id: &str) -> Vec<&Block> {
        self.blocks
            .get(id)
            .map(|block| {
                block
                    .children()
                    .iter()
                    .filter_map(|child| self.blocks.get(child))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Parent of a block.
    pub fn parent(&self, id: &str) -> Option<&Block> {
        self.parents.get(id).and_then(|parent| self.blocks.get(parent))
    }

    /// Sibling directly before a block.
    pub fn previous_sibling(&self, id: &str) -> Option<&Block> {
        let parent = self.parent(id)?;
        let position = parent.child_position(id)?;
        let previous = parent.children().get(position.checked_sub(1)?)?;
        self.blocks.get(previous)
    }

    /// Sibling directly after a block.
    pub fn next_sibling(&self, id: &str) -> Option<&Block> {
        let parent = self.parent(id)?;
        let position = parent.child_position(id)?;
        self.blocks.get(parent.children().get(position + 1)?)
    }

    /// Blocks of one flavour, in discovery order.
    pub fn blocks_by_flavour(&self, flavour: &str) -> Vec<&Block> {
        self.blocks
            .values()
            .filter(|block| block.flavour == flavour)
            .collect()
    }

    /// Whether the page has no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Number of materialized blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Flat JSON of the page's document state.
    pub fn serialize(&self) -> StoreResult<Value> {
        self.space.to_json()
    }

    fn is_ancestor(&self, ancestor: &str, id: &str) -> bool {
        let mut current = self.parents.get(id);
        let mut steps = 0;
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.parents.len() {
                break;
            }
            current = self.parents.get(parent);
        }
        false
    }

    fn subtree(&self, id: &str) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(block) = self.blocks.get(&current) {
                stack.extend(block.children().iter().rev().cloned());
            }
            order.push(current);
        }
        order
    }

    fn root_payload(&self) -> RootAdded {
        RootAdded {
            root: self.root.clone(),
            aux: self.aux_root.clone(),
        }
    }

    // ==================== Reconciliation ====================

    /// Reconcile every committed batch and fire the resulting signals.
    pub fn process_pending(&mut self) -> StoreResult<()> {
        if self.state != PageState::Synced {
            return Ok(());
        }
        for batch in self.space.take_batches() {
            self.apply_batch(batch)?;
        }
        self.flush_history();
        Ok(())
    }

    fn materialize_all(&mut self) -> StoreResult<()> {
        let doc = self.space.doc().clone();
        let map = self.space.map().clone();
        let txn = doc
            .try_transact()
            .map_err(|e| StoreError::State(format!("cannot read page '{}': {e}", self.id())))?;

        let mut keys: Vec<String> = map.keys(&txn).map(str::to_string).collect();
        keys.sort();
        let raw: HashMap<String, Block> = keys
            .iter()
            .filter_map(|id| read_block(&txn, &map, id).map(|block| (id.clone(), block)))
            .collect();
        let referenced: HashSet<&str> = raw
            .values()
            .flat_map(|block| block.children().iter().map(String::as_str))
            .filter(|child| raw.contains_key(*child))
            .collect();

        // Subtrees under unregistered flavours stay out of the projection.
        let mut visited = HashSet::new();
        let mut hidden: Vec<&str> = raw
            .iter()
            .filter(|(_, block)| !self.is_known(block))
            .map(|(id, _)| id.as_str())
            .collect();
        while let Some(id) = hidden.pop() {
            if visited.insert(id.to_string())
                && let Some(block) = raw.get(id)
            {
                hidden.extend(block.children().iter().map(String::as_str));
            }
        }

        let mut heads: Vec<&String> = keys
            .iter()
            .filter(|id| {
                raw.contains_key(*id)
                    && !referenced.contains(id.as_str())
                    && !visited.contains(*id)
            })
            .collect();
        heads.sort_by_key(|id| !self.is_root_role(&raw[*id].flavour));

        let mut added = Vec::new();
        for head in heads {
            self.claim_root_slot(head, &raw[head].flavour);
            self.materialize_subtree(&txn, &map, head, None, &mut visited, &mut added);
        }
        // Anything left is only reachable through a cycle.
        for id in &keys {
            if raw.contains_key(id) && !visited.contains(id) {
                log::warn!("block '{id}' is only reachable through a cycle");
                self.materialize_subtree(&txn, &map, id, None, &mut visited, &mut added);
            }
        }
        Ok(())
    }

    fn is_root_role(&self, flavour: &str) -> bool {
        self.ctx
            .registry
            .get(flavour)
            .is_some_and(|schema| schema.role == BlockRole::Root)
    }

    /// Whether the flavour of `block` is registered. Unknown ones are logged.
    fn is_known(&self, block: &Block) -> bool {
        let known = self.ctx.registry.contains(&block.flavour);
        if !known {
            log::warn!(
                "block '{}' of page '{}' has unregistered flavour '{}'; skipped",
                block.id,
                self.id(),
                block.flavour
            );
        }
        known
    }

    /// `block` with its missing declared props filled in.
    fn project(&self, mut block: Block) -> Block {
        if let Some(schema) = self.ctx.registry.get(&block.flavour) {
            fill_defaults(&mut block, &schema);
        }
        block
    }

    /// Put a parentless block into a free root slot. Returns whether it took one.
    fn claim_root_slot(&mut self, id: &str, flavour: &str) -> bool {
        if flavour == self.ctx.aux_root_flavour {
            if self.aux_root.is_none() {
                self.aux_root = Some(id.to_string());
                return true;
            }
        } else if self.root.is_none() {
            self.root = Some(id.to_string());
            return true;
        }
        log::warn!("block '{id}' has no parent and no free root slot");
        false
    }

    /// Materialize `start` and every not-yet-materialized block below it.
    fn materialize_subtree<T: ReadTxn>(
        &mut self,
        txn: &T,
        map: &MapRef,
        start: &str,
        parent: Option<&str>,
        visited: &mut HashSet<String>,
        added: &mut Vec<String>,
    ) {
        let mut stack: Vec<(String, Option<String>)> =
            vec![(start.to_string(), parent.map(str::to_string))];
        while let Some((id, parent)) = stack.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }
            if let Some(parent) = &parent {
                self.parents.insert(id.clone(), parent.clone());
            }
            if self.blocks.contains_key(&id) {
                continue;
            }
            let Some(block) = read_block(txn, map, &id) else {
                log::debug!("block '{id}' not yet arrived");
                self.parents.remove(&id);
                continue;
            };
            if !self.is_known(&block) {
                self.parents.remove(&id);
                continue;
            }
            let block = self.project(block);
            for child in block.children().iter().rev() {
                stack.push((child.clone(), Some(id.clone())));
            }
            self.blocks.insert(id.clone(), block);
            added.push(id);
        }
    }

    fn apply_batch(&mut self, batch: ChangeBatch) -> StoreResult<()> {
        let sorted = Sorted::from_batch(batch);
        let doc = self.space.doc().clone();
        let map = self.space.map().clone();
        let txn = doc
            .try_transact()
            .map_err(|e| StoreError::State(format!("cannot read page '{}': {e}", self.id())))?;

        let mut notices = Vec::new();
        let mut visited = HashSet::new();
        let mut added = Vec::new();
        let mut orphaned = Vec::new();
        let roots_before = self.root_payload();

        // Removals.
        for id in &sorted.removed {
            let Some(block) = self.blocks.shift_remove(id) else {
                continue;
            };
            self.parents.remove(id);
            orphaned.extend(block.children().iter().cloned());
            if self.root.as_deref() == Some(id.as_str()) {
                self.root = None;
                notices.push(Notice::RootDeleted(id.clone()));
            }
            if self.aux_root.as_deref() == Some(id.as_str()) {
                self.aux_root = None;
                notices.push(Notice::RootDeleted(id.clone()));
            }
            self.ctx.indexer.remove_block(self.id(), id);
            notices.push(Notice::BlockDeleted(id.clone()));
        }

        // Children lists of existing blocks.
        for id in &sorted.children {
            if !self.blocks.contains_key(id) {
                continue;
            }
            let Some(fresh) = read_block(&txn, &map, id) else {
                continue;
            };
            let previous: Vec<String> = self.blocks[id].children().to_vec();
            let children = fresh.children().to_vec();
            for child in &previous {
                if !children.contains(child) && self.parents.get(child) == Some(id) {
                    self.parents.remove(child);
                }
            }
            if let Some(block) = self.blocks.get_mut(id) {
                block.set_children(children.clone());
            }
            for child in &children {
                if self.blocks.contains_key(child) {
                    self.parents.insert(child.clone(), id.clone());
                } else {
                    self.materialize_subtree(&txn, &map, child, Some(id.as_str()), &mut visited, &mut added);
                }
            }
            notices.push(Notice::Children(ChildrenUpdated {
                id: id.clone(),
                children,
            }));
        }

        // Children of removed blocks that nobody adopted are detached.
        for child in orphaned {
            if let Some(parent) = self.parents.get(&child)
                && !self.blocks.contains_key(parent)
            {
                self.parents.remove(&child);
            }
        }

        // Additions: parentless-in-batch heads first, root flavours before others.
        let fresh: Vec<(String, Block)> = sorted
            .added
            .iter()
            .filter(|id| !self.blocks.contains_key(*id))
            .filter_map(|id| read_block(&txn, &map, id).map(|block| (id.clone(), block)))
            .filter(|(_, block)| self.is_known(block))
            .collect();
        let referenced: HashSet<&str> = fresh
            .iter()
            .flat_map(|(_, block)| block.children().iter().map(String::as_str))
            .collect();
        let mut heads: Vec<&(String, Block)> = fresh
            .iter()
            .filter(|(id, _)| !referenced.contains(id.as_str()))
            .collect();
        heads.sort_by_key(|(_, block)| !self.is_root_role(&block.flavour));
        let pending: Vec<&(String, Block)> = heads
            .into_iter()
            .chain(fresh.iter().filter(|(id, _)| referenced.contains(id.as_str())))
            .collect();

        for (id, block) in pending {
            if self.blocks.contains_key(id) {
                continue;
            }
            let parent = self
                .blocks
                .values()
                .find(|candidate| candidate.has_child(id))
                .map(|candidate| candidate.id.clone());
            if parent.is_none() {
                if let Some(owner) = listed_by(&txn, &map, id) {
                    log::warn!("block '{id}' sits under '{owner}', which is not in the tree; skipped");
                    continue;
                }
                self.claim_root_slot(id, &block.flavour);
            }
            self.materialize_subtree(&txn, &map, id, parent.as_deref(), &mut visited, &mut added);
        }

        for id in &added {
            if let Some(block) = self.blocks.get(id) {
                self.ctx.indexer.index_block(self.id(), block);
            }
            notices.push(Notice::BlockAdded(id.clone()));
        }
        let roots_after = self.root_payload();
        if roots_after != roots_before
            && (roots_after.root.is_some() && roots_after.root != roots_before.root
                || roots_after.aux.is_some() && roots_after.aux != roots_before.aux)
        {
            notices.push(Notice::RootAdded);
        }

        // Field updates of blocks that were already live.
        for (id, keys) in &sorted.fields {
            if added.contains(id) || !self.blocks.contains_key(id) {
                continue;
            }
            let Some(fresh) = read_block(&txn, &map, id) else {
                continue;
            };
            let fresh = self.project(fresh);
            if let Some(block) = self.blocks.get_mut(id) {
                block.props = fresh.props;
                block.meta = fresh.meta;
                self.ctx.indexer.index_block(self.space.id(), block);
                notices.push(Notice::Props(PropsUpdated {
                    id: id.clone(),
                    keys: keys.clone(),
                    props: block.props_json(),
                    meta: block.meta.clone(),
                }));
            }
        }

        // Text deltas.
        for (id, prop, ops) in sorted.texts {
            if added.contains(&id) || !self.blocks.contains_key(&id) {
                continue;
            }
            let Ok(text) = text_field(&txn, &map, &id, &prop) else {
                log::warn!("text delta for missing text '{prop}' of '{id}'");
                continue;
            };
            let content = text.get_string(&txn);
            if let Some(block) = self.blocks.get_mut(&id) {
                block
                    .props
                    .insert(prop.clone(), Prop::Text(content.clone()));
                self.ctx.indexer.index_block(self.space.id(), block);
            }
            notices.push(Notice::Text(TextUpdated {
                id,
                prop,
                ops,
                text: content,
            }));
        }
        drop(txn);

        self.emit(notices);
        Ok(())
    }

    fn emit(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::BlockAdded(id) => self.block_added.emit(&id),
                Notice::BlockDeleted(id) => self.block_deleted.emit(&id),
                Notice::RootAdded => self.root_added.emit(&self.root_payload()),
                Notice::RootDeleted(id) => self.root_deleted.emit(&id),
                Notice::Props(payload) => self.props_updated.emit(&payload),
                Notice::Children(payload) => self.children_updated.emit(&payload),
                Notice::Text(payload) => self.text_updated.emit(&payload),
            }
        }
    }
}

fn write_block(
    txn: &mut TransactionMut,
    map: &MapRef,
    id: &str,
    schema: &BlockSchema,
    props: &Props,
) {
    let fields = map.insert(txn, id, MapPrelim::default());
    fields.insert(txn, SYS_ID, id);
    fields.insert(txn, SYS_FLAVOUR, schema.flavour.as_str());
    fields.insert(txn, SYS_CHILDREN, ArrayPrelim::default());
    for (name, value) in schema.initial_props(props) {
        write_prop(txn, &fields, &name, &value, schema.is_text_prop(&name));
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id())
            .field("state", &self.state)
            .field("blocks", &self.blocks.len())
            .field("root", &self.root)
            .field("aux_root", &self.aux_root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::{Cursor, LocalAwareness};
    use crate::ids::AutoIncrement;
    use crate::indexer::MemoryIndexer;
    use crate::meta::MetaStore;
    use serde_json::json;
    use std::sync::Mutex;

    struct Fixture {
        doc: Doc,
        meta: MetaStore,
        awareness: Arc<LocalAwareness>,
        ctx: StoreContext,
    }

    fn fixture() -> Fixture {
        let doc = Doc::new();
        let actor = ActorId::new("alice");
        let awareness = Arc::new(LocalAwareness::new());
        let ctx = StoreContext {
            actor: actor.clone(),
            registry: Arc::new(SchemaRegistry::with_presets()),
            id_generator: Arc::new(AutoIncrement::new()),
            awareness: awareness.clone(),
            indexer: Arc::new(MemoryIndexer::new()),
            aux_root_flavour: "surface".into(),
            capture_timeout_ms: crate::config::DEFAULT_CAPTURE_TIMEOUT_MS,
        };
        let meta = MetaStore::new(&doc, actor).unwrap();
        Fixture {
            doc,
            meta,
            awareness,
            ctx,
        }
    }

    fn synced(fx: &mut Fixture) -> Page {
        let mut page = Page::new(&fx.doc, "page0", fx.ctx.clone());
        page.sync_from_existing_doc(&mut fx.meta).unwrap();
        page
    }

    fn paragraph(page: &mut Page, parent: &str, text: &str) -> String {
        let mut props = Props::new();
        props.insert("text".into(), json!(text));
        page.add_block("paragraph", props, Some(parent), None).unwrap()
    }

    #[test]
    fn test_new_page_is_empty_after_sync() {
        let mut fx = fixture();
        let page = synced(&mut fx);
        assert_eq!(page.state(), PageState::Synced);
        assert!(page.is_empty());
        assert!(!fx.meta.versions().unwrap().is_empty());
    }

    #[test]
    fn test_second_sync_is_state_error() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let root = page.add_block("page", Props::new(), None, None).unwrap();

        let err = page.sync_from_existing_doc(&mut fx.meta).unwrap_err();
        assert!(matches!(err, StoreError::State(_)));
        assert_eq!(page.root().unwrap().id, root);
        assert_eq!(page.block_count(), 1);
    }

    #[test]
    fn test_add_root_and_child() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let added = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&added);
        page.block_added.on(move |id| sink.lock().unwrap().push(id.clone()));

        let root = page.add_block("page", Props::new(), None, None).unwrap();
        let child = paragraph(&mut page, &root, "hello");

        assert_eq!(page.root().unwrap().children(), [child.clone()]);
        assert_eq!(page.parent(&child).unwrap().id, root);
        assert_eq!(page.block(&child).unwrap().text("text"), Some("hello"));
        assert_eq!(*added.lock().unwrap(), vec![root, child]);
    }

    #[test]
    fn test_add_block_validation() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);

        assert!(matches!(
            page.add_block("", Props::new(), None, None),
            Err(StoreError::Structural(_))
        ));
        assert!(matches!(
            page.add_block("unknown", Props::new(), None, None),
            Err(StoreError::NotFound { kind: "flavour", .. })
        ));
        assert!(matches!(
            page.add_block("paragraph", Props::new(), None, None),
            Err(StoreError::Structural(_))
        ));
        assert!(matches!(
            page.add_block("surface", Props::new(), None, None),
            Err(StoreError::Structural(_))
        ));

        let root = page.add_block("page", Props::new(), None, None).unwrap();
        assert!(matches!(
            page.add_block("page", Props::new(), None, None),
            Err(StoreError::Structural(_))
        ));
        assert!(matches!(
            page.add_block("paragraph", Props::new(), Some("missing"), None),
            Err(StoreError::NotFound { kind: "block", .. })
        ));
        assert!(matches!(
            page.add_block("paragraph", Props::new(), Some(root.as_str()), Some(5)),
            Err(StoreError::Structural(_))
        ));
        assert_eq!(page.block_count(), 1);
    }

    #[test]
    fn test_aux_root_slot() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let roots = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&roots);
        page.root_added.on(move |payload| sink.lock().unwrap().push(payload.clone()));

        let root = page.add_block("page", Props::new(), None, None).unwrap();
        let surface = page.add_block("surface", Props::new(), None, None).unwrap();

        assert_eq!(page.aux_root().unwrap().id, surface);
        assert!(page.parent(&surface).is_none());
        let roots = roots.lock().unwrap();
        assert_eq!(roots.len(), 2);
        assert_eq!(
            roots[1],
            RootAdded {
                root: Some(root),
                aux: Some(surface)
            }
        );
    }

    #[test]
    fn test_insert_block_before_and_after() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let root = page.add_block("page", Props::new(), None, None).unwrap();
        let b = paragraph(&mut page, &root, "b");

        let a = page
            .insert_block("paragraph", Props::new(), &b, Placement::Before)
            .unwrap();
        let c = page
            .insert_block("paragraph", Props::new(), &b, Placement::After)
            .unwrap();

        assert_eq!(page.root().unwrap().children(), [a.clone(), b.clone(), c.clone()]);
        assert_eq!(page.previous_sibling(&b).unwrap().id, a);
        assert_eq!(page.next_sibling(&b).unwrap().id, c);
        assert!(page.next_sibling(&c).is_none());
    }

    #[test]
    fn test_delete_with_parent_policy_prepends_children() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let root = page.add_block("page", Props::new(), None, None).unwrap();
        let existing = paragraph(&mut page, &root, "existing");
        let doomed = page
            .add_block("paragraph", Props::new(), Some(root.as_str()), Some(0))
            .unwrap();
        let c1 = paragraph(&mut page, &doomed, "c1");
        let c2 = paragraph(&mut page, &doomed, "c2");

        page.delete_block(&doomed, ChildrenPolicy::Parent).unwrap();

        assert!(page.block(&doomed).is_none());
        assert_eq!(
            page.root().unwrap().children(),
            [c1.clone(), c2.clone(), existing]
        );
        assert_eq!(page.parent(&c1).unwrap().id, root);
    }

    #[test]
    fn test_delete_to_explicit_block() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let root = page.add_block("page", Props::new(), None, None).unwrap();
        let keeper = paragraph(&mut page, &root, "keeper");
        let kept_child = paragraph(&mut page, &keeper, "old");
        let doomed = paragraph(&mut page, &root, "doomed");
        let c1 = paragraph(&mut page, &doomed, "c1");

        page.delete_block(&doomed, ChildrenPolicy::To(keeper.clone()))
            .unwrap();

        assert_eq!(page.block(&keeper).unwrap().children(), [kept_child, c1.clone()]);
        assert_eq!(page.parent(&c1).unwrap().id, keeper);
    }

    #[test]
    fn test_delete_subtree() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let root = page.add_block("page", Props::new(), None, None).unwrap();
        let doomed = paragraph(&mut page, &root, "doomed");
        let child = paragraph(&mut page, &doomed, "child");

        page.delete_block(&doomed, ChildrenPolicy::Delete).unwrap();

        assert!(page.block(&child).is_none());
        assert_eq!(page.block_count(), 1);
        let json = page.serialize().unwrap();
        assert!(json.get(&child).is_none());
    }

    #[test]
    fn test_delete_root_with_children_needs_policy() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let root = page.add_block("page", Props::new(), None, None).unwrap();
        paragraph(&mut page, &root, "x");

        assert!(matches!(
            page.delete_block(&root, ChildrenPolicy::Parent),
            Err(StoreError::Structural(_))
        ));

        let deleted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&deleted);
        page.root_deleted.on(move |id| sink.lock().unwrap().push(id.clone()));
        page.delete_block(&root, ChildrenPolicy::Delete).unwrap();

        assert!(page.is_empty());
        assert!(page.root().is_none());
        assert_eq!(*deleted.lock().unwrap(), vec![root]);
    }

    #[test]
    fn test_move_blocks() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let root = page.add_block("page", Props::new(), None, None).unwrap();
        let a = paragraph(&mut page, &root, "a");
        let b = paragraph(&mut page, &root, "b");
        let c = paragraph(&mut page, &root, "c");
        let nested = paragraph(&mut page, &a, "nested");

        page.move_block(&c, &a, Placement::Before).unwrap();
        assert_eq!(page.root().unwrap().children(), [c.clone(), a.clone(), b.clone()]);

        page.move_blocks(&[c.as_str(), b.as_str()], &nested, Placement::After).unwrap();
        assert_eq!(page.block(&a).unwrap().children(), [nested.clone(), c.clone(), b.clone()]);
        assert_eq!(page.root().unwrap().children(), [a.clone()]);
        assert_eq!(page.parent(&b).unwrap().id, a);
    }

    #[test]
    fn test_move_rejects_self_and_cycles() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let root = page.add_block("page", Props::new(), None, None).unwrap();
        let a = paragraph(&mut page, &root, "a");
        let nested = paragraph(&mut page, &a, "nested");

        assert!(matches!(
            page.move_block(&a, &a, Placement::After),
            Err(StoreError::Structural(_))
        ));
        assert!(matches!(
            page.move_block(&a, &nested, Placement::After),
            Err(StoreError::Structural(_))
        ));
    }

    #[test]
    fn test_update_props_and_text() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let root = page.add_block("page", Props::new(), None, None).unwrap();
        let p = paragraph(&mut page, &root, "hello world");

        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        page.props_updated.on(move |payload| sink.lock().unwrap().push(payload.clone()));
        let texts = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&texts);
        page.text_updated.on(move |payload| sink.lock().unwrap().push(payload.clone()));

        let mut props = Props::new();
        props.insert("type".into(), json!("h1"));
        props.insert("text".into(), json!("hello there world"));
        page.update_block(&p, BlockUpdate::props(props)).unwrap();

        let block = page.block(&p).unwrap();
        assert_eq!(block.prop("type"), Some(&crate::block::Prop::Json(json!("h1"))));
        assert_eq!(block.text("text"), Some("hello there world"));

        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].keys, vec!["prop:type".to_string()]);

        let texts = texts.lock().unwrap();
        assert_eq!(texts.len(), 1);
        assert_eq!(texts[0].text, "hello there world");
        assert_eq!(
            texts[0].ops,
            vec![TextOp::Retain(6), TextOp::Insert("there ".into())]
        );
    }

    #[test]
    fn test_insert_and_delete_text() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let root = page.add_block("page", Props::new(), None, None).unwrap();
        let p = paragraph(&mut page, &root, "héllo");

        page.insert_text(&p, "text", 5, "!").unwrap();
        page.delete_text(&p, "text", 0, 2).unwrap();
        assert_eq!(page.block(&p).unwrap().text("text"), Some("llo!"));

        assert!(matches!(
            page.insert_text(&p, "type", 0, "x"),
            Err(StoreError::Structural(_))
        ));
        assert!(matches!(
            page.delete_text(&p, "text", 3, 10),
            Err(StoreError::Structural(_))
        ));
    }

    #[test]
    fn test_children_replacement() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let root = page.add_block("page", Props::new(), None, None).unwrap();
        let a = paragraph(&mut page, &root, "a");
        let b = paragraph(&mut page, &root, "b");

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        page.children_updated.on(move |payload| sink.lock().unwrap().push(payload.clone()));

        let update = BlockUpdate {
            children: Some(vec![b.clone(), a.clone()]),
            ..BlockUpdate::default()
        };
        page.update_block(&root, update).unwrap();

        assert_eq!(page.root().unwrap().children(), [b.clone(), a.clone()]);
        assert_eq!(events.lock().unwrap().len(), 1);

        let cyclic = BlockUpdate {
            children: Some(vec![root.clone()]),
            ..BlockUpdate::default()
        };
        assert!(matches!(
            page.update_block(&a, cyclic),
            Err(StoreError::Structural(_))
        ));
    }

    #[test]
    fn test_children_replacement_rejects_root_slots() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let root = page.add_block("page", Props::new(), None, None).unwrap();
        let surface = page.add_block("surface", Props::new(), None, None).unwrap();

        let adopt_aux = BlockUpdate {
            children: Some(vec![surface.clone()]),
            ..BlockUpdate::default()
        };
        assert!(matches!(
            page.update_block(&root, adopt_aux),
            Err(StoreError::Structural(_))
        ));
        let adopt_root = BlockUpdate {
            children: Some(vec![root.clone()]),
            ..BlockUpdate::default()
        };
        assert!(matches!(
            page.update_block(&surface, adopt_root),
            Err(StoreError::Structural(_))
        ));

        assert_eq!(page.root().unwrap().id, root);
        assert_eq!(page.aux_root().unwrap().id, surface);
        assert!(page.root().unwrap().children().is_empty());
        assert!(page.parent(&surface).is_none());
        assert_eq!(page.serialize().unwrap()[&root]["sys:children"], json!([]));
    }

    /// Write a bare block map under `parent` the way another replica would.
    fn write_foreign_block(fx: &Fixture, page: &Page, id: &str, flavour: &str, parent: &str) {
        let map = page.space().map().clone();
        let mut txn = fx.doc.transact_mut_with(ActorId::new("bob").origin());
        let fields = map.insert(&mut txn, id, MapPrelim::default());
        fields.insert(&mut txn, SYS_ID, id);
        fields.insert(&mut txn, SYS_FLAVOUR, flavour);
        fields.insert(&mut txn, SYS_CHILDREN, ArrayPrelim::default());
        if let Some(Out::YMap(parent_fields)) = map.get(&txn, parent)
            && let Some(Out::YArray(children)) = parent_fields.get(&txn, SYS_CHILDREN)
        {
            children.push_back(&mut txn, id);
        }
    }

    #[test]
    fn test_unregistered_flavour_is_left_out() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let root = page.add_block("page", Props::new(), None, None).unwrap();
        let added = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&added);
        page.block_added.on(move |id| sink.lock().unwrap().push(id.clone()));

        write_foreign_block(&fx, &page, "custom0", "custom", &root);
        page.process_pending().unwrap();

        assert!(page.block("custom0").is_none());
        assert!(page.parent("custom0").is_none());
        assert!(page.children(&root).is_empty());
        assert_eq!(page.root().unwrap().children(), ["custom0".to_string()]);
        assert!(added.lock().unwrap().is_empty());

        // Blocks below it stay out too, and never take a root slot.
        write_foreign_block(&fx, &page, "inner", "paragraph", "custom0");
        page.process_pending().unwrap();
        assert!(page.block("inner").is_none());
        assert_eq!(page.root().unwrap().id, root);
        assert!(added.lock().unwrap().is_empty());

        let mut reloaded = Page::new(&fx.doc, "page0", fx.ctx.clone());
        reloaded.sync_from_existing_doc(&mut fx.meta).unwrap();
        assert_eq!(reloaded.root().unwrap().id, root);
        assert!(reloaded.block("custom0").is_none());
        assert!(reloaded.block("inner").is_none());
        assert_eq!(reloaded.block_count(), 1);
    }

    #[test]
    fn test_missing_declared_props_read_as_defaults() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let root = page.add_block("page", Props::new(), None, None).unwrap();

        write_foreign_block(&fx, &page, "bare", "paragraph", &root);
        page.process_pending().unwrap();

        let block = page.block("bare").unwrap();
        assert_eq!(block.text("text"), Some(""));
        assert_eq!(block.prop("type"), Some(&Prop::Json(json!("text"))));
        assert_eq!(page.parent("bare").unwrap().id, root);
        // Defaults live in the projection only.
        assert!(page.serialize().unwrap()["bare"].get("prop:type").is_none());
    }

    #[test]
    fn test_first_use_of_a_flavour_stamps_the_ledger() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let root = page.add_block("page", Props::new(), None, None).unwrap();
        assert!(!fx.meta.versions().unwrap().contains_key("custom"));

        fx.ctx
            .registry
            .register(BlockSchema::new("custom", 3, BlockRole::Content));
        page.capture_sync();
        let custom = page
            .add_block("custom", Props::new(), Some(root.as_str()), None)
            .unwrap();
        assert_eq!(fx.meta.versions().unwrap().get("custom"), Some(&3));

        page.undo();
        assert!(page.block(&custom).is_none());
        assert_eq!(fx.meta.versions().unwrap().get("custom"), Some(&3));
    }

    #[test]
    fn test_read_only_rejects_mutations() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let root = page.add_block("page", Props::new(), None, None).unwrap();
        fx.awareness.set_readonly("page0", true);

        assert!(matches!(
            page.add_block("paragraph", Props::new(), Some(root.as_str()), None),
            Err(StoreError::ReadOnly(_))
        ));
        let mut props = Props::new();
        props.insert("title".into(), json!("nope"));
        page.set_props(&root, props);
        page.undo();

        assert_eq!(page.block_count(), 1);
        assert_eq!(page.root().unwrap().text("title"), Some(""));
    }

    #[test]
    fn test_undo_redo_restores_tree_and_cursor() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let root = page.add_block("page", Props::new(), None, None).unwrap();
        page.capture_sync();

        let history_events = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&history_events);
        page.history_updated.on(move |_| *sink.lock().unwrap() += 1);

        fx.awareness.set_local_cursor(Some(Cursor::caret(root.as_str(), 0)));
        let child = paragraph(&mut page, &root, "x");
        fx.awareness.set_local_cursor(None);

        assert!(page.can_undo());
        page.undo();
        assert!(page.block(&child).is_none());
        assert_eq!(page.root().unwrap().children().len(), 0);
        assert_eq!(fx.awareness.local_cursor(), Some(Cursor::caret(root.as_str(), 0)));

        assert!(page.can_redo());
        page.redo();
        assert_eq!(page.root().unwrap().children(), [child]);
        assert!(*history_events.lock().unwrap() >= 3);
    }

    #[test]
    fn test_clear_and_dispose() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let root = page.add_block("page", Props::new(), None, None).unwrap();
        paragraph(&mut page, &root, "x");

        page.clear().unwrap();
        assert!(page.is_empty());
        assert!(page.space().is_empty().unwrap());

        let disposed = Arc::new(Mutex::new(false));
        let sink = Arc::clone(&disposed);
        page.disposed.on(move |_| *sink.lock().unwrap() = true);
        page.dispose();

        assert!(*disposed.lock().unwrap());
        assert_eq!(page.state(), PageState::Disposed);
        assert!(matches!(
            page.add_block("page", Props::new(), None, None),
            Err(StoreError::State(_))
        ));
    }

    #[test]
    fn test_serialize_layout() {
        let mut fx = fixture();
        let mut page = synced(&mut fx);
        let root = page.add_block("page", Props::new(), None, None).unwrap();
        let child = page
            .add_block("paragraph", Props::new(), Some(root.as_str()), None)
            .unwrap();

        let json = page.serialize().unwrap();
        assert_eq!(json[&root]["sys:children"], json!([child.clone()]));
        assert_eq!(json[&child]["sys:flavour"], json!("paragraph"));
        assert_eq!(json[&child]["sys:id"], json!(child));
        assert_eq!(json[&child]["prop:type"], json!("text"));
    }

    #[test]
    fn test_byte_offset() {
        assert_eq!(byte_offset("héllo", 0), Some(0));
        assert_eq!(byte_offset("héllo", 2), Some(3));
        assert_eq!(byte_offset("héllo", 5), Some(6));
        assert_eq!(byte_offset("héllo", 6), None);
    }
}
