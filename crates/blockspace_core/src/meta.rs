//! Workspace metadata space.
//!
//! This module provides [`MetaStore`], which keeps the workspace-wide state in
//! the `space:meta` root map and two root-level collections next to it:
//!
//! ```text
//! Y.Map "space:meta"
//! ├── "name"             → "My workspace"
//! ├── "avatar"           → "blob-key"
//! ├── "workspaceVersion" → 1
//! └── "pageVersion"      → 2
//! Y.Array "meta:pages"   → [Y.Map { id, title, createDate, ... }]
//! Y.Map "meta:versions"  → { "page": 2, "paragraph": 1, ... }
//! ```
//!
//! The page index and the version ledger are root-level types. Replicas that
//! write them for the first time concurrently merge their entries; a nested
//! collection under a map key would keep only one replica's copy.
//!
//! # Page index diffing
//!
//! After every committed transaction touching the page index, the store
//! compares the previous and current page id sets and reports the difference
//! as a [`PagesDiff`]. The workspace turns that diff into page stores and
//! fires `page_added` / `page_removed` once the stores are ready or gone.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;
use yrs::{
    Any, Array, ArrayRef, DeepObservable, Doc, Map, MapPrelim, MapRef, Out, ReadTxn,
    Subscription, TransactionMut,
};

use crate::error::{StoreError, StoreResult};
use crate::ids::ActorId;
use crate::schema::SchemaRegistry;
use crate::signal::Signal;
use crate::space::Space;
use crate::value::{json_to_any, out_as_string, out_to_json};

/// Logical id of the metadata space.
pub const META_SPACE_ID: &str = "meta";

/// Root array holding the page index.
pub const PAGES_ROOT: &str = "meta:pages";

/// Root map holding the per-flavour version ledger.
pub const VERSIONS_ROOT: &str = "meta:versions";

const NAME_KEY: &str = "name";
const AVATAR_KEY: &str = "avatar";
const WORKSPACE_VERSION_KEY: &str = "workspaceVersion";
const PAGE_VERSION_KEY: &str = "pageVersion";

/// Layout version of the metadata space written by this crate.
pub const WORKSPACE_FORMAT_VERSION: u32 = 1;

/// Layout version of page spaces written by this crate.
pub const PAGE_FORMAT_VERSION: u32 = 2;

/// Entry of the page index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageDescriptor {
    /// Page id
    pub id: String,
    /// Display title
    #[serde(default)]
    pub title: String,
    /// Creation time (Unix milliseconds)
    #[serde(default)]
    pub create_date: i64,
    /// Extension fields
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl PageDescriptor {
    /// A descriptor with an empty title, created now.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            create_date: chrono::Utc::now().timestamp_millis(),
            extra: IndexMap::new(),
        }
    }

    /// Set the title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    fn to_fields(&self) -> StoreResult<serde_json::Map<String, Value>> {
        match serde_json::to_value(self) {
            Ok(Value::Object(fields)) => Ok(fields),
            Ok(_) => Err(StoreError::Structural("page descriptor is not an object".into())),
            Err(e) => Err(StoreError::Structural(format!(
                "page descriptor cannot be serialized: {e}"
            ))),
        }
    }
}

/// Page ids added to and removed from the index by one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PagesDiff {
    /// Newly described pages, in index order
    pub added: Vec<String>,
    /// Pages no longer described
    pub removed: Vec<String>,
}

impl PagesDiff {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Per-flavour schema version ledger of a document.
///
/// Pages call into the ledger from `sync_from_existing_doc`: a new page
/// stamps it, an existing page validates against it.
pub trait VersionLedger {
    /// Stamp format versions and every registered flavour's version where
    /// absent.
    fn write_version(&mut self, registry: &SchemaRegistry) -> StoreResult<()>;

    /// Compare the ledger against the registry.
    fn validate_version(&self, registry: &SchemaRegistry) -> StoreResult<()>;
}

/// Workspace metadata store.
pub struct MetaStore {
    space: Space,
    pages: ArrayRef,
    ledger: MapRef,
    pages_changed: Arc<AtomicBool>,
    pages_subscription: Option<Subscription>,
    known_pages: Vec<String>,
    /// A page store was instantiated and synced
    pub page_added: Signal<String>,
    /// A page store was disposed
    pub page_removed: Signal<String>,
    /// The page index changed
    pub pages_updated: Signal<()>,
    /// `name` or `avatar` changed
    pub common_fields_updated: Signal<()>,
}

fn read_u32(value: &Out) -> Option<u32> {
    match value {
        Out::Any(Any::Number(n))
            if *n >= 0.0 && n.fract() == 0.0 && *n <= f64::from(u32::MAX) =>
        {
            Some(*n as u32)
        }
        Out::Any(Any::BigInt(n)) => u32::try_from(*n).ok(),
        _ => None,
    }
}

/// The version ledger root of `doc`.
///
/// Must be called while no transaction is open on `doc`.
pub(crate) fn ledger_map(doc: &Doc) -> MapRef {
    doc.get_or_insert_map(VERSIONS_ROOT)
}

/// Record `version` for `flavour` unless the ledger already has an entry.
pub(crate) fn stamp_flavour(
    txn: &mut TransactionMut,
    ledger: &MapRef,
    flavour: &str,
    version: u32,
) -> bool {
    if ledger.get(txn, flavour).is_some() {
        return false;
    }
    ledger.insert(txn, flavour, Any::Number(f64::from(version)));
    true
}

fn descriptor_id<T: ReadTxn>(txn: &T, entry: &Out) -> Option<String> {
    match entry {
        Out::YMap(fields) => fields.get(txn, "id").and_then(|id| out_as_string(txn, &id)),
        _ => None,
    }
}

fn find_page<T: ReadTxn>(txn: &T, pages: &ArrayRef, id: &str) -> Option<(u32, MapRef)> {
    pages
        .iter(txn)
        .enumerate()
        .find_map(|(index, entry)| match entry {
            Out::YMap(fields)
                if fields
                    .get(txn, "id")
                    .and_then(|v| out_as_string(txn, &v))
                    .as_deref()
                    == Some(id) =>
            {
                Some((index as u32, fields))
            }
            _ => None,
        })
}

fn read_page_ids<T: ReadTxn>(txn: &T, pages: &ArrayRef) -> Vec<String> {
    pages
        .iter(txn)
        .filter_map(|entry| descriptor_id(txn, &entry))
        .collect()
}

impl MetaStore {
    /// Bind the metadata space of `doc` and start observing it.
    pub fn new(doc: &Doc, actor: ActorId) -> StoreResult<Self> {
        let mut space = Space::new(doc, META_SPACE_ID, actor);
        let pages = doc.get_or_insert_array(PAGES_ROOT);
        let ledger = ledger_map(doc);
        let known_pages = space.read(|txn, _| read_page_ids(txn, &pages))?;
        space.observe();

        let pages_changed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&pages_changed);
        let pages_subscription = pages.observe_deep(move |_, _| {
            flag.store(true, Ordering::SeqCst);
        });

        Ok(Self {
            space,
            pages,
            ledger,
            pages_changed,
            pages_subscription: Some(pages_subscription),
            known_pages,
            page_added: Signal::new(),
            page_removed: Signal::new(),
            pages_updated: Signal::new(),
            common_fields_updated: Signal::new(),
        })
    }

    /// The underlying space.
    pub fn space(&self) -> &Space {
        &self.space
    }

    // ==================== Page index ====================

    /// Add a descriptor at `index` (default: end) in one transaction.
    pub fn add_page_descriptor(
        &self,
        descriptor: PageDescriptor,
        index: Option<usize>,
    ) -> StoreResult<()> {
        let fields = descriptor.to_fields()?;
        let pages = &self.pages;
        self.space.transact(|txn, _| {
            if find_page(txn, pages, &descriptor.id).is_some() {
                return Err(StoreError::AlreadyExists(descriptor.id.clone()));
            }
            let len = pages.len(txn) as usize;
            let index = index.unwrap_or(len);
            if index > len {
                return Err(StoreError::Structural(format!(
                    "page index {index} is out of bounds (len {len})"
                )));
            }

            let entry = pages.insert(txn, index as u32, MapPrelim::default());
            for (key, value) in &fields {
                entry.insert(txn, key.as_str(), json_to_any(value));
            }
            Ok(())
        })
    }

    /// Merge `partial` into a descriptor in one transaction.
    pub fn set_page_descriptor(&self, id: &str, partial: &IndexMap<String, Value>) -> StoreResult<()> {
        if let Some(new_id) = partial.get("id")
            && new_id.as_str() != Some(id)
        {
            return Err(StoreError::Structural(format!(
                "page '{id}' cannot change its id"
            )));
        }
        let pages = &self.pages;
        self.space.transact(|txn, _| {
            let (_, entry) =
                find_page(txn, pages, id).ok_or_else(|| StoreError::not_found("page", id))?;
            for (key, value) in partial {
                entry.insert(txn, key.as_str(), json_to_any(value));
            }
            Ok(())
        })
    }

    /// Remove a descriptor by deleting its index position.
    pub fn remove_page_descriptor(&self, id: &str) -> StoreResult<()> {
        let pages = &self.pages;
        self.space.transact(|txn, _| {
            let (index, _) =
                find_page(txn, pages, id).ok_or_else(|| StoreError::not_found("page", id))?;
            pages.remove(txn, index);
            Ok(())
        })
    }

    /// Ordered snapshot of the page index.
    pub fn page_descriptors(&self) -> StoreResult<Vec<PageDescriptor>> {
        self.space.read(|txn, _| {
            self.pages
                .iter(txn)
                .filter_map(|entry| {
                    let json = out_to_json(txn, &entry);
                    match serde_json::from_value::<PageDescriptor>(json) {
                        Ok(descriptor) => Some(descriptor),
                        Err(e) => {
                            log::warn!("skipping malformed page descriptor: {e}");
                            None
                        }
                    }
                })
                .collect()
        })
    }

    /// A single descriptor.
    pub fn page_descriptor(&self, id: &str) -> StoreResult<Option<PageDescriptor>> {
        Ok(self
            .page_descriptors()?
            .into_iter()
            .find(|descriptor| descriptor.id == id))
    }

    /// Ids of all described pages, in index order.
    pub fn page_ids(&self) -> StoreResult<Vec<String>> {
        self.space.read(|txn, _| read_page_ids(txn, &self.pages))
    }

    // ==================== Common fields ====================

    /// Set the workspace name.
    pub fn set_name(&self, name: &str) -> StoreResult<()> {
        self.space.transact(|txn, map| {
            map.insert(txn, NAME_KEY, name);
            Ok(())
        })
    }

    /// Set the workspace avatar (a blob key).
    pub fn set_avatar(&self, avatar: &str) -> StoreResult<()> {
        self.space.transact(|txn, map| {
            map.insert(txn, AVATAR_KEY, avatar);
            Ok(())
        })
    }

    /// The workspace name.
    pub fn name(&self) -> StoreResult<Option<String>> {
        self.read_string(NAME_KEY)
    }

    /// The workspace avatar.
    pub fn avatar(&self) -> StoreResult<Option<String>> {
        self.read_string(AVATAR_KEY)
    }

    fn read_string(&self, key: &str) -> StoreResult<Option<String>> {
        self.space
            .read(|txn, map| map.get(txn, key).and_then(|v| out_as_string(txn, &v)))
    }

    /// The stored flavour ledger.
    pub fn versions(&self) -> StoreResult<IndexMap<String, u32>> {
        self.space.read(|txn, _| {
            let mut versions: IndexMap<String, u32> = self
                .ledger
                .iter(txn)
                .filter_map(|(flavour, value)| match read_u32(&value) {
                    Some(version) => Some((flavour.to_string(), version)),
                    None => {
                        log::warn!("ignoring unreadable ledger entry for '{flavour}'");
                        None
                    }
                })
                .collect();
            versions.sort_keys();
            versions
        })
    }

    // ==================== Reconciliation ====================

    /// Drain committed batches and diff the page index.
    ///
    /// Fires `pages_updated` and `common_fields_updated` as needed; the
    /// returned diff is left to the workspace to act on.
    pub fn process_pending(&mut self) -> StoreResult<PagesDiff> {
        let batches = self.space.take_batches();
        let pages_touched = self.pages_changed.swap(false, Ordering::SeqCst);
        if batches.is_empty() && !pages_touched {
            return Ok(PagesDiff::default());
        }

        let common_touched = batches.iter().flat_map(|batch| &batch.events).any(|event| {
            event.touches(&[], NAME_KEY) || event.touches(&[], AVATAR_KEY)
        });

        let mut diff = PagesDiff::default();
        if pages_touched {
            let current = self.page_ids()?;
            let previous: HashSet<&String> = self.known_pages.iter().collect();
            let now: HashSet<&String> = current.iter().collect();

            diff.added = current
                .iter()
                .filter(|id| !previous.contains(id))
                .cloned()
                .collect();
            diff.removed = self
                .known_pages
                .iter()
                .filter(|id| !now.contains(id))
                .cloned()
                .collect();

            log::debug!(
                "page index changed: +{:?} -{:?}",
                diff.added,
                diff.removed
            );
            self.known_pages = current;
            self.pages_updated.emit(&());
        }
        if common_touched {
            self.common_fields_updated.emit(&());
        }
        Ok(diff)
    }

    /// Drop all signal subscriptions and stop observing.
    pub fn dispose(&mut self) {
        self.space.unobserve();
        self.pages_subscription = None;
        self.pages_changed.store(false, Ordering::SeqCst);
        self.page_added.dispose();
        self.page_removed.dispose();
        self.pages_updated.dispose();
        self.common_fields_updated.dispose();
    }
}

impl VersionLedger for MetaStore {
    fn write_version(&mut self, registry: &SchemaRegistry) -> StoreResult<()> {
        let registered = registry.versions();
        let ledger = &self.ledger;
        self.space.transact(|txn, map| {
            Space::value_or_init(txn, map, WORKSPACE_VERSION_KEY, || {
                Any::Number(WORKSPACE_FORMAT_VERSION as f64)
            });
            Space::value_or_init(txn, map, PAGE_VERSION_KEY, || {
                Any::Number(PAGE_FORMAT_VERSION as f64)
            });
            for (flavour, version) in &registered {
                stamp_flavour(txn, ledger, flavour, *version);
            }
            Ok(())
        })
    }

    fn validate_version(&self, registry: &SchemaRegistry) -> StoreResult<()> {
        let (workspace_version, page_version) = self.space.read(|txn, map| {
            (
                map.get(txn, WORKSPACE_VERSION_KEY).and_then(|v| read_u32(&v)),
                map.get(txn, PAGE_VERSION_KEY).and_then(|v| read_u32(&v)),
            )
        })?;
        let (Some(workspace_version), Some(page_version)) = (workspace_version, page_version)
        else {
            return Err(StoreError::Configuration(
                "document carries no format version stamps".into(),
            ));
        };

        let ledger = self.versions()?;
        if ledger.is_empty() {
            return Err(StoreError::Configuration(
                "document version ledger is empty".into(),
            ));
        }

        check_version("workspace", workspace_version, WORKSPACE_FORMAT_VERSION)?;
        check_version("page", page_version, PAGE_FORMAT_VERSION)?;

        for (flavour, data_version) in &ledger {
            let editor_version = registry
                .version(flavour)
                .ok_or_else(|| StoreError::SchemaMissing {
                    flavour: flavour.clone(),
                })?;
            check_version(flavour, *data_version, editor_version)?;
        }
        Ok(())
    }
}

fn check_version(flavour: &str, data_version: u32, editor_version: u32) -> StoreResult<()> {
    if data_version > editor_version {
        Err(StoreError::SchemaTooNew {
            flavour: flavour.to_string(),
            data_version,
            editor_version,
        })
    } else if data_version < editor_version {
        Err(StoreError::SchemaStale {
            flavour: flavour.to_string(),
            data_version,
            editor_version,
        })
    } else {
        Ok(())
    }
}

impl std::fmt::Debug for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStore")
            .field("known_pages", &self.known_pages)
            .finish()
    }
}
