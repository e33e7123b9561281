//! Workspace: one shared document, its metadata store and its pages.
//!
//! All spaces of a workspace live in a single [`yrs::Doc`]. Local mutations go
//! through a [`Page`] or the [`MetaStore`]; replicated updates come in through
//! [`Workspace::apply_update`]. Either way the change is committed first and
//! the projections catch up in [`Workspace::flush`]:
//!
//! 1. pages whose descriptor disappeared are disposed, then `page_removed` fires
//! 2. live pages reconcile their queued batches
//! 3. pages whose descriptor appeared are instantiated, synced and indexed,
//!    then `page_added` fires
//!
//! With a [`CrdtStorage`] attached every committed update is appended to the
//! update log, and [`Workspace::load`] rebuilds the document from the last
//! snapshot plus the log.

use std::sync::Arc;

use indexmap::IndexMap;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Subscription, Transact, Update};

use crate::awareness::{AwarenessAdapter, LocalAwareness};
use crate::blob::{BlobStorage, MemoryBlobStorage};
use crate::config::WorkspaceConfig;
use crate::error::{StoreError, StoreResult};
use crate::ids::ActorId;
use crate::indexer::{ContentIndexer, MemoryIndexer};
use crate::meta::{MetaStore, PageDescriptor};
use crate::page::{Page, PageState, StoreContext};
use crate::schema::{BlockSchema, SchemaRegistry};
use crate::storage::{CrdtStorage, UpdateOrigin};

/// Origin of the transaction that replays storage on load.
const LOAD_ORIGIN: &str = "blockspace:load";

/// Prefix of origins used for replicated updates, followed by the [`UpdateOrigin`].
const APPLY_ORIGIN_PREFIX: &str = "blockspace:apply:";

fn apply_origin(origin: UpdateOrigin) -> Origin {
    Origin::from(format!("{APPLY_ORIGIN_PREFIX}{origin}").as_str())
}

/// How an update observed on the document should be logged.
fn logged_origin(origin: Option<&Origin>) -> Option<UpdateOrigin> {
    let Some(origin) = origin else {
        return Some(UpdateOrigin::Local);
    };
    let label = std::str::from_utf8(origin.as_ref()).unwrap_or_default();
    if label == LOAD_ORIGIN {
        return None;
    }
    match label.strip_prefix(APPLY_ORIGIN_PREFIX) {
        Some(kind) => Some(kind.parse().unwrap_or(UpdateOrigin::Remote)),
        None => Some(UpdateOrigin::Local),
    }
}

/// A collaborative workspace.
pub struct Workspace {
    config: WorkspaceConfig,
    doc: Doc,
    ctx: StoreContext,
    meta: MetaStore,
    pages: IndexMap<String, Page>,
    blobs: Arc<dyn BlobStorage>,
    storage: Option<Arc<dyn CrdtStorage>>,
    _persistence: Option<Subscription>,
}

impl Workspace {
    /// An empty in-memory workspace with the preset flavours registered.
    pub fn new(config: WorkspaceConfig) -> StoreResult<Self> {
        let doc = Doc::new();
        let actor = config.resolve_actor();
        let awareness: Arc<dyn AwarenessAdapter> = if config.read_only {
            Arc::new(LocalAwareness::read_only())
        } else {
            Arc::new(LocalAwareness::new())
        };
        let ctx = StoreContext {
            actor: actor.clone(),
            registry: Arc::new(SchemaRegistry::with_presets()),
            id_generator: config.id_generator.build(),
            awareness,
            indexer: Arc::new(MemoryIndexer::new()),
            aux_root_flavour: config.aux_root_flavour.clone(),
            capture_timeout_ms: config.capture_timeout_ms,
        };
        let meta = MetaStore::new(&doc, actor)?;

        log::debug!("workspace '{}' created for actor '{}'", config.id, ctx.actor);
        Ok(Self {
            config,
            doc,
            ctx,
            meta,
            pages: IndexMap::new(),
            blobs: Arc::new(MemoryBlobStorage::new()),
            storage: None,
            _persistence: None,
        })
    }

    /// A workspace whose updates are appended to `storage`.
    ///
    /// Nothing is read from storage until [`Workspace::load`] is called.
    pub fn with_storage(config: WorkspaceConfig, storage: Arc<dyn CrdtStorage>) -> StoreResult<Self> {
        let mut workspace = Self::new(config)?;
        let sink = Arc::clone(&storage);
        let doc_name = workspace.config.id.clone();
        let subscription = workspace
            .doc
            .observe_update_v1(move |txn, event| {
                let Some(origin) = logged_origin(txn.origin()) else {
                    return;
                };
                if let Err(e) = sink.append_update(&doc_name, &event.update, origin) {
                    log::warn!("failed to persist update of '{doc_name}': {e}");
                }
            })
            .map_err(|e| StoreError::Crdt(format!("cannot observe updates: {e}")))?;
        workspace.storage = Some(storage);
        workspace._persistence = Some(subscription);
        Ok(workspace)
    }

    /// Replace the awareness adapter. Affects pages instantiated afterwards.
    pub fn with_awareness(mut self, awareness: Arc<dyn AwarenessAdapter>) -> Self {
        self.ctx.awareness = awareness;
        self
    }

    /// Replace the content indexer. Affects pages instantiated afterwards.
    pub fn with_indexer(mut self, indexer: Arc<dyn ContentIndexer>) -> Self {
        self.ctx.indexer = indexer;
        self
    }

    /// Replace the blob storage.
    pub fn with_blobs(mut self, blobs: Arc<dyn BlobStorage>) -> Self {
        self.blobs = blobs;
        self
    }

    // ==================== Accessors ====================

    /// Workspace id.
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// The configuration this workspace was built from.
    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    /// The shared document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Origin of local transactions.
    pub fn actor(&self) -> &ActorId {
        &self.ctx.actor
    }

    /// Flavour registry.
    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.ctx.registry
    }

    /// Awareness adapter.
    pub fn awareness(&self) -> &Arc<dyn AwarenessAdapter> {
        &self.ctx.awareness
    }

    /// Metadata store.
    pub fn meta(&self) -> &MetaStore {
        &self.meta
    }

    /// Blob storage.
    pub fn blobs(&self) -> &Arc<dyn BlobStorage> {
        &self.blobs
    }

    // ==================== Schema ====================

    /// Register a flavour; a later registration of the same flavour wins.
    pub fn register(&self, schema: BlockSchema) {
        self.ctx.registry.register(schema);
    }

    /// Register several flavours.
    pub fn register_all(&self, schemas: impl IntoIterator<Item = BlockSchema>) {
        self.ctx.registry.register_all(schemas);
    }

    // ==================== Pages ====================

    /// Describe a new page and bring its store up.
    ///
    /// Without an id one is drawn from the id generator. `page_added` has
    /// fired by the time this returns.
    pub fn create_page(&mut self, id: Option<&str>) -> StoreResult<String> {
        let id = match id {
            Some(id) => id.to_string(),
            None => self.ctx.id_generator.next_id(),
        };
        if self.pages.contains_key(&id) || self.meta.page_descriptor(&id)?.is_some() {
            return Err(StoreError::AlreadyExists(id));
        }
        if self.ctx.awareness.is_readonly(&id) {
            return Err(StoreError::ReadOnly(id));
        }

        self.meta.add_page_descriptor(PageDescriptor::new(id.as_str()), None)?;
        self.flush()?;
        Ok(id)
    }

    /// Clear a page's blocks and drop its descriptor.
    ///
    /// `page_removed` has fired and the store is disposed by the time this
    /// returns.
    pub fn remove_page(&mut self, id: &str) -> StoreResult<()> {
        if !self.pages.contains_key(id) && self.meta.page_descriptor(id)?.is_none() {
            return Err(StoreError::not_found("page", id));
        }
        if self.ctx.awareness.is_readonly(id) {
            return Err(StoreError::ReadOnly(id.to_string()));
        }

        if let Some(page) = self.pages.get(id) {
            page.remove_all_blocks()?;
        }
        self.meta.remove_page_descriptor(id)?;
        self.flush()
    }

    /// A page store by id.
    pub fn page(&self, id: &str) -> StoreResult<&Page> {
        self.pages
            .get(id)
            .ok_or_else(|| StoreError::not_found("page", id))
    }

    /// A page store by id, for mutation.
    pub fn page_mut(&mut self, id: &str) -> StoreResult<&mut Page> {
        self.pages
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("page", id))
    }

    /// All page stores, in the order they were instantiated.
    pub fn pages(&self) -> impl Iterator<Item = &Page> {
        self.pages.values()
    }

    /// Ids of all page stores.
    pub fn page_ids(&self) -> Vec<String> {
        self.pages.keys().cloned().collect()
    }

    // ==================== Reconciliation ====================

    /// Bring the metadata store and every page up to date with the document.
    ///
    /// A page that fails to sync is kept, unsynced, and the first such error
    /// is returned once every other page has been handled.
    pub fn flush(&mut self) -> StoreResult<()> {
        let diff = self.meta.process_pending()?;

        for id in &diff.removed {
            if let Some(mut page) = self.pages.shift_remove(id) {
                page.dispose();
            }
            self.ctx.indexer.on_remove_page(id);
            log::debug!("page '{id}' removed");
            self.meta.page_removed.emit(id);
        }

        let mut first_error = None;
        for page in self.pages.values_mut() {
            if let Err(e) = page.process_pending() {
                log::error!("page '{}' failed to reconcile: {e}", page.id());
                first_error.get_or_insert(e);
            }
        }

        for id in &diff.added {
            if self.pages.contains_key(id) {
                continue;
            }
            let mut page = Page::new(&self.doc, id.as_str(), self.ctx.clone());
            let synced = page.sync_from_existing_doc(&mut self.meta);
            self.pages.insert(id.clone(), page);
            match synced {
                Ok(()) => {
                    self.ctx.indexer.on_create_page(id);
                    log::debug!("page '{id}' added");
                    self.meta.page_added.emit(id);
                }
                Err(e) => {
                    log::error!("page '{id}' failed to sync: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        // Syncing may have stamped the format versions.
        self.meta.process_pending()?;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ids of pages whose store exists but never finished syncing.
    pub fn unsynced_pages(&self) -> Vec<String> {
        self.pages
            .values()
            .filter(|page| page.state() == PageState::Uninitialized)
            .map(|page| page.id().to_string())
            .collect()
    }

    // ==================== Replication ====================

    /// Encode the current state vector for a sync handshake.
    pub fn encode_state_vector(&self) -> StoreResult<Vec<u8>> {
        let txn = self.read_txn()?;
        Ok(txn.state_vector().encode_v1())
    }

    /// Encode the full document state as one update.
    pub fn encode_state_as_update(&self) -> StoreResult<Vec<u8>> {
        let txn = self.read_txn()?;
        Ok(txn.encode_state_as_update_v1(&StateVector::default()))
    }

    /// Encode what a peer with `remote_state_vector` is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> StoreResult<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| StoreError::Crdt(format!("failed to decode state vector: {e}")))?;
        let txn = self.read_txn()?;
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Apply an update from a peer and reconcile.
    pub fn apply_update(&mut self, update: &[u8], origin: UpdateOrigin) -> StoreResult<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| StoreError::Crdt(format!("failed to decode update: {e}")))?;
        {
            let mut txn = self
                .doc
                .try_transact_mut_with(apply_origin(origin))
                .map_err(|e| StoreError::State(format!("cannot apply update: {e}")))?;
            txn.apply_update(decoded)
                .map_err(|e| StoreError::Crdt(format!("failed to apply update: {e}")))?;
        }
        self.flush()
    }

    /// Subscribe to every encoded update committed on the document.
    ///
    /// Updates replayed by [`Workspace::load`] are not reported.
    pub fn observe_updates<F>(&self, callback: F) -> StoreResult<Subscription>
    where
        F: Fn(&[u8], UpdateOrigin) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |txn, event| {
                if let Some(origin) = logged_origin(txn.origin()) {
                    callback(&event.update, origin);
                }
            })
            .map_err(|e| StoreError::Crdt(format!("cannot observe updates: {e}")))
    }

    fn read_txn(&self) -> StoreResult<yrs::Transaction<'_>> {
        self.doc
            .try_transact()
            .map_err(|e| StoreError::State(format!("cannot read workspace '{}': {e}", self.id())))
    }

    // ==================== Persistence ====================

    fn storage(&self) -> StoreResult<&Arc<dyn CrdtStorage>> {
        self.storage.as_ref().ok_or_else(|| {
            StoreError::Configuration(format!("workspace '{}' has no storage", self.id()))
        })
    }

    /// Replay the stored snapshot and update log, then reconcile.
    ///
    /// Undecodable log entries are skipped with a warning.
    pub fn load(&mut self) -> StoreResult<()> {
        let storage = Arc::clone(self.storage()?);
        let name = self.config.id.clone();
        {
            let mut txn = self
                .doc
                .try_transact_mut_with(Origin::from(LOAD_ORIGIN))
                .map_err(|e| StoreError::State(format!("cannot load workspace: {e}")))?;

            if let Some(state) = storage.load_doc(&name)? {
                let update = Update::decode_v1(&state)
                    .map_err(|e| StoreError::Crdt(format!("failed to decode snapshot: {e}")))?;
                txn.apply_update(update)
                    .map_err(|e| StoreError::Crdt(format!("failed to apply snapshot: {e}")))?;
            }

            for logged in storage.get_all_updates(&name)? {
                let applied = Update::decode_v1(&logged.data)
                    .map_err(|e| e.to_string())
                    .and_then(|update| txn.apply_update(update).map_err(|e| e.to_string()));
                if let Err(e) = applied {
                    log::warn!("skipping stored update {} of '{name}': {e}", logged.update_id);
                }
            }
        }
        log::debug!("workspace '{name}' loaded from storage");
        self.flush()
    }

    /// Store the full document state as a snapshot.
    pub fn save(&self) -> StoreResult<()> {
        let state = self.encode_state_as_update()?;
        self.storage()?.save_doc(&self.config.id, &state)
    }

    // ==================== Search ====================

    /// Blocks matching `query`, mapped to their page id.
    pub fn search(&self, query: &str) -> IndexMap<String, String> {
        self.ctx.indexer.search(query)
    }

    /// Dispose every page and the metadata store.
    pub fn dispose(&mut self) {
        for (_, mut page) in self.pages.drain(..) {
            page.dispose();
        }
        self.meta.dispose();
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("id", &self.config.id)
            .field("actor", &self.ctx.actor)
            .field("pages", &self.pages.keys().collect::<Vec<_>>())
            .field("persistent", &self.storage.is_some())
            .finish()
    }
}
