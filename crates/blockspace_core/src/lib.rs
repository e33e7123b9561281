#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Awareness adapter (read-only state and cursors)
pub mod awareness;

/// Blob storage handle
pub mod blob;

/// Typed block model
pub mod block;

/// Configuration options
pub mod config;

/// Error (common error types)
pub mod error;

/// Classification of raw CRDT events
pub mod events;

/// Undo/redo
pub mod history;

/// Id generators and the actor id
pub mod ids;

/// Content indexing
pub mod indexer;

/// Workspace metadata store
pub mod meta;

/// Block tree store
pub mod page;

/// Flavour schemas and the registry
pub mod schema;

/// Typed signals
pub mod signal;

/// Named root maps of the shared document
pub mod space;

/// CRDT persistence
pub mod storage;

pub mod value;

/// Workspace (one document, its metadata and its pages)
pub mod workspace;

pub use block::{Block, Placement, Prop, Props};
pub use config::WorkspaceConfig;
pub use error::{SerializableError, StoreError, StoreResult};
pub use meta::{MetaStore, PageDescriptor, VersionLedger};
pub use page::{BlockSpec, BlockUpdate, ChildrenPolicy, Page, PageState};
pub use schema::{BlockRole, BlockSchema, SchemaRegistry};
pub use storage::{CrdtStorage, MemoryStorage, UpdateOrigin};
pub use workspace::Workspace;
