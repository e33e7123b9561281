//! Configuration types for a workspace.
//!
//! This module provides the [`WorkspaceConfig`] struct which carries the
//! settings a [`Workspace`](crate::workspace::Workspace) is constructed with.
//! Configuration can be built in code or persisted as TOML.
//!
//! # Key Configuration Fields
//!
//! - `id`: Workspace id
//! - `actor_id`: Origin tag for local transactions (random when absent)
//! - `id_generator`: Block id strategy (`uuid` or `auto_increment`)
//! - `aux_root_flavour`: Flavour tracked as the auxiliary root of a page
//! - `capture_timeout_ms`: Undo grouping window
//! - `read_only`: Start every page in read-only mode
//!
//! # Example
//!
//! ```ignore
//! use blockspace_core::config::WorkspaceConfig;
//!
//! let config = WorkspaceConfig::from_toml_str(r#"
//!     id = "notes"
//!     id_generator = "auto_increment"
//! "#)?;
//! assert_eq!(config.aux_root_flavour, "surface");
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::StoreResult;
use crate::ids::{ActorId, IdGeneratorKind};

/// Default flavour of the auxiliary root slot.
pub const DEFAULT_AUX_ROOT_FLAVOUR: &str = "surface";

/// Default undo grouping window: one week.
///
/// Edits keep merging into the open undo unit until
/// [`Page::capture_sync`](crate::page::Page::capture_sync) closes it.
pub const DEFAULT_CAPTURE_TIMEOUT_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Settings a workspace is constructed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Workspace id
    pub id: String,

    /// Actor id used as the origin of every local transaction.
    /// A random one is generated when not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,

    /// Block id strategy
    #[serde(default)]
    pub id_generator: IdGeneratorKind,

    /// Flavour that occupies the auxiliary root slot of a page
    #[serde(default = "default_aux_root_flavour")]
    pub aux_root_flavour: String,

    /// Undo grouping window in milliseconds
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,

    /// Open every page read-only
    #[serde(default)]
    pub read_only: bool,
}

fn default_aux_root_flavour() -> String {
    DEFAULT_AUX_ROOT_FLAVOUR.to_string()
}

fn default_capture_timeout_ms() -> u64 {
    DEFAULT_CAPTURE_TIMEOUT_MS
}

impl WorkspaceConfig {
    /// Create a config with default settings for the given workspace id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            actor_id: None,
            id_generator: IdGeneratorKind::default(),
            aux_root_flavour: default_aux_root_flavour(),
            capture_timeout_ms: default_capture_timeout_ms(),
            read_only: false,
        }
    }

    /// Set the actor id
    pub fn with_actor_id(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Set the block id strategy
    pub fn with_id_generator(mut self, kind: IdGeneratorKind) -> Self {
        self.id_generator = kind;
        self
    }

    /// Set the read-only flag
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Resolve the actor id, generating one when none is configured.
    pub fn resolve_actor(&self) -> ActorId {
        match &self.actor_id {
            Some(id) => ActorId::new(id.clone()),
            None => ActorId::generate(),
        }
    }

    /// Parse a config from TOML text.
    pub fn from_toml_str(contents: &str) -> StoreResult<Self> {
        let config: WorkspaceConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Load config from a TOML file.
    pub fn load_from(path: &Path) -> StoreResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Save config to a TOML file, creating the parent directory if needed.
    pub fn save_to(&self, path: &Path) -> StoreResult<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = WorkspaceConfig::from_toml_str("id = \"ws\"").unwrap();
        assert_eq!(config, WorkspaceConfig::new("ws"));
        assert_eq!(config.aux_root_flavour, "surface");
        assert_eq!(config.id_generator, IdGeneratorKind::Uuid);
        assert!(!config.read_only);
    }

    #[test]
    fn test_full_config() {
        let config = WorkspaceConfig::from_toml_str(
            r#"
            id = "ws"
            actor_id = "alice"
            id_generator = "auto_increment"
            aux_root_flavour = "canvas"
            capture_timeout_ms = 500
            read_only = true
            "#,
        )
        .unwrap();

        assert_eq!(config.resolve_actor(), ActorId::new("alice"));
        assert_eq!(config.id_generator, IdGeneratorKind::AutoIncrement);
        assert_eq!(config.aux_root_flavour, "canvas");
        assert_eq!(config.capture_timeout_ms, 500);
        assert!(config.read_only);
    }

    #[test]
    fn test_generated_actor_when_absent() {
        let config = WorkspaceConfig::new("ws");
        assert_ne!(config.resolve_actor(), config.resolve_actor());
    }

    #[test]
    fn test_invalid_toml_is_config_parse_error() {
        let err = WorkspaceConfig::from_toml_str("id = ").unwrap_err();
        assert!(matches!(err, StoreError::ConfigParse(_)));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("workspace.toml");

        let config = WorkspaceConfig::new("ws")
            .with_actor_id("bob")
            .with_id_generator(IdGeneratorKind::AutoIncrement);
        config.save_to(&path).unwrap();

        let loaded = WorkspaceConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = WorkspaceConfig::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
    }
}
