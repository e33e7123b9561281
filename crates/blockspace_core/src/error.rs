use serde::Serialize;
use thiserror::Error;

/// Unified error type for blockspace operations
#[derive(Debug, Error)]
pub enum StoreError {
    // Document / version ledger errors
    /// Format stamps or the version ledger are missing
    #[error("Invalid workspace data: {0}")]
    Configuration(String),

    /// The document uses a flavour the registry does not know
    #[error("Editor missing {flavour} flavour. Please make sure this block flavour is registered.")]
    SchemaMissing {
        /// Unregistered flavour
        flavour: String,
    },

    /// The document was written by a newer schema

    #[error(
        "Editor doesn't support {flavour}@{data_version} (editor has {editor_version}). Please upgrade the editor."
    )]
    SchemaTooNew {
        /// Flavour, or `workspace` / `page` for the format stamps
        flavour: String,
        /// Version recorded in the document
        data_version: u32,
        /// Version this editor registers
        editor_version: u32,
    },

    /// The document was written by an older schema

    #[error(
        "In workspace data, {flavour}@{data_version} is outdated (editor has {editor_version}). Please downgrade the editor or try data migration."
    )]
    SchemaStale {
        /// Flavour, or `workspace` / `page` for the format stamps
        flavour: String,
        /// Version recorded in the document
        data_version: u32,
        /// Version this editor registers
        editor_version: u32,
    },

    // Store errors
    /// A page with this id is already described
    #[error("Page '{0}' already exists")]
    AlreadyExists(String),

    /// Lookup of a page, block or flavour failed
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// What was looked up
        kind: &'static str,
        /// The missing id
        id: String,
    },

    /// Lifecycle violation or a transaction that could not be opened
    #[error("Invalid state: {0}")]
    State(String),

    /// Mutation of a read-only page
    #[error("Page '{0}' is read-only")]
    ReadOnly(String),

    /// The edit would break the tree or the schema rules
    #[error("Invalid block structure: {0}")]
    Structural(String),

    // CRDT errors
    /// Update decoding or application failed
    #[error("CRDT error: {0}")]
    Crdt(String),

    // Config errors
    /// Malformed TOML config
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Config could not be written as TOML
    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Config file I/O
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for blockspace operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether this error came out of the version gate.
    pub fn is_version_error(&self) -> bool {
        matches!(
            self,
            StoreError::Configuration(_)
                | StoreError::SchemaMissing { .. }
                | StoreError::SchemaTooNew { .. }
                | StoreError::SchemaStale { .. }
        )
    }

    /// Convert to a serializable representation for IPC
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}

/// A serializable representation of StoreError for IPC (e.g., an editor frontend)
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
}

impl From<&StoreError> for SerializableError {
    fn from(err: &StoreError) -> Self {
        let kind = match err {
            StoreError::Configuration(_) => "Configuration",
            StoreError::SchemaMissing { .. } => "SchemaMissing",
            StoreError::SchemaTooNew { .. } => "SchemaTooNew",
            StoreError::SchemaStale { .. } => "SchemaStale",
            StoreError::AlreadyExists(_) => "AlreadyExists",
            StoreError::NotFound { .. } => "NotFound",
            StoreError::State(_) => "State",
            StoreError::ReadOnly(_) => "ReadOnly",
            StoreError::Structural(_) => "Structural",
            StoreError::Crdt(_) => "Crdt",
            StoreError::ConfigParse(_) => "ConfigParse",
            StoreError::ConfigSerialize(_) => "ConfigSerialize",
            StoreError::Io(_) => "Io",
        }
        .to_string();

        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<StoreError> for SerializableError {
    fn from(err: StoreError) -> Self {
        SerializableError::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializable_kind_matches_variant() {
        let err = StoreError::not_found("block", "abc");
        let ser = err.to_serializable();
        assert_eq!(ser.kind, "NotFound");
        assert_eq!(ser.message, "block 'abc' not found");
    }

    #[test]
    fn test_version_errors_are_classified() {
        assert!(StoreError::Configuration("empty".into()).is_version_error());
        assert!(
            StoreError::SchemaTooNew {
                flavour: "x".into(),
                data_version: 2,
                editor_version: 1
            }
            .is_version_error()
        );
        assert!(!StoreError::ReadOnly("p".into()).is_version_error());
    }
}
