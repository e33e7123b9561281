//! Block flavour registry.
//!
//! The registry maps a flavour name to a [`BlockSchema`]: its version, its
//! role in the tree, nesting rules, which props are collaborative text and a
//! default-props constructor. It is consulted when blocks are added, when
//! blocks are materialized and when a document's version ledger is checked.
//!
//! Registration is append-only and the last registration of a flavour wins.

use std::sync::{Arc, PoisonError, RwLock};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::block::Props;
use crate::error::{StoreError, StoreResult};

/// Position a flavour takes in the block tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockRole {
    /// Primary root of a page; never has a parent
    Root,
    /// Container for other blocks
    Hub,
    /// Leaf or inline content
    Content,
}

/// Registered description of one flavour.
#[derive(Debug, Clone)]
pub struct BlockSchema {
    /// Flavour name
    pub flavour: String,
    /// Current version, compared against the document ledger
    pub version: u32,
    /// Role in the tree
    pub role: BlockRole,
    /// Allowed parent flavours, any when `None`
    pub parents: Option<Vec<String>>,
    /// Allowed child flavours, any when `None`
    pub children: Option<Vec<String>>,
    /// Props stored as collaborative text
    pub text_props: Vec<String>,
    /// Default props for new blocks
    pub props: fn() -> Props,
}

fn no_props() -> Props {
    Props::new()
}

impl BlockSchema {
    /// A schema with no nesting restrictions and no default props.
    pub fn new(flavour: impl Into<String>, version: u32, role: BlockRole) -> Self {
        Self {
            flavour: flavour.into(),
            version,
            role,
            parents: None,
            children: None,
            text_props: Vec::new(),
            props: no_props,
        }
    }

    /// Restrict parent flavours.
    pub fn with_parents(mut self, parents: &[&str]) -> Self {
        self.parents = Some(parents.iter().map(|p| p.to_string()).collect());
        self
    }

    /// Restrict child flavours.
    pub fn with_children(mut self, children: &[&str]) -> Self {
        self.children = Some(children.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Declare collaborative text props.
    pub fn with_text_props(mut self, names: &[&str]) -> Self {
        self.text_props = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Set the default-props constructor.
    pub fn with_props(mut self, props: fn() -> Props) -> Self {
        self.props = props;
        self
    }

    /// Whether `name` is stored as collaborative text.
    pub fn is_text_prop(&self, name: &str) -> bool {
        self.text_props.iter().any(|p| p == name)
    }

    /// Defaults overlaid with `props`, with every text prop present.
    pub fn initial_props(&self, props: &Props) -> Props {
        let mut merged = (self.props)();
        for name in &self.text_props {
            merged.entry(name.clone()).or_insert_with(|| json!(""));
        }
        for (key, value) in props {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    fn allows_parent(&self, parent: &str) -> bool {
        self.parents
            .as_ref()
            .is_none_or(|allowed| allowed.iter().any(|p| p == parent))
    }

    fn allows_child(&self, child: &str) -> bool {
        self.children
            .as_ref()
            .is_none_or(|allowed| allowed.iter().any(|c| c == child))
    }
}

/// Open, thread-safe flavour registry.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<IndexMap<String, Arc<BlockSchema>>>,
}

impl SchemaRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in [`presets`].
    pub fn with_presets() -> Self {
        let registry = Self::new();
        registry.register_all(presets());
        registry
    }

    /// Register a flavour, replacing any earlier registration.
    pub fn register(&self, schema: BlockSchema) {
        let mut schemas = self.schemas.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = schemas.get(&schema.flavour) {
            log::debug!(
                "re-registering flavour '{}' ({} -> {})",
                schema.flavour,
                previous.version,
                schema.version
            );
        }
        schemas.insert(schema.flavour.clone(), Arc::new(schema));
    }

    /// Register several flavours in order.
    pub fn register_all(&self, schemas: impl IntoIterator<Item = BlockSchema>) {
        for schema in schemas {
            self.register(schema);
        }
    }

    /// Look up a flavour.
    pub fn get(&self, flavour: &str) -> Option<Arc<BlockSchema>> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(flavour)
            .cloned()
    }

    /// Whether a flavour is registered.
    pub fn contains(&self, flavour: &str) -> bool {
        self.get(flavour).is_some()
    }

    /// Current version of a flavour.
    pub fn version(&self, flavour: &str) -> Option<u32> {
        self.get(flavour).map(|schema| schema.version)
    }

    /// Every registered flavour with its version, in registration order.
    pub fn versions(&self) -> IndexMap<String, u32> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(flavour, schema)| (flavour.clone(), schema.version))
            .collect()
    }

    /// Number of registered flavours.
    pub fn len(&self) -> usize {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check that `flavour` may be placed under `parent_flavour`.
    ///
    /// Parentless placement is not checked here; the page decides which root
    /// slots are free.
    pub fn validate(
        &self,
        flavour: &str,
        parent_flavour: Option<&str>,
    ) -> StoreResult<Arc<BlockSchema>> {
        if flavour.is_empty() {
            return Err(StoreError::Structural("flavour must not be empty".into()));
        }
        let schema = self
            .get(flavour)
            .ok_or_else(|| StoreError::not_found("flavour", flavour))?;

        let Some(parent_flavour) = parent_flavour else {
            return Ok(schema);
        };

        if schema.role == BlockRole::Root {
            return Err(StoreError::Structural(format!(
                "root flavour '{flavour}' cannot be nested under '{parent_flavour}'"
            )));
        }
        if !schema.allows_parent(parent_flavour) {
            return Err(StoreError::Structural(format!(
                "'{flavour}' cannot be a child of '{parent_flavour}'"
            )));
        }
        if let Some(parent) = self.get(parent_flavour)
            && !parent.allows_child(flavour)
        {
            return Err(StoreError::Structural(format!(
                "'{parent_flavour}' does not accept '{flavour}' children"
            )));
        }
        Ok(schema)
    }
}

/// Built-in flavours.
pub fn presets() -> Vec<BlockSchema> {
    vec![
        BlockSchema::new("page", 2, BlockRole::Root).with_text_props(&["title"]),
        BlockSchema::new("surface", 5, BlockRole::Hub)
            .with_parents(&["page"])
            .with_props(|| {
                let mut props = Props::new();
                props.insert("elements".into(), json!({}));
                props
            }),
        BlockSchema::new("note", 1, BlockRole::Hub)
            .with_parents(&["page"])
            .with_props(|| {
                let mut props = Props::new();
                props.insert("xywh".into(), json!("[0,0,800,100]"));
                props.insert("background".into(), json!("--note-background"));
                props
            }),
        BlockSchema::new("paragraph", 1, BlockRole::Content)
            .with_text_props(&["text"])
            .with_props(|| {
                let mut props = Props::new();
                props.insert("type".into(), json!("text"));
                props
            }),
        BlockSchema::new("list", 1, BlockRole::Content)
            .with_text_props(&["text"])
            .with_props(|| {
                let mut props = Props::new();
                props.insert("type".into(), json!("bulleted"));
                props.insert("checked".into(), json!(false));
                props
            }),
        BlockSchema::new("divider", 1, BlockRole::Content).with_children(&[]),
        BlockSchema::new("image", 1, BlockRole::Content)
            .with_children(&[])
            .with_props(|| {
                let mut props = Props::new();
                props.insert("sourceId".into(), json!(""));
                props.insert("caption".into(), json!(""));
                props.insert("width".into(), json!(0));
                props.insert("height".into(), json!(0));
                props
            }),
    ]
}
