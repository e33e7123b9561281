//! Content indexing sink.
//!
//! The workspace tells the indexer when pages come and go, and pages push
//! every materialized or updated block through [`ContentIndexer::index_block`].
//! [`ContentIndexer::search`] answers with matching block ids mapped to the
//! page holding them.

use std::sync::{PoisonError, RwLock};

use indexmap::IndexMap;

use crate::block::{Block, Prop};

/// Receives page and block lifecycle notifications and answers queries.
pub trait ContentIndexer: Send + Sync {
    /// A page store was instantiated and synced.
    fn on_create_page(&self, page_id: &str);

    /// A page store was disposed.
    fn on_remove_page(&self, page_id: &str);

    /// A block was materialized or changed.
    fn index_block(&self, page_id: &str, block: &Block);

    /// A block was removed.
    fn remove_block(&self, page_id: &str, block_id: &str);

    /// Matching block ids mapped to their page id.
    fn search(&self, query: &str) -> IndexMap<String, String>;
}

/// Case-insensitive substring index over block text.
#[derive(Debug, Default)]
pub struct MemoryIndexer {
    pages: RwLock<IndexMap<String, IndexMap<String, String>>>,
}

impl MemoryIndexer {
    /// An empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed pages.
    pub fn page_count(&self) -> usize {
        self.pages.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Searchable text of a block: its text props and string props.
fn searchable_text(block: &Block) -> String {
    let mut parts = Vec::new();
    for prop in block.props.values() {
        match prop {
            Prop::Text(text) => parts.push(text.as_str()),
            Prop::Json(serde_json::Value::String(text)) => parts.push(text.as_str()),
            Prop::Json(_) => {}
        }
    }
    parts.join("\n").to_lowercase()
}

impl ContentIndexer for MemoryIndexer {
    fn on_create_page(&self, page_id: &str) {
        self.pages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(page_id.to_string())
            .or_default();
    }

    fn on_remove_page(&self, page_id: &str) {
        self.pages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(page_id);
    }

    fn index_block(&self, page_id: &str, block: &Block) {
        self.pages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(page_id.to_string())
            .or_default()
            .insert(block.id.clone(), searchable_text(block));
    }

    fn remove_block(&self, page_id: &str, block_id: &str) {
        if let Some(blocks) = self
            .pages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(page_id)
        {
            blocks.shift_remove(block_id);
        }
    }

    fn search(&self, query: &str) -> IndexMap<String, String> {
        let needle = query.to_lowercase();
        if needle.is_empty() {
            return IndexMap::new();
        }

        let pages = self.pages.read().unwrap_or_else(PoisonError::into_inner);
        let mut matches = IndexMap::new();
        for (page_id, blocks) in pages.iter() {
            for (block_id, text) in blocks {
                if text.contains(&needle) {
                    matches.insert(block_id.clone(), page_id.clone());
                }
            }
        }
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paragraph(id: &str, text: &str) -> Block {
        let mut block = Block::new(id, "paragraph");
        block.props.insert("text".into(), Prop::Text(text.into()));
        block
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let indexer = MemoryIndexer::new();
        indexer.on_create_page("page0");
        indexer.index_block("page0", &paragraph("b1", "Hello World"));
        indexer.index_block("page0", &paragraph("b2", "goodbye"));

        let results = indexer.search("hello");
        assert_eq!(results.len(), 1);
        assert_eq!(results.get("b1"), Some(&"page0".to_string()));
    }

    #[test]
    fn test_removed_page_is_not_searched() {
        let indexer = MemoryIndexer::new();
        indexer.index_block("page0", &paragraph("b1", "needle"));
        indexer.index_block("page1", &paragraph("b2", "needle"));

        indexer.on_remove_page("page0");
        let results = indexer.search("needle");
        assert_eq!(results.keys().collect::<Vec<_>>(), vec!["b2"]);
    }

    #[test]
    fn test_reindex_replaces_text() {
        let indexer = MemoryIndexer::new();
        indexer.index_block("page0", &paragraph("b1", "old"));
        indexer.index_block("page0", &paragraph("b1", "new"));

        assert!(indexer.search("old").is_empty());
        assert_eq!(indexer.search("new").len(), 1);

        indexer.remove_block("page0", "b1");
        assert!(indexer.search("new").is_empty());
    }
}
