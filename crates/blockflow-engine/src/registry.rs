use std::collections::HashMap;
use std::sync::Arc;

use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::traits::Block;
use blockflow_core::types::{BlockCategory, BlockDefinition};

/// Registry of available block types.
///
/// Built once at startup, then shared read-only (`Arc<BlockRegistry>`) by the
/// normalizer, validator, executor and subscription manager.
#[derive(Default)]
pub struct BlockRegistry {
    blocks: HashMap<String, Arc<dyn Block>>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self {
            blocks: HashMap::new(),
        }
    }

    /// Register a block. A later registration of the same type replaces the earlier one.
    pub fn register(&mut self, block: impl Block) {
        self.register_arc(Arc::new(block));
    }

    pub fn register_arc(&mut self, block: Arc<dyn Block>) {
        let block_type = block.definition().block_type.clone();
        self.blocks.insert(block_type, block);
    }

    /// Get a block by type.
    pub fn get(&self, block_type: &str) -> Option<Arc<dyn Block>> {
        self.blocks.get(block_type).cloned()
    }

    /// Get a block by type or fail with `BlockNotFound`.
    pub fn require(&self, block_type: &str) -> Result<Arc<dyn Block>> {
        self.get(block_type)
            .ok_or_else(|| BlockflowError::BlockNotFound(block_type.to_string()))
    }

    pub fn definition(&self, block_type: &str) -> Option<&BlockDefinition> {
        self.blocks.get(block_type).map(|b| b.definition())
    }

    pub fn category(&self, block_type: &str) -> Option<BlockCategory> {
        self.definition(block_type).map(|d| d.category)
    }

    pub fn is_trigger(&self, block_type: &str) -> bool {
        self.category(block_type) == Some(BlockCategory::Trigger)
    }

    /// List all registered block types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.blocks.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
