//! Node tables backing the indexes.
//!
//! A storage exclusively owns every node of one index and addresses them by
//! [`NodeId`]. Released ids go onto a free-page stack and are handed out
//! again before fresh ids, so the table (or file) only grows when no freed
//! slot is available. A released id that has not been reallocated yet is
//! stale: dereferencing it fails with [`StorageError::NotFound`].
//!
//! Two implementations exist:
//! - [`MemoryStorage`]: a slot table in memory
//! - [`PagedStorage`]: fixed-size pages in a file, with a bounded LRU buffer
//!
//! [`StorageError::NotFound`]: crate::types::StorageError::NotFound

pub mod memory;
pub mod page_cache;
pub mod page_file;
pub mod paged;

pub use memory::MemoryStorage;
pub use page_file::{FileHeader, PageFile};
pub use paged::{IntegrityReport, PagedStorage};

use crate::config::IndexConfig;
use crate::node::Node;
use crate::types::{IndexMeta, NodeId, StorageResult, StorageStats};

/// Owner of all nodes of one index.
pub trait IndexStorage: Send {
    /// Stores `node` under a reused id from the free-page stack, or under the
    /// next fresh id. The node's own id is overwritten with the one returned.
    fn allocate(&mut self, node: Node) -> StorageResult<NodeId>;

    fn get(&mut self, id: NodeId) -> StorageResult<&Node>;

    fn get_mut(&mut self, id: NodeId) -> StorageResult<&mut Node>;

    /// Drops the node's contents and pushes `id` onto the free-page stack.
    fn release(&mut self, id: NodeId) -> StorageResult<()>;

    /// Persists the node table, the free-page stack and the high-water mark.
    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    /// Called once at the end of every structural mutation.
    fn mutation_complete(&mut self) -> StorageResult<()> {
        Ok(())
    }

    /// Drops every node and resets ids, the free-page stack and metadata.
    fn reset(&mut self) -> StorageResult<()>;

    fn meta(&self) -> &IndexMeta;

    fn meta_mut(&mut self) -> &mut IndexMeta;

    fn stats(&self) -> StorageStats;

    /// R-tree layout persisted with the node table, if any.
    fn layout(&self) -> Option<IndexConfig> {
        None
    }

    /// Records the R-tree layout so a reopened storage can restore it.
    fn record_layout(&mut self, _layout: IndexConfig) {}

    /// Largest encoded node the storage can hold; `None` when unbounded.
    fn page_capacity(&self) -> Option<usize> {
        None
    }

    fn is_live(&self, id: NodeId) -> bool;
}
