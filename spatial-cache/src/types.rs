//! Core identifiers, error types and statistics shared across the crate.
//!
//! This module defines:
//! - Node, payload and lineage identifiers
//! - The error taxonomy (configuration, storage, iterator, index)
//! - Index metadata persisted alongside the node table
//! - Storage statistics

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

// ============================================================================
// Identifiers
// ============================================================================

/// Stable identifier of a node inside an [`IndexStorage`](crate::storage::IndexStorage).
///
/// In the paged storage it doubles as the page number. Id 0 is reserved.
pub type NodeId = u64;

/// Lineage tag grouping grid entries inserted together.
pub type DataId = u32;

/// Opaque handle to a caller-owned payload.
///
/// The index never dereferences it; it is stored, persisted and returned
/// verbatim. A typical value is a record offset in an external store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PayloadHandle(pub u64);

impl PayloadHandle {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for PayloadHandle {
    fn from(value: u64) -> Self {
        PayloadHandle(value)
    }
}

impl fmt::Display for PayloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Invalid construction parameters. Always reported before any node exists.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("dimension must be positive")]
    ZeroDimension,

    #[error("max_node_entries must be at least 2, got {max}")]
    NodeCapacityTooSmall { max: usize },

    #[error("min_node_entries must be within 1..={} (max_node_entries {max}), got {min}", .max / 2)]
    MinEntriesOutOfRange { min: usize, max: usize },

    #[error("expected a {expected}-dimensional region, got {actual}")]
    UnsupportedDimension { expected: usize, actual: usize },

    #[error("{0} must be positive")]
    ZeroCapacity(&'static str),

    #[error("persisted layout does not match: {0}")]
    LayoutMismatch(String),

    #[error("bounds must be finite on every axis")]
    UnboundedRegion,

    #[error("a node of {max_node_entries} entries needs {needed} bytes, pages hold {page_size}")]
    NodeTooLarge {
        max_node_entries: usize,
        needed: usize,
        page_size: usize,
    },
}

/// Failures of the node table.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("node {0} not found")]
    NotFound(NodeId),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("page {page} corrupted: {reason}")]
    Corrupted { page: NodeId, reason: String },

    #[error("node on page {page} too large: {size} bytes (max {max})")]
    PageOverflow { page: NodeId, size: usize, max: usize },
}

/// Failures of a lazy query iterator.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum IteratorError {
    #[error("iterator invalidated by a structural mutation, re-issue the query")]
    Invalidated,
}

/// Errors returned by index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Iterator(#[from] IteratorError),

    #[error("dimension mismatch: index has {expected} dimensions, region has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid region: {0}")]
    InvalidRegion(String),

    #[error("data slot {index} out of bounds (num_data {num_data})")]
    SlotOutOfBounds { index: usize, num_data: usize },

    #[error("node {id} is not a {expected} node")]
    UnexpectedNode { id: NodeId, expected: &'static str },
}

impl IndexError {
    /// True when the error is the recoverable iterator invalidation.
    pub fn is_invalidated(&self) -> bool {
        matches!(self, IndexError::Iterator(IteratorError::Invalidated))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for index operations
pub type IndexResult<T> = Result<T, IndexError>;

// ============================================================================
// Metadata & Statistics
// ============================================================================

/// Per-index bookkeeping kept by the storage and persisted with it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub root: Option<NodeId>,
    pub entry_count: u64,
    /// Number of levels; 0 for an empty index, 1 for a lone leaf root.
    pub height: u32,
}

/// Statistics about a storage instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub live_nodes: u64,
    pub free_pages: u64,
    pub high_water_mark: u64,
    pub cached_pages: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub disk_reads: u64,
    pub disk_writes: u64,
}
