//! # Spatial Cache - Bounding-Box Spatial Indexes
//!
//! This crate indexes axis-aligned bounding boxes paired with opaque payload
//! handles. Three index kinds share one node model, one storage abstraction
//! and one traversal primitive:
//!
//! - **R-tree**: balanced, quadratic or linear splits, underflow by reinsertion
//! - **Quadtree**: fixed quadrants, straddling entries kept at the parent
//! - **Grid cache**: uniform cells with lineage-tagged batches and region
//!   invalidation, for caching the contents of an authoritative store
//!
//! ## Features
//!
//! - **Pluggable Storage**: in-memory node table or disk pages with an LRU buffer
//! - **Page Reuse**: released pages go on a persisted free-page stack
//! - **Lazy Queries**: iterators fetch nodes by id and stream results
//! - **Safe Iteration**: structural mutations invalidate live iterators, which
//!   then report an error instead of returning wrong results
//! - **Visitors**: one depth-first traversal backs eager queries, invalidation
//!   and user-defined walks
//!
//! ## R-Tree API
//!
//! ```rust,no_run
//! use spatial_cache::{IndexConfig, PagedOptions, RTreeIndex, Region};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut tree = RTreeIndex::create_paged("places.scix", IndexConfig::default(), PagedOptions::default())?;
//! tree.insert(Region::rect(0.0, 0.0, 10.0, 10.0), 1)?;
//!
//! for entry in tree.query(&Region::rect(5.0, 5.0, 15.0, 15.0))? {
//!     println!("{}", entry?.payload);
//! }
//! tree.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Grid Cache API
//!
//! ```rust
//! use spatial_cache::{GridConfig, GridIndex, Region};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut grid = GridIndex::new(GridConfig::new(Region::rect(0.0, 0.0, 100.0, 100.0), 1000))?;
//! grid.insert(Region::rect(1.0, 1.0, 2.0, 2.0), 7)?;
//!
//! // the backing store changed in the lower-left quarter
//! grid.invalidate(Some(Region::rect(0.0, 0.0, 50.0, 50.0)))?;
//! assert!(grid.is_empty());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod entry;
pub mod grid;
pub mod node;
pub mod quadtree;
pub mod query;
pub mod region;
pub mod rtree;
pub mod spatial_index;
pub mod storage;
pub mod types;
pub mod visitor;

// Re-export core types
pub use config::{GridConfig, IndexConfig, PagedOptions, QuadtreeConfig, SplitPolicy};
pub use entry::Entry;
pub use region::{Coords, Region};
pub use types::{
    ConfigError, DataId, IndexError, IndexMeta, IndexResult, IteratorError, NodeId, PayloadHandle,
    StorageError, StorageResult, StorageStats,
};

// Re-export nodes and storage
pub use node::{GridNode, Node, QuadNode, TreeNode};
pub use storage::{IndexStorage, IntegrityReport, MemoryStorage, PagedStorage};

// Re-export indexes
pub use grid::GridIndex;
pub use quadtree::QuadtreeIndex;
pub use rtree::RTreeIndex;
pub use spatial_index::SpatialIndex;

// Re-export traversal and queries
pub use query::{IteratorRegistry, LazyQueryIterator, QueryMode};
pub use visitor::{visit, InvalidatingVisitor, NodeVisitor, VisitFlow, VisitSummary, WindowVisitor};
