//! Constants shared by the index implementations and the paged storage.

/// Default page size (16KB) - balances I/O efficiency and memory usage
pub const DEFAULT_PAGE_SIZE: usize = 16384;

/// Smallest page size accepted by the paged storage
pub const MIN_PAGE_SIZE: usize = 512;

/// Default maximum number of entries (or children) per R-tree node
pub const DEFAULT_MAX_NODE_ENTRIES: usize = 64;

/// Default minimum entries before underflow (roughly 40% of max)
pub const DEFAULT_MIN_NODE_ENTRIES: usize = 25;

/// Default cache size in number of pages (16MB with 16KB pages)
pub const DEFAULT_CACHE_PAGES: usize = 1024;

/// Default number of entries a quadtree node holds before subdividing
pub const DEFAULT_QUAD_CAPACITY: usize = 16;

/// Default maximum quadtree depth (root is depth 0)
pub const DEFAULT_QUAD_MAX_DEPTH: u32 = 12;

/// Default target number of entries per grid cell
pub const DEFAULT_ENTRIES_PER_CELL: usize = 32;

/// Magic number for file format identification
pub const MAGIC: u32 = 0x5343_4958; // "SCIX"

/// File format version
pub const VERSION: u32 = 1;

/// Page 0 holds the file header, node pages start at 1
pub const HEADER_PAGE: u64 = 0;
