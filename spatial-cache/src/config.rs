//! Construction parameters for the indexes and the paged storage.
//!
//! All checks happen here, at construction time. An index that was built
//! from a validated configuration never reports a configuration error later.

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CACHE_PAGES, DEFAULT_ENTRIES_PER_CELL, DEFAULT_MAX_NODE_ENTRIES,
    DEFAULT_MIN_NODE_ENTRIES, DEFAULT_PAGE_SIZE, DEFAULT_QUAD_CAPACITY, DEFAULT_QUAD_MAX_DEPTH,
    MIN_PAGE_SIZE,
};
use crate::region::Region;
use crate::types::ConfigError;

/// How an overflowing R-tree node picks its two split seeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SplitPolicy {
    /// Seeds are the pair wasting the most area; O(n^2) per split.
    #[default]
    Quadratic,
    /// Seeds are the pair with the greatest normalized separation along
    /// any axis; O(n) per split, lower quality.
    Linear,
}

/// R-tree layout parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub dimension: usize,
    /// M: nodes holding more than this split.
    pub max_node_entries: usize,
    /// m: non-root nodes holding fewer than this underflow. Requires m <= M/2.
    pub min_node_entries: usize,
    pub split_policy: SplitPolicy,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dimension: 2,
            max_node_entries: DEFAULT_MAX_NODE_ENTRIES,
            min_node_entries: DEFAULT_MIN_NODE_ENTRIES,
            split_policy: SplitPolicy::Quadratic,
        }
    }
}

impl IndexConfig {
    pub fn new(dimension: usize, max_node_entries: usize, min_node_entries: usize) -> Self {
        Self {
            dimension,
            max_node_entries,
            min_node_entries,
            split_policy: SplitPolicy::default(),
        }
    }

    pub fn with_split_policy(mut self, split_policy: SplitPolicy) -> Self {
        self.split_policy = split_policy;
        self
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dimension == 0 {
            return Err(ConfigError::ZeroDimension);
        }
        if self.max_node_entries < 2 {
            return Err(ConfigError::NodeCapacityTooSmall {
                max: self.max_node_entries,
            });
        }
        if self.min_node_entries == 0 || self.min_node_entries > self.max_node_entries / 2 {
            return Err(ConfigError::MinEntriesOutOfRange {
                min: self.min_node_entries,
                max: self.max_node_entries,
            });
        }
        Ok(())
    }
}

/// Options of the disk-paged storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagedOptions {
    /// Size of every page slot in bytes, header page included.
    pub page_size: usize,
    /// Bound of the in-memory page buffer.
    pub cache_pages: usize,
    /// Flush after every structural mutation.
    pub force_flush: bool,
}

impl Default for PagedOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: DEFAULT_CACHE_PAGES,
            force_flush: false,
        }
    }
}

impl PagedOptions {
    pub fn with_cache_pages(mut self, cache_pages: usize) -> Self {
        self.cache_pages = cache_pages;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_force_flush(mut self, force_flush: bool) -> Self {
        self.force_flush = force_flush;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_pages == 0 {
            return Err(ConfigError::ZeroCapacity("cache_pages"));
        }
        if self.page_size < MIN_PAGE_SIZE {
            return Err(ConfigError::LayoutMismatch(format!(
                "page_size {} below minimum {}",
                self.page_size, MIN_PAGE_SIZE
            )));
        }
        Ok(())
    }
}

/// Quadtree parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuadtreeConfig {
    /// Region covered by the root quadrant.
    pub bounds: Region,
    /// Entries a node holds before it subdivides.
    pub node_capacity: usize,
    /// Nodes at this depth never subdivide (root is depth 0).
    pub max_depth: u32,
}

impl QuadtreeConfig {
    pub fn new(bounds: Region) -> Self {
        Self {
            bounds,
            node_capacity: DEFAULT_QUAD_CAPACITY,
            max_depth: DEFAULT_QUAD_MAX_DEPTH,
        }
    }

    pub fn with_node_capacity(mut self, node_capacity: usize) -> Self {
        self.node_capacity = node_capacity;
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bounds.dimension() != 2 {
            return Err(ConfigError::UnsupportedDimension {
                expected: 2,
                actual: self.bounds.dimension(),
            });
        }
        if self.node_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("node_capacity"));
        }
        if !self.bounds.is_finite() {
            return Err(ConfigError::UnboundedRegion);
        }
        Ok(())
    }
}

/// Grid cache parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Region divided into cells.
    pub bounds: Region,
    /// Expected number of entries.
    pub capacity: usize,
    /// Requested average number of entries per cell.
    pub entries_per_cell: usize,
}

impl GridConfig {
    pub fn new(bounds: Region, capacity: usize) -> Self {
        Self {
            bounds,
            capacity,
            entries_per_cell: DEFAULT_ENTRIES_PER_CELL,
        }
    }

    pub fn with_entries_per_cell(mut self, entries_per_cell: usize) -> Self {
        self.entries_per_cell = entries_per_cell;
        self
    }

    /// Cells along each axis, so that the total cell count is at least
    /// `capacity / entries_per_cell`.
    pub fn cells_per_axis(&self) -> usize {
        let wanted = self.capacity.div_ceil(self.entries_per_cell.max(1)).max(1);
        let dims = self.bounds.dimension() as i32;
        let mut side = (wanted as f64).powf(1.0 / dims as f64).floor().max(1.0) as usize;
        while side.pow(dims as u32) < wanted {
            side += 1;
        }
        side
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity("capacity"));
        }
        if self.entries_per_cell == 0 {
            return Err(ConfigError::ZeroCapacity("entries_per_cell"));
        }
        if !self.bounds.is_finite() {
            return Err(ConfigError::UnboundedRegion);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(IndexConfig::default().validate().is_ok());
        assert!(PagedOptions::default().validate().is_ok());
    }

    #[test]
    fn test_min_must_not_exceed_half_max() {
        assert!(IndexConfig::new(2, 4, 2).validate().is_ok());
        assert_eq!(
            IndexConfig::new(2, 4, 3).validate(),
            Err(ConfigError::MinEntriesOutOfRange { min: 3, max: 4 })
        );
        assert_eq!(
            IndexConfig::new(2, 5, 0).validate(),
            Err(ConfigError::MinEntriesOutOfRange { min: 0, max: 5 })
        );
    }

    #[test]
    fn test_dimension_and_capacity_checks() {
        assert_eq!(
            IndexConfig::new(0, 4, 2).validate(),
            Err(ConfigError::ZeroDimension)
        );
        assert_eq!(
            IndexConfig::new(2, 1, 1).validate(),
            Err(ConfigError::NodeCapacityTooSmall { max: 1 })
        );
    }

    #[test]
    fn test_cache_bounds_must_be_finite() {
        let open = Region::new(&[0.0, 0.0], &[f64::INFINITY, 1.0]).unwrap();
        assert_eq!(
            QuadtreeConfig::new(open.clone()).validate(),
            Err(ConfigError::UnboundedRegion)
        );
        assert_eq!(
            GridConfig::new(open, 10).validate(),
            Err(ConfigError::UnboundedRegion)
        );
    }

    #[test]
    fn test_paged_options_checks() {
        assert!(PagedOptions::default().with_cache_pages(0).validate().is_err());
        assert!(PagedOptions::default().with_page_size(64).validate().is_err());
    }

    #[test]
    fn test_quadtree_requires_two_dimensions() {
        let bounds = Region::new(&[0.0, 0.0, 0.0], &[1.0, 1.0, 1.0]).unwrap();
        assert_eq!(
            QuadtreeConfig::new(bounds).validate(),
            Err(ConfigError::UnsupportedDimension { expected: 2, actual: 3 })
        );
        let ok = QuadtreeConfig::new(Region::rect(0.0, 0.0, 1.0, 1.0));
        assert!(ok.validate().is_ok());
        assert!(ok.with_node_capacity(0).validate().is_err());
    }

    #[test]
    fn test_grid_cells_per_axis() {
        let bounds = Region::rect(0.0, 0.0, 100.0, 100.0);
        assert_eq!(GridConfig::new(bounds.clone(), 100).with_entries_per_cell(1).cells_per_axis(), 10);
        assert_eq!(GridConfig::new(bounds.clone(), 101).with_entries_per_cell(1).cells_per_axis(), 11);
        assert_eq!(GridConfig::new(bounds.clone(), 5).with_entries_per_cell(20).cells_per_axis(), 1);
        assert_eq!(GridConfig::new(bounds, 40).with_entries_per_cell(10).cells_per_axis(), 2);
    }
}
