//! SpatialIndex trait definition shared by all index kinds.

use crate::grid::GridIndex;
use crate::quadtree::QuadtreeIndex;
use crate::query::LazyQueryIterator;
use crate::region::Region;
use crate::rtree::RTreeIndex;
use crate::storage::IndexStorage;
use crate::types::{IndexResult, PayloadHandle};

/// A bounding-box index over opaque payload handles.
///
/// Each index kind also offers richer inherent methods; this trait covers
/// what callers need to swap one kind for another.
pub trait SpatialIndex {
    /// Storage the index keeps its nodes in.
    type Storage: IndexStorage;

    /// Adds an entry.
    fn insert(&mut self, bounds: Region, payload: PayloadHandle) -> IndexResult<()>;

    /// Removes one matching entry. Returns false when none exists.
    fn delete(&mut self, bounds: &Region, payload: PayloadHandle) -> IndexResult<bool>;

    /// Lazily yields the entries intersecting `window`.
    fn query(&self, window: &Region) -> IndexResult<LazyQueryIterator<Self::Storage>>;

    /// Gets the number of entries.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry.
    fn clear(&mut self) -> IndexResult<()>;

    /// Persists pending changes; a no-op for in-memory storage.
    fn flush(&mut self) -> IndexResult<()>;
}

impl<S: IndexStorage> SpatialIndex for RTreeIndex<S> {
    type Storage = S;

    fn insert(&mut self, bounds: Region, payload: PayloadHandle) -> IndexResult<()> {
        RTreeIndex::insert(self, bounds, payload)
    }

    fn delete(&mut self, bounds: &Region, payload: PayloadHandle) -> IndexResult<bool> {
        RTreeIndex::delete(self, bounds, payload)
    }

    fn query(&self, window: &Region) -> IndexResult<LazyQueryIterator<S>> {
        RTreeIndex::query(self, window)
    }

    fn len(&self) -> u64 {
        RTreeIndex::len(self)
    }

    fn clear(&mut self) -> IndexResult<()> {
        RTreeIndex::clear(self)
    }

    fn flush(&mut self) -> IndexResult<()> {
        RTreeIndex::flush(self)
    }
}

impl<S: IndexStorage> SpatialIndex for QuadtreeIndex<S> {
    type Storage = S;

    fn insert(&mut self, bounds: Region, payload: PayloadHandle) -> IndexResult<()> {
        QuadtreeIndex::insert(self, bounds, payload)
    }

    fn delete(&mut self, bounds: &Region, payload: PayloadHandle) -> IndexResult<bool> {
        QuadtreeIndex::delete(self, bounds, payload)
    }

    fn query(&self, window: &Region) -> IndexResult<LazyQueryIterator<S>> {
        QuadtreeIndex::query(self, window)
    }

    fn len(&self) -> u64 {
        QuadtreeIndex::len(self)
    }

    fn clear(&mut self) -> IndexResult<()> {
        QuadtreeIndex::clear(self)
    }

    fn flush(&mut self) -> IndexResult<()> {
        QuadtreeIndex::flush(self)
    }
}

impl<S: IndexStorage> SpatialIndex for GridIndex<S> {
    type Storage = S;

    /// Inserts under a fresh lineage tag.
    fn insert(&mut self, bounds: Region, payload: PayloadHandle) -> IndexResult<()> {
        GridIndex::insert(self, bounds, payload).map(|_| ())
    }

    fn delete(&mut self, bounds: &Region, payload: PayloadHandle) -> IndexResult<bool> {
        GridIndex::delete(self, bounds, payload)
    }

    fn query(&self, window: &Region) -> IndexResult<LazyQueryIterator<S>> {
        GridIndex::query(self, window)
    }

    fn len(&self) -> u64 {
        GridIndex::len(self)
    }

    fn clear(&mut self) -> IndexResult<()> {
        GridIndex::clear(self)
    }

    fn flush(&mut self) -> IndexResult<()> {
        GridIndex::flush(self)
    }
}
