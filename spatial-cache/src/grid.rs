//! Uniform grid cache.
//!
//! The grid divides its bounds into `side^D` equal cells, with `side` chosen
//! from the expected entry count and the requested entries per cell. Cells
//! are children of a single root node, numbered with axis 0 varying fastest.
//!
//! An entry is stored in every cell its bounds overlap, so a cell scan alone
//! answers a lookup. A query reports the copy held by the first of those
//! cells that touches the window, so identical entries inserted twice are
//! reported twice. Entries not contained in the grid bounds are stored in
//! the root. Every insertion carries a
//! lineage tag ([`DataId`]) so whole batches can be dropped together.
//!
//! The grid is meant to sit in front of an authoritative store: when an area
//! changes there, [`GridIndex::invalidate`] drops whatever the cells inside
//! that area cached and marks them stale until [`GridIndex::validate`] is
//! called after a refill. An entry spanning an invalidated cell is dropped
//! from the surviving cells as well.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::config::GridConfig;
use crate::entry::Entry;
use crate::node::{GridNode, Node};
use crate::query::{IteratorRegistry, LazyQueryIterator, QueryMode, ReplicaFilter};
use crate::region::Region;
use crate::storage::{IndexStorage, MemoryStorage};
use crate::types::{ConfigError, DataId, IndexError, IndexResult, NodeId, PayloadHandle, StorageStats};
use crate::visitor::{self, InvalidatingVisitor, NodeVisitor, VisitFlow, VisitSummary};

/// Nodes an entry is stored in; the first one is its home, which counts it.
type Targets = SmallVec<[NodeId; 4]>;

type CellRange = SmallVec<[(usize, usize); 2]>;

pub struct GridIndex<S: IndexStorage = MemoryStorage> {
    config: GridConfig,
    layout: Arc<GridLayout>,
    next_tag: DataId,
    storage: Arc<Mutex<S>>,
    iterators: IteratorRegistry,
}

impl GridIndex<MemoryStorage> {
    pub fn new(config: GridConfig) -> IndexResult<Self> {
        Self::with_storage(config, MemoryStorage::new())
    }
}

impl<S: IndexStorage> GridIndex<S> {
    /// Builds the grid on `storage`, or reuses the grid a reopened storage
    /// already holds when its layout matches `config`.
    pub fn with_storage(config: GridConfig, mut storage: S) -> IndexResult<Self> {
        config.validate()?;
        let side = config.cells_per_axis();
        let expected_cells = side.pow(config.bounds.dimension() as u32);

        let (root, cells, next_tag) = match storage.meta().root {
            Some(root) => {
                let node = storage.get(root)?.as_grid()?;
                if node.level != 1 || node.shape != config.bounds || node.cells.len() != expected_cells {
                    return Err(ConfigError::LayoutMismatch(format!(
                        "storage holds a grid of {} cells over {}, requested {} over {}",
                        node.cells.len(),
                        node.shape,
                        expected_cells,
                        config.bounds
                    ))
                    .into());
                }
                let cells = node.cells.clone();
                let next_tag = Self::highest_tag(&mut storage, root, &cells)? + 1;
                (root, cells, next_tag)
            }
            None => {
                let (root, cells) = Self::build(&mut storage, &config, side)?;
                (root, cells, 1)
            }
        };
        log::debug!("grid of {} cells ({} per axis) over {}", cells.len(), side, config.bounds);

        let layout = GridLayout {
            bounds: config.bounds.clone(),
            side,
            root,
            cells,
        };
        Ok(Self {
            config,
            layout: Arc::new(layout),
            next_tag,
            storage: Arc::new(Mutex::new(storage)),
            iterators: IteratorRegistry::new(),
        })
    }

    fn build(storage: &mut S, config: &GridConfig, side: usize) -> IndexResult<(NodeId, Vec<NodeId>)> {
        let capacity = config.entries_per_cell;
        let root = storage.allocate(Node::Grid(GridNode::new(config.bounds.clone(), 1, None, capacity)))?;

        let total = side.pow(config.bounds.dimension() as u32);
        let mut cells = Vec::with_capacity(total);
        for index in 0..total {
            let shape = GridLayout::cell_shape(&config.bounds, side, index)?;
            cells.push(storage.allocate(Node::Grid(GridNode::new(shape, 0, Some(root), capacity)))?);
        }
        storage.get_mut(root)?.as_grid_mut()?.cells = cells.clone();

        let meta = storage.meta_mut();
        meta.root = Some(root);
        meta.height = 2;
        Ok((root, cells))
    }

    fn highest_tag(storage: &mut S, root: NodeId, cells: &[NodeId]) -> IndexResult<DataId> {
        let mut highest = 0;
        for &id in std::iter::once(&root).chain(cells) {
            let node = storage.get(id)?.as_grid()?;
            if let Some(max) = node.data_ids[..node.num_data].iter().max() {
                highest = highest.max(*max);
            }
        }
        Ok(highest)
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Inserts one entry under a fresh lineage tag, which is returned.
    pub fn insert(&mut self, bounds: Region, payload: impl Into<PayloadHandle>) -> IndexResult<DataId> {
        let tag = self.next_tag;
        self.insert_tagged(bounds, payload, tag)?;
        Ok(tag)
    }

    /// Inserts one entry under an existing lineage tag.
    pub fn insert_tagged(
        &mut self,
        bounds: Region,
        payload: impl Into<PayloadHandle>,
        tag: DataId,
    ) -> IndexResult<()> {
        self.check_dimension(&bounds)?;
        self.iterators.invalidate_all();
        let mut storage = self.storage.lock();
        self.store(&mut storage, Entry::new(bounds, payload), tag)?;
        self.next_tag = self.next_tag.max(tag.saturating_add(1));
        storage.mutation_complete()?;
        Ok(())
    }

    /// Inserts all entries under one fresh lineage tag, which is returned.
    pub fn insert_batch<I, P>(&mut self, entries: I) -> IndexResult<DataId>
    where
        I: IntoIterator<Item = (Region, P)>,
        P: Into<PayloadHandle>,
    {
        let entries: Vec<Entry> = entries
            .into_iter()
            .map(|(bounds, payload)| Entry::new(bounds, payload))
            .collect();
        for entry in &entries {
            self.check_dimension(&entry.bounds)?;
        }

        let tag = self.next_tag;
        self.iterators.invalidate_all();
        let mut storage = self.storage.lock();
        for entry in entries {
            self.store(&mut storage, entry, tag)?;
        }
        self.next_tag = tag.saturating_add(1);
        storage.mutation_complete()?;
        Ok(tag)
    }

    /// Removes one entry equal to `(bounds, payload)` from every cell holding
    /// it. Returns false when no cell does.
    pub fn delete(&mut self, bounds: &Region, payload: impl Into<PayloadHandle>) -> IndexResult<bool> {
        self.check_dimension(bounds)?;
        let entry = Entry::new(bounds.clone(), payload);
        let targets = self.layout.targets(bounds);

        let mut storage = self.storage.lock();
        let mut holders = Targets::new();
        for &id in &targets {
            if storage.get(id)?.as_grid()?.position_of(&entry).is_some() {
                holders.push(id);
            }
        }
        if holders.is_empty() {
            return Ok(false);
        }

        self.iterators.invalidate_all();
        for &id in &holders {
            let node = storage.get_mut(id)?.as_grid_mut()?;
            if let Some(pos) = node.position_of(&entry) {
                node.delete_data(pos)?;
            }
        }
        let meta = storage.meta_mut();
        meta.entry_count = meta.entry_count.saturating_sub(1);
        storage.mutation_complete()?;
        Ok(true)
    }

    /// Removes every entry inserted under `tag`; returns how many.
    pub fn delete_batch(&mut self, tag: DataId) -> IndexResult<usize> {
        self.iterators.invalidate_all();
        let mut storage = self.storage.lock();
        let mut removed = 0;
        for &id in self.layout.nodes() {
            let node = storage.get_mut(id)?.as_grid_mut()?;
            removed += (0..node.num_data)
                .filter_map(|i| node.data_at(i))
                .filter(|(entry, data_id)| *data_id == tag && self.layout.is_home(id, &entry.bounds))
                .count();
            node.delete_tagged(tag);
        }

        let meta = storage.meta_mut();
        meta.entry_count = meta.entry_count.saturating_sub(removed as u64);
        storage.mutation_complete()?;
        log::debug!("deleted batch {} ({} entries)", tag, removed);
        Ok(removed)
    }

    /// Removes the entry in slot `index` of grid node `node`, moving the
    /// node's last entry into the freed slot. The entry's copies in the other
    /// cells it spans go with it.
    pub fn delete_data(&mut self, node: NodeId, index: usize) -> IndexResult<Entry> {
        let mut storage = self.storage.lock();
        let num_data = storage.get(node)?.as_grid()?.num_data;
        if index >= num_data {
            return Err(IndexError::SlotOutOfBounds { index, num_data });
        }

        self.iterators.invalidate_all();
        let entry = storage.get_mut(node)?.as_grid_mut()?.delete_data(index)?;
        let targets = self.layout.targets(&entry.bounds);
        if targets.contains(&node) {
            for &id in targets.iter().filter(|&&id| id != node) {
                let cell = storage.get_mut(id)?.as_grid_mut()?;
                if let Some(pos) = cell.position_of(&entry) {
                    cell.delete_data(pos)?;
                }
            }
        }
        let meta = storage.meta_mut();
        meta.entry_count = meta.entry_count.saturating_sub(1);
        storage.mutation_complete()?;
        Ok(entry)
    }

    /// Drops the cached entries of every grid node whose shape lies inside
    /// `region` (every node when `None`) and marks those nodes stale.
    /// Entries that also lived in another cell are removed there too.
    /// Returns the ids of the stale nodes.
    pub fn invalidate(&mut self, region: Option<Region>) -> IndexResult<Vec<NodeId>> {
        if let Some(region) = &region {
            self.check_dimension(region)?;
        }
        self.iterators.invalidate_all();

        let mut storage = self.storage.lock();
        let mut invalidator = InvalidatingVisitor::new(region);
        visitor::visit(&mut *storage, self.layout.root, &mut invalidator)?;
        let invalidated = invalidator.into_invalidated();
        let spilled = self.drop_replicas_of(&mut storage, &invalidated)?;
        let remaining = self.count_entries(&mut storage)?;
        storage.meta_mut().entry_count = remaining;
        storage.mutation_complete()?;

        log::debug!(
            "invalidated {} grid nodes ({} copies dropped elsewhere), {} entries remain",
            invalidated.len(),
            spilled,
            remaining
        );
        Ok(invalidated)
    }

    /// Marks the stale grid nodes whose shape lies inside `window` as valid
    /// again. Returns their ids.
    pub fn validate(&mut self, window: &Region) -> IndexResult<Vec<NodeId>> {
        self.check_dimension(window)?;
        self.iterators.invalidate_all();

        let mut storage = self.storage.lock();
        let mut validator = ValidatingVisitor {
            window: window.clone(),
            validated: Vec::new(),
        };
        let summary = visitor::visit(&mut *storage, self.layout.root, &mut validator)?;
        if summary.nodes_modified > 0 {
            storage.mutation_complete()?;
        }
        Ok(validator.validated)
    }

    /// Drops every entry and rebuilds empty, valid cells.
    pub fn clear(&mut self) -> IndexResult<()> {
        self.iterators.invalidate_all();
        let mut storage = self.storage.lock();
        storage.reset()?;
        let side = self.layout.side;
        let (root, cells) = Self::build(&mut storage, &self.config, side)?;
        self.layout = Arc::new(GridLayout {
            bounds: self.config.bounds.clone(),
            side,
            root,
            cells,
        });
        self.next_tag = 1;
        storage.mutation_complete()?;
        Ok(())
    }

    pub fn flush(&mut self) -> IndexResult<()> {
        Ok(self.storage.lock().flush()?)
    }

    pub fn close(mut self) -> IndexResult<()> {
        self.iterators.invalidate_all();
        self.flush()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Lazily yields the entries intersecting `window`, each stored entry
    /// once however many cells hold it.
    pub fn query(&self, window: &Region) -> IndexResult<LazyQueryIterator<S>> {
        self.query_with_mode(window, QueryMode::Intersects)
    }

    /// Lazily yields the entries lying entirely inside `window`, each once.
    pub fn query_contained(&self, window: &Region) -> IndexResult<LazyQueryIterator<S>> {
        self.query_with_mode(window, QueryMode::Contained)
    }

    fn query_with_mode(&self, window: &Region, mode: QueryMode) -> IndexResult<LazyQueryIterator<S>> {
        self.check_dimension(window)?;
        let layout = Arc::clone(&self.layout);
        let scope = window.clone();
        let owns: ReplicaFilter = Box::new(move |node: NodeId, entry: &Entry| {
            layout.owner(&entry.bounds, &scope) == Some(node)
        });
        Ok(LazyQueryIterator::new(
            Arc::clone(&self.storage),
            Some(self.layout.root),
            window.clone(),
            mode,
            &self.iterators,
            Some(owns),
        ))
    }

    /// True when no node that could hold entries overlapping `window` is
    /// stale.
    pub fn is_cached(&self, window: &Region) -> IndexResult<bool> {
        self.check_dimension(window)?;
        let mut nodes = Targets::new();
        if !self.config.bounds.contains(window) {
            nodes.push(self.layout.root);
        }
        if self.config.bounds.touches(window) {
            nodes.extend(self.layout.cells_in(&self.layout.cell_range(window)));
        }

        let mut storage = self.storage.lock();
        for id in nodes {
            if !storage.get(id)?.as_grid()?.valid {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn visit<V: NodeVisitor + ?Sized>(&mut self, visitor: &mut V) -> IndexResult<VisitSummary> {
        if !visitor.is_data_visitor() {
            self.iterators.invalidate_all();
        }
        let mut storage = self.storage.lock();
        let summary = visitor::visit(&mut *storage, self.layout.root, visitor)?;
        if summary.nodes_modified > 0 {
            storage.mutation_complete()?;
        }
        Ok(summary)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn cell_count(&self) -> usize {
        self.layout.cells.len()
    }

    pub fn cells_per_axis(&self) -> usize {
        self.layout.side
    }

    /// Cell ids, axis 0 varying fastest.
    pub fn cells(&self) -> &[NodeId] {
        &self.layout.cells
    }

    /// The cell containing `point`; `None` outside the grid bounds.
    pub fn cell_for_point(&self, point: &[f64]) -> IndexResult<Option<NodeId>> {
        let region = Region::point(point)?;
        self.check_dimension(&region)?;
        if !self.config.bounds.contains(&region) {
            return Ok(None);
        }
        Ok(self.layout.cells_in(&self.layout.cell_range(&region)).first().copied())
    }

    pub fn root_id(&self) -> NodeId {
        self.layout.root
    }

    pub fn node(&self, id: NodeId) -> IndexResult<Node> {
        Ok(self.storage.lock().get(id)?.clone())
    }

    /// Number of distinct entries currently cached.
    pub fn len(&self) -> u64 {
        self.storage.lock().meta().entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StorageStats {
        self.storage.lock().stats()
    }

    pub fn live_iterators(&self) -> usize {
        self.iterators.live_count()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn check_dimension(&self, region: &Region) -> IndexResult<()> {
        let expected = self.config.bounds.dimension();
        if region.dimension() != expected {
            return Err(IndexError::DimensionMismatch {
                expected,
                actual: region.dimension(),
            });
        }
        Ok(())
    }

    fn store(&self, storage: &mut S, entry: Entry, tag: DataId) -> IndexResult<()> {
        let targets = self.layout.targets(&entry.bounds);
        log::trace!("storing {} in {} grid nodes", entry.payload, targets.len());
        for id in targets {
            storage.get_mut(id)?.as_grid_mut()?.insert_data(entry.clone(), tag);
        }
        storage.meta_mut().entry_count += 1;
        Ok(())
    }

    /// Distinct entries left in the grid, counting each at its home node.
    fn count_entries(&self, storage: &mut S) -> IndexResult<u64> {
        let mut count = 0;
        for &id in self.layout.nodes() {
            let node = storage.get(id)?.as_grid()?;
            count += (0..node.num_data)
                .filter_map(|i| node.data_at(i))
                .filter(|(entry, _)| self.layout.is_home(id, &entry.bounds))
                .count() as u64;
        }
        Ok(count)
    }

    /// Removes, from the cells that survived an invalidation, every entry
    /// that was also stored in one of the `invalidated` nodes. Returns how
    /// many copies were removed.
    fn drop_replicas_of(&self, storage: &mut S, invalidated: &[NodeId]) -> IndexResult<usize> {
        if invalidated.is_empty() {
            return Ok(0);
        }
        let gone: HashSet<NodeId> = invalidated.iter().copied().collect();
        let spans_gone = |entry: &Entry| {
            self.layout
                .targets(&entry.bounds)
                .iter()
                .any(|id| gone.contains(id))
        };

        let mut removed = 0;
        for &id in self.layout.cells.iter().filter(|id| !gone.contains(*id)) {
            let node = storage.get(id)?.as_grid()?;
            if !(0..node.num_data)
                .filter_map(|i| node.data_at(i))
                .any(|(entry, _)| spans_gone(entry))
            {
                continue;
            }

            let node = storage.get_mut(id)?.as_grid_mut()?;
            let mut i = 0;
            while i < node.num_data {
                if node.data_at(i).is_some_and(|(entry, _)| spans_gone(entry)) {
                    // the last entry moves into `i` and is checked next
                    node.delete_data(i)?;
                    removed += 1;
                } else {
                    i += 1;
                }
            }
        }
        Ok(removed)
    }
}

// ============================================================================
// Cell geometry
// ============================================================================

/// Where the cells of one grid lie; shared with its query iterators.
#[derive(Debug)]
struct GridLayout {
    bounds: Region,
    side: usize,
    root: NodeId,
    cells: Vec<NodeId>,
}

impl GridLayout {
    fn cell_shape(bounds: &Region, side: usize, index: usize) -> IndexResult<Region> {
        let dims = bounds.dimension();
        let mut min: SmallVec<[f64; 2]> = SmallVec::with_capacity(dims);
        let mut max: SmallVec<[f64; 2]> = SmallVec::with_capacity(dims);
        let mut rest = index;
        for axis in 0..dims {
            let cell = rest % side;
            rest /= side;
            let width = bounds.extent(axis) / side as f64;
            let lo = bounds.min()[axis] + width * cell as f64;
            let hi = if cell + 1 == side {
                bounds.max()[axis]
            } else {
                lo + width
            };
            min.push(lo);
            max.push(hi);
        }
        Region::new(&min, &max)
    }

    /// The root followed by every cell.
    fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        std::iter::once(&self.root).chain(&self.cells)
    }

    /// Per axis, the first and last cell whose interior `bounds` overlaps.
    /// A bounds lying on a cell boundary maps to the cell above it.
    fn cell_range(&self, bounds: &Region) -> CellRange {
        let last = self.side - 1;
        let clamp = |v: f64| -> usize {
            if v <= 0.0 {
                0
            } else {
                (v as usize).min(last)
            }
        };
        (0..bounds.dimension())
            .map(|axis| {
                let origin = self.bounds.min()[axis];
                let width = self.bounds.extent(axis) / self.side as f64;
                if width <= 0.0 {
                    return (0, 0);
                }
                let lo = clamp(((bounds.min()[axis] - origin) / width).floor());
                let hi = clamp(((bounds.max()[axis] - origin) / width).ceil() - 1.0);
                (lo, hi.max(lo))
            })
            .collect()
    }

    fn cells_in(&self, range: &CellRange) -> Targets {
        self.cell_indices(range)
            .into_iter()
            .filter_map(|index| self.cells.get(index).copied())
            .collect()
    }

    /// Row-major indices of the cells in `range`, axis 0 varying fastest.
    fn cell_indices(&self, range: &CellRange) -> SmallVec<[usize; 4]> {
        let mut out = SmallVec::new();
        let mut cursor: SmallVec<[usize; 2]> = range.iter().map(|&(lo, _)| lo).collect();
        loop {
            let mut index = 0;
            let mut stride = 1;
            for &c in &cursor {
                index += c * stride;
                stride *= self.side;
            }
            out.push(index);

            // odometer step, axis 0 fastest
            let mut axis = 0;
            loop {
                if axis == cursor.len() {
                    return out;
                }
                if cursor[axis] < range[axis].1 {
                    cursor[axis] += 1;
                    break;
                }
                cursor[axis] = range[axis].0;
                axis += 1;
            }
        }
    }

    fn targets(&self, bounds: &Region) -> Targets {
        if self.bounds.contains(bounds) {
            self.cells_in(&self.cell_range(bounds))
        } else {
            smallvec::smallvec![self.root]
        }
    }

    fn is_home(&self, node: NodeId, bounds: &Region) -> bool {
        self.targets(bounds).first() == Some(&node)
    }

    /// The node whose copy of an entry a query over `window` reports: the
    /// first target cell whose shape touches the window, or the root for
    /// entries outside the grid.
    fn owner(&self, bounds: &Region, window: &Region) -> Option<NodeId> {
        if !self.bounds.contains(bounds) {
            return Some(self.root);
        }
        self.cell_indices(&self.cell_range(bounds))
            .into_iter()
            .find(|&index| {
                Self::cell_shape(&self.bounds, self.side, index).is_ok_and(|shape| shape.touches(window))
            })
            .and_then(|index| self.cells.get(index).copied())
    }
}

/// Marks stale grid nodes inside a window as valid.
struct ValidatingVisitor {
    window: Region,
    validated: Vec<NodeId>,
}

impl NodeVisitor for ValidatingVisitor {
    fn is_data_visitor(&self) -> bool {
        false
    }

    fn visit_node(&mut self, node: &mut Node) -> VisitFlow {
        if node.parent().is_some() && !node.bounds().is_some_and(|b| b.touches(&self.window)) {
            return VisitFlow::Prune;
        }
        if let Node::Grid(grid) = node {
            if !grid.valid && self.window.contains(&grid.shape) {
                grid.valid = true;
                self.validated.push(grid.id);
            }
        }
        VisitFlow::Continue
    }
}
