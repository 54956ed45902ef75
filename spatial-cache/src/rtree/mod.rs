//! R-tree over an [`IndexStorage`].
//!
//! Key properties:
//! - Nodes hold between m and M items (the root may hold fewer)
//! - Internal nodes cache their children's bounds, so a query only loads
//!   the pages it descends into
//! - Overflow splits the node (quadratic or linear seeds) and propagates up
//!   through parent ids; a root split adds a level
//! - Underflow after a delete dissolves the node and reinserts its entries
//!
//! The same code runs on [`MemoryStorage`] and on [`PagedStorage`]; the
//! storage decides where nodes live.

mod split;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{IndexConfig, PagedOptions};
use crate::entry::Entry;
use crate::node::{ChildRef, Node, TreeContents, TreeNode};
use crate::query::{IteratorRegistry, LazyQueryIterator, QueryMode};
use crate::region::Region;
use crate::storage::{page_file, IndexStorage, IntegrityReport, MemoryStorage, PagedStorage};
use crate::types::{ConfigError, IndexError, IndexResult, NodeId, PayloadHandle, StorageStats};
use crate::visitor::{self, NodeVisitor, VisitSummary, WindowVisitor};

pub struct RTreeIndex<S: IndexStorage = MemoryStorage> {
    config: IndexConfig,
    storage: Arc<Mutex<S>>,
    iterators: IteratorRegistry,
}

impl RTreeIndex<MemoryStorage> {
    pub fn in_memory(config: IndexConfig) -> IndexResult<Self> {
        Self::with_storage(config, MemoryStorage::new())
    }
}

impl RTreeIndex<PagedStorage> {
    /// Creates a new paged R-tree file at `path`, replacing any existing one.
    pub fn create_paged(
        path: impl AsRef<Path>,
        config: IndexConfig,
        options: PagedOptions,
    ) -> IndexResult<Self> {
        config.validate()?;
        Self::check_page_fit(&config, options.page_size)?;
        let storage = PagedStorage::create(path, options)?;
        Self::with_storage(config, storage)
    }

    /// Reopens a paged R-tree; the layout is read back from the file.
    pub fn open_paged(path: impl AsRef<Path>, options: PagedOptions) -> IndexResult<Self> {
        let storage = PagedStorage::open(path, options)?;
        let config = storage
            .layout()
            .ok_or_else(|| ConfigError::LayoutMismatch("file holds no R-tree layout".into()))?;
        Self::with_storage(config, storage)
    }

    pub fn check_integrity(&self) -> IndexResult<IntegrityReport> {
        Ok(self.storage.lock().check_integrity()?)
    }
}

impl<S: IndexStorage> RTreeIndex<S> {
    pub fn with_storage(config: IndexConfig, mut storage: S) -> IndexResult<Self> {
        config.validate()?;
        if let Some(page_size) = storage.page_capacity() {
            Self::check_page_fit(&config, page_size)?;
        }
        match storage.layout() {
            Some(layout) if layout != config => {
                return Err(ConfigError::LayoutMismatch(format!(
                    "storage holds {:?}, requested {:?}",
                    layout, config
                ))
                .into());
            }
            Some(_) => {}
            None => storage.record_layout(config),
        }

        Ok(Self {
            config,
            storage: Arc::new(Mutex::new(storage)),
            iterators: IteratorRegistry::new(),
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Fails unless a node holding `max_node_entries + 1` items, as an
    /// overflowing node does until it is split, fits on one page.
    fn check_page_fit(config: &IndexConfig, page_size: usize) -> IndexResult<()> {
        let origin = vec![0.0; config.dimension];
        let bounds = Region::new(&origin, &origin)?;
        let mut node = TreeNode::leaf(Some(NodeId::MAX));
        node.id = NodeId::MAX;
        node.bounds = Some(bounds.clone());
        node.contents = TreeContents::Leaf(
            (0..=config.max_node_entries)
                .map(|_| Entry::new(bounds.clone(), u64::MAX))
                .collect(),
        );

        let needed = page_file::encoded_page_len(&Node::Tree(node))?;
        if needed > page_size {
            return Err(ConfigError::NodeTooLarge {
                max_node_entries: config.max_node_entries,
                needed,
                page_size,
            }
            .into());
        }
        Ok(())
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    pub fn insert(&mut self, bounds: Region, payload: impl Into<PayloadHandle>) -> IndexResult<()> {
        self.check_dimension(&bounds)?;
        self.iterators.invalidate_all();

        let mut storage = self.storage.lock();
        self.insert_entry(&mut storage, Entry::new(bounds, payload))?;
        storage.meta_mut().entry_count += 1;
        storage.mutation_complete()?;
        Ok(())
    }

    /// Removes one entry equal to `(bounds, payload)`. Returns false when no
    /// such entry exists.
    pub fn delete(&mut self, bounds: &Region, payload: impl Into<PayloadHandle>) -> IndexResult<bool> {
        self.check_dimension(bounds)?;
        let payload = payload.into();

        let mut storage = self.storage.lock();
        let Some(root) = storage.meta().root else {
            return Ok(false);
        };
        let Some(leaf_id) = self.find_leaf(&mut storage, root, bounds, payload)? else {
            return Ok(false);
        };

        self.iterators.invalidate_all();
        {
            let leaf = storage.get_mut(leaf_id)?.as_tree_mut()?;
            if let TreeContents::Leaf(entries) = &mut leaf.contents {
                if let Some(pos) = entries.iter().position(|e| e.matches(bounds, payload)) {
                    entries.remove(pos);
                }
            }
            leaf.recompute_bounds();
        }

        let orphans = self.condense(&mut storage, leaf_id)?;
        let meta = storage.meta_mut();
        meta.entry_count = meta.entry_count.saturating_sub(1);
        self.shorten(&mut storage)?;

        if !orphans.is_empty() {
            log::debug!("reinserting {} entries after underflow", orphans.len());
        }
        for entry in orphans {
            self.insert_entry(&mut storage, entry)?;
        }
        storage.mutation_complete()?;
        Ok(true)
    }

    /// Drops every entry and node.
    pub fn clear(&mut self) -> IndexResult<()> {
        self.iterators.invalidate_all();
        let mut storage = self.storage.lock();
        storage.reset()?;
        storage.record_layout(self.config);
        storage.mutation_complete()?;
        Ok(())
    }

    pub fn flush(&mut self) -> IndexResult<()> {
        Ok(self.storage.lock().flush()?)
    }

    /// Invalidates live iterators and flushes. Paged files can be reopened
    /// with [`RTreeIndex::open_paged`] afterwards.
    pub fn close(mut self) -> IndexResult<()> {
        self.iterators.invalidate_all();
        self.flush()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Lazily yields the entries intersecting `window`.
    pub fn query(&self, window: &Region) -> IndexResult<LazyQueryIterator<S>> {
        self.query_with_mode(window, QueryMode::Intersects)
    }

    /// Lazily yields the entries lying entirely inside `window`.
    pub fn query_contained(&self, window: &Region) -> IndexResult<LazyQueryIterator<S>> {
        self.query_with_mode(window, QueryMode::Contained)
    }

    fn query_with_mode(&self, window: &Region, mode: QueryMode) -> IndexResult<LazyQueryIterator<S>> {
        self.check_dimension(window)?;
        let root = self.storage.lock().meta().root;
        Ok(LazyQueryIterator::new(
            Arc::clone(&self.storage),
            root,
            window.clone(),
            mode,
            &self.iterators,
            None,
        ))
    }

    /// Collects the entries intersecting `window` in one traversal.
    pub fn collect_window(&self, window: &Region) -> IndexResult<Vec<Entry>> {
        self.check_dimension(window)?;
        let mut storage = self.storage.lock();
        let Some(root) = storage.meta().root else {
            return Ok(Vec::new());
        };
        let mut collector = WindowVisitor::new(window.clone(), QueryMode::Intersects);
        visitor::visit(&mut *storage, root, &mut collector)?;
        Ok(collector.into_matches())
    }

    /// The `k` entries nearest to `point`, closest first, with their minimum
    /// point-to-box distance.
    pub fn nearest(&self, point: &[f64], k: usize) -> IndexResult<Vec<(Entry, f64)>> {
        if point.len() != self.config.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.config.dimension,
                actual: point.len(),
            });
        }
        let mut results = Vec::with_capacity(k);
        if k == 0 {
            return Ok(results);
        }
        let mut storage = self.storage.lock();
        let Some(root) = storage.meta().root else {
            return Ok(results);
        };

        let mut heap = BinaryHeap::new();
        heap.push(Candidate {
            distance: 0.0,
            item: CandidateItem::Node(root),
        });
        while let Some(candidate) = heap.pop() {
            match candidate.item {
                CandidateItem::Entry(entry) => {
                    results.push((entry, candidate.distance));
                    if results.len() == k {
                        break;
                    }
                }
                CandidateItem::Node(id) => {
                    let node = storage.get(id)?.as_tree()?;
                    for entry in node.entries() {
                        heap.push(Candidate {
                            distance: entry.bounds.min_distance(point),
                            item: CandidateItem::Entry(entry.clone()),
                        });
                    }
                    for child in node.children() {
                        heap.push(Candidate {
                            distance: child.bounds.min_distance(point),
                            item: CandidateItem::Node(child.id),
                        });
                    }
                }
            }
        }
        Ok(results)
    }

    /// Runs `visitor` over the whole tree. Node visitors may modify nodes,
    /// so they invalidate live iterators first.
    pub fn visit<V: NodeVisitor + ?Sized>(&mut self, visitor: &mut V) -> IndexResult<VisitSummary> {
        if !visitor.is_data_visitor() {
            self.iterators.invalidate_all();
        }
        let mut storage = self.storage.lock();
        let Some(root) = storage.meta().root else {
            return Ok(VisitSummary::default());
        };
        let summary = visitor::visit(&mut *storage, root, visitor)?;
        if summary.nodes_modified > 0 {
            storage.mutation_complete()?;
        }
        Ok(summary)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Combined bounds of all entries; `None` when empty.
    pub fn bounds(&self) -> IndexResult<Option<Region>> {
        let mut storage = self.storage.lock();
        match storage.meta().root {
            Some(root) => Ok(storage.get(root)?.bounds().cloned()),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> u64 {
        self.storage.lock().meta().entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of levels; 0 when empty.
    pub fn height(&self) -> u32 {
        self.storage.lock().meta().height
    }

    pub fn root_id(&self) -> Option<NodeId> {
        self.storage.lock().meta().root
    }

    /// A copy of node `id`.
    pub fn node(&self, id: NodeId) -> IndexResult<Node> {
        Ok(self.storage.lock().get(id)?.clone())
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
        if region.dimension() != self.config.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.config.dimension,
                actual: region.dimension(),
            });
        }
        Ok(())
    }

    fn insert_entry(&self, storage: &mut S, entry: Entry) -> IndexResult<()> {
        let root = match storage.meta().root {
            Some(root) => root,
            None => {
                let root = storage.allocate(Node::Tree(TreeNode::leaf(None)))?;
                let meta = storage.meta_mut();
                meta.root = Some(root);
                meta.height = 1;
                root
            }
        };

        let leaf_id = self.choose_leaf(storage, root, &entry.bounds)?;
        let overflow = {
            let leaf = storage.get_mut(leaf_id)?.as_tree_mut()?;
            leaf.bounds = Some(match leaf.bounds.take() {
                Some(bounds) => bounds.combine(&entry.bounds),
                None => entry.bounds.clone(),
            });
            match &mut leaf.contents {
                TreeContents::Leaf(entries) => entries.push(entry),
                TreeContents::Internal(_) => {
                    return Err(IndexError::UnexpectedNode {
                        id: leaf_id,
                        expected: "leaf",
                    })
                }
            }
            leaf.len() > self.config.max_node_entries
        };

        let sibling = if overflow {
            Some(self.split(storage, leaf_id)?)
        } else {
            None
        };
        self.adjust_tree(storage, leaf_id, sibling)
    }

    /// Least enlargement, then smallest resulting area, then lowest id.
    fn choose_leaf(&self, storage: &mut S, root: NodeId, bounds: &Region) -> IndexResult<NodeId> {
        let mut current = root;
        loop {
            let node = storage.get(current)?.as_tree()?;
            if node.is_leaf() {
                return Ok(current);
            }
            let best = node
                .children()
                .iter()
                .map(|c| (c.bounds.enlargement(bounds), c.bounds.combine(bounds).area(), c.id))
                .min_by(|a, b| {
                    a.0.total_cmp(&b.0)
                        .then(a.1.total_cmp(&b.1))
                        .then(a.2.cmp(&b.2))
                });
            match best {
                Some((_, _, child)) => {
                    log::trace!("choose_leaf: {} -> {}", current, child);
                    current = child;
                }
                None => {
                    return Err(IndexError::UnexpectedNode {
                        id: current,
                        expected: "non-empty internal",
                    })
                }
            }
        }
    }

    /// Moves part of an overflowing node into a new sibling with the same
    /// parent and level. Returns the sibling's id.
    fn split(&self, storage: &mut S, id: NodeId) -> IndexResult<NodeId> {
        let (parent, level, contents) = {
            let node = storage.get_mut(id)?.as_tree_mut()?;
            let contents = std::mem::replace(&mut node.contents, TreeContents::Leaf(Vec::new()));
            (node.parent, node.level, contents)
        };

        let min = self.config.min_node_entries;
        let policy = self.config.split_policy;
        let (kept, moved, moved_children) = match contents {
            TreeContents::Leaf(entries) => {
                let (a, b) = split::partition(entries, |e| &e.bounds, min, policy);
                (TreeContents::Leaf(a), TreeContents::Leaf(b), Vec::new())
            }
            TreeContents::Internal(children) => {
                let (a, b) = split::partition(children, |c| &c.bounds, min, policy);
                let ids: Vec<NodeId> = b.iter().map(|c| c.id).collect();
                (TreeContents::Internal(a), TreeContents::Internal(b), ids)
            }
        };

        {
            let node = storage.get_mut(id)?.as_tree_mut()?;
            node.contents = kept;
            node.recompute_bounds();
        }
        let mut sibling = TreeNode {
            id: 0,
            level,
            parent,
            bounds: None,
            contents: moved,
        };
        sibling.recompute_bounds();
        let sibling_id = storage.allocate(Node::Tree(sibling))?;
        for child in moved_children {
            storage.get_mut(child)?.set_parent(Some(sibling_id));
        }
        log::trace!("split node {} at level {}, sibling {}", id, level, sibling_id);
        Ok(sibling_id)
    }

    /// Walks from `id` to the root, refreshing cached child bounds and
    /// linking in the sibling produced by a split at each level.
    fn adjust_tree(&self, storage: &mut S, mut id: NodeId, mut sibling: Option<NodeId>) -> IndexResult<()> {
        loop {
            let (parent, level, bounds) = {
                let node = storage.get(id)?.as_tree()?;
                (node.parent, node.level, node.bounds.clone())
            };
            let sibling_ref = match sibling {
                Some(sib) => Some(Self::child_ref(storage, sib)?),
                None => None,
            };

            let Some(parent_id) = parent else {
                if let Some(sibling_ref) = sibling_ref {
                    self.grow_root(storage, id, level, bounds, sibling_ref)?;
                }
                return Ok(());
            };

            let overflow = {
                let parent = storage.get_mut(parent_id)?.as_tree_mut()?;
                if let TreeContents::Internal(children) = &mut parent.contents {
                    if let (Some(bounds), Some(pos)) = (bounds, children.iter().position(|c| c.id == id)) {
                        children[pos].bounds = bounds;
                    }
                    if let Some(sibling_ref) = sibling_ref {
                        children.push(sibling_ref);
                    }
                }
                parent.recompute_bounds();
                parent.len() > self.config.max_node_entries
            };

            sibling = if overflow {
                Some(self.split(storage, parent_id)?)
            } else {
                None
            };
            id = parent_id;
        }
    }

    fn child_ref(storage: &mut S, id: NodeId) -> IndexResult<ChildRef> {
        let bounds = storage
            .get(id)?
            .bounds()
            .cloned()
            .ok_or(IndexError::UnexpectedNode {
                id,
                expected: "non-empty tree",
            })?;
        Ok(ChildRef { bounds, id })
    }

    fn grow_root(
        &self,
        storage: &mut S,
        old_root: NodeId,
        level: u32,
        bounds: Option<Region>,
        sibling: ChildRef,
    ) -> IndexResult<()> {
        let bounds = bounds.ok_or(IndexError::UnexpectedNode {
            id: old_root,
            expected: "non-empty tree",
        })?;
        let sibling_id = sibling.id;
        let mut root = TreeNode::internal(level + 1, None);
        root.contents = TreeContents::Internal(vec![ChildRef { bounds, id: old_root }, sibling]);
        root.recompute_bounds();

        let root_id = storage.allocate(Node::Tree(root))?;
        storage.get_mut(old_root)?.set_parent(Some(root_id));
        storage.get_mut(sibling_id)?.set_parent(Some(root_id));
        let meta = storage.meta_mut();
        meta.root = Some(root_id);
        meta.height += 1;
        log::debug!("root split: new root {} (height {})", root_id, meta.height);
        Ok(())
    }

    /// Leaf holding `(bounds, payload)`, searching every child whose bounds
    /// contain `bounds`.
    fn find_leaf(
        &self,
        storage: &mut S,
        root: NodeId,
        bounds: &Region,
        payload: PayloadHandle,
    ) -> IndexResult<Option<NodeId>> {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = storage.get(id)?.as_tree()?;
            match &node.contents {
                TreeContents::Leaf(entries) => {
                    if entries.iter().any(|e| e.matches(bounds, payload)) {
                        return Ok(Some(id));
                    }
                }
                TreeContents::Internal(children) => stack.extend(
                    children
                        .iter()
                        .filter(|c| c.bounds.contains(bounds))
                        .map(|c| c.id),
                ),
            }
        }
        Ok(None)
    }

    /// Walks from `leaf_id` to the root. Underfull (or empty) non-root nodes
    /// are detached and dissolved; the rest get their cached bounds
    /// refreshed. Returns the entries of dissolved nodes.
    fn condense(&self, storage: &mut S, leaf_id: NodeId) -> IndexResult<Vec<Entry>> {
        let mut orphans = Vec::new();
        let mut id = leaf_id;
        loop {
            let (parent, len, bounds) = {
                let node = storage.get(id)?.as_tree()?;
                (node.parent, node.len(), node.bounds.clone())
            };
            let Some(parent_id) = parent else {
                break;
            };

            let detach = len < self.config.min_node_entries || bounds.is_none();
            {
                let parent = storage.get_mut(parent_id)?.as_tree_mut()?;
                if let TreeContents::Internal(children) = &mut parent.contents {
                    if let Some(pos) = children.iter().position(|c| c.id == id) {
                        match bounds {
                            Some(bounds) if !detach => children[pos].bounds = bounds,
                            _ => {
                                children.remove(pos);
                            }
                        }
                    }
                }
                parent.recompute_bounds();
            }
            if detach {
                Self::dissolve(storage, id, &mut orphans)?;
            }
            id = parent_id;
        }
        Ok(orphans)
    }

    /// Releases the subtree below `id`, collecting its entries.
    fn dissolve(storage: &mut S, id: NodeId, orphans: &mut Vec<Entry>) -> IndexResult<()> {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            {
                let node = storage.get(id)?.as_tree()?;
                orphans.extend(node.entries().iter().cloned());
                stack.extend(node.children().iter().map(|c| c.id));
            }
            storage.release(id)?;
        }
        Ok(())
    }

    /// Collapses a root with a single child and releases an empty root.
    fn shorten(&self, storage: &mut S) -> IndexResult<()> {
        while let Some(root) = storage.meta().root {
            let (is_leaf, len, only_child) = {
                let node = storage.get(root)?.as_tree()?;
                (node.is_leaf(), node.len(), node.children().first().map(|c| c.id))
            };
            match (is_leaf, len, only_child) {
                (false, 1, Some(child)) => {
                    storage.release(root)?;
                    storage.get_mut(child)?.set_parent(None);
                    let meta = storage.meta_mut();
                    meta.root = Some(child);
                    meta.height = meta.height.saturating_sub(1);
                    log::debug!("root collapsed into {} (height {})", child, meta.height);
                }
                (_, 0, _) => {
                    storage.release(root)?;
                    let meta = storage.meta_mut();
                    meta.root = None;
                    meta.height = 0;
                    log::debug!("index emptied");
                }
                _ => break,
            }
        }
        Ok(())
    }
}

// ============================================================================
// Nearest-neighbour candidates
// ============================================================================

enum CandidateItem {
    Node(NodeId),
    Entry(Entry),
}

struct Candidate {
    distance: f64,
    item: CandidateItem,
}

impl Candidate {
    fn is_entry(&self) -> bool {
        matches!(self.item, CandidateItem::Entry(_))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    /// Reversed on distance so the max-heap pops the closest first; entries
    /// win ties against nodes.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .distance
            .total_cmp(&self.distance)
            .then_with(|| self.is_entry().cmp(&other.is_entry()))
    }
}
