//! Region quadtree over an [`IndexStorage`].
//!
//! Each node covers a fixed quadrant. A leaf holding more than
//! `node_capacity` entries subdivides into four equal quadrants and pushes
//! down every entry that fits entirely inside one of them. Entries that
//! straddle a quadrant boundary stay at the parent level, so nothing is ever
//! stored twice. Nodes at `max_depth` never subdivide.
//!
//! Entries lying outside the root quadrant are held by the root itself.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::QuadtreeConfig;
use crate::entry::Entry;
use crate::node::{Node, QuadNode};
use crate::query::{IteratorRegistry, LazyQueryIterator, QueryMode};
use crate::region::Region;
use crate::storage::{IndexStorage, MemoryStorage};
use crate::types::{ConfigError, IndexError, IndexResult, NodeId, PayloadHandle, StorageStats};
use crate::visitor::{self, NodeVisitor, VisitFlow, VisitSummary};

pub struct QuadtreeIndex<S: IndexStorage = MemoryStorage> {
    config: QuadtreeConfig,
    root: NodeId,
    storage: Arc<Mutex<S>>,
    iterators: IteratorRegistry,
}

impl QuadtreeIndex<MemoryStorage> {
    pub fn new(config: QuadtreeConfig) -> IndexResult<Self> {
        Self::with_storage(config, MemoryStorage::new())
    }
}

impl<S: IndexStorage> QuadtreeIndex<S> {
    /// Builds a quadtree on `storage`. A storage that already holds a
    /// quadtree over the same bounds is reused as is.
    pub fn with_storage(config: QuadtreeConfig, mut storage: S) -> IndexResult<Self> {
        config.validate()?;
        let root = match storage.meta().root {
            Some(root) => {
                let node = storage.get(root)?.as_quad()?;
                if node.shape != config.bounds {
                    return Err(ConfigError::LayoutMismatch(format!(
                        "storage holds a quadtree over {}, requested {}",
                        node.shape, config.bounds
                    ))
                    .into());
                }
                root
            }
            None => Self::create_root(&mut storage, &config)?,
        };

        Ok(Self {
            config,
            root,
            storage: Arc::new(Mutex::new(storage)),
            iterators: IteratorRegistry::new(),
        })
    }

    fn create_root(storage: &mut S, config: &QuadtreeConfig) -> IndexResult<NodeId> {
        let root = storage.allocate(Node::Quad(QuadNode::new(config.bounds.clone(), 0, None)))?;
        let meta = storage.meta_mut();
        meta.root = Some(root);
        meta.height = 1;
        Ok(root)
    }

    pub fn config(&self) -> &QuadtreeConfig {
        &self.config
    }

    pub fn insert(&mut self, bounds: Region, payload: impl Into<PayloadHandle>) -> IndexResult<()> {
        self.check_dimension(&bounds)?;
        self.iterators.invalidate_all();

        let entry = Entry::new(bounds, payload);
        let mut storage = self.storage.lock();
        let mut current = self.root;
        loop {
            let node = storage.get_mut(current)?.as_quad_mut()?;
            let next = match node.children {
                Some(children) => node.fitting_quadrant(&entry.bounds).map(|q| children[q]),
                None => None,
            };
            match next {
                Some(child) => current = child,
                None => {
                    node.entries.push(entry);
                    let overflow = node.is_leaf()
                        && node.entries.len() > self.config.node_capacity
                        && node.depth < self.config.max_depth;
                    if overflow {
                        self.subdivide(&mut storage, current)?;
                    }
                    break;
                }
            }
        }

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
        let Some((holder, pos)) = self.locate(&mut storage, bounds, payload)? else {
            return Ok(false);
        };

        self.iterators.invalidate_all();
        let (is_leaf, parent) = {
            let node = storage.get_mut(holder)?.as_quad_mut()?;
            node.entries.remove(pos);
            (node.is_leaf(), node.parent)
        };

        let mut candidate = if is_leaf { parent } else { Some(holder) };
        while let Some(id) = candidate {
            if !self.collapse(&mut storage, id)? {
                break;
            }
            candidate = storage.get(id)?.parent();
        }

        let meta = storage.meta_mut();
        meta.entry_count = meta.entry_count.saturating_sub(1);
        storage.mutation_complete()?;
        Ok(true)
    }

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
        Ok(LazyQueryIterator::new(
            Arc::clone(&self.storage),
            Some(self.root),
            window.clone(),
            mode,
            &self.iterators,
            None,
        ))
    }

    pub fn visit<V: NodeVisitor + ?Sized>(&mut self, visitor: &mut V) -> IndexResult<VisitSummary> {
        if !visitor.is_data_visitor() {
            self.iterators.invalidate_all();
        }
        let mut storage = self.storage.lock();
        let summary = visitor::visit(&mut *storage, self.root, visitor)?;
        if summary.nodes_modified > 0 {
            storage.mutation_complete()?;
        }
        Ok(summary)
    }

    /// Drops every entry and node, leaving an empty root.
    pub fn clear(&mut self) -> IndexResult<()> {
        self.iterators.invalidate_all();
        let mut storage = self.storage.lock();
        storage.reset()?;
        self.root = Self::create_root(&mut storage, &self.config)?;
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

    pub fn len(&self) -> u64 {
        self.storage.lock().meta().entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Depth of the deepest node; 0 while the root is a leaf.
    pub fn depth(&self) -> IndexResult<u32> {
        let mut probe = DepthProbe { deepest: 0 };
        visitor::visit(&mut *self.storage.lock(), self.root, &mut probe)?;
        Ok(probe.deepest)
    }

    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> IndexResult<Node> {
        Ok(self.storage.lock().get(id)?.clone())
    }

    pub fn stats(&self) -> StorageStats {
        self.storage.lock().stats()
    }

    pub fn live_iterators(&self) -> usize {
        self.iterators.live_count()
    }

    fn check_dimension(&self, region: &Region) -> IndexResult<()> {
        if region.dimension() != 2 {
            return Err(IndexError::DimensionMismatch {
                expected: 2,
                actual: region.dimension(),
            });
        }
        Ok(())
    }

    /// Creates the four children of leaf `id` and pushes its entries down.
    /// A child that receives too many entries is subdivided in turn.
    fn subdivide(&self, storage: &mut S, id: NodeId) -> IndexResult<()> {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let (depth, quadrants, entries) = {
                let node = storage.get_mut(id)?.as_quad_mut()?;
                let quadrants: Vec<Region> = (0..4).map(|i| node.quadrant(i)).collect();
                (node.depth, quadrants, std::mem::take(&mut node.entries))
            };

            let mut kept = Vec::new();
            let mut buckets: [Vec<Entry>; 4] = Default::default();
            for entry in entries {
                match quadrants.iter().position(|q| q.contains(&entry.bounds)) {
                    Some(q) => buckets[q].push(entry),
                    None => kept.push(entry),
                }
            }

            let mut children = [0; 4];
            for (q, (shape, bucket)) in quadrants.into_iter().zip(buckets).enumerate() {
                let overflow = bucket.len() > self.config.node_capacity && depth + 1 < self.config.max_depth;
                let mut child = QuadNode::new(shape, depth + 1, Some(id));
                child.entries = bucket;
                children[q] = storage.allocate(Node::Quad(child))?;
                if overflow {
                    pending.push(children[q]);
                }
            }

            let node = storage.get_mut(id)?.as_quad_mut()?;
            node.entries = kept;
            node.children = Some(children);
            log::trace!("subdivided quad node {} at depth {}", id, depth);
        }
        Ok(())
    }

    /// Follows the fitting-quadrant path of `bounds`, which is the only path
    /// an entry with those bounds can have been stored on.
    fn locate(
        &self,
        storage: &mut S,
        bounds: &Region,
        payload: PayloadHandle,
    ) -> IndexResult<Option<(NodeId, usize)>> {
        let mut current = self.root;
        loop {
            let node = storage.get(current)?.as_quad()?;
            if let Some(pos) = node.entries.iter().position(|e| e.matches(bounds, payload)) {
                return Ok(Some((current, pos)));
            }
            match node.children {
                Some(children) => match node.fitting_quadrant(bounds) {
                    Some(q) => current = children[q],
                    None => return Ok(None),
                },
                None => return Ok(None),
            }
        }
    }

    /// Merges the four children of `id` back into it when all of them are
    /// leaves and everything fits within the node capacity.
    fn collapse(&self, storage: &mut S, id: NodeId) -> IndexResult<bool> {
        let (children, mut total) = {
            let node = storage.get(id)?.as_quad()?;
            match node.children {
                Some(children) => (children, node.entries.len()),
                None => return Ok(false),
            }
        };
        for child in children {
            let child = storage.get(child)?.as_quad()?;
            if !child.is_leaf() {
                return Ok(false);
            }
            total += child.entries.len();
        }
        if total > self.config.node_capacity {
            return Ok(false);
        }

        let mut absorbed = Vec::with_capacity(total);
        for child in children {
            absorbed.append(&mut storage.get_mut(child)?.as_quad_mut()?.entries);
            storage.release(child)?;
        }
        let node = storage.get_mut(id)?.as_quad_mut()?;
        node.entries.append(&mut absorbed);
        node.children = None;
        log::trace!("collapsed quad node {}", id);
        Ok(true)
    }
}

struct DepthProbe {
    deepest: u32,
}

impl NodeVisitor for DepthProbe {
    fn is_data_visitor(&self) -> bool {
        false
    }

    fn visit_node(&mut self, node: &mut Node) -> VisitFlow {
        self.deepest = self.deepest.max(node.level());
        VisitFlow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PagedStorage;
    use crate::config::PagedOptions;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    fn config() -> QuadtreeConfig {
        QuadtreeConfig::new(Region::rect(0.0, 0.0, 100.0, 100.0))
            .with_node_capacity(4)
            .with_max_depth(6)
    }

    fn payloads<S: IndexStorage>(index: &QuadtreeIndex<S>, window: &Region) -> Vec<u64> {
        let mut found: Vec<u64> = index
            .query(window)
            .unwrap()
            .map(|r| r.unwrap().payload.value())
            .collect();
        found.sort_unstable();
        found
    }

    fn small_box(rng: &mut StdRng) -> Region {
        let x = rng.gen_range(0.0..98.0);
        let y = rng.gen_range(0.0..98.0);
        Region::rect(x, y, x + rng.gen_range(0.0..2.0), y + rng.gen_range(0.0..2.0))
    }

    #[test]
    fn test_rejects_non_planar_regions() {
        let bounds = Region::new(&[0.0, 0.0, 0.0], &[1.0, 1.0, 1.0]).unwrap();
        assert!(QuadtreeIndex::new(QuadtreeConfig::new(bounds.clone())).is_err());

        let mut index = QuadtreeIndex::new(config()).unwrap();
        assert!(matches!(
            index.insert(bounds, 1u64),
            Err(IndexError::DimensionMismatch { expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn test_subdivides_past_capacity() {
        let mut index = QuadtreeIndex::new(config()).unwrap();
        for i in 0..4u64 {
            let x = i as f64;
            index.insert(Region::rect(x, x, x + 0.5, x + 0.5), i).unwrap();
        }
        assert_eq!(index.depth().unwrap(), 0);

        index.insert(Region::rect(60.0, 60.0, 61.0, 61.0), 4u64).unwrap();
        let root = index.node(index.root_id()).unwrap();
        assert_eq!(root.child_count(), 4);
        assert_eq!(root.entry_slots(), 0);
        assert!(index.depth().unwrap() >= 1);
        assert_eq!(index.len(), 5);
    }

    #[test]
    fn test_straddling_entries_stay_at_parent() {
        let mut index = QuadtreeIndex::new(config()).unwrap();
        let straddler = Region::rect(45.0, 45.0, 55.0, 55.0);
        index.insert(straddler.clone(), 99u64).unwrap();
        for i in 0..4u64 {
            let x = 10.0 + i as f64;
            index.insert(Region::rect(x, x, x + 1.0, x + 1.0), i).unwrap();
        }

        let root = index.node(index.root_id()).unwrap().as_quad().unwrap().clone();
        assert!(!root.is_leaf());
        assert_eq!(root.entries.len(), 1);
        assert_eq!(root.entries[0].bounds, straddler);
        assert_eq!(payloads(&index, &Region::rect(50.0, 50.0, 51.0, 51.0)), vec![99]);
    }

    #[test]
    fn test_max_depth_stops_subdivision() {
        let mut index = QuadtreeIndex::new(config().with_max_depth(2)).unwrap();
        for i in 0..50u64 {
            index.insert(Region::point(&[1.0, 1.0]).unwrap(), i).unwrap();
        }
        assert_eq!(index.depth().unwrap(), 2);
        assert_eq!(payloads(&index, &Region::rect(0.0, 0.0, 2.0, 2.0)).len(), 50);
    }

    #[test]
    fn test_entries_outside_root_are_kept() {
        let mut index = QuadtreeIndex::new(config()).unwrap();
        for i in 0..10u64 {
            let x = i as f64 * 9.0;
            index.insert(Region::rect(x, x, x + 1.0, x + 1.0), i).unwrap();
        }
        index.insert(Region::rect(150.0, 150.0, 151.0, 151.0), 500u64).unwrap();
        assert_eq!(payloads(&index, &Region::rect(140.0, 140.0, 160.0, 160.0)), vec![500]);
        assert!(index.delete(&Region::rect(150.0, 150.0, 151.0, 151.0), 500u64).unwrap());
        assert_eq!(index.len(), 10);
    }

    #[test]
    fn test_query_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut index = QuadtreeIndex::new(config()).unwrap();
        let mut inserted = Vec::new();
        for i in 0..400u64 {
            let b = small_box(&mut rng);
            index.insert(b.clone(), i).unwrap();
            inserted.push((b, i));
        }
        for _ in 0..25 {
            let window = small_box(&mut rng).combine(&small_box(&mut rng));
            let mut expected: Vec<u64> = inserted
                .iter()
                .filter(|(b, _)| window.intersects(b))
                .map(|(_, i)| *i)
                .collect();
            expected.sort_unstable();
            assert_eq!(payloads(&index, &window), expected);
        }
        for (b, i) in &inserted {
            assert!(payloads(&index, b).contains(i));
        }
    }

    #[test]
    fn test_delete_collapses_children() {
        let mut rng = StdRng::seed_from_u64(21);
        let mut index = QuadtreeIndex::new(config()).unwrap();
        let mut inserted = Vec::new();
        for i in 0..60u64 {
            let b = small_box(&mut rng);
            index.insert(b.clone(), i).unwrap();
            inserted.push((b, i));
        }
        assert!(index.depth().unwrap() > 0);
        let peak = index.stats().live_nodes;

        for (b, i) in inserted.iter().skip(2) {
            assert!(index.delete(b, *i).unwrap());
        }
        assert_eq!(index.len(), 2);
        assert_eq!(index.depth().unwrap(), 0);
        assert_eq!(index.stats().live_nodes, 1);
        assert!(peak > 1);
        for (b, i) in inserted.iter().take(2) {
            assert_eq!(payloads(&index, b), vec![*i]);
        }
        assert!(!index.delete(&inserted[5].0, inserted[5].1).unwrap());
    }

    #[test]
    fn test_iterator_invalidated_by_insert() {
        let mut index = QuadtreeIndex::new(config()).unwrap();
        index.insert(Region::rect(1.0, 1.0, 2.0, 2.0), 1u64).unwrap();
        let mut iter = index.query(&Region::rect(0.0, 0.0, 10.0, 10.0)).unwrap();
        index.insert(Region::rect(3.0, 3.0, 4.0, 4.0), 2u64).unwrap();
        assert!(iter.next().unwrap().unwrap_err().is_invalidated());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_clear_and_contained_query() {
        let mut index = QuadtreeIndex::new(config()).unwrap();
        index.insert(Region::rect(1.0, 1.0, 2.0, 2.0), 1u64).unwrap();
        index.insert(Region::rect(1.0, 1.0, 20.0, 20.0), 2u64).unwrap();
        let contained: Vec<u64> = index
            .query_contained(&Region::rect(0.0, 0.0, 5.0, 5.0))
            .unwrap()
            .map(|r| r.unwrap().payload.value())
            .collect();
        assert_eq!(contained, vec![1]);

        index.clear().unwrap();
        assert!(index.is_empty());
        assert_eq!(index.stats().live_nodes, 1);
        assert!(payloads(&index, &Region::rect(0.0, 0.0, 100.0, 100.0)).is_empty());
    }

    #[test]
    fn test_paged_quadtree_reopens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quad.scix");
        let options = PagedOptions::default().with_page_size(4096).with_cache_pages(4);

        let mut index = QuadtreeIndex::with_storage(config(), PagedStorage::create(&path, options).unwrap()).unwrap();
        for i in 0..40u64 {
            let x = (i % 10) as f64 * 9.0;
            let y = (i / 10) as f64 * 20.0;
            index.insert(Region::rect(x, y, x + 1.0, y + 1.0), i).unwrap();
        }
        let window = Region::rect(0.0, 0.0, 50.0, 50.0);
        let before = payloads(&index, &window);
        index.close().unwrap();

        let storage = PagedStorage::open(&path, options).unwrap();
        let index = QuadtreeIndex::with_storage(config(), storage).unwrap();
        assert_eq!(index.len(), 40);
        assert_eq!(payloads(&index, &window), before);

        let other = QuadtreeConfig::new(Region::rect(0.0, 0.0, 10.0, 10.0));
        let storage = PagedStorage::open(&path, options).unwrap();
        assert!(QuadtreeIndex::with_storage(other, storage).is_err());
    }
}
