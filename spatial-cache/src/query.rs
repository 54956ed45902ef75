//! Lazy window queries and iterator invalidation.
//!
//! A [`LazyQueryIterator`] keeps only a stack of `(node id, cursor)` frames
//! and fetches one node at a time from the shared storage, so results stream
//! without being materialized.
//!
//! Every live iterator is registered with its index's [`IteratorRegistry`].
//! A structural mutation calls [`IteratorRegistry::invalidate_all`] before it
//! touches any node. The next advance of an invalidated iterator yields
//! `Err(IteratorError::Invalidated)` exactly once, then `None`. Dropping or
//! closing an iterator deregisters it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::entry::Entry;
use crate::region::Region;
use crate::storage::IndexStorage;
use crate::types::{IndexResult, IteratorError, NodeId};

/// How an entry must relate to the query window to be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryMode {
    /// Positive-measure overlap (see [`Region::intersects`]).
    #[default]
    Intersects,
    /// Entry lies entirely inside the window.
    Contained,
}

impl QueryMode {
    pub fn matches(self, window: &Region, bounds: &Region) -> bool {
        match self {
            QueryMode::Intersects => window.intersects(bounds),
            QueryMode::Contained => window.contains(bounds),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: u64,
    live: HashMap<u64, Arc<AtomicBool>>,
}

/// Tracks the live iterators of one index.
#[derive(Debug, Clone, Default)]
pub struct IteratorRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl IteratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self) -> Registration {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let flag = Arc::new(AtomicBool::new(false));
        inner.live.insert(id, Arc::clone(&flag));
        Registration {
            id,
            flag,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Flags every live iterator as invalidated and forgets them. Returns
    /// how many were invalidated.
    pub fn invalidate_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.live.len();
        for flag in inner.live.values() {
            flag.store(true, Ordering::Release);
        }
        inner.live.clear();
        if count > 0 {
            log::debug!("invalidated {} live iterators", count);
        }
        count
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().live.len()
    }
}

/// One iterator's entry in the registry; deregisters on drop.
#[derive(Debug)]
pub(crate) struct Registration {
    id: u64,
    flag: Arc<AtomicBool>,
    registry: Weak<Mutex<RegistryInner>>,
}

impl Registration {
    pub(crate) fn is_invalidated(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub(crate) fn deregister(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.lock().live.remove(&self.id);
        }
        self.registry = Weak::new();
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.deregister();
    }
}

// ============================================================================
// Iterator
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Frame {
    id: NodeId,
    /// Entry slots first, then children.
    cursor: usize,
    /// The node's own bounds still need checking against the window.
    check_bounds: bool,
}

/// Decides whether the copy of an entry found in a node is the one to
/// report, for indexes that store an entry under several nodes.
pub(crate) type ReplicaFilter = Box<dyn Fn(NodeId, &Entry) -> bool + Send + Sync>;

enum Step {
    Yield(Entry),
    Descend(NodeId),
    Pop,
}

/// Streams the entries of one index that match a window.
///
/// Items are `Ok(entry)` while the index is unchanged. After a structural
/// mutation the next item is `Err(IndexError::Iterator(Invalidated))` and the
/// iterator is exhausted; issue a new query to continue.
///
/// The index is not locked between calls to `next`, so the iterator may be
/// held across mutations of the index it came from.
pub struct LazyQueryIterator<S: IndexStorage> {
    storage: Arc<Mutex<S>>,
    window: Region,
    mode: QueryMode,
    stack: Vec<Frame>,
    registration: Option<Registration>,
    replicas: Option<ReplicaFilter>,
}

impl<S: IndexStorage> LazyQueryIterator<S> {
    pub(crate) fn new(
        storage: Arc<Mutex<S>>,
        root: Option<NodeId>,
        window: Region,
        mode: QueryMode,
        registry: &IteratorRegistry,
        replicas: Option<ReplicaFilter>,
    ) -> Self {
        let stack = root
            .map(|id| Frame {
                id,
                cursor: 0,
                check_bounds: false,
            })
            .into_iter()
            .collect();
        Self {
            storage,
            window,
            mode,
            stack,
            registration: Some(registry.register()),
            replicas,
        }
    }

    pub fn window(&self) -> &Region {
        &self.window
    }

    /// True once a mutation has invalidated this iterator.
    pub fn is_invalidated(&self) -> bool {
        self.registration
            .as_ref()
            .is_some_and(Registration::is_invalidated)
    }

    /// Deregisters the iterator early.
    pub fn close(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        self.stack.clear();
        if let Some(mut registration) = self.registration.take() {
            registration.deregister();
        }
    }

    fn advance(&mut self) -> IndexResult<Option<Entry>> {
        let shared = Arc::clone(&self.storage);
        let mut storage = shared.lock();

        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let node = storage.get(frame.id)?;

            let step = if frame.check_bounds
                && !node.bounds().is_some_and(|b| b.touches(&self.window))
            {
                Step::Pop
            } else {
                frame.check_bounds = false;
                let slots = node.entry_slots();
                let mut step = None;
                while frame.cursor < slots {
                    let index = frame.cursor;
                    frame.cursor += 1;
                    if let Some(entry) = node.entry_at(index) {
                        if self.mode.matches(&self.window, &entry.bounds)
                            && self.replicas.as_ref().map_or(true, |owns| owns(frame.id, entry))
                        {
                            step = Some(Step::Yield(entry.clone()));
                            break;
                        }
                    }
                }
                match step {
                    Some(step) => step,
                    None => match node.child_at(frame.cursor - slots) {
                        Some((child, bounds)) => {
                            frame.cursor += 1;
                            if bounds.map_or(true, |b| b.touches(&self.window)) {
                                Step::Descend(child)
                            } else {
                                continue;
                            }
                        }
                        None => Step::Pop,
                    },
                }
            };

            match step {
                Step::Yield(entry) => return Ok(Some(entry)),
                Step::Descend(id) => self.stack.push(Frame {
                    id,
                    cursor: 0,
                    check_bounds: true,
                }),
                Step::Pop => {
                    self.stack.pop();
                }
            }
        }
    }
}

impl<S: IndexStorage> Iterator for LazyQueryIterator<S> {
    type Item = IndexResult<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        let registration = self.registration.as_ref()?;
        if registration.is_invalidated() {
            self.finish();
            return Some(Err(IteratorError::Invalidated.into()));
        }

        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.finish();
                None
            }
            Err(e) => {
                self.finish();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, TreeContents, TreeNode};
    use crate::storage::MemoryStorage;

    fn leaf_storage() -> (Arc<Mutex<MemoryStorage>>, NodeId) {
        let mut storage = MemoryStorage::new();
        let mut leaf = TreeNode::leaf(None);
        leaf.contents = TreeContents::Leaf(vec![
            Entry::new(Region::rect(0.0, 0.0, 1.0, 1.0), 1),
            Entry::new(Region::rect(5.0, 5.0, 6.0, 6.0), 2),
            Entry::new(Region::rect(0.5, 0.5, 0.8, 0.8), 3),
        ]);
        leaf.recompute_bounds();
        let id = storage.allocate(Node::Tree(leaf)).unwrap();
        (Arc::new(Mutex::new(storage)), id)
    }

    #[test]
    fn test_query_modes() {
        let window = Region::rect(0.0, 0.0, 1.0, 1.0);
        let inner = Region::rect(0.2, 0.2, 0.4, 0.4);
        let crossing = Region::rect(0.5, 0.5, 2.0, 2.0);
        assert!(QueryMode::Intersects.matches(&window, &crossing));
        assert!(!QueryMode::Contained.matches(&window, &crossing));
        assert!(QueryMode::Contained.matches(&window, &inner));
    }

    #[test]
    fn test_iterator_streams_matches() {
        let (storage, root) = leaf_storage();
        let registry = IteratorRegistry::new();
        let iter = LazyQueryIterator::new(
            storage,
            Some(root),
            Region::rect(0.0, 0.0, 2.0, 2.0),
            QueryMode::Intersects,
            &registry,
            None,
        );
        assert_eq!(registry.live_count(), 1);
        let payloads: Vec<u64> = iter.map(|r| r.unwrap().payload.value()).collect();
        assert_eq!(payloads, vec![1, 3]);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_replica_filter_skips_copies() {
        let (storage, root) = leaf_storage();
        let registry = IteratorRegistry::new();
        let filter: ReplicaFilter = Box::new(|_: NodeId, entry: &Entry| entry.payload.value() != 1);
        let iter = LazyQueryIterator::new(
            storage,
            Some(root),
            Region::rect(0.0, 0.0, 2.0, 2.0),
            QueryMode::Intersects,
            &registry,
            Some(filter),
        );
        let payloads: Vec<u64> = iter.map(|r| r.unwrap().payload.value()).collect();
        assert_eq!(payloads, vec![3]);
    }

    #[test]
    fn test_empty_root_yields_nothing() {
        let storage = Arc::new(Mutex::new(MemoryStorage::new()));
        let registry = IteratorRegistry::new();
        let mut iter = LazyQueryIterator::new(
            storage,
            None,
            Region::rect(0.0, 0.0, 1.0, 1.0),
            QueryMode::Intersects,
            &registry,
            None,
        );
        assert!(iter.next().is_none());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_invalidation_yields_error_once() {
        let (storage, root) = leaf_storage();
        let registry = IteratorRegistry::new();
        let mut iter = LazyQueryIterator::new(
            storage,
            Some(root),
            Region::rect(0.0, 0.0, 2.0, 2.0),
            QueryMode::Intersects,
            &registry,
            None,
        );
        assert!(iter.next().unwrap().is_ok());
        assert_eq!(registry.invalidate_all(), 1);
        assert!(iter.is_invalidated());

        let err = iter.next().unwrap().unwrap_err();
        assert!(err.is_invalidated());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_close_and_drop_deregister() {
        let (storage, root) = leaf_storage();
        let registry = IteratorRegistry::new();
        let window = Region::rect(0.0, 0.0, 2.0, 2.0);
        let a = LazyQueryIterator::new(Arc::clone(&storage), Some(root), window.clone(), QueryMode::Intersects, &registry, None);
        let b = LazyQueryIterator::new(storage, Some(root), window, QueryMode::Intersects, &registry, None);
        assert_eq!(registry.live_count(), 2);
        a.close();
        assert_eq!(registry.live_count(), 1);
        drop(b);
        assert_eq!(registry.live_count(), 0);
        assert_eq!(registry.invalidate_all(), 0);
    }
}
