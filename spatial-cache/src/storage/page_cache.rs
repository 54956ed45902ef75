//! LRU buffer for paged nodes.
//!
//! Pages enter the buffer only when first accessed or freshly allocated;
//! nothing is preloaded. A page modified through [`PageCache::get_mut`] is
//! dirty until the owner writes it back and calls [`PageCache::mark_clean`].
//! Inserting into a full buffer evicts the least recently used page and hands
//! it back, so the owner can write it out if it is dirty.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::node::Node;
use crate::types::NodeId;

/// A buffered page with its dirty flag
#[derive(Debug)]
pub struct CachedPage {
    pub node: Node,
    pub dirty: bool,
}

pub struct PageCache {
    pages: LruCache<NodeId, CachedPage>,
}

impl PageCache {
    pub fn new(max_pages: usize) -> Self {
        let cap = NonZeroUsize::new(max_pages).unwrap_or(NonZeroUsize::MIN);
        Self {
            pages: LruCache::new(cap),
        }
    }

    /// Returns the page and marks it most recently used.
    pub fn get(&mut self, id: NodeId) -> Option<&Node> {
        self.pages.get(&id).map(|cached| &cached.node)
    }

    /// Returns the page mutably, marking it dirty and most recently used.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.pages.get_mut(&id).map(|cached| {
            cached.dirty = true;
            &mut cached.node
        })
    }

    pub fn peek(&self, id: NodeId) -> Option<&CachedPage> {
        self.pages.peek(&id)
    }

    /// Buffers a page. Returns the page evicted to make room, if any.
    pub fn insert(&mut self, id: NodeId, node: Node, dirty: bool) -> Option<(NodeId, CachedPage)> {
        match self.pages.push(id, CachedPage { node, dirty }) {
            Some((evicted, page)) if evicted != id => Some((evicted, page)),
            _ => None,
        }
    }

    pub fn remove(&mut self, id: NodeId) -> Option<CachedPage> {
        self.pages.pop(&id)
    }

    pub fn dirty_pages(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .pages
            .iter()
            .filter(|(_, cached)| cached.dirty)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn mark_clean(&mut self, id: NodeId) {
        if let Some(cached) = self.pages.peek_mut(&id) {
            cached.dirty = false;
        }
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.pages.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::TreeNode;

    fn leaf(id: NodeId) -> Node {
        let mut node = Node::Tree(TreeNode::leaf(None));
        node.set_id(id);
        node
    }

    #[test]
    fn test_page_cache_insert_and_get() {
        let mut cache = PageCache::new(10);
        assert!(cache.is_empty());
        assert!(cache.insert(1, leaf(1), false).is_none());
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(1));
        assert_eq!(cache.get(1).map(Node::id), Some(1));
        assert!(cache.get(2).is_none());
    }

    #[test]
    fn test_page_cache_get_mut_marks_dirty() {
        let mut cache = PageCache::new(10);
        cache.insert(1, leaf(1), false);
        assert!(!cache.peek(1).unwrap().dirty);
        assert!(cache.get_mut(1).is_some());
        assert!(cache.peek(1).unwrap().dirty);
        assert_eq!(cache.dirty_pages(), vec![1]);

        cache.mark_clean(1);
        assert!(cache.dirty_pages().is_empty());
    }

    #[test]
    fn test_page_cache_lru_eviction() {
        let mut cache = PageCache::new(3);
        cache.insert(1, leaf(1), true);
        cache.insert(2, leaf(2), false);
        cache.insert(3, leaf(3), false);

        // touch 1 so that 2 becomes the oldest
        cache.get(1);
        let (evicted, page) = cache.insert(4, leaf(4), false).unwrap();
        assert_eq!(evicted, 2);
        assert!(!page.dirty);
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
    }

    #[test]
    fn test_page_cache_replace_is_not_eviction() {
        let mut cache = PageCache::new(1);
        cache.insert(1, leaf(1), false);
        assert!(cache.insert(1, leaf(1), true).is_none());
        assert!(cache.peek(1).unwrap().dirty);
    }

    #[test]
    fn test_page_cache_remove_and_clear() {
        let mut cache = PageCache::new(4);
        cache.insert(1, leaf(1), true);
        cache.insert(2, leaf(2), false);
        let removed = cache.remove(1).unwrap();
        assert!(removed.dirty);
        assert!(cache.remove(1).is_none());
        cache.clear();
        assert!(cache.is_empty());
    }
}
