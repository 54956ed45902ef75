use super::IndexStorage;
use crate::node::Node;
use crate::types::{IndexMeta, NodeId, StorageError, StorageResult, StorageStats};

/// In-memory node table.
///
/// Slot `i` holds node `i + 1`; a `None` slot is a released id waiting on
/// the free-page stack.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    slots: Vec<Option<Node>>,
    free: Vec<NodeId>,
    meta: IndexMeta,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(id: NodeId) -> Option<usize> {
        id.checked_sub(1).map(|i| i as usize)
    }
}

impl IndexStorage for MemoryStorage {
    fn allocate(&mut self, mut node: Node) -> StorageResult<NodeId> {
        if let Some(id) = self.free.pop() {
            node.set_id(id);
            log::trace!("reusing node id {}", id);
            if let Some(slot) = Self::slot(id).and_then(|i| self.slots.get_mut(i)) {
                *slot = Some(node);
                return Ok(id);
            }
            return Err(StorageError::NotFound(id));
        }

        self.slots.push(None);
        let id = self.slots.len() as NodeId;
        node.set_id(id);
        if let Some(slot) = self.slots.last_mut() {
            *slot = Some(node);
        }
        Ok(id)
    }

    fn get(&mut self, id: NodeId) -> StorageResult<&Node> {
        Self::slot(id)
            .and_then(|i| self.slots.get(i))
            .and_then(Option::as_ref)
            .ok_or(StorageError::NotFound(id))
    }

    fn get_mut(&mut self, id: NodeId) -> StorageResult<&mut Node> {
        Self::slot(id)
            .and_then(|i| self.slots.get_mut(i))
            .and_then(Option::as_mut)
            .ok_or(StorageError::NotFound(id))
    }

    fn release(&mut self, id: NodeId) -> StorageResult<()> {
        let slot = Self::slot(id)
            .and_then(|i| self.slots.get_mut(i))
            .ok_or(StorageError::NotFound(id))?;
        if slot.take().is_none() {
            return Err(StorageError::NotFound(id));
        }
        self.free.push(id);
        Ok(())
    }

    fn reset(&mut self) -> StorageResult<()> {
        self.slots.clear();
        self.free.clear();
        self.meta = IndexMeta::default();
        Ok(())
    }

    fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut IndexMeta {
        &mut self.meta
    }

    fn stats(&self) -> StorageStats {
        let high_water_mark = self.slots.len() as u64;
        let free_pages = self.free.len() as u64;
        StorageStats {
            live_nodes: high_water_mark - free_pages,
            free_pages,
            high_water_mark,
            ..StorageStats::default()
        }
    }

    fn is_live(&self, id: NodeId) -> bool {
        Self::slot(id)
            .and_then(|i| self.slots.get(i))
            .is_some_and(Option::is_some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::TreeNode;

    fn leaf() -> Node {
        Node::Tree(TreeNode::leaf(None))
    }

    #[test]
    fn test_allocate_assigns_fresh_ids() {
        let mut storage = MemoryStorage::new();
        assert_eq!(storage.allocate(leaf()).unwrap(), 1);
        assert_eq!(storage.allocate(leaf()).unwrap(), 2);
        assert_eq!(storage.get(2).unwrap().id(), 2);
    }

    #[test]
    fn test_released_id_is_stale_then_reused() {
        let mut storage = MemoryStorage::new();
        let a = storage.allocate(leaf()).unwrap();
        let b = storage.allocate(leaf()).unwrap();
        storage.release(a).unwrap();

        assert!(matches!(storage.get(a), Err(StorageError::NotFound(id)) if id == a));
        assert!(storage.release(a).is_err());
        assert!(!storage.is_live(a));
        assert!(storage.is_live(b));

        let c = storage.allocate(leaf()).unwrap();
        assert_eq!(c, a);
        assert_eq!(storage.get(c).unwrap().id(), a);
    }

    #[test]
    fn test_zero_and_unknown_ids_not_found() {
        let mut storage = MemoryStorage::new();
        assert!(storage.get(0).is_err());
        assert!(storage.get_mut(5).is_err());
    }

    #[test]
    fn test_stats_balance() {
        let mut storage = MemoryStorage::new();
        let ids: Vec<_> = (0..5).map(|_| storage.allocate(leaf()).unwrap()).collect();
        storage.release(ids[1]).unwrap();
        storage.release(ids[3]).unwrap();
        let stats = storage.stats();
        assert_eq!(stats.high_water_mark, 5);
        assert_eq!(stats.free_pages, 2);
        assert_eq!(stats.live_nodes + stats.free_pages, stats.high_water_mark);
    }

    #[test]
    fn test_reset() {
        let mut storage = MemoryStorage::new();
        storage.allocate(leaf()).unwrap();
        storage.meta_mut().entry_count = 3;
        storage.reset().unwrap();
        assert_eq!(storage.stats(), StorageStats::default());
        assert_eq!(storage.meta().entry_count, 0);
    }
}
