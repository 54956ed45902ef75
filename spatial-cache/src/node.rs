//! Node kinds stored in an [`IndexStorage`](crate::storage::IndexStorage).
//!
//! The set of node kinds is closed, so it is a tagged enum rather than a
//! trait object:
//! - [`TreeNode`]: R-tree leaf or internal node (memory or paged storage)
//! - [`QuadNode`]: quadtree quadrant with its spanning entries
//! - [`GridNode`]: grid cell (or grid root) with swap-remove data slots
//!
//! Nodes never own each other. Children and parents are referenced by
//! [`NodeId`] and resolved through the storage.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::entry::Entry;
use crate::region::Region;
use crate::types::{DataId, IndexError, IndexResult, NodeId};

/// Child ids collected during traversal.
pub type ChildIds = SmallVec<[NodeId; 8]>;

// ============================================================================
// Node
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Tree(TreeNode),
    Quad(QuadNode),
    Grid(GridNode),
}

impl Node {
    pub fn id(&self) -> NodeId {
        match self {
            Node::Tree(n) => n.id,
            Node::Quad(n) => n.id,
            Node::Grid(n) => n.id,
        }
    }

    pub(crate) fn set_id(&mut self, id: NodeId) {
        match self {
            Node::Tree(n) => n.id = id,
            Node::Quad(n) => n.id = id,
            Node::Grid(n) => n.id = id,
        }
    }

    /// Tree level (leaves are 0), quadtree depth (root is 0), or grid level
    /// (cells are 0, the root is 1).
    pub fn level(&self) -> u32 {
        match self {
            Node::Tree(n) => n.level,
            Node::Quad(n) => n.depth,
            Node::Grid(n) => n.level,
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        match self {
            Node::Tree(n) => n.parent,
            Node::Quad(n) => n.parent,
            Node::Grid(n) => n.parent,
        }
    }

    pub fn set_parent(&mut self, parent: Option<NodeId>) {
        match self {
            Node::Tree(n) => n.parent = parent,
            Node::Quad(n) => n.parent = parent,
            Node::Grid(n) => n.parent = parent,
        }
    }

    /// Bounds of a tree node's content, or the fixed shape of a quadrant or
    /// grid cell. `None` for an empty tree node.
    pub fn bounds(&self) -> Option<&Region> {
        match self {
            Node::Tree(n) => n.bounds.as_ref(),
            Node::Quad(n) => Some(&n.shape),
            Node::Grid(n) => Some(&n.shape),
        }
    }

    /// Number of entry positions to scan with [`Node::entry_at`].
    pub fn entry_slots(&self) -> usize {
        match self {
            Node::Tree(n) => n.entries().len(),
            Node::Quad(n) => n.entries.len(),
            Node::Grid(n) => n.num_data,
        }
    }

    pub fn entry_at(&self, index: usize) -> Option<&Entry> {
        match self {
            Node::Tree(n) => n.entries().get(index),
            Node::Quad(n) => n.entries.get(index),
            Node::Grid(n) => n.data_at(index).map(|(entry, _)| entry),
        }
    }

    pub fn child_count(&self) -> usize {
        match self {
            Node::Tree(n) => n.children().len(),
            Node::Quad(n) => n.children.map_or(0, |c| c.len()),
            Node::Grid(n) => n.cells.len(),
        }
    }

    /// Child id at `index`, with the child's bounds when the parent keeps a
    /// copy of them (R-tree internal nodes do).
    pub fn child_at(&self, index: usize) -> Option<(NodeId, Option<&Region>)> {
        match self {
            Node::Tree(n) => n.children().get(index).map(|c| (c.id, Some(&c.bounds))),
            Node::Quad(n) => n.children.and_then(|c| c.get(index).copied()).map(|id| (id, None)),
            Node::Grid(n) => n.cells.get(index).map(|id| (*id, None)),
        }
    }

    pub fn children(&self) -> ChildIds {
        (0..self.child_count())
            .filter_map(|i| self.child_at(i).map(|(id, _)| id))
            .collect()
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::Tree(_) => "tree",
            Node::Quad(_) => "quad",
            Node::Grid(_) => "grid",
        }
    }

    pub fn as_tree(&self) -> IndexResult<&TreeNode> {
        match self {
            Node::Tree(n) => Ok(n),
            other => Err(IndexError::UnexpectedNode { id: other.id(), expected: "tree" }),
        }
    }

    pub fn as_tree_mut(&mut self) -> IndexResult<&mut TreeNode> {
        match self {
            Node::Tree(n) => Ok(n),
            other => Err(IndexError::UnexpectedNode { id: other.id(), expected: "tree" }),
        }
    }

    pub fn as_quad(&self) -> IndexResult<&QuadNode> {
        match self {
            Node::Quad(n) => Ok(n),
            other => Err(IndexError::UnexpectedNode { id: other.id(), expected: "quad" }),
        }
    }

    pub fn as_quad_mut(&mut self) -> IndexResult<&mut QuadNode> {
        match self {
            Node::Quad(n) => Ok(n),
            other => Err(IndexError::UnexpectedNode { id: other.id(), expected: "quad" }),
        }
    }

    pub fn as_grid(&self) -> IndexResult<&GridNode> {
        match self {
            Node::Grid(n) => Ok(n),
            other => Err(IndexError::UnexpectedNode { id: other.id(), expected: "grid" }),
        }
    }

    pub fn as_grid_mut(&mut self) -> IndexResult<&mut GridNode> {
        match self {
            Node::Grid(n) => Ok(n),
            other => Err(IndexError::UnexpectedNode { id: other.id(), expected: "grid" }),
        }
    }
}

// ============================================================================
// R-tree nodes
// ============================================================================

/// A child reference in an internal node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRef {
    pub bounds: Region,
    pub id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreeContents {
    Leaf(Vec<Entry>),
    Internal(Vec<ChildRef>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: NodeId,
    /// Height from leaf level (leaves are 0)
    pub level: u32,
    pub parent: Option<NodeId>,
    /// Combine of the entries or of the children's bounds.
    pub bounds: Option<Region>,
    pub contents: TreeContents,
}

impl TreeNode {
    pub fn leaf(parent: Option<NodeId>) -> Self {
        Self {
            id: 0,
            level: 0,
            parent,
            bounds: None,
            contents: TreeContents::Leaf(Vec::new()),
        }
    }

    pub fn internal(level: u32, parent: Option<NodeId>) -> Self {
        Self {
            id: 0,
            level,
            parent,
            bounds: None,
            contents: TreeContents::Internal(Vec::new()),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.contents, TreeContents::Leaf(_))
    }

    pub fn len(&self) -> usize {
        match &self.contents {
            TreeContents::Leaf(entries) => entries.len(),
            TreeContents::Internal(children) => children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> &[Entry] {
        match &self.contents {
            TreeContents::Leaf(entries) => entries,
            TreeContents::Internal(_) => &[],
        }
    }

    pub fn children(&self) -> &[ChildRef] {
        match &self.contents {
            TreeContents::Leaf(_) => &[],
            TreeContents::Internal(children) => children,
        }
    }

    pub fn child_position(&self, id: NodeId) -> Option<usize> {
        self.children().iter().position(|c| c.id == id)
    }

    /// Recomputes `bounds` from the contents.
    pub fn recompute_bounds(&mut self) {
        self.bounds = match &self.contents {
            TreeContents::Leaf(entries) => Region::combine_all(entries.iter().map(|e| &e.bounds)),
            TreeContents::Internal(children) => {
                Region::combine_all(children.iter().map(|c| &c.bounds))
            }
        };
    }
}

// ============================================================================
// Quadtree nodes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuadNode {
    pub id: NodeId,
    pub depth: u32,
    pub parent: Option<NodeId>,
    /// Fixed quadrant covered by this node.
    pub shape: Region,
    /// Entries held at this level: all of them for a leaf, only the ones
    /// straddling a quadrant boundary once subdivided.
    pub entries: Vec<Entry>,
    pub children: Option<[NodeId; 4]>,
}

impl QuadNode {
    pub fn new(shape: Region, depth: u32, parent: Option<NodeId>) -> Self {
        Self {
            id: 0,
            depth,
            parent,
            shape,
            entries: Vec::new(),
            children: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    /// Shape of quadrant `index`: bit 0 selects the upper x half, bit 1 the
    /// upper y half.
    pub fn quadrant(&self, index: usize) -> Region {
        let (min, max) = (self.shape.min(), self.shape.max());
        let mid_x = (min[0] + max[0]) / 2.0;
        let mid_y = (min[1] + max[1]) / 2.0;
        let (x1, x2) = if index & 1 == 0 { (min[0], mid_x) } else { (mid_x, max[0]) };
        let (y1, y2) = if index & 2 == 0 { (min[1], mid_y) } else { (mid_y, max[1]) };
        Region::rect(x1, y1, x2, y2)
    }

    /// First quadrant fully containing `bounds`, if any.
    pub fn fitting_quadrant(&self, bounds: &Region) -> Option<usize> {
        (0..4).find(|&i| self.quadrant(i).contains(bounds))
    }
}

// ============================================================================
// Grid nodes
// ============================================================================

/// A grid cell (level 0) or the grid root (level 1).
///
/// Data lives in parallel slot arrays. Positions below `num_data` are live;
/// deletion moves the last live slot into the freed one, so it costs O(1)
/// and does not preserve insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridNode {
    pub id: NodeId,
    pub level: u32,
    pub parent: Option<NodeId>,
    pub shape: Region,
    /// Cleared by invalidation, restored by validation.
    pub valid: bool,
    pub num_data: usize,
    pub data_ids: Vec<DataId>,
    pub data: Vec<Option<Entry>>,
    /// Cell ids in row-major order; only the root has cells.
    pub cells: Vec<NodeId>,
}

impl GridNode {
    pub fn new(shape: Region, level: u32, parent: Option<NodeId>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            id: 0,
            level,
            parent,
            shape,
            valid: true,
            num_data: 0,
            data_ids: vec![0; capacity],
            data: vec![None; capacity],
            cells: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Appends an entry tagged with `data_id`, doubling the slot arrays when
    /// they are full. Returns the slot used.
    pub fn insert_data(&mut self, entry: Entry, data_id: DataId) -> usize {
        if self.num_data == self.capacity() {
            let grown = (self.capacity() * 2).max(1);
            self.data.resize(grown, None);
            self.data_ids.resize(grown, 0);
        }
        let slot = self.num_data;
        self.data[slot] = Some(entry);
        self.data_ids[slot] = data_id;
        self.num_data += 1;
        slot
    }

    /// Removes the entry at `index` by moving the last live entry into its
    /// slot.
    pub fn delete_data(&mut self, index: usize) -> IndexResult<Entry> {
        if index >= self.num_data {
            return Err(IndexError::SlotOutOfBounds {
                index,
                num_data: self.num_data,
            });
        }
        let last = self.num_data - 1;
        let removed = self.data[index].take();
        if index != last {
            self.data[index] = self.data[last].take();
            self.data_ids[index] = self.data_ids[last];
        }
        self.data_ids[last] = 0;
        self.num_data = last;
        removed.ok_or(IndexError::SlotOutOfBounds { index, num_data: last })
    }

    pub fn data_at(&self, index: usize) -> Option<(&Entry, DataId)> {
        if index >= self.num_data {
            return None;
        }
        self.data[index].as_ref().map(|e| (e, self.data_ids[index]))
    }

    pub fn position_of(&self, entry: &Entry) -> Option<usize> {
        (0..self.num_data).find(|&i| self.data[i].as_ref() == Some(entry))
    }

    /// Removes every entry tagged `data_id`; returns how many were removed.
    pub fn delete_tagged(&mut self, data_id: DataId) -> usize {
        let mut removed = 0;
        let mut i = 0;
        while i < self.num_data {
            if self.data_ids[i] == data_id {
                // the swapped-in entry lands at `i` and is checked next
                if self.delete_data(i).is_ok() {
                    removed += 1;
                }
            } else {
                i += 1;
            }
        }
        removed
    }

    /// Drops all cached data and marks the node stale.
    pub fn invalidate(&mut self) {
        for slot in self.data.iter_mut() {
            *slot = None;
        }
        for id in self.data_ids.iter_mut() {
            *id = 0;
        }
        self.num_data = 0;
        self.valid = false;
    }
}
