//! Depth-first traversal with caller-supplied visitors.
//!
//! [`visit`] walks the subtree below a node. For every node it hands the
//! visitor a copy through [`NodeVisitor::visit_node`]; the returned
//! [`VisitFlow`] decides whether the walk descends into that node's
//! children. A copy the visitor changed is written back to the storage.
//! Data visitors additionally receive every live entry of every node they
//! did not prune through [`NodeVisitor::visit_data`].
//!
//! The root of a walk is never pruned by bounds, since quadtree and grid
//! roots may hold entries lying outside their shape.

use crate::entry::Entry;
use crate::node::Node;
use crate::query::QueryMode;
use crate::region::Region;
use crate::storage::IndexStorage;
use crate::types::{IndexResult, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitFlow {
    Continue,
    /// Skip this node's entries and children.
    Prune,
}

/// Callbacks driven by [`visit`].
pub trait NodeVisitor {
    /// Data visitors receive entries through [`NodeVisitor::visit_data`].
    fn is_data_visitor(&self) -> bool;

    fn visit_node(&mut self, _node: &mut Node) -> VisitFlow {
        VisitFlow::Continue
    }

    fn visit_data(&mut self, _node: NodeId, _entry: &Entry) {}
}

/// Counts gathered during one [`visit`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VisitSummary {
    pub nodes_visited: usize,
    pub nodes_modified: usize,
    pub entries_visited: usize,
}

/// Walks the subtree rooted at `root` depth first, children in order.
pub fn visit<S, V>(storage: &mut S, root: NodeId, visitor: &mut V) -> IndexResult<VisitSummary>
where
    S: IndexStorage + ?Sized,
    V: NodeVisitor + ?Sized,
{
    let mut summary = VisitSummary::default();
    let mut stack = vec![root];

    while let Some(id) = stack.pop() {
        let original = storage.get(id)?.clone();
        let mut node = original.clone();
        summary.nodes_visited += 1;

        let flow = visitor.visit_node(&mut node);
        if node != original {
            *storage.get_mut(id)? = node.clone();
            summary.nodes_modified += 1;
        }
        if flow == VisitFlow::Prune {
            continue;
        }

        if visitor.is_data_visitor() {
            for i in 0..node.entry_slots() {
                if let Some(entry) = node.entry_at(i) {
                    visitor.visit_data(id, entry);
                    summary.entries_visited += 1;
                }
            }
        }

        let children = node.children();
        stack.extend(children.iter().rev());
    }

    Ok(summary)
}

// ============================================================================
// Built-in visitors
// ============================================================================

/// Collects the entries matching a window. An entry stored under several
/// nodes, as grid entries spanning cells are, is collected once per copy.
#[derive(Debug)]
pub struct WindowVisitor {
    window: Region,
    mode: QueryMode,
    matches: Vec<Entry>,
}

impl WindowVisitor {
    pub fn new(window: Region, mode: QueryMode) -> Self {
        Self {
            window,
            mode,
            matches: Vec::new(),
        }
    }

    pub fn into_matches(self) -> Vec<Entry> {
        self.matches
    }
}

impl NodeVisitor for WindowVisitor {
    fn is_data_visitor(&self) -> bool {
        true
    }

    fn visit_node(&mut self, node: &mut Node) -> VisitFlow {
        if node.parent().is_none() {
            return VisitFlow::Continue;
        }
        match node.bounds() {
            Some(bounds) if bounds.touches(&self.window) => VisitFlow::Continue,
            _ => VisitFlow::Prune,
        }
    }

    fn visit_data(&mut self, _node: NodeId, entry: &Entry) {
        if self.mode.matches(&self.window, &entry.bounds) {
            self.matches.push(entry.clone());
        }
    }
}

/// Invalidates grid nodes whose shape lies inside a region, or every grid
/// node when no region is given. Other node kinds are left untouched.
#[derive(Debug, Default)]
pub struct InvalidatingVisitor {
    region: Option<Region>,
    invalidated: Vec<NodeId>,
}

impl InvalidatingVisitor {
    pub fn new(region: Option<Region>) -> Self {
        Self {
            region,
            invalidated: Vec::new(),
        }
    }

    /// Ids of the nodes invalidated so far, in visiting order.
    pub fn invalidated(&self) -> &[NodeId] {
        &self.invalidated
    }

    pub fn into_invalidated(self) -> Vec<NodeId> {
        self.invalidated
    }
}

impl NodeVisitor for InvalidatingVisitor {
    fn is_data_visitor(&self) -> bool {
        false
    }

    fn visit_node(&mut self, node: &mut Node) -> VisitFlow {
        if let (Some(region), Some(bounds)) = (&self.region, node.bounds()) {
            if node.parent().is_some() && !region.touches(bounds) {
                return VisitFlow::Prune;
            }
        }
        if let Node::Grid(grid) = node {
            let covered = self.region.as_ref().map_or(true, |r| r.contains(&grid.shape));
            if covered {
                grid.invalidate();
                self.invalidated.push(grid.id);
            }
        }
        VisitFlow::Continue
    }
}
