//! The routing tree: a trie over the levels of topic filters.
//!
//! Every edge is one level of a filter (`+` and `#` included, as plain labels), so `a/b/#` is the
//! path root → `a` → `b` → `#`. Values are stored on the node their filter ends at, and the same
//! filter inserted twice shares the path.
//!
//! The tree itself isn't synchronized; [`Router`](crate::mqtt::router::Router) puts it behind a lock.

use std::fmt::{self, Debug, Formatter};

use slotmap::SlotMap;

mod node;
mod visitor;

pub use node::NodeId;

use node::Node;
use visitor::{NodePlace, VisitMatches};

type Nodes<T> = SlotMap<NodeId, Node<T>>;

pub struct RoutingTree<T> {
    root: NodeId,
    nodes: Nodes<T>,
    len: usize,
}

impl<T> RoutingTree<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of values stored across all filters.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Add `value` at the end of `filter`'s path, creating the path as needed.
    ///
    /// Values added for the same filter are kept in insertion order. Returns `None` and drops
    /// `value` if `filter` is empty.
    pub fn add_filter(&mut self, filter: &str, value: T) -> Option<NodeId> {
        if filter.is_empty() {
            return None;
        }

        let levels: Vec<&str> = filter.split('/').collect();

        let node_id = match visitor::walk_filter(&levels, &self.nodes, self.root) {
            Ok(node_id) => node_id,
            Err(place) => self.insert_path(place, &levels),
        };

        self.nodes[node_id].values.push(value);
        self.len += 1;

        Some(node_id)
    }

    fn insert_path(&mut self, place: NodePlace, levels: &[&str]) -> NodeId {
        let mut parent = place.parent_id;
        let mut idx = place.idx;

        for level in &levels[place.level..] {
            let new_id = self.nodes.insert(Node::new(parent, level));
            self.nodes[parent].children.insert(idx, new_id);

            // since we just made a node we know it's empty and don't have to figure out where to push the next one.
            parent = new_id;
            idx = 0;
        }

        parent
    }

    /// Exact lookup of the node `filter` ends at. Wildcards are not expanded.
    pub fn find(&self, filter: &str) -> Option<NodeId> {
        if filter.is_empty() {
            return None;
        }

        let levels: Vec<&str> = filter.split('/').collect();

        visitor::walk_filter(&levels, &self.nodes, self.root).ok()
    }

    /// Every node holding values whose filter matches `topic`, in tree order.
    pub fn matches(&self, topic: &str) -> Vec<NodeId> {
        let levels: Vec<&str> = topic.split('/').collect();
        let mut found = Vec::new();

        VisitMatches::new(&levels, topic.starts_with('$'), |node_id| found.push(node_id))
            .visit_children(&self.nodes, self.root, 0);

        found
    }

    /// The values stored at `node_id`, empty if the node no longer exists.
    pub fn values(&self, node_id: NodeId) -> &[T] {
        self.nodes.get(node_id).map_or(&[], |node| &node.values)
    }

    /// Rebuild the filter `node_id` stands for from its ancestors.
    ///
    /// Returns `None` for the root and for nodes that have been removed.
    pub fn filter(&self, node_id: NodeId) -> Option<String> {
        let mut current = self.nodes.get(node_id)?;

        if current.is_root() {
            return None;
        }

        let mut labels = Vec::new();

        while !current.is_root() {
            labels.push(&*current.label);
            current = &self.nodes[current.parent];
        }

        labels.reverse();

        Some(labels.join("/"))
    }

    /// The filters of every leaf, i.e. every node without children, in tree order.
    pub fn filters(&self) -> Vec<String> {
        self.preorder()
            .into_iter()
            .filter(|it| self.nodes[*it].is_leaf())
            .filter_map(|it| self.filter(it))
            .collect()
    }

    /// Remove the values of `filter` for which `remove` returns true.
    ///
    /// Nodes left without values or children are pruned up to the root.
    pub fn remove(&mut self, filter: &str, mut remove: impl FnMut(&T) -> bool) -> Vec<T> {
        let Some(node_id) = self.find(filter) else {
            return Vec::new();
        };

        let node = &mut self.nodes[node_id];

        let (removed, kept): (Vec<T>, Vec<T>) = std::mem::take(&mut node.values)
            .into_iter()
            .partition(|it| remove(it));

        node.values = kept;
        self.len -= removed.len();

        self.prune(node_id);

        removed
    }

    // iteratively remove nodes from the trie until we find either the root or a non empty node.
    fn prune(&mut self, node_id: NodeId) {
        let mut current = node_id;

        loop {
            let node = &self.nodes[current];

            // don't remove the root node, we'll have to put it back and it's not like it gives us anything useful to get rid of.
            if node.is_root() || !node.is_empty() {
                break;
            }

            let parent = node.parent;

            self.nodes.remove(current);
            self.nodes[parent].children.retain(|it| *it != current);

            current = parent;
        }
    }

    fn preorder(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<NodeId> = self.nodes[self.root].children.iter().rev().copied().collect();

        while let Some(node_id) = stack.pop() {
            order.push(node_id);
            stack.extend(self.nodes[node_id].children.iter().rev());
        }

        order
    }
}

impl<T> Default for RoutingTree<T> {
    fn default() -> Self {
        let mut nodes = Nodes::default();
        let root = nodes.insert(Node::root());

        Self {
            root,
            nodes,
            len: 0,
        }
    }
}

impl<T: Debug> Debug for RoutingTree<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut debug_map = f.debug_map();

        for node_id in self.preorder() {
            let node = &self.nodes[node_id];

            if node.values.is_empty() {
                continue;
            }

            if let Some(filter) = self.filter(node_id) {
                debug_map.entry(&filter, &node.values);
            }
        }

        debug_map.finish()
    }
}
