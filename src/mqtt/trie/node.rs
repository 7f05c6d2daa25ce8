use slotmap::Key;

slotmap::new_key_type! {
    /// An opaque reference to a node of a [`RoutingTree`](super::RoutingTree).
    pub struct NodeId;
}

/// A node of the tree: one level of one or more filters.
pub(super) struct Node<T> {
    /// Only used to rebuild the filter a node stands for, and to prune empty branches.
    pub(super) parent: NodeId,

    /// The level this node matches. Empty for the root.
    pub(super) label: Box<str>,

    /// The subscriptions terminating at this node, in insertion order.
    pub(super) values: Vec<T>,

    /// Sorted by label.
    pub(super) children: Vec<NodeId>,
}

impl<T> Node<T> {
    pub(super) fn new(parent: NodeId, label: &str) -> Self {
        Self {
            parent,
            label: label.into(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    pub(super) fn root() -> Self {
        Self::new(NodeId::null(), "")
    }

    pub(super) fn is_root(&self) -> bool {
        self.parent.is_null()
    }

    pub(super) fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.children.is_empty() && self.values.is_empty()
    }
}
