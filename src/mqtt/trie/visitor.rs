use super::node::NodeId;
use super::Nodes;

/// Walk down the exact path of `levels`.
///
/// On failure returns where the first missing node has to be inserted, so that inserting the
/// remaining levels from there completes the path.
pub(super) fn walk_filter<T>(
    levels: &[&str],
    nodes: &Nodes<T>,
    root: NodeId,
) -> Result<NodeId, NodePlace> {
    let mut node_id = root;

    for (level_idx, &level) in levels.iter().enumerate() {
        let node = &nodes[node_id];

        let idx = node
            .children
            .binary_search_by(|it| nodes[*it].label[..].cmp(level))
            .map_err(|idx| NodePlace {
                parent_id: node_id,
                level: level_idx,
                idx,
            })?;

        node_id = node.children[idx];
    }

    // we ran out of levels, this is the node.
    Ok(node_id)
}

/// An identification on where to insert a node if it's missing.
pub(super) struct NodePlace {
    pub(super) parent_id: NodeId,
    /// Index of the first level without a node.
    pub(super) level: usize,
    /// Index into the parent's children that keeps them sorted.
    pub(super) idx: usize,
}

/// Visits every node holding values whose filter matches the topic, in pre-order.
/// All matching nodes will be visited exactly once.
pub(super) struct VisitMatches<'a, F> {
    levels: &'a [&'a str],
    system: bool,
    callback: F,
}

impl<'a, F> VisitMatches<'a, F>
where
    F: FnMut(NodeId),
{
    pub(super) fn new(levels: &'a [&'a str], system: bool, callback: F) -> Self {
        Self {
            levels,
            system,
            callback,
        }
    }

    pub(super) fn visit_children<T>(&mut self, nodes: &Nodes<T>, node_id: NodeId, depth: usize) {
        for &child in &nodes[node_id].children {
            self.visit_node(nodes, child, depth);
        }
    }

    fn visit_node<T>(&mut self, nodes: &Nodes<T>, node_id: NodeId, depth: usize) {
        let node = &nodes[node_id];

        // `$` topics are reserved for the server, wildcards in the first level never match them.
        let wildcard_allowed = depth > 0 || !self.system;

        match &*node.label {
            // `#` is always the last level of a filter and also matches the parent level.
            "#" => {
                if wildcard_allowed && !node.values.is_empty() {
                    (self.callback)(node_id);
                }

                return;
            }
            "+" => match self.levels.get(depth) {
                Some(level) if !level.is_empty() && wildcard_allowed => (),
                _ => return,
            },
            literal => {
                if self.levels.get(depth) != Some(&literal) {
                    return;
                }
            }
        }

        if depth + 1 == self.levels.len() && !node.values.is_empty() {
            (self.callback)(node_id);
        }

        self.visit_children(nodes, node_id, depth + 1);
    }
}
