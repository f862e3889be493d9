//! Deduplicated collection of remote nodes, orderable by distance to a target.
//!
//! Used both as a query result (neighbour candidates, replica sets) and as the
//! work queue of the join traversal.

use std::collections::HashMap;

use crate::identity::{NodeId, RemoteNode};

#[derive(Clone, Debug, Default)]
pub struct NodeSet {
    nodes: HashMap<NodeId, RemoteNode>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `node`; returns false if a node with the same identifier was present.
    pub fn add(&mut self, node: RemoteNode) -> bool {
        if self.nodes.contains_key(&node.id) {
            return false;
        }
        self.nodes.insert(node.id, node);
        true
    }

    pub fn extend<I: IntoIterator<Item = RemoteNode>>(&mut self, nodes: I) {
        for node in nodes {
            self.add(node);
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<RemoteNode> {
        self.nodes.remove(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteNode> {
        self.nodes.values()
    }

    /// All members, closest to `target` first.
    pub fn sorted_by_distance(&self, target: &NodeId) -> Vec<RemoteNode> {
        let mut sorted: Vec<RemoteNode> = self.nodes.values().cloned().collect();
        sorted.sort_by(|a, b| target.distance_cmp(&a.id, &b.id));
        sorted
    }

    /// The `k` members closest to `target`, closest first.
    pub fn closest(&self, target: &NodeId, k: usize) -> Vec<RemoteNode> {
        let mut sorted = self.sorted_by_distance(target);
        sorted.truncate(k);
        sorted
    }

    pub fn into_vec(self) -> Vec<RemoteNode> {
        self.nodes.into_values().collect()
    }
}

impl FromIterator<RemoteNode> for NodeSet {
    fn from_iter<I: IntoIterator<Item = RemoteNode>>(iter: I) -> Self {
        let mut set = NodeSet::new();
        set.extend(iter);
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> RemoteNode {
        RemoteNode::new(NodeId::parse(id).unwrap(), format!("10.0.0.1:{}", id.len()))
    }

    #[test]
    fn duplicates_are_ignored() {
        let mut set = NodeSet::new();
        assert!(set.add(node("100")));
        assert!(!set.add(node("100")));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn sorted_by_distance_puts_longest_prefix_first() {
        let set: NodeSet = [node("200"), node("100"), node("120")].into_iter().collect();
        let target = NodeId::parse("123").unwrap();
        let order: Vec<String> = set
            .sorted_by_distance(&target)
            .into_iter()
            .map(|n| n.id.to_hex()[..3].to_string())
            .collect();
        assert_eq!(order, vec!["120", "100", "200"]);
    }

    #[test]
    fn closest_truncates_to_k() {
        let set: NodeSet = ["1", "2", "3", "4"].into_iter().map(node).collect();
        let target = NodeId::parse("3").unwrap();
        let closest = set.closest(&target, 2);
        assert_eq!(closest.len(), 2);
        assert_eq!(closest[0].id, target);
    }

    #[test]
    fn remove_and_contains() {
        let mut set: NodeSet = [node("a"), node("b")].into_iter().collect();
        let a = NodeId::parse("a").unwrap();
        assert!(set.contains(&a));
        assert!(set.remove(&a).is_some());
        assert!(!set.contains(&a));
        assert!(!set.is_empty());
    }
}
