//! # Prefix Routing Table and Backpointer Index
//!
//! The routing table has one row per identifier digit ([`DIGITS`] levels) and one
//! slot per digit value ([`BASE`] slots per level). A remote node lives in exactly
//! one slot: level = length of the prefix it shares with the local node, digit =
//! its own digit at that level. Each slot keeps a short list of candidates, most
//! recently confirmed alive first; when a full slot receives a new candidate the
//! one at the back is evicted.
//!
//! The backpointer index records which remote nodes hold the local node in their
//! routing tables, per level. It is only consulted when leaving the mesh.
//!
//! Both structures store plain [`RemoteNode`] values keyed by identifier; the
//! mutual references between nodes never become object references.

use std::collections::HashMap;

use crate::identity::{NodeId, RemoteNode, BASE, DIGITS};
use crate::nodeset::NodeSet;

/// Default number of candidates per slot (primary + alternates).
pub const DEFAULT_SLOT_SIZE: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotUpdate {
    /// Node was not present and the slot had room.
    Inserted,
    /// Node was already present; moved to the front.
    Refreshed,
    /// Slot was full; the least recently confirmed candidate was evicted.
    Replaced { evicted: RemoteNode },
    /// Node is the local node.
    Rejected,
}

impl SlotUpdate {
    /// True when the node was newly placed in the table.
    pub fn is_new(&self) -> bool {
        matches!(self, SlotUpdate::Inserted | SlotUpdate::Replaced { .. })
    }
}

#[derive(Debug, Clone, Default)]
struct Slot {
    candidates: Vec<RemoteNode>,
}

impl Slot {
    fn touch(&mut self, node: RemoteNode, capacity: usize) -> SlotUpdate {
        if let Some(pos) = self.candidates.iter().position(|c| c.id == node.id) {
            self.candidates.remove(pos);
            // Newest address wins.
            self.candidates.insert(0, node);
            return SlotUpdate::Refreshed;
        }

        self.candidates.insert(0, node);
        if self.candidates.len() > capacity {
            match self.candidates.pop() {
                Some(evicted) => SlotUpdate::Replaced { evicted },
                None => SlotUpdate::Inserted,
            }
        } else {
            SlotUpdate::Inserted
        }
    }

    fn refresh(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.candidates.iter().position(|c| &c.id == id) {
            let existing = self.candidates.remove(pos);
            self.candidates.insert(0, existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.candidates.iter().position(|c| &c.id == id) {
            self.candidates.remove(pos);
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
pub struct RoutingTable {
    local: RemoteNode,
    slot_size: usize,
    levels: Vec<Vec<Slot>>,
}

impl RoutingTable {
    pub fn new(local: RemoteNode, slot_size: usize) -> Self {
        let levels = (0..DIGITS).map(|_| vec![Slot::default(); BASE]).collect();
        Self {
            local,
            slot_size: slot_size.max(1),
            levels,
        }
    }

    pub fn local(&self) -> &RemoteNode {
        &self.local
    }

    fn slot_of(&self, id: &NodeId) -> Option<(usize, usize)> {
        let level = self.local.id.shared_prefix_len(id);
        if level == DIGITS {
            return None;
        }
        Some((level, usize::from(id.digit(level))))
    }

    /// Insert or refresh a candidate in the slot implied by its shared prefix.
    pub fn add(&mut self, node: RemoteNode) -> SlotUpdate {
        let Some((level, digit)) = self.slot_of(&node.id) else {
            return SlotUpdate::Rejected;
        };
        self.levels[level][digit].touch(node, self.slot_size)
    }

    /// Mark a candidate as just confirmed alive.
    pub fn refresh(&mut self, id: &NodeId) -> bool {
        match self.slot_of(id) {
            Some((level, digit)) => self.levels[level][digit].refresh(id),
            None => false,
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> bool {
        match self.slot_of(id) {
            Some((level, digit)) => self.levels[level][digit].remove(id),
            None => false,
        }
    }

    /// Purge every given node; returns the ones that were present.
    pub fn remove_all<'a, I>(&mut self, nodes: I) -> Vec<RemoteNode>
    where
        I: IntoIterator<Item = &'a RemoteNode>,
    {
        nodes
            .into_iter()
            .filter(|node| self.remove(&node.id))
            .cloned()
            .collect()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        match self.slot_of(id) {
            Some((level, digit)) => self.levels[level][digit]
                .candidates
                .iter()
                .any(|c| &c.id == id),
            None => false,
        }
    }

    /// Next hop toward `target`, or `None` when the local node is the root.
    pub fn best_match(&self, target: &NodeId) -> Option<RemoteNode> {
        let level = self.local.id.shared_prefix_len(target);
        self.best_match_from(target, level)
    }

    /// Surrogate routing starting at `level`: per level, digits are scanned in
    /// increasing XOR distance from the target's digit. Reaching the local
    /// node's own digit descends to the next level.
    pub fn best_match_from(&self, target: &NodeId, level: usize) -> Option<RemoteNode> {
        for level in level..DIGITS {
            let wanted = target.digit(level);
            let own = self.local.id.digit(level);
            for offset in 0..BASE as u8 {
                let digit = wanted ^ offset;
                if digit == own {
                    break;
                }
                if let Some(primary) = self.levels[level][usize::from(digit)].candidates.first() {
                    return Some(primary.clone());
                }
            }
        }
        None
    }

    /// Non-empty slots at `level`, each ordered primary first.
    pub fn level_slots(&self, level: usize) -> Vec<Vec<RemoteNode>> {
        if level >= DIGITS {
            return Vec::new();
        }
        self.levels[level]
            .iter()
            .filter(|slot| !slot.candidates.is_empty())
            .map(|slot| slot.candidates.clone())
            .collect()
    }

    pub fn level_nodes(&self, level: usize) -> Vec<RemoteNode> {
        self.level_slots(level).into_iter().flatten().collect()
    }

    pub fn nodes(&self) -> Vec<RemoteNode> {
        self.levels
            .iter()
            .flat_map(|row| row.iter())
            .flat_map(|slot| slot.candidates.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.levels
            .iter()
            .flat_map(|row| row.iter())
            .map(|slot| slot.candidates.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `k` known nodes closest to `target`.
    pub fn closest(&self, target: &NodeId, k: usize) -> Vec<RemoteNode> {
        let set: NodeSet = self.nodes().into_iter().collect();
        set.closest(target, k)
    }

    /// Who should stand in for the local node in the tables of its level-`level`
    /// backpointers: the closest known node sharing more than `level` digits.
    pub fn replacement_for(&self, level: usize) -> Option<RemoteNode> {
        let deeper: NodeSet = ((level + 1)..DIGITS)
            .flat_map(|l| self.level_nodes(l))
            .collect();
        deeper.closest(&self.local.id, 1).into_iter().next()
    }
}

/// Per-level record of the nodes that route through the local node.
#[derive(Debug)]
pub struct Backpointers {
    local: NodeId,
    levels: Vec<HashMap<NodeId, RemoteNode>>,
}

impl Backpointers {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            levels: vec![HashMap::new(); DIGITS],
        }
    }

    pub fn add(&mut self, node: RemoteNode) -> bool {
        let level = self.local.shared_prefix_len(&node.id);
        if level == DIGITS {
            return false;
        }
        self.levels[level].insert(node.id, node).is_none()
    }

    pub fn remove(&mut self, id: &NodeId) -> bool {
        let level = self.local.shared_prefix_len(id);
        if level == DIGITS {
            return false;
        }
        self.levels[level].remove(id).is_some()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        let level = self.local.shared_prefix_len(id);
        level < DIGITS && self.levels[level].contains_key(id)
    }

    pub fn level(&self, level: usize) -> Vec<RemoteNode> {
        self.levels
            .get(level)
            .map(|nodes| nodes.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<RemoteNode> {
        self.levels
            .iter()
            .flat_map(|nodes| nodes.values().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::parse(s).expect("valid identifier")
    }

    fn node(s: &str) -> RemoteNode {
        RemoteNode::new(id(s), format!("127.0.0.1:{}", 10_000 + s.len()))
    }

    fn table(local: &str) -> RoutingTable {
        RoutingTable::new(node(local), DEFAULT_SLOT_SIZE)
    }

    #[test]
    fn never_lists_the_local_node() {
        let mut rt = table("100");
        assert_eq!(rt.add(node("100")), SlotUpdate::Rejected);
        assert!(rt.is_empty());
    }

    #[test]
    fn candidates_land_in_prefix_slot_and_deduplicate() {
        let mut rt = table("100");
        assert_eq!(rt.add(node("120")), SlotUpdate::Inserted);
        assert_eq!(rt.add(node("120")), SlotUpdate::Refreshed);
        assert_eq!(rt.len(), 1);
        assert_eq!(rt.level_nodes(1), vec![node("120")]);
        assert!(rt.level_nodes(0).is_empty());
    }

    #[test]
    fn full_slot_evicts_least_recently_confirmed() {
        let mut rt = table("000");
        for s in ["a1", "a2", "a3"] {
            assert_eq!(rt.add(node(s)), SlotUpdate::Inserted);
        }
        // a1 was confirmed most recently, so a2 becomes the oldest
        assert!(rt.refresh(&id("a1")));
        match rt.add(node("a4")) {
            SlotUpdate::Replaced { evicted } => assert_eq!(evicted, node("a2")),
            other => panic!("expected eviction, got {other:?}"),
        }
        assert_eq!(rt.level_slots(0), vec![vec![node("a4"), node("a1"), node("a3")]]);
    }

    #[test]
    fn best_match_on_empty_table_is_self() {
        let rt = table("abc");
        for _ in 0..16 {
            assert!(rt.best_match(&NodeId::random()).is_none());
        }
    }

    #[test]
    fn best_match_prefers_longer_prefix() {
        let mut rt = table("100");
        rt.add(node("120"));
        rt.add(node("200"));
        assert_eq!(rt.best_match(&id("123")), Some(node("120")));
    }

    #[test]
    fn best_match_returns_none_when_local_is_closest() {
        let mut rt = table("120");
        rt.add(node("100"));
        rt.add(node("200"));
        assert_eq!(rt.best_match(&id("123")), None);
    }

    #[test]
    fn surrogate_scan_uses_xor_order_when_slot_is_empty() {
        // target digit 4 at level 0; local digit is 0 (xor 4), candidates 5 (xor 1) and 6 (xor 2)
        let mut rt = table("0");
        rt.add(node("6"));
        rt.add(node("5"));
        assert_eq!(rt.best_match(&id("4")), Some(node("5")));

        // target digit 1: local digit 0 is at xor 1, before 5 (xor 4) -> descend, then self
        assert_eq!(rt.best_match(&id("1")), None);
    }

    #[test]
    fn best_match_from_skips_levels_below_start() {
        let mut rt = table("500");
        rt.add(node("1"));
        // From level 0 the target "1" routes to node "1"; from level 1 only
        // digits after the first are considered.
        assert_eq!(rt.best_match_from(&id("1"), 0), Some(node("1")));
        assert_eq!(rt.best_match_from(&id("1"), 1), None);
    }

    #[test]
    fn remove_all_purges_every_level() {
        let mut rt = table("000");
        for s in ["1", "01", "001", "0001"] {
            rt.add(node(s));
        }
        let removed = rt.remove_all(&[node("01"), node("0001"), node("fff")]);
        assert_eq!(removed.len(), 2);
        assert_eq!(rt.len(), 2);
        assert!(!rt.contains(&id("01")));
        assert!(rt.contains(&id("001")));
    }

    #[test]
    fn replacement_comes_from_deeper_levels() {
        let mut rt = table("100");
        rt.add(node("2"));
        rt.add(node("18"));
        rt.add(node("101"));
        assert_eq!(rt.replacement_for(0), Some(node("101")));
        assert_eq!(rt.replacement_for(2), None);
    }

    #[test]
    fn backpointers_are_tracked_per_level() {
        let mut bp = Backpointers::new(id("100"));
        assert!(bp.add(node("120")));
        assert!(!bp.add(node("120")));
        assert!(bp.add(node("200")));
        assert!(!bp.add(node("100")));
        assert_eq!(bp.level(1), vec![node("120")]);
        assert_eq!(bp.level(0), vec![node("200")]);
        assert!(bp.remove(&id("120")));
        assert!(!bp.contains(&id("120")));
        assert_eq!(bp.len(), 1);
    }
}
