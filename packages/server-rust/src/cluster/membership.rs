//! Membership state: the three node lists.
//!
//! `pre_cluster` holds processes the driver has seen but the logical cluster
//! has not admitted; `in_cluster` holds admitted members, kept sorted by
//! entry order so the first element is the master; `leave_list` holds nodes
//! that departed while the cluster was re-forming, retained so quorum can be
//! reached without them.

use tracing::debug;

use shoal_core::{Node, NodeEntry, NodeId};

/// Which list a removed node was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WasMember {
    InCluster,
    PreCluster,
    Unknown,
}

/// The three membership lists.
///
/// Invariants: `in_cluster` is sorted by `NodeEntry` order and
/// duplicate-free; no id appears on more than one list; `leave_list` never
/// intersects `in_cluster`.
#[derive(Debug, Default)]
pub struct Membership {
    pre_cluster: Vec<Node>,
    in_cluster: Vec<Node>,
    leave_list: Vec<Node>,
}

impl Membership {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // -- pre_cluster -------------------------------------------------------

    /// Records a driver-level member not yet admitted. A known id (on any
    /// list) is left untouched.
    pub fn add_pre(&mut self, id: NodeId) {
        if self.find_pre(&id).is_some() || self.find_in_cluster(&id).is_some() {
            return;
        }
        self.pre_cluster.push(Node {
            id,
            entry: NodeEntry::new([0; 16], 0, Some(0)),
        });
    }

    #[must_use]
    pub fn pre_count(&self) -> usize {
        self.pre_cluster.len()
    }

    /// Updates the storage entry of a pre-cluster node. Returns `false` when
    /// the id is not in `pre_cluster` (it left, or was already admitted).
    pub fn set_pre_entry(&mut self, id: &NodeId, entry: NodeEntry) -> bool {
        match self.pre_cluster.iter_mut().find(|n| n.id == *id) {
            Some(node) => {
                node.entry = entry;
                true
            }
            None => false,
        }
    }

    // -- in_cluster --------------------------------------------------------

    /// Admits a node: moves it from `pre_cluster` into `in_cluster` at its
    /// sort position. Returns `false` when the id is unknown; an id already
    /// admitted is a no-op success.
    pub fn promote(&mut self, id: NodeId, entry: NodeEntry) -> bool {
        if self.find_in_cluster(&id).is_some() {
            return true;
        }
        let Some(pos) = self.pre_cluster.iter().position(|n| n.id == id) else {
            return false;
        };
        self.pre_cluster.remove(pos);
        let node = Node { id, entry };
        let at = self
            .in_cluster
            .partition_point(|n| n.entry < node.entry);
        self.in_cluster.insert(at, node);
        debug!(?id, ?entry, nr_members = self.in_cluster.len(), "admitted node");
        true
    }

    /// Removes an id from whichever list holds it.
    pub fn remove(&mut self, id: &NodeId) -> WasMember {
        if let Some(pos) = self.in_cluster.iter().position(|n| n.id == *id) {
            self.in_cluster.remove(pos);
            return WasMember::InCluster;
        }
        if let Some(pos) = self.pre_cluster.iter().position(|n| n.id == *id) {
            self.pre_cluster.remove(pos);
            return WasMember::PreCluster;
        }
        WasMember::Unknown
    }

    #[must_use]
    pub fn find_pre(&self, id: &NodeId) -> Option<&Node> {
        self.pre_cluster.iter().find(|n| n.id == *id)
    }

    #[must_use]
    pub fn find_in_cluster(&self, id: &NodeId) -> Option<&Node> {
        self.in_cluster.iter().find(|n| n.id == *id)
    }

    /// The admitted members, in canonical (sorted) order.
    #[must_use]
    pub fn in_cluster(&self) -> &[Node] {
        &self.in_cluster
    }

    /// Canonical sorted entry array, as persisted in epoch snapshots.
    #[must_use]
    pub fn ordered_entries(&self) -> Vec<NodeEntry> {
        self.in_cluster.iter().map(|n| n.entry).collect()
    }

    /// The master: first admitted member in sort order.
    #[must_use]
    pub fn master(&self) -> Option<&Node> {
        self.in_cluster.first()
    }

    #[must_use]
    pub fn contains_entry(&self, entry: &NodeEntry) -> bool {
        self.in_cluster.iter().any(|n| n.entry == *entry)
    }

    /// Number of distinct failure zones among admitted members.
    #[must_use]
    pub fn nr_zones(&self) -> usize {
        let mut zones: Vec<u32> = self.in_cluster.iter().map(|n| n.entry.zone).collect();
        zones.sort_unstable();
        zones.dedup();
        zones.len()
    }

    // -- leave_list --------------------------------------------------------

    /// Adds a departed node to the leave list iff it is not already there
    /// and it appears in the given latest-epoch snapshot. Stale or unrelated
    /// churn is silently dropped.
    pub fn leave_list_add_if_eligible(&mut self, node: Node, snapshot: &[NodeEntry]) -> bool {
        if self.leave_list.iter().any(|n| n.entry == node.entry) {
            return false;
        }
        if !snapshot.contains(&node.entry) {
            debug!(entry = ?node.entry, "leaver not in latest epoch, dropped");
            return false;
        }
        self.leave_list.push(node);
        true
    }

    #[must_use]
    pub fn leave_list(&self) -> &[Node] {
        &self.leave_list
    }

    #[must_use]
    pub fn leave_count(&self) -> usize {
        self.leave_list.len()
    }

    /// Garbage-collects the leave list on a transition back to `OK`.
    pub fn clear_leave_list(&mut self) {
        self.leave_list.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn node(last: u8, port: u16) -> Node {
        let mut addr = [0u8; 16];
        addr[15] = last;
        Node {
            id: NodeId { addr, pid: u64::from(last) },
            entry: NodeEntry::new(addr, port, None),
        }
    }

    fn admitted(ms: &Membership) -> Vec<u64> {
        ms.in_cluster().iter().map(|n| n.id.pid).collect()
    }

    #[test]
    fn promote_keeps_sorted_order() {
        let mut ms = Membership::new();
        for n in [node(3, 7000), node(1, 7000), node(2, 7000)] {
            ms.add_pre(n.id);
            assert!(ms.promote(n.id, n.entry));
        }
        assert_eq!(admitted(&ms), vec![1, 2, 3]);
        assert_eq!(ms.master().unwrap().id.pid, 1);
    }

    #[test]
    fn promote_unknown_id_fails() {
        let mut ms = Membership::new();
        let n = node(1, 7000);
        assert!(!ms.promote(n.id, n.entry));
    }

    #[test]
    fn promote_is_idempotent() {
        let mut ms = Membership::new();
        let n = node(1, 7000);
        ms.add_pre(n.id);
        assert!(ms.promote(n.id, n.entry));
        assert!(ms.promote(n.id, n.entry));
        assert_eq!(ms.in_cluster().len(), 1);
    }

    #[test]
    fn add_pre_ignores_known_ids() {
        let mut ms = Membership::new();
        let n = node(1, 7000);
        ms.add_pre(n.id);
        ms.add_pre(n.id);
        assert!(ms.find_pre(&n.id).is_some());
        ms.promote(n.id, n.entry);
        ms.add_pre(n.id);
        assert!(ms.find_pre(&n.id).is_none());
    }

    #[test]
    fn remove_reports_origin_list() {
        let mut ms = Membership::new();
        let a = node(1, 7000);
        let b = node(2, 7000);
        ms.add_pre(a.id);
        ms.add_pre(b.id);
        ms.promote(a.id, a.entry);

        assert_eq!(ms.remove(&a.id), WasMember::InCluster);
        assert_eq!(ms.remove(&b.id), WasMember::PreCluster);
        assert_eq!(ms.remove(&a.id), WasMember::Unknown);
    }

    #[test]
    fn leave_list_eligibility() {
        let mut ms = Membership::new();
        let a = node(1, 7000);
        let stranger = node(9, 7000);
        let snapshot = vec![a.entry];

        assert!(ms.leave_list_add_if_eligible(a, &snapshot));
        // Duplicate is dropped.
        assert!(!ms.leave_list_add_if_eligible(a, &snapshot));
        // Not in the latest snapshot: dropped.
        assert!(!ms.leave_list_add_if_eligible(stranger, &snapshot));
        assert_eq!(ms.leave_count(), 1);

        ms.clear_leave_list();
        assert_eq!(ms.leave_count(), 0);
    }

    #[test]
    fn nr_zones_counts_distinct() {
        let mut ms = Membership::new();
        for (last, zone) in [(1u8, 1u32), (2, 1), (3, 2)] {
            let mut addr = [0u8; 16];
            addr[15] = last;
            let n = Node {
                id: NodeId { addr, pid: u64::from(last) },
                entry: NodeEntry::new(addr, 7000, Some(zone)),
            };
            ms.add_pre(n.id);
            ms.promote(n.id, n.entry);
        }
        assert_eq!(ms.nr_zones(), 2);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // After any interleaving of admissions and removals the
            // in-cluster list stays sorted and duplicate-free.
            #[test]
            fn in_cluster_sorted_and_unique(ops in proptest::collection::vec((0u8..12, any::<bool>()), 0..64)) {
                let mut ms = Membership::new();
                for (last, remove) in ops {
                    let n = node(last, 7000);
                    if remove {
                        ms.remove(&n.id);
                    } else {
                        ms.add_pre(n.id);
                        ms.promote(n.id, n.entry);
                    }
                    let entries = ms.ordered_entries();
                    let mut sorted = entries.clone();
                    sorted.sort();
                    sorted.dedup();
                    prop_assert_eq!(&entries, &sorted);
                }
            }
        }
    }
}
