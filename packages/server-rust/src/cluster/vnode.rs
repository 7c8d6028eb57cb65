//! Virtual-node ring: replica placement derived from the member set.
//!
//! Each member contributes `nr_vnodes` points on a hash ring; an object id
//! hashes to a point and its replicas are the next members clockwise,
//! skipping duplicate failure zones. The ring is a pure function of the
//! sorted member entries; the engine caches it and clears the cache on any
//! membership change.

use shoal_core::NodeEntry;

use crate::vdi::fnv64;

/// One point on the placement ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vnode {
    pub point: u64,
    pub entry: NodeEntry,
}

/// Builds the ring from sorted member entries.
#[must_use]
pub fn build_ring(entries: &[NodeEntry]) -> Vec<Vnode> {
    let mut ring = Vec::with_capacity(entries.iter().map(|e| usize::from(e.nr_vnodes)).sum());
    for entry in entries {
        for i in 0..entry.nr_vnodes {
            let mut key = [0u8; 20];
            key[..16].copy_from_slice(&entry.addr);
            key[16..18].copy_from_slice(&entry.port.to_le_bytes());
            key[18..20].copy_from_slice(&i.to_le_bytes());
            ring.push(Vnode {
                point: fnv64(&key),
                entry: *entry,
            });
        }
    }
    ring.sort_by_key(|v| v.point);
    ring
}

/// The first `copies` zone-distinct members clockwise from the object's
/// point.
#[must_use]
pub fn replicas(ring: &[Vnode], oid: u64, copies: usize) -> Vec<NodeEntry> {
    let mut out: Vec<NodeEntry> = Vec::with_capacity(copies);
    if ring.is_empty() || copies == 0 {
        return out;
    }
    let point = fnv64(&oid.to_le_bytes());
    let start = ring.partition_point(|v| v.point < point);
    for i in 0..ring.len() {
        let v = &ring[(start + i) % ring.len()];
        if out.iter().any(|e| e.zone == v.entry.zone) {
            continue;
        }
        out.push(v.entry);
        if out.len() == copies {
            break;
        }
    }
    out
}

/// `true` when one of the object's replicas is this node.
#[must_use]
pub fn is_access_local(ring: &[Vnode], oid: u64, copies: usize, this: &NodeEntry) -> bool {
    if oid == 0 {
        return false;
    }
    replicas(ring, oid, copies).contains(this)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(last: u8, zone: u32) -> NodeEntry {
        let mut addr = [0u8; 16];
        addr[15] = last;
        NodeEntry::new(addr, 7000, Some(zone))
    }

    #[test]
    fn ring_size_is_sum_of_weights() {
        let ring = build_ring(&[entry(1, 1), entry(2, 2)]);
        assert_eq!(ring.len(), 2 * usize::from(shoal_core::DEFAULT_VNODES));
        assert!(ring.windows(2).all(|w| w[0].point <= w[1].point));
    }

    #[test]
    fn replicas_are_zone_distinct() {
        let ring = build_ring(&[entry(1, 1), entry(2, 1), entry(3, 2), entry(4, 3)]);
        for oid in [1u64, 42, 0xdead_beef, u64::MAX] {
            let reps = replicas(&ring, oid, 3);
            assert_eq!(reps.len(), 3, "oid {oid}");
            let mut zones: Vec<u32> = reps.iter().map(|e| e.zone).collect();
            zones.sort_unstable();
            zones.dedup();
            assert_eq!(zones.len(), 3, "oid {oid}");
        }
    }

    #[test]
    fn replicas_capped_by_zone_count() {
        let ring = build_ring(&[entry(1, 1), entry(2, 1)]);
        assert_eq!(replicas(&ring, 7, 3).len(), 1);
    }

    #[test]
    fn placement_is_deterministic() {
        let ring = build_ring(&[entry(1, 1), entry(2, 2), entry(3, 3)]);
        assert_eq!(replicas(&ring, 99, 2), replicas(&ring, 99, 2));
    }

    #[test]
    fn local_access_detection() {
        let members = [entry(1, 1), entry(2, 2), entry(3, 3)];
        let ring = build_ring(&members);
        // With copies == members, every oid is local to every member.
        assert!(is_access_local(&ring, 1234, 3, &members[0]));
        // Oid zero is the null object, never local.
        assert!(!is_access_local(&ring, 0, 3, &members[0]));
    }

    #[test]
    fn empty_ring_places_nothing() {
        assert!(replicas(&[], 1, 3).is_empty());
        assert!(!is_access_local(&[], 1, 3, &entry(1, 1)));
    }
}
