//! Partition guard: fail-stop on suspected network partition.
//!
//! When the driver reports a leave, the node probes every other member over
//! TCP. If it cannot reach a majority, it is more likely on the minority
//! side of a partition than a survivor, and the process aborts rather than
//! risk split-brain. Clusters of one or two nodes skip the check; a
//! majority there is meaningless.

use std::net::{IpAddr, Ipv6Addr, SocketAddr, TcpStream};
use std::time::Duration;

use tracing::{debug, error};

use shoal_core::{Node, NodeEntry, NodeId};

// ---------------------------------------------------------------------------
// Connectivity
// ---------------------------------------------------------------------------

/// Reachability probe seam. The production impl blocks on a TCP connect;
/// the guard runs on the worker half of a leave event where blocking is
/// allowed.
pub trait Connectivity: Send + Sync {
    fn probe(&self, entry: &NodeEntry) -> bool;
}

/// TCP connect probe with a bounded timeout.
pub struct TcpConnectivity {
    timeout: Duration,
}

impl TcpConnectivity {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpConnectivity {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl Connectivity for TcpConnectivity {
    fn probe(&self, entry: &NodeEntry) -> bool {
        let ip = IpAddr::from(Ipv6Addr::from(entry.addr));
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
            IpAddr::V4(_) => ip,
        };
        let addr = SocketAddr::new(ip, entry.port);
        TcpStream::connect_timeout(&addr, self.timeout).is_ok()
    }
}

// ---------------------------------------------------------------------------
// Majority check
// ---------------------------------------------------------------------------

/// Probes the members other than the leaver (this node included) and
/// returns `true` when a majority of the pre-leave cluster is reachable.
#[must_use]
pub fn majority_alive(members: &[Node], left: &NodeId, conn: &dyn Connectivity) -> bool {
    let nr_nodes = members.len();
    let nr_majority = nr_nodes / 2 + 1;

    // Partition handling needs at least 3 nodes to be meaningful.
    if nr_nodes < 3 {
        return true;
    }

    let mut nr_reachable = 0;
    for node in members.iter().filter(|n| n.id != *left) {
        if !conn.probe(&node.entry) {
            continue;
        }
        nr_reachable += 1;
        if nr_reachable >= nr_majority {
            debug!(nr_nodes, nr_reachable, "majority of nodes alive");
            return true;
        }
    }
    error!(nr_nodes, nr_majority, nr_reachable, "majority of nodes not alive");
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use parking_lot::Mutex;

    use super::*;

    /// Probe stub answering from a mutable set of reachable entries.
    pub(crate) struct StaticConnectivity {
        alive: Mutex<HashSet<NodeEntry>>,
    }

    impl StaticConnectivity {
        pub(crate) fn new<I: IntoIterator<Item = NodeEntry>>(alive: I) -> Self {
            Self {
                alive: Mutex::new(alive.into_iter().collect()),
            }
        }

        pub(crate) fn set_alive<I: IntoIterator<Item = NodeEntry>>(&self, alive: I) {
            *self.alive.lock() = alive.into_iter().collect();
        }
    }

    impl Connectivity for StaticConnectivity {
        fn probe(&self, entry: &NodeEntry) -> bool {
            self.alive.lock().contains(entry)
        }
    }

    fn node(last: u8) -> Node {
        let mut addr = [0u8; 16];
        addr[15] = last;
        Node {
            id: NodeId { addr, pid: u64::from(last) },
            entry: NodeEntry::new(addr, 7000, None),
        }
    }

    #[test]
    fn small_clusters_skip_the_check() {
        let members = vec![node(1), node(2)];
        let conn = StaticConnectivity::new([]);
        assert!(majority_alive(&members, &node(2).id, &conn));
    }

    #[test]
    fn three_nodes_one_reachable_is_minority() {
        let members = vec![node(1), node(2), node(3)];
        // Only self answers: 1 reachable < majority 2.
        let conn = StaticConnectivity::new([node(1).entry]);
        assert!(!majority_alive(&members, &node(3).id, &conn));
    }

    #[test]
    fn three_nodes_two_reachable_is_majority() {
        let members = vec![node(1), node(2), node(3)];
        let conn = StaticConnectivity::new([node(1).entry, node(2).entry]);
        assert!(majority_alive(&members, &node(3).id, &conn));
    }

    #[test]
    fn leaver_is_not_probed() {
        let members = vec![node(1), node(2), node(3)];
        // The leaver still answers probes, but must not count.
        let conn = StaticConnectivity::new([node(1).entry, node(3).entry]);
        assert!(!majority_alive(&members, &node(3).id, &conn));
        conn.set_alive([node(1).entry, node(2).entry, node(3).entry]);
        assert!(majority_alive(&members, &node(3).id, &conn));
    }
}
