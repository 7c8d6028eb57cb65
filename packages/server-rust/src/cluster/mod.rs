//! Cluster group engine module.
//!
//! Membership state, the cluster status machine, the two-phase join
//! protocol, the cooperative event queue, request admission, and the
//! partition guard. `GroupEngine` ties them together over the collaborator
//! seams in [`traits`].

pub mod admission;
pub mod engine;
pub mod event;
pub mod membership;
pub mod partition;
pub mod request;
pub mod status;
pub mod system;
pub mod traits;
pub mod vnode;

// ---------------------------------------------------------------------------
// Re-exports — flat public API
// ---------------------------------------------------------------------------

pub use admission::{check_epoch, is_busy, is_recovery_exempt, OutstandingIo};
pub use engine::{EngineSeams, GroupEngine};
pub use event::{Event, EventQueue};
pub use membership::{Membership, WasMember};
pub use partition::{majority_alive, Connectivity, TcpConnectivity};
pub use request::{ClientRequest, EpochRecord, ReplyData, RequestReply};
pub use status::{arbitrate, sanity_check, Arbitration};
pub use system::{ClusterView, Fault, System};
pub use traits::{NoPeers, NullStoreGateway, NullWorkers, PeerClient, RequestWorkers, StoreGateway};
pub use vnode::{build_ring, is_access_local, replicas, Vnode};

// ---------------------------------------------------------------------------
// Shared test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::HashSet;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use shoal_core::{Epoch, Node, NodeEntry, NodeId};

    use crate::driver::{Delivery, LoopbackHub};
    use crate::epoch::MemEpochStore;
    use crate::vdi::{InMemoryVdiEngine, VdiBitmap};

    use super::engine::{EngineSeams, GroupEngine};
    use super::partition::Connectivity;
    use super::request::ClientRequest;
    use super::traits::{PeerClient, RequestWorkers, StoreGateway};

    pub(crate) fn nid(last: u8) -> NodeId {
        let mut addr = [0u8; 16];
        addr[15] = last;
        NodeId { addr, pid: u64::from(last) }
    }

    pub(crate) fn nentry(last: u8) -> NodeEntry {
        let mut addr = [0u8; 16];
        addr[15] = last;
        NodeEntry::new(addr, 7000, Some(u32::from(last)))
    }

    pub(crate) fn nnode(last: u8) -> Node {
        Node { id: nid(last), entry: nentry(last) }
    }

    /// Store gateway recording recovery and epoch notifications.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingStore {
        inner: Arc<RecordingStoreInner>,
    }

    #[derive(Default)]
    struct RecordingStoreInner {
        recoveries: Mutex<Vec<Epoch>>,
        epoch_updates: Mutex<Vec<Epoch>>,
        recovering: Mutex<HashSet<u64>>,
    }

    impl RecordingStore {
        pub(crate) fn recoveries(&self) -> Vec<Epoch> {
            self.inner.recoveries.lock().clone()
        }

        pub(crate) fn epoch_updates(&self) -> Vec<Epoch> {
            self.inner.epoch_updates.lock().clone()
        }

        pub(crate) fn set_recovering(&self, oid: u64, yes: bool) {
            let mut set = self.inner.recovering.lock();
            if yes {
                set.insert(oid);
            } else {
                set.remove(&oid);
            }
        }
    }

    impl StoreGateway for RecordingStore {
        fn update_epoch(&self, epoch: Epoch) {
            self.inner.epoch_updates.lock().push(epoch);
        }

        fn start_recovery(&self, epoch: Epoch) {
            self.inner.recoveries.lock().push(epoch);
        }

        fn is_recovering(&self, oid: u64) -> bool {
            self.inner.recovering.lock().contains(&oid)
        }
    }

    /// Worker pools that park dispatched requests for manual completion.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingWorkers {
        inner: Arc<Mutex<Vec<(&'static str, ClientRequest)>>>,
    }

    impl RecordingWorkers {
        pub(crate) fn take(&self) -> Vec<(&'static str, ClientRequest)> {
            std::mem::take(&mut self.inner.lock())
        }

        pub(crate) fn dispatched_oids(&self) -> Vec<u64> {
            self.inner.lock().iter().map(|(_, r)| r.header.obj.oid).collect()
        }

        pub(crate) fn len(&self) -> usize {
            self.inner.lock().len()
        }
    }

    impl RequestWorkers for RecordingWorkers {
        fn queue_io(&self, req: ClientRequest) {
            self.inner.lock().push(("io", req));
        }

        fn queue_gateway(&self, req: ClientRequest) {
            self.inner.lock().push(("gateway", req));
        }
    }

    /// Probe stub answering from a shared set of reachable entries.
    #[derive(Clone, Default)]
    pub(crate) struct TestConnectivity {
        alive: Arc<Mutex<HashSet<NodeEntry>>>,
    }

    impl TestConnectivity {
        pub(crate) fn set_alive<I: IntoIterator<Item = NodeEntry>>(&self, alive: I) {
            *self.alive.lock() = alive.into_iter().collect();
        }
    }

    impl Connectivity for TestConnectivity {
        fn probe(&self, entry: &NodeEntry) -> bool {
            self.alive.lock().contains(entry)
        }
    }

    /// Peer RPC stub; bitmap fetches answer from a shared table.
    #[derive(Clone, Default)]
    pub(crate) struct StubPeers {
        bitmaps: Arc<Mutex<Vec<(NodeEntry, VdiBitmap)>>>,
    }

    impl StubPeers {
        pub(crate) fn put_bitmap(&self, peer: NodeEntry, bitmap: VdiBitmap) {
            self.bitmaps.lock().push((peer, bitmap));
        }
    }

    impl PeerClient for StubPeers {
        fn fetch_vdi_bitmap(&self, peer: &NodeEntry) -> anyhow::Result<VdiBitmap> {
            self.bitmaps
                .lock()
                .iter()
                .find(|(e, _)| e == peer)
                .map(|(_, b)| b.clone())
                .ok_or_else(|| anyhow::anyhow!("peer {peer:?} unreachable"))
        }

        fn read_epoch(&self, peer: &NodeEntry, epoch: Epoch) -> anyhow::Result<Vec<NodeEntry>> {
            anyhow::bail!("no remote epochs (peer {peer:?}, epoch {epoch})")
        }
    }

    /// One node under test: the engine plus handles to its stubs.
    pub(crate) struct TestNode {
        pub id: NodeId,
        pub entry: NodeEntry,
        pub engine: GroupEngine,
        pub epochs: Arc<MemEpochStore>,
        pub store: RecordingStore,
        pub workers: RecordingWorkers,
        pub conn: TestConnectivity,
        pub peers: StubPeers,
    }

    pub(crate) fn make_node(last: u8, hub: &LoopbackHub, epochs: Arc<MemEpochStore>) -> TestNode {
        let id = nid(last);
        let entry = nentry(last);
        let store = RecordingStore::default();
        let workers = RecordingWorkers::default();
        let conn = TestConnectivity::default();
        let peers = StubPeers::default();
        let engine = GroupEngine::new(
            id,
            entry,
            EngineSeams {
                epochs: Box::new(Arc::clone(&epochs)),
                vdi: Box::new(InMemoryVdiEngine::new()),
                store: Box::new(store.clone()),
                peers: Box::new(peers.clone()),
                connectivity: Box::new(conn.clone()),
                workers: Box::new(workers.clone()),
                driver: Box::new(hub.port(id)),
            },
        );
        TestNode {
            id,
            entry,
            engine,
            epochs,
            store,
            workers,
            conn,
            peers,
        }
    }

    /// Delivers exactly one pending hub delivery to its targets. Returns
    /// `false` when the hub is drained.
    pub(crate) fn step(hub: &LoopbackHub, nodes: &mut [TestNode]) -> bool {
        let Some(delivery) = hub.next_delivery() else {
            return false;
        };
        match delivery {
            Delivery::Join { joined, members, targets } => {
                for t in targets {
                    if let Some(n) = nodes.iter_mut().find(|n| n.id == t) {
                        n.engine.handle_join(joined, members.clone());
                    }
                }
            }
            Delivery::Leave { left, members, targets } => {
                for t in targets {
                    if let Some(n) = nodes.iter_mut().find(|n| n.id == t) {
                        n.engine.handle_leave(left, members.clone());
                    }
                }
            }
            Delivery::Notify { sender, payload, targets } => {
                for t in targets {
                    if let Some(n) = nodes.iter_mut().find(|n| n.id == t) {
                        n.engine.handle_notify(sender, &payload);
                    }
                }
            }
        }
        true
    }

    /// Drains the hub completely.
    pub(crate) fn run(hub: &LoopbackHub, nodes: &mut [TestNode]) {
        while step(hub, nodes) {}
    }
}

// ---------------------------------------------------------------------------
// Integration tests: end-to-end scenarios over the loopback driver
// ---------------------------------------------------------------------------
