//! Seams toward the engine's external collaborators.
//!
//! The object store, recovery subsystem, peer RPC, and worker pools are
//! separate subsystems; the engine only depends on these contracts. Null
//! implementations are provided for hosts that wire a node without the full
//! storage stack (and for tests).

use tracing::warn;

use shoal_core::{Epoch, NodeEntry};

use crate::vdi::VdiBitmap;

use super::request::ClientRequest;

// ---------------------------------------------------------------------------
// StoreGateway
// ---------------------------------------------------------------------------

/// Object store and recovery subsystem, as seen from the engine.
pub trait StoreGateway: Send + Sync {
    /// Informs the store that the node's epoch advanced (it keys object
    /// directories by epoch).
    fn update_epoch(&self, epoch: Epoch);

    /// Kicks off recovery toward the given epoch. Fire-and-forget; progress
    /// comes back through `GroupEngine::object_recovered`.
    fn start_recovery(&self, epoch: Epoch);

    /// `true` while the object is still being recovered.
    fn is_recovering(&self, oid: u64) -> bool;
}

/// Store stub: nothing recovers, epoch updates are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStoreGateway;

impl StoreGateway for NullStoreGateway {
    fn update_epoch(&self, _epoch: Epoch) {}
    fn start_recovery(&self, _epoch: Epoch) {}
    fn is_recovering(&self, _oid: u64) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// PeerClient
// ---------------------------------------------------------------------------

/// Point-to-point RPC against another member. Called from worker context;
/// implementations may block.
pub trait PeerClient: Send + Sync {
    /// Fetches the peer's VDI in-use bitmap for OR-merging after a join.
    ///
    /// # Errors
    ///
    /// Returns an error when the peer is unreachable or answers badly.
    fn fetch_vdi_bitmap(&self, peer: &NodeEntry) -> anyhow::Result<VdiBitmap>;

    /// Reads an epoch snapshot a peer still holds.
    ///
    /// # Errors
    ///
    /// Returns an error when the peer is unreachable or has no snapshot.
    fn read_epoch(&self, peer: &NodeEntry, epoch: Epoch) -> anyhow::Result<Vec<NodeEntry>>;
}

/// Peer stub for hosts without the peer transport wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPeers;

impl PeerClient for NoPeers {
    fn fetch_vdi_bitmap(&self, peer: &NodeEntry) -> anyhow::Result<VdiBitmap> {
        anyhow::bail!("no peer transport configured (peer {peer:?})")
    }

    fn read_epoch(&self, peer: &NodeEntry, epoch: Epoch) -> anyhow::Result<Vec<NodeEntry>> {
        anyhow::bail!("no peer transport configured (peer {peer:?}, epoch {epoch})")
    }
}

// ---------------------------------------------------------------------------
// RequestWorkers
// ---------------------------------------------------------------------------

/// The two worker pools object I/O is dispatched to. The pool executes the
/// request against the store (direct) or proxies it to the replica holders
/// (gateway), answers the client, and retires it with
/// `GroupEngine::complete_request`.
pub trait RequestWorkers: Send + Sync {
    fn queue_io(&self, req: ClientRequest);
    fn queue_gateway(&self, req: ClientRequest);
}

/// Worker stub: fails everything. Hosts that accept client I/O must wire
/// real pools.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWorkers;

impl RequestWorkers for NullWorkers {
    fn queue_io(&self, mut req: ClientRequest) {
        warn!(id = req.id, "no io worker pool configured");
        req.respond_code(shoal_core::ResultCode::SystemError);
    }

    fn queue_gateway(&self, mut req: ClientRequest) {
        warn!(id = req.id, "no gateway worker pool configured");
        req.respond_code(shoal_core::ResultCode::SystemError);
    }
}
