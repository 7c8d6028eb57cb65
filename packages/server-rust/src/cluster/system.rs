//! The single owned state value of a node.
//!
//! Everything the event pump mutates lives here: identity, status, epoch,
//! the membership lists, the event queue with its gating bits, and the
//! request bookkeeping lists. Handlers receive `&mut System`; nothing in it
//! is shared or atomic. A read-only [`ClusterView`] snapshot is published
//! through `ArcSwap` for observers (health endpoints, the daemon log loop)
//! so they never have to enter the event queue.

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;

use shoal_core::{ClusterStatus, Epoch, Node, NodeEntry, NodeId, ResultCode};

use crate::vdi::VdiBitmap;

use super::admission::OutstandingIo;
use super::event::EventQueue;
use super::membership::Membership;
use super::request::ClientRequest;
use super::vnode::Vnode;

// ---------------------------------------------------------------------------
// Fault
// ---------------------------------------------------------------------------

/// Fatal outcomes. Library code records them instead of exiting; the host
/// process translates them into exit or abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    #[error("failed to join the cluster: {0:?}")]
    JoinFailed(ResultCode),
    #[error("handed mastership off; restart when a better master is up")]
    MasterTransferred,
    #[error("majority unreachable, suspecting network partition")]
    PartitionSuspected,
    #[error("group driver failed")]
    DriverFailed,
}

// ---------------------------------------------------------------------------
// ClusterView
// ---------------------------------------------------------------------------

/// Read-only snapshot of cluster state, republished after every event.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterView {
    pub status: ClusterStatus,
    pub epoch: Epoch,
    pub members: Vec<Node>,
    pub master: Option<NodeEntry>,
    pub join_finished: bool,
    pub fault: Option<Fault>,
}

impl ClusterView {
    fn empty() -> Self {
        Self {
            status: ClusterStatus::WaitForFormat,
            epoch: 0,
            members: Vec::new(),
            master: None,
            join_finished: false,
            fault: None,
        }
    }
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

/// Process-wide node state, owned by the engine and touched only from the
/// main context.
pub struct System {
    pub this_id: NodeId,
    pub this_entry: NodeEntry,

    pub status: ClusterStatus,
    pub epoch: Epoch,
    pub join_finished: bool,
    /// Object redundancy; 0 until learned from format or a join response.
    pub nr_copies: u32,

    pub membership: Membership,
    pub queue: EventQueue,

    pub nr_outstanding_io: usize,
    /// VDI metadata requests awaiting their group FIN, in broadcast order.
    pub pending: VecDeque<ClientRequest>,
    pub outstanding: Vec<OutstandingIo>,
    pub wait_for_obj: VecDeque<ClientRequest>,

    pub vdi_inuse: VdiBitmap,
    /// Cached placement ring; empty means invalidated.
    pub vnodes: Vec<Vnode>,

    pub fault: Option<Fault>,

    view: Arc<ArcSwap<ClusterView>>,
}

impl System {
    #[must_use]
    pub fn new(this_id: NodeId, this_entry: NodeEntry, status: ClusterStatus) -> Self {
        Self {
            this_id,
            this_entry,
            status,
            epoch: 0,
            join_finished: false,
            nr_copies: 0,
            membership: Membership::new(),
            queue: EventQueue::new(),
            nr_outstanding_io: 0,
            pending: VecDeque::new(),
            outstanding: Vec::new(),
            wait_for_obj: VecDeque::new(),
            vdi_inuse: VdiBitmap::new(),
            vnodes: Vec::new(),
            fault: None,
            view: Arc::new(ArcSwap::new(Arc::new(ClusterView::empty()))),
        }
    }

    /// `true` when this node is the cluster master: it has finished joining
    /// and sorts first among admitted members.
    #[must_use]
    pub fn is_master(&self) -> bool {
        if !self.join_finished {
            return false;
        }
        self.membership
            .master()
            .is_some_and(|m| m.entry == self.this_entry)
    }

    /// Handle observers clone to read the published view.
    #[must_use]
    pub fn view_handle(&self) -> Arc<ArcSwap<ClusterView>> {
        Arc::clone(&self.view)
    }

    /// Republishes the view snapshot; called by the engine after each event
    /// settles.
    pub fn publish_view(&self) {
        self.view.store(Arc::new(ClusterView {
            status: self.status,
            epoch: self.epoch,
            members: self.membership.in_cluster().to_vec(),
            master: self.membership.master().map(|n| n.entry),
            join_finished: self.join_finished,
            fault: self.fault,
        }));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
