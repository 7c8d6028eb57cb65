//! The cluster group engine.
//!
//! One engine owns the node's [`System`] state and serializes everything
//! that touches it through the event queue: driver membership callbacks,
//! totally ordered notifies, and client requests. Every pumped event runs
//! in two halves, stage-1 (the worker half, allowed to block on network
//! and disk) and stage-2 (the main-context half that commits state), and
//! exactly one event runs at a time. Client requests are drained off the
//! queue front-to-first-membership-event and handed to the worker pools;
//! they may run concurrently with each other but never with a membership
//! event's stages.

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use shoal_core::request::{flags, is_cluster_read_opcode, is_io_opcode, is_vdi_opcode, op};
use shoal_core::{
    epoch_after, ClusterStatus, GroupMessage, JoinBody, LeaveBody, MessageBody, MessageHeader,
    MessageState, Node, NodeEntry, NodeId, RequestHeader, ResultCode, VdiOpBody, VdiRequest,
    VdiResponse, DEFAULT_COPIES, PROTO_VER,
};

use crate::driver::GroupDriver;
use crate::epoch::{read_or_remote, EpochStore};
use crate::vdi::{VdiEngine, VdiOpResult};

use super::admission::{self, OutstandingIo};
use super::event::Event;
use super::membership::WasMember;
use super::partition::{majority_alive, Connectivity};
use super::request::{ClientRequest, EpochRecord, ReplyData, RequestReply};
use super::status;
use super::system::{Fault, System};
use super::traits::{PeerClient, RequestWorkers, StoreGateway};
use super::vnode;

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// The engine's external collaborators, injected at construction.
pub struct EngineSeams {
    pub epochs: Box<dyn EpochStore>,
    pub vdi: Box<dyn VdiEngine>,
    pub store: Box<dyn StoreGateway>,
    pub peers: Box<dyn PeerClient>,
    pub connectivity: Box<dyn Connectivity>,
    pub workers: Box<dyn RequestWorkers>,
    pub driver: Box<dyn GroupDriver>,
}

// ---------------------------------------------------------------------------
// GroupEngine
// ---------------------------------------------------------------------------

/// The single-threaded cooperative core of a node.
pub struct GroupEngine {
    sys: System,
    epochs: Box<dyn EpochStore>,
    vdi: Box<dyn VdiEngine>,
    store: Box<dyn StoreGateway>,
    peers: Box<dyn PeerClient>,
    conn: Box<dyn Connectivity>,
    workers: Box<dyn RequestWorkers>,
    driver: Box<dyn GroupDriver>,
    next_request_id: u64,
}

impl GroupEngine {
    /// Builds an engine. The starting status is derived from the epoch log:
    /// a node with no persisted epoch waits for a format request, one with
    /// history waits to rejoin its recorded cluster.
    #[must_use]
    pub fn new(this_id: NodeId, this_entry: NodeEntry, seams: EngineSeams) -> Self {
        let status = if seams.epochs.latest() == 0 {
            ClusterStatus::WaitForFormat
        } else {
            ClusterStatus::WaitForJoin
        };
        info!(node = %this_id, ?status, "creating cluster engine");
        Self {
            sys: System::new(this_id, this_entry, status),
            epochs: seams.epochs,
            vdi: seams.vdi,
            store: seams.store,
            peers: seams.peers,
            conn: seams.connectivity,
            workers: seams.workers,
            driver: seams.driver,
            next_request_id: 0,
        }
    }

    /// Announces this node to the group driver.
    ///
    /// # Errors
    ///
    /// Returns an error when the driver cannot join its group.
    pub fn start(&mut self) -> anyhow::Result<()> {
        self.driver.join()
    }

    // -- accessors ---------------------------------------------------------

    #[must_use]
    pub fn system(&self) -> &System {
        &self.sys
    }

    #[must_use]
    pub fn status(&self) -> ClusterStatus {
        self.sys.status
    }

    #[must_use]
    pub fn epoch(&self) -> u32 {
        self.sys.epoch
    }

    #[must_use]
    pub fn is_master(&self) -> bool {
        self.sys.is_master()
    }

    #[must_use]
    pub fn fault(&self) -> Option<Fault> {
        self.sys.fault
    }

    #[must_use]
    pub fn view_handle(&self) -> std::sync::Arc<arc_swap::ArcSwap<super::system::ClusterView>> {
        self.sys.view_handle()
    }

    // -- driver callbacks --------------------------------------------------

    /// Driver agreement that `joined` is now a group member.
    pub fn handle_join(&mut self, joined: NodeId, members: Vec<NodeId>) {
        if self.sys.fault.is_some() || self.sys.status == ClusterStatus::Shutdown {
            return;
        }
        debug!(%joined, nr_members = members.len(), "driver join");
        self.sys.queue.push_back(Event::Join { joined, members });
        self.pump();
        self.sys.publish_view();
    }

    /// Driver agreement that `left` is gone.
    pub fn handle_leave(&mut self, left: NodeId, members: Vec<NodeId>) {
        if self.sys.fault.is_some() || self.sys.status == ClusterStatus::Shutdown {
            return;
        }
        debug!(%left, nr_members = members.len(), "driver leave");
        self.sys.queue.push_back(Event::Leave { left, members });
        self.pump();
        self.sys.publish_view();
    }

    /// A totally ordered notify payload from the driver.
    pub fn handle_notify(&mut self, sender: NodeId, payload: &[u8]) {
        if self.sys.fault.is_some() {
            return;
        }
        let msg = match GroupMessage::decode(payload) {
            Ok(msg) => msg,
            Err(err) => {
                error!(%sender, %err, "dropping malformed notify");
                return;
            }
        };
        debug!(
            op = msg.opcode(),
            state = ?msg.header.state,
            from = ?msg.header.from,
            "notify"
        );

        let ev = Event::Notify { msg, skip: false };
        if self.sys.queue.suspended {
            // The dialog we are suspended on finalizes with this FIN; let it
            // overtake whatever else queued up in between.
            if let Event::Notify { msg, .. } = &ev {
                if msg.is_fin() {
                    let is_join = msg.is_join();
                    self.sys.queue.push_front(ev);
                    self.sys.queue.suspended = false;
                    if is_join {
                        self.sys.queue.joining = false;
                    }
                    self.pump();
                    self.sys.publish_view();
                    return;
                }
            }
        }
        self.sys.queue.push_back(ev);
        self.pump();
        self.sys.publish_view();
    }

    /// Host signal that the driver's readiness handle failed.
    pub fn driver_failed(&mut self) {
        error!("group driver failed; is the membership daemon still running?");
        self.sys.fault = Some(Fault::DriverFailed);
        self.sys.publish_view();
    }

    // -- client request surface --------------------------------------------

    /// Enqueues a client request; the reply arrives on the returned channel
    /// once admission and execution settle.
    pub fn queue_request(
        &mut self,
        header: RequestHeader,
        data: Vec<u8>,
    ) -> oneshot::Receiver<RequestReply> {
        self.next_request_id += 1;
        let (mut req, rx) = ClientRequest::new(self.next_request_id, header, data);
        if self.sys.fault.is_some() {
            req.respond_code(ResultCode::SystemError);
            return rx;
        }
        self.sys.queue.push_back(Event::Request(req));
        self.pump();
        self.sys.publish_view();
        rx
    }

    /// Retires an admitted object request after its worker finished, waking
    /// any requests parked behind its target object.
    pub fn complete_request(&mut self, id: u64) {
        if let Some(pos) = self.sys.outstanding.iter().position(|io| io.id == id) {
            self.sys.outstanding.remove(pos);
            self.sys.nr_outstanding_io -= 1;
        } else {
            warn!(id, "completion for unknown request");
        }
        self.requeue_waiters();
    }

    /// Recovery progress callback: objects parked behind recovery get
    /// another admission pass.
    pub fn object_recovered(&mut self, oid: u64) {
        debug!(oid, "object recovered");
        self.requeue_waiters();
    }

    fn requeue_waiters(&mut self) {
        while let Some(req) = self.sys.wait_for_obj.pop_front() {
            self.sys.queue.push_back(Event::Request(req));
        }
        self.pump();
        self.sys.publish_view();
    }

    /// Broadcasts a graceful leave. The node keeps serving as a gateway
    /// until the host stops it.
    ///
    /// # Errors
    ///
    /// Returns an error when the broadcast cannot be submitted.
    pub fn leave_cluster(&mut self) -> anyhow::Result<()> {
        let msg = GroupMessage::new(
            self.sys.this_entry,
            self.sys.this_id,
            MessageState::Fin,
            MessageBody::Leave(LeaveBody {
                epoch: self.epochs.latest(),
            }),
        );
        self.broadcast(&msg)
    }

    // -- event pump --------------------------------------------------------

    /// Runs queued work until the queue empties or a gate closes. Invoked
    /// after every enqueue and every completion.
    fn pump(&mut self) {
        loop {
            if self.sys.queue.is_empty() {
                return;
            }

            // Never preempt a running event with a membership change.
            if self.sys.queue.running
                && self.sys.queue.front().is_some_and(Event::is_membership_change)
            {
                return;
            }

            if self.sys.queue.joining {
                debug_assert!(self.sys.queue.suspended, "joining implies suspended");
                // While our join is in flight only direct I/O makes
                // progress, and its progress is a typed failure: the client
                // must retry against the post-join epoch.
                let fail_head = matches!(
                    self.sys.queue.front(),
                    Some(Event::Request(req))
                        if is_io_opcode(req.header.opcode)
                            && req.header.has_flag(flags::CMD_DIRECT)
                );
                if fail_head {
                    if let Some(Event::Request(mut req)) = self.sys.queue.pop_front() {
                        req.respond_code(ResultCode::NewNodeVer);
                    }
                }
                return;
            }

            // Admit client requests up to the first membership event,
            // re-running while admission failures retire synchronously.
            while self.drain_requests() {}

            if self.sys.queue.running || self.sys.queue.suspended || self.sys.queue.is_empty() {
                return;
            }

            // The vnode ring must not change under in-flight I/O.
            if self.sys.queue.front().is_some_and(Event::is_membership_change)
                && self.sys.nr_outstanding_io > 0
            {
                return;
            }

            let Some(ev) = self.sys.queue.pop_front() else {
                return;
            };
            self.sys.queue.running = true;
            self.run_event(ev);

            if self.sys.fault.is_some() {
                return;
            }
            if self.sys.queue.suspended && !self.sys.queue.joining {
                return;
            }
        }
    }

    /// Removes and admits every request between the queue head and the
    /// first membership event. Returns `true` when a request failed
    /// synchronously and the drain should re-run.
    fn drain_requests(&mut self) -> bool {
        let mut failed: Vec<(ClientRequest, ResultCode)> = Vec::new();
        let mut i = 0;
        while i < self.sys.queue.len() {
            match self.sys.queue.get(i) {
                Some(Event::Notify { .. }) => i += 1,
                Some(Event::Join { .. } | Event::Leave { .. }) | None => break,
                Some(Event::Request(_)) => {
                    if let Some(Event::Request(req)) = self.sys.queue.remove(i) {
                        self.admit_request(req, &mut failed);
                    }
                }
            }
        }
        let retry = !failed.is_empty();
        for (mut req, code) in failed {
            req.respond_code(code);
        }
        retry
    }

    // -- request admission -------------------------------------------------

    fn admit_request(
        &mut self,
        mut req: ClientRequest,
        failed: &mut Vec<(ClientRequest, ResultCode)>,
    ) {
        let opcode = req.header.opcode;

        if is_cluster_read_opcode(opcode) {
            self.answer_cluster_read(&mut req);
            return;
        }
        if is_vdi_opcode(opcode) {
            self.forward_vdi_op(req);
            return;
        }
        if !is_io_opcode(opcode) {
            warn!(opcode, "request opcode not handled by this node");
            req.respond_code(ResultCode::InvalidParms);
            return;
        }

        self.ensure_ring();
        let copies = (self.sys.nr_copies as usize).min(self.sys.membership.nr_zones());
        let oid = req.header.obj.oid;
        let exempt = admission::is_recovery_exempt(&req.header);

        if !exempt && self.store.is_recovering(oid) {
            if req.header.has_flag(flags::CMD_DIRECT) {
                failed.push((req, ResultCode::NewNodeVer));
            } else {
                self.sys.wait_for_obj.push_back(req);
            }
            return;
        }
        if !exempt && admission::is_busy(&self.sys.outstanding, oid) {
            self.sys.wait_for_obj.push_back(req);
            return;
        }

        let local = vnode::is_access_local(&self.sys.vnodes, oid, copies, &self.sys.this_entry)
            || vnode::is_access_local(
                &self.sys.vnodes,
                req.header.obj.cow_oid,
                copies,
                &self.sys.this_entry,
            );
        if local {
            let rc = admission::check_epoch(req.header.epoch, self.sys.epoch);
            if !rc.is_success() {
                failed.push((req, rc));
                return;
            }
        }

        self.sys.outstanding.push(OutstandingIo {
            id: req.id,
            oid,
            recovery_read: exempt,
        });
        self.sys.nr_outstanding_io += 1;
        if req.header.has_flag(flags::CMD_DIRECT) {
            self.workers.queue_io(req);
        } else {
            self.workers.queue_gateway(req);
        }
    }

    fn answer_cluster_read(&mut self, req: &mut ClientRequest) {
        match req.header.opcode {
            op::GET_NODE_LIST => {
                let entries = self.sys.membership.ordered_entries();
                let local_idx = entries.iter().position(|e| *e == self.sys.this_entry);
                let master_idx = if entries.is_empty() { None } else { Some(0) };
                req.respond(RequestReply {
                    result: ResultCode::Success,
                    data: ReplyData::NodeList {
                        entries,
                        local_idx,
                        master_idx,
                    },
                });
            }
            op::GET_EPOCH => match self.epochs.read(req.header.obj.tgt_epoch) {
                Some(nodes) => req.respond(RequestReply {
                    result: ResultCode::Success,
                    data: ReplyData::EpochNodes(nodes),
                }),
                None => req.respond_code(ResultCode::NoTag),
            },
            op::STAT_CLUSTER => {
                let members = self.sys.membership.ordered_entries();
                let ctime = self.epochs.ctime();
                let mut records = Vec::new();
                let mut epoch = self.epochs.latest();
                while epoch > 0 {
                    let nodes = read_or_remote(
                        self.epochs.as_ref(),
                        self.peers.as_ref(),
                        &members,
                        &self.sys.this_entry,
                        epoch,
                    )
                    .unwrap_or_default();
                    records.push(EpochRecord { epoch, ctime, nodes });
                    epoch -= 1;
                }
                let result = match self.sys.status {
                    ClusterStatus::Ok => ResultCode::Success,
                    ClusterStatus::WaitForFormat => ResultCode::WaitForFormat,
                    ClusterStatus::WaitForJoin => ResultCode::WaitForJoin,
                    ClusterStatus::Shutdown => ResultCode::Shutdown,
                    ClusterStatus::JoinFailed => ResultCode::JoinFailed,
                    ClusterStatus::Halt => ResultCode::Halt,
                };
                req.respond(RequestReply {
                    result,
                    data: ReplyData::ClusterStat(records),
                });
            }
            other => {
                warn!(opcode = other, "not a cluster read");
                req.respond_code(ResultCode::InvalidParms);
            }
        }
    }

    /// Wraps a VDI metadata request into an INIT message and broadcasts it;
    /// total order across the group decides execution, and the FIN wakes
    /// the parked request.
    fn forward_vdi_op(&mut self, mut req: ClientRequest) {
        let vreq = VdiRequest::from_header(&req.header);
        let data = if req.header.has_flag(flags::CMD_WRITE) {
            req.data.clone()
        } else {
            Vec::new()
        };
        let msg = GroupMessage::new(
            self.sys.this_entry,
            self.sys.this_id,
            MessageState::Init,
            MessageBody::VdiOp(Box::new(VdiOpBody {
                req: vreq,
                rsp: VdiResponse::default(),
                data,
            })),
        );
        match self.broadcast(&msg) {
            Ok(()) => self.sys.pending.push_back(req),
            Err(err) => {
                error!(%err, "vdi op broadcast failed");
                req.respond_code(ResultCode::Eio);
            }
        }
    }

    // -- event execution ---------------------------------------------------

    fn run_event(&mut self, mut ev: Event) {
        // Stage-1: the worker half.
        match &mut ev {
            Event::Join { .. } => {}
            Event::Leave { left, .. } => self.stage1_leave(*left),
            Event::Notify { msg, skip } => self.stage1_notify(msg, skip),
            Event::Request(_) => error!("request events are drained, never pumped"),
        }

        // Stage-2: the main-context half.
        let skipped = matches!(&ev, Event::Notify { skip: true, .. });
        if self.sys.fault.is_none() && !self.sys.queue.suspended && !skipped {
            match ev {
                Event::Join { joined, members } => self.stage2_join(joined, &members),
                Event::Leave { left, .. } => self.stage2_leave(&left),
                Event::Notify { msg, .. } => self.stage2_notify(msg),
                Event::Request(_) => {}
            }
        }

        self.sys.queue.running = false;
        self.sys.publish_view();
    }

    // -- driver membership events ------------------------------------------

    fn stage1_leave(&mut self, left: NodeId) {
        if !majority_alive(self.sys.membership.in_cluster(), &left, self.conn.as_ref()) {
            error!("perhaps a network partition has occurred; stopping");
            self.sys.fault = Some(Fault::PartitionSuspected);
        }
    }

    fn stage2_join(&mut self, joined: NodeId, members: &[NodeId]) {
        let first_in_group = members.len() == 1 && joined == self.sys.this_id;
        if first_in_group {
            self.sys.join_finished = true;
        }

        if self.sys.membership.pre_count() == 0 {
            for m in members {
                self.sys.membership.add_pre(*m);
            }
        } else {
            self.sys.membership.add_pre(joined);
        }

        if first_in_group {
            // Alone in the group: nobody can arbitrate, so derive the join
            // outcome from our own epoch log.
            let latest = self.epochs.latest();
            let mut body = JoinBody {
                nr_copies: self.sys.nr_copies,
                cluster_status: ClusterStatus::WaitForFormat,
                epoch: 0,
                ctime: 0,
                result: ResultCode::Success,
                inc_epoch: false,
                nodes: Vec::new(),
                leave_nodes: Vec::new(),
            };
            if latest > 0 {
                self.sys.epoch = latest;
                let entries = self.epochs.read(latest).unwrap_or_default();
                body.epoch = latest;
                body.ctime = self.epochs.ctime();
                let arb = status::arbitrate(
                    &self.sys,
                    self.epochs.as_ref(),
                    &self.sys.this_entry,
                    &entries,
                    body.ctime,
                    latest,
                );
                body.cluster_status = arb.status;
            }
            let hdr = MessageHeader {
                proto_ver: PROTO_VER,
                state: MessageState::Fin,
                from: self.sys.this_entry,
                sender: self.sys.this_id,
            };
            self.update_cluster_info(&hdr, &body);
            if self.sys.status == ClusterStatus::Ok {
                self.store.start_recovery(self.sys.epoch);
            }
            return;
        }

        if joined == self.sys.this_id {
            self.send_join_request();
        }
    }

    fn stage2_leave(&mut self, left: &NodeId) {
        let was = self.sys.membership.remove(left);
        debug!(?left, ?was, "driver leave settled");
        if was != WasMember::InCluster {
            return;
        }
        self.sys.vnodes.clear();
        if self.sys.status.serves_epochs() {
            // Snapshot for epoch+1 goes to disk before the counter moves.
            let entries = self.sys.membership.ordered_entries();
            if let Err(err) = self.epochs.write(self.sys.epoch + 1, &entries) {
                error!(%err, epoch = self.sys.epoch + 1, "epoch write failed");
            }
            self.sys.epoch += 1;
            self.store.update_epoch(self.sys.epoch);
            self.store.start_recovery(self.sys.epoch);
        }
    }

    fn send_join_request(&mut self) {
        let latest = self.epochs.latest();
        let mut body = JoinBody {
            nr_copies: self.sys.nr_copies,
            cluster_status: self.sys.status,
            epoch: 0,
            ctime: 0,
            result: ResultCode::Success,
            inc_epoch: false,
            nodes: Vec::new(),
            leave_nodes: Vec::new(),
        };
        if latest > 0 {
            body.epoch = latest;
            body.ctime = self.epochs.ctime();
            body.nodes = self
                .epochs
                .read(latest)
                .unwrap_or_default()
                .into_iter()
                .map(|entry| Node {
                    id: NodeId::UNSET,
                    entry,
                })
                .collect();
        }
        info!(node = %self.sys.this_id, epoch = latest, "requesting to join");
        let msg = GroupMessage::new(
            self.sys.this_entry,
            self.sys.this_id,
            MessageState::Init,
            MessageBody::Join(body),
        );
        if let Err(err) = self.broadcast(&msg) {
            error!(%err, "join broadcast failed");
            self.sys.fault = Some(Fault::DriverFailed);
        }
    }

    // -- notify stages -----------------------------------------------------

    fn stage1_notify(&mut self, msg: &mut GroupMessage, skip: &mut bool) {
        let hdr = msg.header;

        // Until our own join settles, the only foreign traffic that matters
        // is a master transfer; everything else is replayed to us in the
        // join response.
        if !self.sys.join_finished
            && !matches!(msg.body, MessageBody::MasterTransfer)
            && hdr.sender != self.sys.this_id
        {
            *skip = true;
            return;
        }

        if let MessageBody::Join(body) = &msg.body {
            if !self.sys.membership.set_pre_entry(&hdr.sender, hdr.from)
                && self.sys.membership.find_in_cluster(&hdr.sender).is_none()
            {
                // The sender is not in the group anymore (or never made it
                // in); its dialog is dead traffic.
                debug!(sender = ?hdr.sender, "node left before its join settled");
                *skip = true;
                return;
            }
            // Entering a running cluster: merge the in-use bitmap of peers
            // that were serving while we were not.
            if hdr.state == MessageState::Fin
                && body.cluster_status == ClusterStatus::Ok
                && self.sys.status != ClusterStatus::Ok
            {
                let nodes = body.nodes.clone();
                self.merge_peer_bitmaps(&hdr.from, &nodes);
            }
        }

        if hdr.state == MessageState::Init && self.sys.is_master() {
            match &mut msg.body {
                MessageBody::Join(body) => self.arbitrate_join(&hdr, body),
                MessageBody::VdiOp(body) => self.execute_vdi_op(body),
                _ => warn!(op = msg.body.opcode(), "unexpected INIT message"),
            }
        }
    }

    fn stage2_notify(&mut self, mut msg: GroupMessage) {
        let hdr = msg.header;

        if hdr.state == MessageState::Fin {
            if let MessageBody::VdiOp(body) = &msg.body {
                self.vdi_op_done(&hdr, body);
            }
        }

        // An INIT dialog must see its FIN before other membership traffic;
        // if the FIN already queued up, pull it forward, else suspend.
        if self.sys.join_finished && hdr.state == MessageState::Init {
            if !self.sys.queue.promote_fin() {
                self.sys.queue.suspended = true;
                if msg.is_join() {
                    self.sys.queue.joining = true;
                }
            }
        }

        let mut do_recovery = false;
        if hdr.state == MessageState::Fin {
            match &msg.body {
                MessageBody::Join(body) => {
                    let body = body.clone();
                    self.update_cluster_info(&hdr, &body);
                    do_recovery = true;
                }
                MessageBody::Leave(_) => {
                    if self.sys.membership.find_in_cluster(&hdr.sender).is_some() {
                        self.sys.membership.remove(&hdr.sender);
                        self.sys.vnodes.clear();
                        if self.sys.status == ClusterStatus::Ok {
                            // Snapshot first, then advance the counter; the
                            // on-disk order peers rely on.
                            let entries = self.sys.membership.ordered_entries();
                            if let Err(err) = self.epochs.write(self.sys.epoch + 1, &entries) {
                                error!(%err, epoch = self.sys.epoch + 1, "epoch write failed");
                            }
                            self.sys.epoch += 1;
                            self.store.update_epoch(self.sys.epoch);
                        }
                    }
                    self.reconcile_waiting_join(&hdr);
                    do_recovery = true;
                }
                MessageBody::MasterTransfer => self.reconcile_waiting_join(&hdr),
                MessageBody::VdiOp(_) => {}
                MessageBody::MasterChanged => debug!("ignoring reserved MASTER_CHANGED"),
            }
        }

        if self.sys.fault.is_none() && hdr.state == MessageState::Init && self.sys.is_master() {
            if msg.is_join() {
                self.send_join_response(msg);
            } else if matches!(&msg.body, MessageBody::VdiOp(_)) {
                msg.header.state = MessageState::Fin;
                if let Err(err) = self.broadcast(&msg) {
                    error!(%err, "vdi op rebroadcast failed");
                }
            }
        }

        if do_recovery && self.sys.status.serves_epochs() {
            self.sys.membership.clear_leave_list();
            self.store.start_recovery(self.sys.epoch);
        }
    }

    // -- join protocol -----------------------------------------------------

    /// Master-side arbitration of an INIT join: stamps the response into
    /// the message in place.
    fn arbitrate_join(&mut self, hdr: &MessageHeader, body: &mut JoinBody) {
        if hdr.proto_ver != PROTO_VER {
            error!(
                proto_ver = hdr.proto_ver,
                "joining node sent a wrong protocol version"
            );
            body.result = ResultCode::VerMismatch;
            return;
        }
        let entries: Vec<NodeEntry> = body.nodes.iter().map(|n| n.entry).collect();
        let arb = status::arbitrate(
            &self.sys,
            self.epochs.as_ref(),
            &hdr.from,
            &entries,
            body.ctime,
            body.epoch,
        );
        body.result = arb.result;
        body.cluster_status = arb.status;
        body.inc_epoch = arb.inc_epoch;
        body.nr_copies = self.sys.nr_copies;
        body.ctime = self.epochs.ctime();
        body.nodes = self.sys.membership.in_cluster().to_vec();
    }

    /// Master-side FIN rebroadcast of an arbitrated join.
    fn send_join_response(&mut self, mut msg: GroupMessage) {
        let MessageBody::Join(body) = &mut msg.body else {
            return;
        };
        debug!(result = ?body.result, status = ?body.cluster_status, "answering join");
        if body.result.is_success() && body.cluster_status == ClusterStatus::WaitForJoin {
            body.leave_nodes = self.sys.membership.leave_list().to_vec();
        }
        body.epoch = self.sys.epoch;
        msg.header.state = MessageState::Fin;
        if let Err(err) = self.broadcast(&msg) {
            error!(%err, "join response broadcast failed");
        }
    }

    /// Applies a FIN join on every node, the joiner included.
    fn update_cluster_info(&mut self, hdr: &MessageHeader, body: &JoinBody) {
        debug!(
            status = ?body.cluster_status,
            epoch = body.epoch,
            result = ?body.result,
            join_finished = self.sys.join_finished,
            "updating cluster info"
        );

        if !body.result.is_success() {
            if hdr.from == self.sys.this_entry {
                error!(result = ?body.result, "cluster refused our join");
                if body.cluster_status == ClusterStatus::WaitForJoin
                    && epoch_after(self.epochs.latest(), body.epoch)
                {
                    // Our persisted view is newer than the arbiter's: signal
                    // the hand-off and stop; the operator restarts us once a
                    // better master is up.
                    let mt = GroupMessage::new(
                        self.sys.this_entry,
                        self.sys.this_id,
                        MessageState::Fin,
                        MessageBody::MasterTransfer,
                    );
                    if let Err(err) = self.broadcast(&mt) {
                        error!(%err, "master transfer broadcast failed");
                    }
                    self.sys.fault = Some(Fault::MasterTransferred);
                } else {
                    if let Err(err) = self.leave_cluster() {
                        error!(%err, "leave broadcast failed");
                    }
                    self.sys.fault = Some(Fault::JoinFailed(body.result));
                }
            }
            return;
        }

        if self.sys.status == ClusterStatus::JoinFailed {
            return;
        }

        if self.sys.nr_copies == 0 {
            self.sys.nr_copies = body.nr_copies;
        }

        if !self.sys.join_finished {
            // Adopt the master's view wholesale.
            self.sys.epoch = body.epoch;
            for n in &body.nodes {
                if !self.sys.membership.promote(n.id, n.entry) {
                    info!(node = ?n.id, "listed member is gone");
                }
            }
            if body.cluster_status == ClusterStatus::WaitForJoin {
                let snapshot = self.epochs.read(self.epochs.latest()).unwrap_or_default();
                for n in &body.leave_nodes {
                    self.sys.membership.leave_list_add_if_eligible(*n, &snapshot);
                }
            }
            self.sys.join_finished = true;
            if body.cluster_status.serves_epochs() && body.inc_epoch {
                // Persist our copy of the pre-admission snapshot.
                let entries = self.sys.membership.ordered_entries();
                if let Err(err) = self.epochs.write(self.sys.epoch, &entries) {
                    error!(%err, epoch = self.sys.epoch, "epoch write failed");
                }
            }
        }

        if !self.sys.membership.promote(hdr.sender, hdr.from) {
            warn!(node = ?hdr.sender, "joiner vanished before admission");
        }
        self.sys.vnodes.clear();

        if body.cluster_status.serves_epochs() {
            // Guarded on the stamped epoch so a redelivered FIN is a no-op.
            if body.inc_epoch && self.sys.epoch == body.epoch {
                self.sys.epoch += 1;
                let entries = self.sys.membership.ordered_entries();
                if let Err(err) = self.epochs.write(self.sys.epoch, &entries) {
                    error!(%err, epoch = self.sys.epoch, "epoch write failed");
                }
                self.store.update_epoch(self.sys.epoch);
            }
            if !self.sys.status.serves_epochs() {
                // First transition into a running cluster: adopt its ctime.
                if let Err(err) = self.epochs.set_ctime(body.ctime) {
                    error!(%err, "ctime write failed");
                }
            }
        }

        self.sys.status = body.cluster_status;
    }

    /// Leave and master-transfer handling while the cluster re-forms: the
    /// sender joins the leave list, an unfinished join settles, and the
    /// quorum condition is re-evaluated against the recorded snapshot.
    fn reconcile_waiting_join(&mut self, hdr: &MessageHeader) {
        if self.sys.status != ClusterStatus::WaitForJoin {
            return;
        }
        let latest = self.epochs.latest();
        let snapshot = self.epochs.read(latest).unwrap_or_default();
        self.sys.membership.leave_list_add_if_eligible(
            Node {
                id: hdr.sender,
                entry: hdr.from,
            },
            &snapshot,
        );

        // This is also how a node waiting on its own join learns the dialog
        // is over (its would-be master is gone).
        if !self.sys.join_finished {
            self.sys.join_finished = true;
            self.sys.membership.add_pre(self.sys.this_id);
            self.sys.membership.promote(self.sys.this_id, self.sys.this_entry);
            self.sys.vnodes.clear();
            self.sys.epoch = latest;
        }

        let nr_local = self.epochs.read(self.sys.epoch).map_or(0, |e| e.len());
        let nr = self.sys.membership.in_cluster().len();
        let nr_leave = self.sys.membership.leave_count();
        debug!(nr_local, nr, nr_leave, "re-evaluating join quorum");
        if nr_local == nr + nr_leave {
            self.sys.status = ClusterStatus::Ok;
            let entries = self.sys.membership.ordered_entries();
            if let Err(err) = self.epochs.write(self.sys.epoch, &entries) {
                error!(%err, epoch = self.sys.epoch, "epoch write failed");
            }
            self.store.update_epoch(self.sys.epoch);
        }
    }

    // -- vdi op execution --------------------------------------------------

    /// Master-side stage-1 execution of a VDI operation; the response is
    /// stamped into the message in place.
    fn execute_vdi_op(&mut self, body: &mut VdiOpBody) {
        let req = body.req;
        let create = req.flags & flags::CMD_CREAT != 0;
        let excl = req.flags & flags::CMD_EXCL != 0;
        let outcome = match req.opcode {
            op::NEW_VDI => self.vdi.new_vdi(
                &body.data,
                req.params.vdi_size,
                req.params.base_vdi_id,
                req.params.snapid,
            ),
            op::DEL_VDI => self.vdi.del_vdi(&body.data, req.params.snapid),
            op::LOCK_VDI | op::GET_VDI_INFO => {
                if req.proto_ver == PROTO_VER {
                    self.vdi.lookup_vdi(&body.data, req.params.snapid)
                } else {
                    VdiOpResult::fail(ResultCode::VerMismatch)
                }
            }
            op::GET_VDI_ATTR => {
                // Payload is "<name>\0<attribute>".
                let split = body.data.iter().position(|b| *b == 0);
                match split {
                    Some(at) => {
                        self.vdi
                            .vdi_attr(&body.data[..at], &body.data[at + 1..], create, excl)
                    }
                    None => VdiOpResult::fail(ResultCode::InvalidParms),
                }
            }
            op::RELEASE_VDI | op::MAKE_FS | op::SHUTDOWN => VdiOpResult {
                result: ResultCode::Success,
                vdi_id: 0,
                attr_id: 0,
            },
            other => {
                error!(opcode = other, "vdi opcode is not implemented");
                VdiOpResult::fail(ResultCode::SystemError)
            }
        };
        body.rsp = VdiResponse {
            result: outcome.result,
            vdi_id: outcome.vdi_id,
            attr_id: outcome.attr_id,
            copies: self.sys.nr_copies,
            data_length: 0,
        };
    }

    /// FIN-side commit of a VDI operation: cluster-wide side effects on
    /// every node, then the originator wakes its parked request.
    fn vdi_op_done(&mut self, hdr: &MessageHeader, body: &VdiOpBody) {
        let req = body.req;
        let mut rsp = body.rsp;

        if rsp.result.is_success() {
            match req.opcode {
                op::NEW_VDI => self.sys.vdi_inuse.set(rsp.vdi_id),
                op::MAKE_FS => {
                    self.sys.nr_copies = if req.params.copies == 0 {
                        DEFAULT_COPIES
                    } else {
                        req.params.copies
                    };
                    if let Err(err) = self.epochs.set_ctime(req.params.ctime) {
                        error!(%err, "ctime write failed");
                    }
                    let latest = self.epochs.latest();
                    for epoch in 1..=latest {
                        self.epochs.remove(epoch);
                    }
                    self.sys.vdi_inuse.clear();
                    self.sys.epoch = 1;
                    let entries = self.sys.membership.ordered_entries();
                    info!(nr_nodes = entries.len(), "formatting cluster at epoch 1");
                    if let Err(err) = self.epochs.write(1, &entries) {
                        error!(%err, "epoch write failed");
                    }
                    self.store.update_epoch(1);
                    self.sys.status = ClusterStatus::Ok;
                    rsp.copies = self.sys.nr_copies;
                }
                op::SHUTDOWN => self.sys.status = ClusterStatus::Shutdown,
                op::DEL_VDI
                | op::LOCK_VDI
                | op::RELEASE_VDI
                | op::GET_VDI_INFO
                | op::GET_VDI_ATTR => {}
                other => {
                    warn!(opcode = other, "unknown vdi operation");
                    rsp.result = ResultCode::Unknown;
                }
            }
        }

        if hdr.from != self.sys.this_entry {
            return;
        }
        match self.sys.pending.pop_front() {
            Some(mut pending) => pending.respond(RequestReply {
                result: rsp.result,
                data: ReplyData::Vdi(rsp),
            }),
            None => warn!("vdi FIN without a pending request"),
        }
    }

    // -- helpers -----------------------------------------------------------

    fn merge_peer_bitmaps(&mut self, from: &NodeEntry, nodes: &[Node]) {
        let mut peers: Vec<NodeEntry> = self.sys.membership.ordered_entries();
        peers.push(*from);
        peers.extend(nodes.iter().map(|n| n.entry));
        peers.sort();
        peers.dedup();
        for peer in peers {
            if peer == self.sys.this_entry {
                continue;
            }
            match self.peers.fetch_vdi_bitmap(&peer) {
                Ok(bitmap) => self.sys.vdi_inuse.or_merge(&bitmap),
                Err(err) => warn!(?peer, %err, "vdi bitmap fetch failed"),
            }
        }
    }

    fn ensure_ring(&mut self) {
        if self.sys.vnodes.is_empty() {
            self.sys.vnodes = vnode::build_ring(&self.sys.membership.ordered_entries());
        }
    }

    fn broadcast(&self, msg: &GroupMessage) -> anyhow::Result<()> {
        let bytes = msg.encode()?;
        self.driver.notify(&bytes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
