//! Group wire messages.
//!
//! These messages are broadcast through the group-communication driver and
//! delivered to every member in the same total order. They use `MsgPack`
//! serialization (`rmp_serde::to_vec_named()`); the driver frames payloads,
//! so the encoded length is the transport's concern.
//!
//! Every message carries a common header (protocol version, dialog state,
//! sender entry and identity); the operation itself is the `MessageBody`
//! variant. A join is a two-phase dialog: the joiner broadcasts `INIT`, the
//! master stamps the arbitration outcome into the same body and rebroadcasts
//! it as `FIN`.

use serde::{Deserialize, Serialize};

use crate::request::{VdiRequest, VdiResponse};
use crate::result::ResultCode;
use crate::types::{ClusterStatus, Epoch, Node, NodeEntry, NodeId};

// ---------------------------------------------------------------------------
// Wire opcodes
// ---------------------------------------------------------------------------

/// Numeric opcodes of the group protocol.
pub mod opcode {
    pub const JOIN: u8 = 0x01;
    pub const VDI_OP: u8 = 0x02;
    /// Reserved: classified but never originated by this implementation.
    pub const MASTER_CHANGED: u8 = 0x03;
    pub const LEAVE: u8 = 0x04;
    pub const MASTER_TRANSFER: u8 = 0x05;
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Dialog state of a group message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageState {
    Init,
    Cont,
    Fin,
}

impl MessageState {
    /// Wire value of the state (`INIT=1`, `CONT=2`, `FIN=3`).
    #[must_use]
    pub fn wire(self) -> u8 {
        match self {
            MessageState::Init => 1,
            MessageState::Cont => 2,
            MessageState::Fin => 3,
        }
    }
}

/// Common header carried by every group message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    pub proto_ver: u8,
    pub state: MessageState,
    /// Storage entry of the sending node.
    pub from: NodeEntry,
    /// Driver identity of the sending node.
    pub sender: NodeId,
}

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

/// Join dialog body.
///
/// On `INIT` the fields describe the joiner's locally persisted view; the
/// master overwrites `nodes`, `leave_nodes`, `result`, `cluster_status`,
/// `inc_epoch` and `epoch` in place before rebroadcasting as `FIN`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinBody {
    pub nr_copies: u32,
    pub cluster_status: ClusterStatus,
    pub epoch: Epoch,
    pub ctime: u64,
    pub result: ResultCode,
    pub inc_epoch: bool,
    pub nodes: Vec<Node>,
    pub leave_nodes: Vec<Node>,
}

/// Graceful leave announcement; always `FIN`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveBody {
    /// Latest epoch persisted at the leaver; carried on the wire for
    /// diagnostics, receivers judge eligibility against their own log.
    pub epoch: Epoch,
}

/// A VDI metadata operation routed through the group for total ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VdiOpBody {
    pub req: VdiRequest,
    pub rsp: VdiResponse,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Operation payload of a group message, tagged by operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageBody {
    Join(JoinBody),
    VdiOp(Box<VdiOpBody>),
    MasterChanged,
    Leave(LeaveBody),
    MasterTransfer,
}

impl MessageBody {
    /// Numeric wire opcode of this body.
    #[must_use]
    pub fn opcode(&self) -> u8 {
        match self {
            MessageBody::Join(_) => opcode::JOIN,
            MessageBody::VdiOp(_) => opcode::VDI_OP,
            MessageBody::MasterChanged => opcode::MASTER_CHANGED,
            MessageBody::Leave(_) => opcode::LEAVE,
            MessageBody::MasterTransfer => opcode::MASTER_TRANSFER,
        }
    }
}

// ---------------------------------------------------------------------------
// GroupMessage
// ---------------------------------------------------------------------------

/// Errors from decoding an inbound group payload.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed group message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("failed to encode group message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

/// A complete group message: header plus operation body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMessage {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl GroupMessage {
    /// Builds a message from this node with the given state and body.
    #[must_use]
    pub fn new(from: NodeEntry, sender: NodeId, state: MessageState, body: MessageBody) -> Self {
        Self {
            header: MessageHeader {
                proto_ver: crate::types::PROTO_VER,
                state,
                from,
                sender,
            },
            body,
        }
    }

    /// Serializes to the named-`MsgPack` wire form.
    ///
    /// # Errors
    ///
    /// Returns `WireError::Encode` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Parses an inbound payload delivered by the driver.
    ///
    /// # Errors
    ///
    /// Returns `WireError::Decode` on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        match rmp_serde::from_slice(bytes) {
            Ok(msg) => Ok(msg),
            Err(err) => {
                tracing::debug!(len = bytes.len(), %err, "group message decode failed");
                Err(err.into())
            }
        }
    }

    /// Numeric wire opcode, for logging.
    #[must_use]
    pub fn opcode(&self) -> u8 {
        self.body.opcode()
    }

    #[must_use]
    pub fn is_fin(&self) -> bool {
        self.header.state == MessageState::Fin
    }

    #[must_use]
    pub fn is_join(&self) -> bool {
        matches!(self.body, MessageBody::Join(_))
    }

    #[must_use]
    pub fn is_membership_msg(&self) -> bool {
        matches!(
            self.body,
            MessageBody::Join(_) | MessageBody::Leave(_) | MessageBody::MasterTransfer
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn node(last: u8, pid: u64) -> Node {
        let mut addr = [0u8; 16];
        addr[15] = last;
        Node {
            id: NodeId { addr, pid },
            entry: NodeEntry::new(addr, 7000, None),
        }
    }

    fn round_trip(msg: &GroupMessage) {
        let bytes = msg.encode().expect("serialize failed");
        let decoded = GroupMessage::decode(&bytes).expect("deserialize failed");
        assert_eq!(msg, &decoded);
    }

    #[test]
    fn serde_join_init() {
        let n = node(1, 10);
        round_trip(&GroupMessage::new(
            n.entry,
            n.id,
            MessageState::Init,
            MessageBody::Join(JoinBody {
                nr_copies: 3,
                cluster_status: ClusterStatus::WaitForFormat,
                epoch: 0,
                ctime: 0,
                result: ResultCode::Success,
                inc_epoch: false,
                nodes: vec![],
                leave_nodes: vec![],
            }),
        ));
    }

    #[test]
    fn serde_join_fin_with_views() {
        let n = node(1, 10);
        round_trip(&GroupMessage::new(
            n.entry,
            n.id,
            MessageState::Fin,
            MessageBody::Join(JoinBody {
                nr_copies: 3,
                cluster_status: ClusterStatus::WaitForJoin,
                epoch: 7,
                ctime: 1_700_000_000,
                result: ResultCode::Success,
                inc_epoch: true,
                nodes: vec![node(1, 10), node(2, 11)],
                leave_nodes: vec![node(3, 12)],
            }),
        ));
    }

    #[test]
    fn serde_leave_and_master_transfer() {
        let n = node(2, 20);
        round_trip(&GroupMessage::new(
            n.entry,
            n.id,
            MessageState::Fin,
            MessageBody::Leave(LeaveBody { epoch: 9 }),
        ));
        round_trip(&GroupMessage::new(
            n.entry,
            n.id,
            MessageState::Fin,
            MessageBody::MasterTransfer,
        ));
    }

    #[test]
    fn opcodes_match_contract() {
        let n = node(1, 1);
        let join = GroupMessage::new(
            n.entry,
            n.id,
            MessageState::Init,
            MessageBody::Join(JoinBody {
                nr_copies: 0,
                cluster_status: ClusterStatus::WaitForFormat,
                epoch: 0,
                ctime: 0,
                result: ResultCode::Success,
                inc_epoch: false,
                nodes: vec![],
                leave_nodes: vec![],
            }),
        );
        assert_eq!(join.opcode(), 0x01);
        assert_eq!(MessageBody::MasterChanged.opcode(), 0x03);
        assert_eq!(MessageBody::Leave(LeaveBody { epoch: 0 }).opcode(), 0x04);
        assert_eq!(MessageBody::MasterTransfer.opcode(), 0x05);
        assert_eq!(MessageState::Init.wire(), 1);
        assert_eq!(MessageState::Fin.wire(), 3);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(GroupMessage::decode(&[0xc1, 0xff, 0x00]).is_err());
    }
}
