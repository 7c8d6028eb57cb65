//! Client request header contract.
//!
//! Every client request starts with the same fixed little-endian header:
//! `opcode: u8`, `flags: u16`, `epoch: u32`, `data_length: u32`, followed by
//! op-specific fields in a 32-byte area. The header is exactly
//! [`HEADER_SIZE`] bytes; `data_length` bytes of payload follow it. The
//! request parser and TCP transport live outside this crate -- this module
//! only pins the byte layout down.

use serde::{Deserialize, Serialize};

use crate::result::ResultCode;
use crate::types::Epoch;

/// Size of the fixed request header in bytes.
pub const HEADER_SIZE: usize = 48;

// ---------------------------------------------------------------------------
// Flags and opcodes
// ---------------------------------------------------------------------------

/// Request flag bits.
pub mod flags {
    pub const CMD_WRITE: u16 = 0x01;
    /// Request targets a replica on this node directly (no gateway hop).
    pub const CMD_DIRECT: u16 = 0x02;
    pub const CMD_COW: u16 = 0x04;
    /// Issued by the recovery subsystem; exempt from busy-object gating.
    pub const CMD_RECOVERY: u16 = 0x08;
    pub const CMD_CREAT: u16 = 0x10;
    pub const CMD_EXCL: u16 = 0x20;
}

/// Request opcodes.
pub mod op {
    // Object I/O.
    pub const CREATE_AND_WRITE_OBJ: u8 = 0x01;
    pub const READ_OBJ: u8 = 0x02;
    pub const WRITE_OBJ: u8 = 0x03;
    pub const REMOVE_OBJ: u8 = 0x04;

    // VDI metadata, arbitrated by the master through the group.
    pub const NEW_VDI: u8 = 0x11;
    pub const DEL_VDI: u8 = 0x12;
    pub const LOCK_VDI: u8 = 0x13;
    pub const RELEASE_VDI: u8 = 0x14;
    pub const GET_VDI_INFO: u8 = 0x15;
    pub const GET_VDI_ATTR: u8 = 0x16;

    // Cluster-level.
    pub const GET_NODE_LIST: u8 = 0x82;
    pub const READ_VDIS: u8 = 0x85;
    pub const STAT_CLUSTER: u8 = 0x86;
    pub const MAKE_FS: u8 = 0x87;
    pub const SHUTDOWN: u8 = 0x88;
    pub const GET_EPOCH: u8 = 0x8b;
}

/// `true` for object I/O opcodes.
#[must_use]
pub fn is_io_opcode(opcode: u8) -> bool {
    matches!(
        opcode,
        op::CREATE_AND_WRITE_OBJ | op::READ_OBJ | op::WRITE_OBJ | op::REMOVE_OBJ
    )
}

/// `true` for the ops answered synchronously from local cluster state.
#[must_use]
pub fn is_cluster_read_opcode(opcode: u8) -> bool {
    matches!(opcode, op::GET_NODE_LIST | op::GET_EPOCH | op::STAT_CLUSTER)
}

/// `true` for the metadata ops that must pass through group arbitration.
#[must_use]
pub fn is_vdi_opcode(opcode: u8) -> bool {
    matches!(
        opcode,
        op::NEW_VDI
            | op::DEL_VDI
            | op::LOCK_VDI
            | op::RELEASE_VDI
            | op::GET_VDI_INFO
            | op::GET_VDI_ATTR
            | op::MAKE_FS
            | op::SHUTDOWN
    )
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Op-specific fields of an object I/O request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectParams {
    pub oid: u64,
    pub cow_oid: u64,
    pub tgt_epoch: Epoch,
    pub copies: u32,
}

/// Op-specific fields of a VDI metadata request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VdiParams {
    pub vdi_size: u64,
    pub base_vdi_id: u32,
    pub copies: u32,
    pub snapid: u32,
    /// Cluster creation time; meaningful for `MAKE_FS` only, zero otherwise.
    pub ctime: u64,
}

/// Decoded fixed request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub opcode: u8,
    pub flags: u16,
    pub epoch: Epoch,
    pub data_length: u32,
    pub obj: ObjectParams,
    pub vdi: VdiParams,
}

/// Errors from parsing a request header.
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("request header truncated: got {0} bytes, need {HEADER_SIZE}")]
    Truncated(usize),
}

impl RequestHeader {
    /// Builds a header with zeroed op-specific fields.
    #[must_use]
    pub fn new(opcode: u8, flags: u16, epoch: Epoch) -> Self {
        Self {
            opcode,
            flags,
            epoch,
            data_length: 0,
            obj: ObjectParams::default(),
            vdi: VdiParams::default(),
        }
    }

    #[must_use]
    pub fn has_flag(&self, bit: u16) -> bool {
        self.flags & bit != 0
    }

    /// Parses the fixed header from the leading [`HEADER_SIZE`] bytes.
    ///
    /// Both op-specific areas are decoded; which one is meaningful follows
    /// from the opcode. Unknown opcodes still parse -- admission rejects
    /// them later with a typed result code.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError::Truncated`] if fewer than [`HEADER_SIZE`]
    /// bytes are given.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated(buf.len()));
        }
        let u16le = |o: usize| u16::from_le_bytes([buf[o], buf[o + 1]]);
        let u32le = |o: usize| u32::from_le_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]]);
        let u64le = |o: usize| {
            u64::from_le_bytes([
                buf[o],
                buf[o + 1],
                buf[o + 2],
                buf[o + 3],
                buf[o + 4],
                buf[o + 5],
                buf[o + 6],
                buf[o + 7],
            ])
        };
        Ok(Self {
            opcode: buf[0],
            flags: u16le(2),
            epoch: u32le(4),
            data_length: u32le(8),
            obj: ObjectParams {
                oid: u64le(12),
                cow_oid: u64le(20),
                tgt_epoch: u32le(28),
                copies: u32le(32),
            },
            vdi: VdiParams {
                vdi_size: u64le(12),
                base_vdi_id: u32le(20),
                copies: u32le(24),
                snapid: u32le(28),
                ctime: u64le(32),
            },
        })
    }

    /// Serializes the fixed header. The op-specific area written is chosen
    /// by opcode class; object layout for object I/O and epoch reads, VDI
    /// layout for everything else.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.opcode;
        buf[2..4].copy_from_slice(&self.flags.to_le_bytes());
        buf[4..8].copy_from_slice(&self.epoch.to_le_bytes());
        buf[8..12].copy_from_slice(&self.data_length.to_le_bytes());
        if is_io_opcode(self.opcode) || self.opcode == op::GET_EPOCH {
            buf[12..20].copy_from_slice(&self.obj.oid.to_le_bytes());
            buf[20..28].copy_from_slice(&self.obj.cow_oid.to_le_bytes());
            buf[28..32].copy_from_slice(&self.obj.tgt_epoch.to_le_bytes());
            buf[32..36].copy_from_slice(&self.obj.copies.to_le_bytes());
        } else {
            buf[12..20].copy_from_slice(&self.vdi.vdi_size.to_le_bytes());
            buf[20..24].copy_from_slice(&self.vdi.base_vdi_id.to_le_bytes());
            buf[24..28].copy_from_slice(&self.vdi.copies.to_le_bytes());
            buf[28..32].copy_from_slice(&self.vdi.snapid.to_le_bytes());
            buf[32..40].copy_from_slice(&self.vdi.ctime.to_le_bytes());
        }
        buf
    }
}

// ---------------------------------------------------------------------------
// VDI op message embedding
// ---------------------------------------------------------------------------

/// The request half of a VDI operation as carried in a group message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VdiRequest {
    pub proto_ver: u8,
    pub opcode: u8,
    pub flags: u16,
    pub epoch: Epoch,
    pub data_length: u32,
    pub params: VdiParams,
}

impl VdiRequest {
    /// Lifts a client request header into the group-message form.
    #[must_use]
    pub fn from_header(hdr: &RequestHeader) -> Self {
        Self {
            proto_ver: crate::types::PROTO_VER,
            opcode: hdr.opcode,
            flags: hdr.flags,
            epoch: hdr.epoch,
            data_length: hdr.data_length,
            params: hdr.vdi,
        }
    }
}

/// The response half of a VDI operation, filled in by the executing master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VdiResponse {
    pub result: ResultCode,
    pub vdi_id: u32,
    pub attr_id: u32,
    pub copies: u32,
    pub data_length: u32,
}

impl Default for VdiResponse {
    fn default() -> Self {
        Self {
            result: ResultCode::Success,
            vdi_id: 0,
            attr_id: 0,
            copies: 0,
            data_length: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_header_round_trips() {
        let mut hdr = RequestHeader::new(op::WRITE_OBJ, flags::CMD_WRITE | flags::CMD_DIRECT, 7);
        hdr.data_length = 4096;
        hdr.obj = ObjectParams {
            oid: 0xdead_beef_0042,
            cow_oid: 0,
            tgt_epoch: 0,
            copies: 3,
        };
        let parsed = RequestHeader::from_bytes(&hdr.to_bytes()).unwrap();
        assert_eq!(parsed.opcode, op::WRITE_OBJ);
        assert_eq!(parsed.flags, flags::CMD_WRITE | flags::CMD_DIRECT);
        assert_eq!(parsed.epoch, 7);
        assert_eq!(parsed.data_length, 4096);
        assert_eq!(parsed.obj, hdr.obj);
    }

    #[test]
    fn vdi_header_round_trips() {
        let mut hdr = RequestHeader::new(op::NEW_VDI, flags::CMD_WRITE, 3);
        hdr.data_length = 32;
        hdr.vdi = VdiParams {
            vdi_size: 4 << 30,
            base_vdi_id: 0,
            copies: 3,
            snapid: 0,
            ctime: 0,
        };
        let parsed = RequestHeader::from_bytes(&hdr.to_bytes()).unwrap();
        assert_eq!(parsed.opcode, op::NEW_VDI);
        assert_eq!(parsed.vdi, hdr.vdi);
    }

    #[test]
    fn truncated_header_is_rejected() {
        let err = RequestHeader::from_bytes(&[0u8; 12]).unwrap_err();
        assert!(matches!(err, HeaderError::Truncated(12)));
    }

    #[test]
    fn opcode_classes_are_disjoint() {
        for opc in 0..=u8::MAX {
            let classes = [
                is_io_opcode(opc),
                is_cluster_read_opcode(opc),
                is_vdi_opcode(opc),
            ];
            assert!(classes.iter().filter(|&&c| c).count() <= 1, "opcode {opc:#x}");
        }
    }

    #[test]
    fn flag_test_helper() {
        let hdr = RequestHeader::new(op::READ_OBJ, flags::CMD_RECOVERY, 1);
        assert!(hdr.has_flag(flags::CMD_RECOVERY));
        assert!(!hdr.has_flag(flags::CMD_WRITE));
    }
}
