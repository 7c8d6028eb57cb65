//! Request admission gates.
//!
//! Object I/O is admitted against three gates: the target must not be under
//! recovery, must not already have an outstanding request, and for locally
//! held objects the request's epoch must match ours. Recovery reads are
//! exempt from the first two gates so recovery can make progress under
//! client load.

use tracing::warn;

use shoal_core::request::{flags, op};
use shoal_core::{epoch_after, epoch_before, Epoch, RequestHeader, ResultCode};

/// An admitted object request currently running on a worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutstandingIo {
    pub id: u64,
    pub oid: u64,
    pub recovery_read: bool,
}

/// Compares a request's epoch against the node's, wrap-aware.
#[must_use]
pub fn check_epoch(req_epoch: Epoch, node_epoch: Epoch) -> ResultCode {
    if epoch_before(req_epoch, node_epoch) {
        warn!(req_epoch, node_epoch, "request from an old view");
        ResultCode::OldNodeVer
    } else if epoch_after(req_epoch, node_epoch) {
        warn!(req_epoch, node_epoch, "request from a newer view");
        ResultCode::NewNodeVer
    } else {
        ResultCode::Success
    }
}

/// `true` when the request is a recovery read, exempt from object gating.
/// A recovery flag on anything but a read is a bug in the recovery
/// subsystem; it is logged and still treated as exempt.
#[must_use]
pub fn is_recovery_exempt(header: &RequestHeader) -> bool {
    if !header.has_flag(flags::CMD_RECOVERY) {
        return false;
    }
    if header.opcode != op::READ_OBJ {
        warn!(opcode = header.opcode, "recovery flag on a non-read request");
    }
    true
}

/// `true` when the object already has a non-recovery request outstanding.
#[must_use]
pub fn is_busy(outstanding: &[OutstandingIo], oid: u64) -> bool {
    if oid == 0 {
        return false;
    }
    outstanding
        .iter()
        .any(|io| !io.recovery_read && io.oid == oid)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_check_maps_directions() {
        assert_eq!(check_epoch(5, 5), ResultCode::Success);
        assert_eq!(check_epoch(4, 5), ResultCode::OldNodeVer);
        assert_eq!(check_epoch(6, 5), ResultCode::NewNodeVer);
        // Wrap-aware: u32::MAX is just before 0.
        assert_eq!(check_epoch(u32::MAX, 0), ResultCode::OldNodeVer);
        assert_eq!(check_epoch(0, u32::MAX), ResultCode::NewNodeVer);
    }

    #[test]
    fn recovery_exemption() {
        let mut hdr = RequestHeader::new(op::READ_OBJ, flags::CMD_RECOVERY, 1);
        assert!(is_recovery_exempt(&hdr));
        hdr.flags = 0;
        assert!(!is_recovery_exempt(&hdr));
        // Misflagged write is logged but still exempt.
        let w = RequestHeader::new(op::WRITE_OBJ, flags::CMD_RECOVERY, 1);
        assert!(is_recovery_exempt(&w));
    }

    #[test]
    fn busy_ignores_recovery_reads_and_null_oid() {
        let outstanding = [
            OutstandingIo { id: 1, oid: 10, recovery_read: false },
            OutstandingIo { id: 2, oid: 20, recovery_read: true },
        ];
        assert!(is_busy(&outstanding, 10));
        assert!(!is_busy(&outstanding, 20));
        assert!(!is_busy(&outstanding, 30));
        assert!(!is_busy(&outstanding, 0));
    }
}
