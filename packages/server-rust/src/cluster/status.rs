//! Cluster status machine: join sanity checks and master arbitration.
//!
//! The master answers every join with three facts: a result code, the
//! cluster status the joiner must adopt, and whether the admission advances
//! the epoch. The rules differ by the master's own status; a re-forming
//! cluster (`WaitForJoin`) additionally decides whether this join completes
//! the quorum recorded in the last persisted snapshot.

use tracing::warn;

use shoal_core::{epoch_after, epoch_before, ClusterStatus, Epoch, NodeEntry, ResultCode};

use crate::epoch::EpochStore;

use super::system::System;

/// Outcome of master-side join arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arbitration {
    pub result: ResultCode,
    pub status: ClusterStatus,
    pub inc_epoch: bool,
}

/// Validates a joiner's persisted view against the local one: creation time
/// first, then the epoch counter in both directions, then (for a re-forming
/// cluster) the snapshot contents at that epoch.
///
/// Skipped entirely when the local status is `WaitForFormat` or `Shutdown`,
/// or when the joiner reports no entries (a newly created node has nothing
/// to disagree about).
#[must_use]
pub fn sanity_check(
    sys: &System,
    epochs: &dyn EpochStore,
    entries: &[NodeEntry],
    ctime: u64,
    epoch: Epoch,
) -> ResultCode {
    if matches!(
        sys.status,
        ClusterStatus::WaitForFormat | ClusterStatus::Shutdown
    ) || entries.is_empty()
    {
        return ResultCode::Success;
    }

    if ctime != epochs.ctime() {
        return ResultCode::InvalidCtime;
    }

    let latest = epochs.latest();
    if epoch_before(epoch, latest) {
        // The joiner's view is stale; it must be cleaned up before rejoining.
        return ResultCode::OldNodeVer;
    }
    if epoch_after(epoch, latest) {
        // The joiner is ahead of this cluster; while re-forming, this is the
        // signal that a better master exists.
        return ResultCode::NewNodeVer;
    }

    if sys.status.serves_epochs() {
        return ResultCode::Success;
    }

    match epochs.read(epoch) {
        Some(local) if local == entries => ResultCode::Success,
        _ => ResultCode::InvalidEpoch,
    }
}

/// Master-side arbitration of a join request.
#[must_use]
pub fn arbitrate(
    sys: &System,
    epochs: &dyn EpochStore,
    from: &NodeEntry,
    entries: &[NodeEntry],
    ctime: u64,
    epoch: Epoch,
) -> Arbitration {
    let mut arb = Arbitration {
        result: sanity_check(sys, epochs, entries, ctime, epoch),
        status: sys.status,
        inc_epoch: false,
    };
    if !arb.result.is_success() {
        warn!(?from, result = ?arb.result, "join rejected");
        return arb;
    }

    match sys.status {
        ClusterStatus::Ok | ClusterStatus::Halt => {
            arb.inc_epoch = true;
        }
        ClusterStatus::WaitForFormat => {
            if !entries.is_empty() {
                arb.result = ResultCode::NotFormatted;
            }
        }
        ClusterStatus::WaitForJoin => {
            let nr = sys.membership.in_cluster().len() + 1;
            let local_entries = epochs.read(epoch).unwrap_or_default();
            let nr_local = local_entries.len();

            if nr == nr_local {
                // Every recorded member must be accounted for: the joiner
                // itself or someone already back in the cluster.
                let covered = local_entries
                    .iter()
                    .all(|e| e == from || sys.membership.contains_entry(e));
                if covered {
                    arb.status = ClusterStatus::Ok;
                }
            } else if nr_local == nr + sys.membership.leave_count() {
                // Some recorded members are known to have left for good; the
                // cluster makes do with the degraded set and recovers now.
                arb.inc_epoch = true;
                arb.status = ClusterStatus::Ok;
            }
        }
        ClusterStatus::Shutdown => {
            arb.result = ResultCode::Shutdown;
        }
        ClusterStatus::JoinFailed => {}
    }

    if !arb.result.is_success() {
        warn!(?from, result = ?arb.result, "join rejected");
    }
    arb
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
