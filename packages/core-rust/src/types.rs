//! Node identity, membership entries, and cluster status.
//!
//! A `NodeId` is the opaque identity assigned by the group-communication
//! driver; a `NodeEntry` is the storage-facing description of the same
//! process (address, service port, failure zone, replication weight). The
//! two are paired in `Node`. `NodeEntry` ordering defines the canonical
//! member order: epoch snapshots are sorted by it and the first member in
//! that order is the cluster master.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Group protocol version, checked on every inbound join.
pub const PROTO_VER: u8 = 0x02;

/// Default replication weight contributed to the vnode ring per node.
pub const DEFAULT_VNODES: u16 = 64;

/// Default object redundancy when a format request does not specify one.
pub const DEFAULT_COPIES: u32 = 3;

/// Cluster generation counter. Epoch 0 means "never formatted".
pub type Epoch = u32;

// ---------------------------------------------------------------------------
// Epoch comparison
// ---------------------------------------------------------------------------

/// Returns `true` if epoch `a` precedes `b`, treating the u32 space as a
/// circle (wraparound at 2^32 is intended semantics).
#[must_use]
pub fn epoch_before(a: Epoch, b: Epoch) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Returns `true` if epoch `a` follows `b`, wrap-aware.
#[must_use]
pub fn epoch_after(a: Epoch, b: Epoch) -> bool {
    epoch_before(b, a)
}

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// Opaque identity handed out by the group driver: the process address and
/// pid. Totally ordered by address bytes, then pid.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeId {
    pub addr: [u8; 16],
    pub pid: u64,
}

impl NodeId {
    /// Placeholder identity used where the wire form predates knowing the
    /// real driver id (a joiner's view of the epoch log names entries only).
    pub const UNSET: NodeId = NodeId {
        addr: [0; 16],
        pid: 0,
    };
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr
            .cmp(&other.addr)
            .then_with(|| self.pid.cmp(&other.pid))
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", fmt_addr(&self.addr), self.pid)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// NodeEntry
// ---------------------------------------------------------------------------

/// Storage-facing description of a member.
///
/// Ordering is `(addr, port, zone)`; this order is the canonical member
/// order used for epoch snapshots and master identification.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEntry {
    pub addr: [u8; 16],
    pub port: u16,
    pub zone: u32,
    pub nr_vnodes: u16,
}

impl NodeEntry {
    /// Builds an entry, deriving the failure zone from the low 4 bytes of
    /// the address when no explicit zone is given.
    #[must_use]
    pub fn new(addr: [u8; 16], port: u16, zone: Option<u32>) -> Self {
        Self {
            addr,
            port,
            zone: zone.unwrap_or_else(|| zone_from_addr(&addr)),
            nr_vnodes: DEFAULT_VNODES,
        }
    }
}

impl Ord for NodeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr
            .cmp(&other.addr)
            .then_with(|| self.port.cmp(&other.port))
            .then_with(|| self.zone.cmp(&other.zone))
    }
}

impl PartialOrd for NodeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for NodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} z{}", fmt_addr(&self.addr), self.port, self.zone)
    }
}

/// Default zone: the low 4 bytes of the address, little-endian.
#[must_use]
pub fn zone_from_addr(addr: &[u8; 16]) -> u32 {
    u32::from(addr[12])
        | u32::from(addr[13]) << 8
        | u32::from(addr[14]) << 16
        | u32::from(addr[15]) << 24
}

fn fmt_addr(addr: &[u8; 16]) -> String {
    // v4-mapped addresses print in dotted-quad form, everything else hex.
    if addr[..12] == [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff] {
        format!("{}.{}.{}.{}", addr[12], addr[13], addr[14], addr[15])
    } else {
        addr.iter().map(|b| format!("{b:02x}")).collect()
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A driver identity paired with its storage entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub entry: NodeEntry,
}

// ---------------------------------------------------------------------------
// ClusterStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of the logical cluster as seen from one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClusterStatus {
    /// No epoch log exists anywhere yet; waiting for a format request.
    WaitForFormat,
    /// An epoch log exists but not all of its members are back; joins are
    /// arbitrated against the last persisted snapshot.
    WaitForJoin,
    Ok,
    /// Too few zones to place all replicas; reads/writes are refused but
    /// membership continues to be tracked.
    Halt,
    JoinFailed,
    Shutdown,
}

impl ClusterStatus {
    /// `true` for the two states in which the cluster serves epochs
    /// (membership changes advance the epoch and persist snapshots).
    #[must_use]
    pub fn serves_epochs(self) -> bool {
        matches!(self, ClusterStatus::Ok | ClusterStatus::Halt)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
