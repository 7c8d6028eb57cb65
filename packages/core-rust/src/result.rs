//! Result codes shared by the group protocol and the client request layer.

use serde::{Deserialize, Serialize};

/// Typed outcome carried in message responses and client replies.
///
/// Epoch and view disagreements are demoted to codes here rather than
/// surfaced as errors; clients re-issue against the new view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultCode {
    Success,
    /// The cluster has no epoch log yet and the request needs one.
    NotFormatted,
    /// The joiner's cluster creation time disagrees with ours.
    InvalidCtime,
    /// The requester's view is older than the local one.
    OldNodeVer,
    /// The requester's view is newer than the local one.
    NewNodeVer,
    /// The membership recorded for an epoch disagrees with ours.
    InvalidEpoch,
    /// Group protocol version mismatch.
    VerMismatch,
    NoMem,
    /// No epoch snapshot exists for the requested epoch.
    NoTag,
    InvalidParms,
    Eio,
    Shutdown,
    WaitForFormat,
    WaitForJoin,
    JoinFailed,
    Halt,
    Unknown,
    SystemError,
}

impl ResultCode {
    #[must_use]
    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}
