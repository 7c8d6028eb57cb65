//! Shoal core: the types shared by every node of a shoal cluster.
//!
//! This crate carries no I/O. It defines node identity and ordering, the
//! cluster status and result-code taxonomy, the group wire messages
//! exchanged through the membership driver, and the bit-exact client
//! request header contract. The server crate builds the cluster engine on
//! top of these types.

pub mod messages;
pub mod request;
pub mod result;
pub mod types;

pub use messages::{
    GroupMessage, JoinBody, LeaveBody, MessageBody, MessageHeader, MessageState, VdiOpBody,
    WireError,
};
pub use request::{ObjectParams, RequestHeader, VdiParams, VdiRequest, VdiResponse};
pub use result::ResultCode;
pub use types::{
    epoch_after, epoch_before, ClusterStatus, Epoch, Node, NodeEntry, NodeId, DEFAULT_COPIES,
    DEFAULT_VNODES, PROTO_VER,
};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
