//! Pending client requests and their typed replies.
//!
//! The TCP transport and request parser live outside this crate; a request
//! arrives here already decoded into its fixed header plus payload, together
//! with a one-shot reply channel the transport is waiting on. The engine
//! answers cluster reads synchronously, parks VDI metadata ops until their
//! group FIN comes back, and hands object I/O to the worker pools.

use tokio::sync::oneshot;
use tracing::warn;

use shoal_core::{Epoch, NodeEntry, RequestHeader, ResultCode, VdiResponse};

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// One record of cluster history returned by a cluster-stat request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochRecord {
    pub epoch: Epoch,
    pub ctime: u64,
    pub nodes: Vec<NodeEntry>,
}

/// Typed payload of a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyData {
    None,
    Bytes(Vec<u8>),
    NodeList {
        entries: Vec<NodeEntry>,
        local_idx: Option<usize>,
        master_idx: Option<usize>,
    },
    EpochNodes(Vec<NodeEntry>),
    ClusterStat(Vec<EpochRecord>),
    Vdi(VdiResponse),
}

/// Reply delivered to the transport's one-shot channel.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestReply {
    pub result: ResultCode,
    pub data: ReplyData,
}

impl RequestReply {
    #[must_use]
    pub fn code(result: ResultCode) -> Self {
        Self {
            result,
            data: ReplyData::None,
        }
    }
}

// ---------------------------------------------------------------------------
// ClientRequest
// ---------------------------------------------------------------------------

/// A client request in flight through the engine.
#[derive(Debug)]
pub struct ClientRequest {
    pub id: u64,
    pub header: RequestHeader,
    pub data: Vec<u8>,
    reply: Option<oneshot::Sender<RequestReply>>,
}

impl ClientRequest {
    /// Pairs a request with the reply channel its transport waits on.
    #[must_use]
    pub fn new(id: u64, header: RequestHeader, data: Vec<u8>) -> (Self, oneshot::Receiver<RequestReply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                id,
                header,
                data,
                reply: Some(tx),
            },
            rx,
        )
    }

    /// Completes the request. Replying twice is a bug and is logged, not
    /// panicked on.
    pub fn respond(&mut self, reply: RequestReply) {
        match self.reply.take() {
            Some(tx) => {
                // A dropped receiver just means the client went away.
                let _ = tx.send(reply);
            }
            None => warn!(id = self.id, "request answered twice"),
        }
    }

    /// Completes the request with a bare result code.
    pub fn respond_code(&mut self, result: ResultCode) {
        self.respond(RequestReply::code(result));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::request::op;

    #[test]
    fn respond_delivers_once() {
        let hdr = RequestHeader::new(op::GET_EPOCH, 0, 1);
        let (mut req, mut rx) = ClientRequest::new(1, hdr, vec![]);

        req.respond_code(ResultCode::NoTag);
        assert_eq!(rx.try_recv().unwrap().result, ResultCode::NoTag);

        // Second respond is swallowed.
        req.respond_code(ResultCode::Success);
    }

    #[test]
    fn respond_tolerates_dropped_client() {
        let hdr = RequestHeader::new(op::GET_EPOCH, 0, 1);
        let (mut req, rx) = ClientRequest::new(2, hdr, vec![]);
        drop(rx);
        req.respond_code(ResultCode::Success);
    }
}
