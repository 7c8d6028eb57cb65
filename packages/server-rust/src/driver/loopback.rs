//! In-process group driver with totally ordered delivery.
//!
//! All ports share one delivery queue, so every member observes joins,
//! leaves, and notifies in the same order. The host drains the queue with
//! [`LoopbackHub::next_delivery`] and feeds each delivery to the engines of
//! its target members; engines broadcasting from inside a handler simply
//! append to the queue, which the same drain loop picks up.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use shoal_core::NodeId;

use super::GroupDriver;

/// One pending delivery, with the member set it targets.
#[derive(Debug, Clone)]
pub enum Delivery {
    Join {
        joined: NodeId,
        members: Vec<NodeId>,
        targets: Vec<NodeId>,
    },
    Leave {
        left: NodeId,
        members: Vec<NodeId>,
        targets: Vec<NodeId>,
    },
    Notify {
        sender: NodeId,
        payload: Vec<u8>,
        targets: Vec<NodeId>,
    },
}

#[derive(Default)]
struct HubState {
    members: Vec<NodeId>,
    pending: VecDeque<Delivery>,
}

/// Shared in-process broadcast hub.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the driver port for one member process.
    #[must_use]
    pub fn port(&self, id: NodeId) -> LoopbackPort {
        LoopbackPort {
            id,
            state: Arc::clone(&self.state),
        }
    }

    /// Pops the next delivery in total order, if any.
    #[must_use]
    pub fn next_delivery(&self) -> Option<Delivery> {
        self.state.lock().pending.pop_front()
    }

    /// Removes a member without a voluntary leave, as the driver would on a
    /// crashed process. Remaining members observe an `on_leave`.
    pub fn evict(&self, id: NodeId) {
        let mut st = self.state.lock();
        st.members.retain(|m| *m != id);
        let members = st.members.clone();
        st.pending.push_back(Delivery::Leave {
            left: id,
            members: members.clone(),
            targets: members,
        });
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }
}

/// Per-member handle implementing the outbound driver contract.
pub struct LoopbackPort {
    id: NodeId,
    state: Arc<Mutex<HubState>>,
}

impl GroupDriver for LoopbackPort {
    fn join(&self) -> anyhow::Result<()> {
        let mut st = self.state.lock();
        if !st.members.contains(&self.id) {
            st.members.push(self.id);
        }
        let members = st.members.clone();
        st.pending.push_back(Delivery::Join {
            joined: self.id,
            members: members.clone(),
            targets: members,
        });
        Ok(())
    }

    fn leave(&self) -> anyhow::Result<()> {
        let mut st = self.state.lock();
        st.members.retain(|m| *m != self.id);
        let members = st.members.clone();
        st.pending.push_back(Delivery::Leave {
            left: self.id,
            members: members.clone(),
            targets: members,
        });
        Ok(())
    }

    fn notify(&self, payload: &[u8]) -> anyhow::Result<()> {
        let mut st = self.state.lock();
        let targets = st.members.clone();
        st.pending.push_back(Delivery::Notify {
            sender: self.id,
            payload: payload.to_vec(),
            targets,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn id(last: u8) -> NodeId {
        let mut addr = [0u8; 16];
        addr[15] = last;
        NodeId { addr, pid: u64::from(last) }
    }

    #[test]
    fn join_targets_include_joiner() {
        let hub = LoopbackHub::new();
        hub.port(id(1)).join().unwrap();
        match hub.next_delivery().unwrap() {
            Delivery::Join { joined, members, targets } => {
                assert_eq!(joined, id(1));
                assert_eq!(members, vec![id(1)]);
                assert_eq!(targets, vec![id(1)]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn notify_is_totally_ordered_across_senders() {
        let hub = LoopbackHub::new();
        let p1 = hub.port(id(1));
        let p2 = hub.port(id(2));
        p1.join().unwrap();
        p2.join().unwrap();
        let _ = hub.next_delivery();
        let _ = hub.next_delivery();

        p1.notify(b"a").unwrap();
        p2.notify(b"b").unwrap();
        p1.notify(b"c").unwrap();

        let order: Vec<Vec<u8>> = std::iter::from_fn(|| hub.next_delivery())
            .map(|d| match d {
                Delivery::Notify { payload, targets, .. } => {
                    assert_eq!(targets.len(), 2);
                    payload
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(order, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn evict_notifies_remaining_members_only() {
        let hub = LoopbackHub::new();
        hub.port(id(1)).join().unwrap();
        hub.port(id(2)).join().unwrap();
        hub.port(id(3)).join().unwrap();
        while hub.next_delivery().is_some() {}

        hub.evict(id(3));
        match hub.next_delivery().unwrap() {
            Delivery::Leave { left, members, targets } => {
                assert_eq!(left, id(3));
                assert_eq!(members, vec![id(1), id(2)]);
                assert_eq!(targets, vec![id(1), id(2)]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(hub.member_count(), 2);
    }
}
