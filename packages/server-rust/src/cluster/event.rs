//! The cooperative event queue.
//!
//! All inputs to the engine (driver membership callbacks, totally ordered
//! notifies, and client requests) become events on one FIFO. The pump in
//! the engine dequeues exactly one event at a time; the three state bits
//! here gate what it may do. They are plain booleans on purpose: they are
//! only ever touched from the main context.

use std::collections::VecDeque;

use shoal_core::{GroupMessage, NodeId};

use super::request::ClientRequest;

/// One queued event.
#[derive(Debug)]
pub enum Event {
    /// Driver agreement that `joined` is now a group member.
    Join {
        joined: NodeId,
        members: Vec<NodeId>,
    },
    /// Driver agreement that `left` is gone.
    Leave {
        left: NodeId,
        members: Vec<NodeId>,
    },
    /// A totally ordered group message.
    Notify { msg: GroupMessage, skip: bool },
    /// A client request awaiting admission.
    Request(ClientRequest),
}

impl Event {
    /// Driver membership events; these must never preempt a running event
    /// and must wait for in-flight I/O to drain.
    #[must_use]
    pub fn is_membership_change(&self) -> bool {
        matches!(self, Event::Join { .. } | Event::Leave { .. })
    }
}

/// FIFO of pending events plus the pump gating bits.
#[derive(Debug, Default)]
pub struct EventQueue {
    queue: VecDeque<Event>,
    /// An event's stage-1/stage-2 pair is executing.
    pub running: bool,
    /// A dialog is awaiting its FIN; only selected work may proceed.
    pub suspended: bool,
    /// The suspended dialog is a join; client I/O is held back too.
    pub joining: bool,
}

impl EventQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, ev: Event) {
        self.queue.push_back(ev);
    }

    /// Places an event at the head; used when an awaited FIN must overtake
    /// earlier traffic.
    pub fn push_front(&mut self, ev: Event) {
        self.queue.push_front(ev);
    }

    #[must_use]
    pub fn pop_front(&mut self) -> Option<Event> {
        self.queue.pop_front()
    }

    #[must_use]
    pub fn front(&self) -> Option<&Event> {
        self.queue.front()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&Event> {
        self.queue.get(idx)
    }

    #[must_use]
    pub fn remove(&mut self, idx: usize) -> Option<Event> {
        self.queue.remove(idx)
    }

    /// Moves the first queued FIN notify to the head. Returns `true` when
    /// one was found; this is how a suspended dialog is finalized even when
    /// unrelated notifies were delivered in between.
    pub fn promote_fin(&mut self) -> bool {
        let pos = self.queue.iter().position(|ev| match ev {
            Event::Notify { msg, .. } => msg.is_fin(),
            _ => false,
        });
        match pos {
            Some(pos) => {
                if let Some(ev) = self.queue.remove(pos) {
                    self.queue.push_front(ev);
                }
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
