//! Group-communication driver boundary.
//!
//! The driver provides cluster-wide agreement on membership and a totally
//! ordered broadcast. The engine only depends on the outbound half
//! ([`GroupDriver`]); inbound delivery is the host's event loop calling the
//! engine's `handle_join` / `handle_leave` / `handle_notify` in the order
//! the driver reports. A production deployment plugs a real driver (e.g. a
//! corosync or raft adapter) behind this trait; [`LoopbackHub`] is the
//! in-process driver used by the integration tests and the demo binary.
//!
//! Contract the engine relies on:
//! - `on_join(joined, members)` / `on_leave(left, members)` reflect
//!   cluster-wide agreement, delivered to every current member;
//! - notify payloads are delivered to every member (sender included) in one
//!   total order;
//! - the delivery loop (`dispatch` in driver terms) never runs re-entrantly
//!   with itself.

pub mod loopback;

pub use loopback::{Delivery, LoopbackHub, LoopbackPort};

/// Outbound half of the group driver.
pub trait GroupDriver: Send {
    /// Announces this process to the group; the agreement comes back as an
    /// `on_join` delivery.
    ///
    /// # Errors
    ///
    /// Returns an error when the driver cannot reach its group.
    fn join(&self) -> anyhow::Result<()>;

    /// Leaves the group; remaining members observe an `on_leave`.
    ///
    /// # Errors
    ///
    /// Returns an error when the driver cannot reach its group.
    fn leave(&self) -> anyhow::Result<()>;

    /// Broadcasts a payload with total-order delivery to all members,
    /// including this one.
    ///
    /// # Errors
    ///
    /// Returns an error when the broadcast cannot be submitted.
    fn notify(&self, payload: &[u8]) -> anyhow::Result<()>;
}
