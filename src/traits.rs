//! Core trait abstractions for the fbas engine.
//!
//! This module defines the capabilities the engine needs from its
//! surroundings:
//!
//! - [`Value`]: the application payload agreed upon per slot
//! - [`Clock`]: monotonic time source driving nomination rounds
//! - [`Scheduler`]: one-shot timers for the deferred ballot-counter update

use std::{
    fmt,
    time::{Duration, Instant},
};

use crate::types::{SlotId, TimerToken};

/// Abstraction over the values nodes vote on.
///
/// Values are compared only through [`Ord`]; two values are the same
/// value when they compare equal. The engine never inspects a value
/// beyond ordering, combining and hashing it.
///
/// # Example
///
/// ```ignore
/// use fbas::Value;
///
/// #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
/// struct Height(u64);
///
/// impl Value for Height {
///     fn combine(&self, other: &Self) -> Self {
///         Self(self.0.max(other.0))
///     }
///
///     fn bytes(&self) -> Vec<u8> {
///         self.0.to_be_bytes().to_vec()
///     }
/// }
/// ```
pub trait Value: Clone + Ord + fmt::Debug + Send + Sync + 'static {
    /// Merges two candidate values into one.
    ///
    /// Must be deterministic. It is used to fold a whole set of confirmed
    /// candidates into a single ballot value, so it should be commutative
    /// and associative for the result to be independent of fold order.
    fn combine(&self, other: &Self) -> Self;

    /// Canonical encoding used as input to the leader-priority hash.
    fn bytes(&self) -> Vec<u8>;
}

/// Monotonic time source.
///
/// Nomination rounds are derived from the time elapsed since a slot was
/// created, so implementations must never go backwards.
pub trait Clock: fmt::Debug + Send + Sync + 'static {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// Schedules the deferred ballot-counter update.
///
/// Arming is fire-and-forget. When the delay elapses the implementation
/// must route `(slot, token)` back into the owning node through
/// [`Node::fire_timer`](crate::Node::fire_timer), inside the same mutual
/// exclusion domain as [`Node::handle`](crate::Node::handle). A firing whose
/// token no longer matches the slot's armed token is ignored by the node,
/// so a late firing after [`Scheduler::cancel`] can never apply.
pub trait Scheduler: fmt::Debug + Send + Sync + 'static {
    /// Arms a one-shot timer for `slot`, replacing any timer already armed
    /// for that slot.
    fn schedule(&self, slot: SlotId, token: TimerToken, delay: Duration);

    /// Cancels the timer armed for `slot` if it still carries `token`.
    fn cancel(&self, slot: SlotId, token: TimerToken);
}
