//! Provider implementations of the clock and scheduler traits.
//!
//! The system clock and the no-op scheduler are what a [`Node`](crate::Node)
//! starts with. The manual variants give tests and the
//! [`Simulation`](crate::Simulation) full control over time.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use tracing::trace;

use crate::{
    traits::{Clock, Scheduler},
    types::{SlotId, TimerToken},
};

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time, so one handle can drive every node in a
/// simulation.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    elapsed_nanos: Arc<AtomicU64>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Creates a clock frozen at the current instant.
    pub fn new() -> Self {
        Self { origin: Instant::now(), elapsed_nanos: Arc::new(AtomicU64::new(0)) }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos.load(Ordering::SeqCst))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }
}

/// Scheduler that never fires.
///
/// Deferred ballot-counter updates are armed but never applied, which is
/// enough for nodes whose peers always make progress on their own.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopScheduler;

impl Scheduler for NoopScheduler {
    fn schedule(&self, slot: SlotId, token: TimerToken, delay: Duration) {
        trace!(slot, token = token.generation(), ?delay, "timer ignored");
    }

    fn cancel(&self, _slot: SlotId, _token: TimerToken) {}
}

/// An armed timer recorded by a [`ManualScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimer {
    /// Slot the timer belongs to.
    pub slot: SlotId,
    /// Token to pass back to [`Node::fire_timer`](crate::Node::fire_timer).
    pub token: TimerToken,
    /// Requested delay.
    pub delay: Duration,
}

/// Scheduler that records armed timers for the caller to fire by hand.
///
/// Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct ManualScheduler {
    armed: Arc<Mutex<BTreeMap<SlotId, ArmedTimer>>>,
}

impl ManualScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the timers currently armed, in slot order.
    pub fn armed(&self) -> Vec<ArmedTimer> {
        self.armed.lock().map(|armed| armed.values().copied().collect()).unwrap_or_default()
    }

    /// Removes and returns every armed timer, as if they all elapsed.
    pub fn take_all(&self) -> Vec<ArmedTimer> {
        self.armed
            .lock()
            .map(|mut armed| std::mem::take(&mut *armed).into_values().collect())
            .unwrap_or_default()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, slot: SlotId, token: TimerToken, delay: Duration) {
        if let Ok(mut armed) = self.armed.lock() {
            armed.insert(slot, ArmedTimer { slot, token, delay });
        }
    }

    fn cancel(&self, slot: SlotId, token: TimerToken) {
        if let Ok(mut armed) = self.armed.lock() {
            if armed.get(&slot).is_some_and(|timer| timer.token == token) {
                armed.remove(&slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new();
        let other = clock.clone();
        let start = other.now();

        clock.advance(Duration::from_millis(250));
        assert_eq!(other.now() - start, Duration::from_millis(250));
        assert_eq!(other.elapsed(), Duration::from_millis(250));
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_scheduler_replace_and_cancel() {
        let scheduler = ManualScheduler::new();
        scheduler.schedule(1, TimerToken::new(1), Duration::from_millis(250));
        scheduler.schedule(1, TimerToken::new(2), Duration::from_millis(500));
        scheduler.schedule(2, TimerToken::new(1), Duration::from_millis(250));

        let armed = scheduler.armed();
        assert_eq!(armed.len(), 2);
        assert_eq!(armed[0].token, TimerToken::new(2));

        // Stale token leaves the newer timer alone.
        scheduler.cancel(1, TimerToken::new(1));
        assert_eq!(scheduler.armed().len(), 2);

        scheduler.cancel(1, TimerToken::new(2));
        assert_eq!(scheduler.armed().len(), 1);

        let fired = scheduler.take_all();
        assert_eq!(fired, vec![ArmedTimer { slot: 2, token: TimerToken::new(1), delay: Duration::from_millis(250) }]);
        assert!(scheduler.armed().is_empty());
    }
}
