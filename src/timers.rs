//! Tokio-backed timers for the deferred ballot-counter update.
//!
//! Each armed timer is a tokio task that sleeps for the requested delay
//! and then sends a [`TimerFired`] event into a channel. The receiving end
//! routes the event into [`Node::fire_timer`](crate::Node::fire_timer),
//! which ignores it unless the token is still the slot's armed token.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, trace};

use crate::{
    traits::Scheduler,
    types::{SlotId, TimerToken},
};

/// A timer that elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    /// Slot the timer was armed for.
    pub slot: SlotId,
    /// Token it was armed with.
    pub token: TimerToken,
}

/// Manages one sleeping task per slot.
///
/// Must be used from within a tokio runtime. Clones share the same set of
/// timers.
#[derive(Clone)]
pub struct TimerManager {
    /// Active timers (slot -> token and task handle).
    timers: Arc<Mutex<HashMap<SlotId, (TimerToken, JoinHandle<()>)>>>,
    /// Event sender for timer fires.
    event_tx: mpsc::Sender<TimerFired>,
}

impl std::fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerManager").field("active", &self.active_count()).finish_non_exhaustive()
    }
}

impl TimerManager {
    /// Creates a timer manager sending fired timers to `event_tx`.
    pub fn new(event_tx: mpsc::Sender<TimerFired>) -> Self {
        Self { timers: Arc::new(Mutex::new(HashMap::new())), event_tx }
    }

    /// Cancels every timer.
    pub fn cancel_all(&self) {
        if let Ok(mut timers) = self.timers.lock() {
            for (slot, (_, handle)) in timers.drain() {
                handle.abort();
                trace!(slot, "timer cancelled (shutdown)");
            }
        }
    }

    /// Number of armed timers, including ones that fired but were not yet
    /// cancelled by the node.
    pub fn active_count(&self) -> usize {
        self.timers.lock().map(|timers| timers.len()).unwrap_or_default()
    }
}

impl Scheduler for TimerManager {
    fn schedule(&self, slot: SlotId, token: TimerToken, delay: Duration) {
        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            trace!(slot, ?delay, "timer task started, sleeping");
            tokio::time::sleep(delay).await;
            trace!(slot, "timer fired, sending event");
            if event_tx.send(TimerFired { slot, token }).await.is_err() {
                trace!(slot, "timer receiver dropped");
            }
        });

        if let Ok(mut timers) = self.timers.lock() {
            if let Some((_, previous)) = timers.insert(slot, (token, handle)) {
                previous.abort();
            }
        }
        debug!(slot, token = token.generation(), ?delay, "timer set");
    }

    fn cancel(&self, slot: SlotId, token: TimerToken) {
        let Ok(mut timers) = self.timers.lock() else { return };
        if timers.get(&slot).is_some_and(|(armed, _)| *armed == token) {
            if let Some((_, handle)) = timers.remove(&slot) {
                handle.abort();
                debug!(slot, token = token.generation(), "timer cancelled");
            }
        }
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        // Only the last handle tears the tasks down.
        if Arc::strong_count(&self.timers) == 1 {
            self.cancel_all();
        }
    }
}
