//! Async driver for a single node.
//!
//! The [`Conductor`] owns a [`Node`] behind a tokio mutex, arms the node's
//! deferred updates on a [`TimerManager`], starts a nomination round every
//! round duration, and publishes every message the node produces on a
//! broadcast channel for the transport to pick up.

use std::{sync::Arc, time::Duration};

use futures::{Stream, stream};
use tokio::{
    sync::{Mutex, RwLock, broadcast, mpsc},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, trace, warn};

use crate::{
    message::{ExtTopic, Msg},
    node::{Node, RankedPeer, SlotStatus},
    timers::{TimerFired, TimerManager},
    traits::Value,
    types::{NodeError, NodeId, Phase, SlotId},
};

/// Configuration for the conductor.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    /// Capacity of the outbound broadcast channel. Subscribers that fall
    /// further behind skip the oldest messages.
    pub outbound_capacity: usize,
    /// Capacity of the fired-timer channel.
    pub timer_capacity: usize,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self { outbound_capacity: 1024, timer_capacity: 256 }
    }
}

/// Internal state of the conductor.
#[derive(Debug, Default)]
struct ConductorState {
    /// Whether the conductor is running.
    running: bool,
    /// The timer-event loop, once started.
    timer_loop: Option<JoinHandle<()>>,
    /// The nomination round ticker, once started.
    round_loop: Option<JoinHandle<()>>,
}

/// Drives a [`Node`] from async code.
///
/// Inbound messages, nominations and fired timers all take the same lock
/// on the node, so each is applied atomically with respect to the others.
///
/// # Example
///
/// ```ignore
/// use fbas::{Conductor, ConductorConfig, Node};
///
/// let conductor = Conductor::new(node, ConductorConfig::default());
/// conductor.start().await;
///
/// let mut outbound = std::pin::pin!(conductor.outbound());
/// conductor.nominate(1, value).await?;
/// while let Some(msg) = outbound.next().await {
///     transport.broadcast(msg).await;
/// }
/// ```
pub struct Conductor<V: Value> {
    /// The node.
    node: Arc<Mutex<Node<V>>>,
    /// Timers armed by the node.
    timers: TimerManager,
    /// Fired timers, taken by the loop on start.
    timer_rx: Arc<Mutex<Option<mpsc::Receiver<TimerFired>>>>,
    /// Every message the node produces.
    outbound: broadcast::Sender<Msg<V>>,
    /// Internal state.
    state: Arc<RwLock<ConductorState>>,
    /// Length of a nomination round.
    round_duration: Duration,
    /// Our id.
    id: NodeId,
}

impl<V: Value> Clone for Conductor<V> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            timers: self.timers.clone(),
            timer_rx: Arc::clone(&self.timer_rx),
            outbound: self.outbound.clone(),
            state: Arc::clone(&self.state),
            round_duration: self.round_duration,
            id: self.id.clone(),
        }
    }
}

impl<V: Value> std::fmt::Debug for Conductor<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conductor").field("id", &self.id).finish_non_exhaustive()
    }
}

impl<V: Value> Conductor<V> {
    /// Creates a conductor for `node`, replacing its scheduler with tokio
    /// timers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(node: Node<V>, config: ConductorConfig) -> Self {
        let (timer_tx, timer_rx) = mpsc::channel(config.timer_capacity.max(1));
        let timers = TimerManager::new(timer_tx);
        let node = node.with_scheduler(Arc::new(timers.clone()));
        let id = node.id().clone();
        let round_duration = node.config().round_duration.max(Duration::from_millis(1));
        let (outbound, _) = broadcast::channel(config.outbound_capacity.max(1));
        Self {
            node: Arc::new(Mutex::new(node)),
            timers,
            timer_rx: Arc::new(Mutex::new(Some(timer_rx))),
            outbound,
            state: Arc::new(RwLock::new(ConductorState::default())),
            round_duration,
            id,
        }
    }

    /// This node's id.
    pub const fn id(&self) -> &NodeId {
        &self.id
    }

    /// Starts routing fired timers into the node and renominating once per
    /// round. Calling it again is a no-op.
    pub async fn start(&self) {
        let Some(mut timer_rx) = self.timer_rx.lock().await.take() else {
            debug!(node = %self.id, "conductor already started");
            return;
        };

        let node = Arc::clone(&self.node);
        let outbound = self.outbound.clone();
        let id = self.id.clone();
        let handle = tokio::spawn(async move {
            while let Some(TimerFired { slot, token }) = timer_rx.recv().await {
                let out = node.lock().await.fire_timer(slot, token);
                if let Some(msg) = out {
                    debug!(node = %id, slot, counter = msg.counter(), "deferred update applied");
                    publish(&outbound, msg);
                }
            }
            trace!(node = %id, "timer loop exited");
        });

        let node = Arc::clone(&self.node);
        let outbound = self.outbound.clone();
        let id = self.id.clone();
        let period = self.round_duration;
        let rounds = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let out = node.lock().await.renominate();
                for msg in out {
                    trace!(node = %id, slot = msg.slot, "renominated");
                    publish(&outbound, msg);
                }
            }
        });

        let mut state = self.state.write().await;
        state.running = true;
        state.timer_loop = Some(handle);
        state.round_loop = Some(rounds);
        info!(node = %self.id, "conductor started");
    }

    /// Stops the timer loop and cancels every armed timer.
    pub async fn stop(&self) {
        let mut state = self.state.write().await;
        state.running = false;
        for handle in [state.timer_loop.take(), state.round_loop.take()].into_iter().flatten() {
            handle.abort();
        }
        self.timers.cancel_all();
        info!(node = %self.id, "conductor stopped");
    }

    /// Returns whether the conductor is running.
    pub async fn is_running(&self) -> bool {
        self.state.read().await.running
    }

    /// Handles an inbound message. The response, if any, is returned and
    /// also published on the outbound stream.
    ///
    /// # Errors
    ///
    /// See [`Node::handle`].
    pub async fn handle(&self, msg: Msg<V>) -> Result<Option<Msg<V>>, NodeError> {
        let out = self.node.lock().await.handle(msg)?;
        if let Some(msg) = &out {
            publish(&self.outbound, msg.clone());
        }
        Ok(out)
    }

    /// Nominates `value` for `slot`. The resulting message, if any, is
    /// returned and published. A value held until this node leads a round
    /// goes out through the round ticker.
    ///
    /// # Errors
    ///
    /// See [`Node::nominate`].
    pub async fn nominate(&self, slot: SlotId, value: V) -> Result<Option<Msg<V>>, NodeError> {
        let out = self.node.lock().await.nominate(slot, value)?;
        if let Some(msg) = &out {
            publish(&self.outbound, msg.clone());
        }
        Ok(out)
    }

    /// Stream of every message the node produces from now on.
    ///
    /// A subscriber that lags more than the channel capacity skips the
    /// oldest messages; each message carries full slot state, so later
    /// ones supersede what was skipped.
    pub fn outbound(&self) -> impl Stream<Item = Msg<V>> + Send + 'static {
        let rx = self.outbound.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "outbound subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    /// The decision for `slot`.
    pub async fn externalized(&self, slot: SlotId) -> Option<ExtTopic<V>> {
        self.node.lock().await.externalized(slot).cloned()
    }

    /// The highest decided slot and its decision.
    pub async fn last_externalized(&self) -> Option<(SlotId, ExtTopic<V>)> {
        self.node.lock().await.last_externalized().map(|(slot, ext)| (slot, ext.clone()))
    }

    /// Decisions above `after`, in slot order.
    pub async fn externalized_after(&self, after: SlotId) -> Vec<(SlotId, ExtTopic<V>)> {
        self.node
            .lock()
            .await
            .externalized_after(after)
            .map(|(slot, ext)| (slot, ext.clone()))
            .collect()
    }

    /// Externalize messages for every decided slot above `after`, in slot
    /// order.
    pub async fn decisions_after(&self, after: SlotId) -> Vec<Msg<V>> {
        let node = self.node.lock().await;
        let slots: Vec<SlotId> = node.externalized_after(after).map(|(slot, _)| slot).collect();
        slots.into_iter().filter_map(|slot| node.decision_message(slot)).collect()
    }

    /// Current phase of `slot`.
    pub async fn phase(&self, slot: SlotId) -> Option<Phase> {
        self.node.lock().await.phase(slot)
    }

    /// Diagnostic snapshot of `slot`.
    pub async fn status(&self, slot: SlotId) -> Option<SlotStatus<V>> {
        self.node.lock().await.status(slot)
    }

    /// Undecided slots.
    pub async fn pending_slots(&self) -> Vec<SlotId> {
        self.node.lock().await.pending_slots()
    }

    /// Ranked neighbors for `round` of `slot`.
    ///
    /// # Errors
    ///
    /// See [`Node::neighbors_and_priority`].
    pub async fn neighbors_and_priority(
        &self,
        slot: SlotId,
        round: u32,
    ) -> Result<Vec<RankedPeer>, NodeError> {
        self.node.lock().await.neighbors_and_priority(slot, round)
    }

    /// Nomination leader of an undecided `slot` for its current round.
    pub async fn leader(&self, slot: SlotId) -> Option<NodeId> {
        let node = self.node.lock().await;
        let round = node.round(slot)?;
        node.leader(slot, round).ok().flatten()
    }

    /// Drops decisions below `before`.
    pub async fn prune(&self, before: SlotId) {
        self.node.lock().await.prune(before);
    }
}

fn publish<V: Value>(outbound: &broadcast::Sender<Msg<V>>, msg: Msg<V>) {
    if outbound.send(msg).is_err() {
        trace!("no outbound subscribers");
    }
}

#[cfg(test)]
mod tests {
    use std::{pin::pin, time::Duration};

    use futures::StreamExt;

    use super::*;
    use crate::{
        ballot::Ballot,
        message::{PrepTopic, Topic},
        node::NodeConfig,
        providers::ManualClock,
    };

    #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    struct Val(u32);

    impl Value for Val {
        fn combine(&self, other: &Self) -> Self {
            Self(self.0.max(other.0))
        }

        fn bytes(&self) -> Vec<u8> {
            self.0.to_be_bytes().to_vec()
        }
    }

    fn conductor(me: &str, peer: &str, clock: &ManualClock, interval: Duration) -> Conductor<Val> {
        let node = Node::new(NodeId::from(me), [[NodeId::from(peer)]])
            .unwrap()
            .with_clock(Arc::new(clock.clone()))
            .with_config(NodeConfig {
                round_duration: Duration::from_millis(100),
                deferred_update_interval: interval,
            });
        Conductor::new(node, ConductorConfig::default())
    }

    fn route(from: &Conductor<Val>, to: Conductor<Val>) -> JoinHandle<()> {
        let outbound = from.outbound();
        tokio::spawn(async move {
            let mut outbound = pin!(outbound);
            while let Some(msg) = outbound.next().await {
                let _ = to.handle(msg).await;
            }
        })
    }

    #[tokio::test]
    async fn test_two_conductors_externalize() {
        let clock = ManualClock::new();
        let a = conductor("a", "b", &clock, Duration::from_millis(250));
        let b = conductor("b", "a", &clock, Duration::from_millis(250));
        a.start().await;
        b.start().await;
        let routes = [route(&a, b.clone()), route(&b, a.clone())];

        a.nominate(1, Val(4)).await.unwrap();
        b.nominate(1, Val(4)).await.unwrap();

        let decided = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let (Some(x), Some(y)) = (a.externalized(1).await, b.externalized(1).await) {
                    return (x, y);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timeout");

        assert_eq!(decided.0.c, decided.1.c);
        assert_eq!(decided.0.c.value, Val(4));
        assert_eq!(a.phase(1).await, Some(Phase::Externalize));
        assert_eq!(a.last_externalized().await.map(|(slot, _)| slot), Some(1));
        let feed = b.decisions_after(0).await;
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].sender, NodeId::from("b"));

        for route in routes {
            route.abort();
        }
        a.stop().await;
        b.stop().await;
        assert!(!a.is_running().await);
    }

    #[tokio::test]
    async fn test_handle_publishes_response() {
        let clock = ManualClock::new();
        let a = conductor("a", "b", &clock, Duration::from_millis(250));
        let mut outbound = pin!(a.outbound());

        let out = a.nominate(1, Val(1)).await.unwrap();
        if let Some(out) = out {
            let published = outbound.next().await.unwrap();
            assert_eq!(published, out);
        }
        assert_eq!(a.pending_slots().await, vec![1]);
        assert!(a.leader(1).await.is_some());
        assert_eq!(a.leader(9).await, None);
    }

    #[tokio::test]
    async fn test_timer_loop_applies_deferred_update() {
        let clock = ManualClock::new();
        let a = conductor("a", "b", &clock, Duration::from_millis(10));
        a.start().await;
        a.start().await;
        assert!(a.is_running().await);
        let mut outbound = pin!(a.outbound());

        let prepare = |p: Option<Ballot<Val>>| {
            Msg::new(
                NodeId::from("b"),
                1,
                [[NodeId::from("a")]].into_iter().collect(),
                Topic::Prepare(PrepTopic { b: Ballot::new(1, Val(3)), p, pp: None, hn: 0, cn: 0 }),
            )
        };
        a.handle(prepare(None)).await.unwrap();
        a.handle(prepare(Some(Ballot::new(1, Val(3))))).await.unwrap();

        let bumped = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let msg = outbound.next().await.unwrap();
                if msg.counter() == 2 {
                    return msg;
                }
            }
        })
        .await
        .expect("timeout");
        assert_eq!(bumped.sender, NodeId::from("a"));
        assert_eq!(a.status(1).await.unwrap().ballot, Some(Ballot::new(2, Val(3))));
    }

    #[tokio::test]
    async fn test_round_ticker_sends_held_proposal() {
        let clock = ManualClock::new();
        let a = conductor("a", "b", &clock, Duration::from_millis(250));
        let b = conductor("b", "a", &clock, Duration::from_millis(250));
        a.start().await;
        b.start().await;
        let routes = [route(&a, b.clone()), route(&b, a.clone())];

        let first_leader = a.neighbors_and_priority(1, 0).await.unwrap()[0].id.clone();
        let proposer = if first_leader == *a.id() { &b } else { &a };
        assert!(proposer.nominate(1, Val(4)).await.unwrap().is_none());

        let decided = tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                if let (Some(x), Some(y)) = (a.externalized(1).await, b.externalized(1).await) {
                    return (x, y);
                }
                clock.advance(Duration::from_millis(100));
                tokio::time::sleep(Duration::from_millis(150)).await;
            }
        })
        .await
        .expect("timeout");

        assert_eq!(decided.0.c.value, Val(4));
        assert_eq!(decided.1.c.value, Val(4));

        for route in routes {
            route.abort();
        }
        a.stop().await;
        b.stop().await;
    }
}
