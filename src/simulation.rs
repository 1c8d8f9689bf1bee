//! Deterministic in-process network of nodes.
//!
//! Every node has its own inbox. Broadcasting pushes a message onto every
//! other node's inbox, and delivery pops from one inbox at a time, so tests
//! choose the interleaving explicitly. Time only moves through
//! [`Simulation::advance_round`], which also starts the next nomination
//! round, and deferred updates only apply through [`Simulation::fire_timers`].

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use tracing::{debug, trace};

use crate::{
    message::{ExtTopic, Msg},
    node::{Node, NodeConfig},
    providers::{ManualClock, ManualScheduler},
    traits::Value,
    types::{ConfigError, NodeError, NodeId, SlotId},
};

#[derive(Debug)]
struct SimNode<V: Value> {
    node: Node<V>,
    scheduler: ManualScheduler,
    inbox: VecDeque<Msg<V>>,
    crashed: bool,
}

/// A set of nodes exchanging messages through explicit queues.
#[derive(Debug)]
pub struct Simulation<V: Value> {
    clock: ManualClock,
    config: NodeConfig,
    nodes: BTreeMap<NodeId, SimNode<V>>,
    delivered: usize,
}

impl<V: Value> Default for Simulation<V> {
    fn default() -> Self {
        Self::new(NodeConfig::default())
    }
}

impl<V: Value> Simulation<V> {
    /// Creates an empty simulation whose nodes use `config`.
    pub fn new(config: NodeConfig) -> Self {
        Self { clock: ManualClock::new(), config, nodes: BTreeMap::new(), delivered: 0 }
    }

    /// Adds a node sharing the simulation clock.
    ///
    /// # Errors
    ///
    /// Fails if the slices are invalid for `id`.
    pub fn add_node<I, S>(&mut self, id: NodeId, slices: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: IntoIterator<Item = NodeId>,
    {
        let scheduler = ManualScheduler::new();
        let node = Node::new(id.clone(), slices)?
            .with_config(self.config)
            .with_clock(Arc::new(self.clock.clone()))
            .with_scheduler(Arc::new(scheduler.clone()));
        self.nodes.insert(id, SimNode { node, scheduler, inbox: VecDeque::new(), crashed: false });
        Ok(())
    }

    /// Stops a node: it drops its inbox and never sends again.
    pub fn crash(&mut self, id: &NodeId) {
        if let Some(sim) = self.nodes.get_mut(id) {
            sim.crashed = true;
            sim.inbox.clear();
            debug!(node = %id, "node crashed");
        }
    }

    /// Has `id` nominate `value` for `slot`, broadcasting the result.
    ///
    /// # Errors
    ///
    /// See [`Node::nominate`].
    pub fn nominate(&mut self, id: &NodeId, slot: SlotId, value: V) -> Result<(), NodeError> {
        let Some(sim) = self.nodes.get_mut(id).filter(|sim| !sim.crashed) else {
            return Ok(());
        };
        if let Some(out) = sim.node.nominate(slot, value)? {
            self.broadcast(out);
        }
        Ok(())
    }

    /// Queues `msg` for every node other than its sender.
    pub fn broadcast(&mut self, msg: Msg<V>) {
        for (id, sim) in &mut self.nodes {
            if *id != msg.sender && !sim.crashed {
                sim.inbox.push_back(msg.clone());
            }
        }
    }

    /// Node ids with queued messages.
    pub fn busy(&self) -> Vec<NodeId> {
        self.nodes.iter().filter(|(_, sim)| !sim.inbox.is_empty()).map(|(id, _)| id.clone()).collect()
    }

    /// Number of messages queued for `id`.
    pub fn inbox_len(&self, id: &NodeId) -> usize {
        self.nodes.get(id).map_or(0, |sim| sim.inbox.len())
    }

    /// Delivers the message at `index` of `id`'s inbox. Returns false if
    /// there is none.
    pub fn deliver_at(&mut self, id: &NodeId, index: usize) -> bool {
        let Some(sim) = self.nodes.get_mut(id) else { return false };
        let Some(msg) = sim.inbox.remove(index) else { return false };
        self.delivered += 1;
        match sim.node.handle(msg) {
            Ok(Some(out)) => self.broadcast(out),
            Ok(None) => {}
            Err(err) => debug!(node = %id, %err, "message dropped"),
        }
        true
    }

    /// Delivers queued messages in round-robin order until every inbox is
    /// empty or `max_steps` messages were delivered. Returns the number
    /// delivered.
    pub fn run(&mut self, max_steps: usize) -> usize {
        let mut steps = 0;
        while steps < max_steps {
            let busy = self.busy();
            if busy.is_empty() {
                break;
            }
            for id in busy {
                if steps >= max_steps {
                    break;
                }
                if self.deliver_at(&id, 0) {
                    steps += 1;
                }
            }
        }
        trace!(steps, total = self.delivered, "run finished");
        steps
    }

    /// Moves the shared clock forward by one nomination round and has every
    /// live node renominate, broadcasting the results. Returns the number of
    /// messages sent.
    pub fn advance_round(&mut self) -> usize {
        self.clock.advance(self.config.round_duration);
        let outbound: Vec<Msg<V>> = self
            .nodes
            .values_mut()
            .filter(|sim| !sim.crashed)
            .flat_map(|sim| sim.node.renominate())
            .collect();
        let sent = outbound.len();
        for msg in outbound {
            self.broadcast(msg);
        }
        sent
    }

    /// Fires every armed deferred update on every live node, broadcasting
    /// the results. Returns the number of updates applied.
    pub fn fire_timers(&mut self) -> usize {
        let mut outbound = Vec::new();
        for sim in self.nodes.values_mut().filter(|sim| !sim.crashed) {
            for timer in sim.scheduler.take_all() {
                outbound.extend(sim.node.fire_timer(timer.slot, timer.token));
            }
        }
        let fired = outbound.len();
        for msg in outbound {
            self.broadcast(msg);
        }
        fired
    }

    /// The node `id`.
    pub fn node(&self, id: &NodeId) -> Option<&Node<V>> {
        self.nodes.get(id).map(|sim| &sim.node)
    }

    /// The decision `id` reached for `slot`.
    pub fn externalized(&self, id: &NodeId, slot: SlotId) -> Option<&ExtTopic<V>> {
        self.node(id)?.externalized(slot)
    }

    /// Live node ids.
    pub fn live(&self) -> Vec<NodeId> {
        self.nodes.iter().filter(|(_, sim)| !sim.crashed).map(|(id, _)| id.clone()).collect()
    }

    /// The shared clock.
    pub const fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Total messages delivered so far.
    pub const fn delivered(&self) -> usize {
        self.delivered
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use rstest::rstest;

    use super::*;
    use crate::types::Phase;

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

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    fn ids(s: &[&str]) -> Vec<NodeId> {
        s.iter().map(|s| id(s)).collect()
    }

    fn pair() -> Simulation<Val> {
        let mut sim = Simulation::default();
        sim.add_node(id("a"), [ids(&["b"])]).unwrap();
        sim.add_node(id("b"), [ids(&["a"])]).unwrap();
        sim
    }

    /// Three nodes, each satisfied by any one other node.
    fn triangle() -> Simulation<Val> {
        let mut sim = Simulation::default();
        sim.add_node(id("a"), [ids(&["b"]), ids(&["c"])]).unwrap();
        sim.add_node(id("b"), [ids(&["a"]), ids(&["c"])]).unwrap();
        sim.add_node(id("c"), [ids(&["a"]), ids(&["b"])]).unwrap();
        sim
    }

    /// Nominates on every live node each round until all of them decide.
    fn drive(sim: &mut Simulation<Val>, slot: SlotId, value: u32) -> bool {
        for _ in 0..64 {
            for node in sim.live() {
                sim.nominate(&node, slot, Val(value)).unwrap();
            }
            sim.run(10_000);
            if sim.live().iter().all(|node| sim.externalized(node, slot).is_some()) {
                return true;
            }
            sim.advance_round();
            sim.fire_timers();
        }
        false
    }

    #[test]
    fn test_two_nodes_agree() {
        let mut sim = pair();
        assert!(drive(&mut sim, 1, 3));

        let a = sim.externalized(&id("a"), 1).unwrap();
        let b = sim.externalized(&id("b"), 1).unwrap();
        assert_eq!(a.c, b.c);
        assert_eq!(a.c.value, Val(3));
        assert!(sim.delivered() > 0);
    }

    #[test]
    fn test_minority_crash_still_decides() {
        let mut sim = triangle();
        sim.crash(&id("c"));
        assert_eq!(sim.live(), ids(&["a", "b"]));

        assert!(drive(&mut sim, 1, 9));
        let a = sim.externalized(&id("a"), 1).unwrap();
        let b = sim.externalized(&id("b"), 1).unwrap();
        assert_eq!(a.c, b.c);
        assert_eq!(a.c.value, Val(9));
        assert!(sim.externalized(&id("c"), 1).is_none());
        assert_eq!(sim.inbox_len(&id("c")), 0);
    }

    #[test]
    fn test_consecutive_slots() {
        let mut sim = triangle();
        for slot in 1..=3 {
            assert!(drive(&mut sim, slot, 10 + slot as u32));
        }
        for node in ids(&["a", "b", "c"]) {
            assert_eq!(sim.externalized(&node, 3).unwrap().c.value, Val(13));
        }
    }

    #[test]
    fn test_nominating_ahead_of_previous_slot_fails() {
        let mut sim = pair();
        let err = sim.nominate(&id("a"), 2, Val(1)).unwrap_err();
        assert_eq!(err, NodeError::MissingPreviousValue { slot: 1 });
        assert_eq!(sim.node(&id("a")).unwrap().phase(2), None);
    }

    /// Four nodes, each satisfied by any two of the other three.
    fn two_of_three() -> Simulation<Val> {
        let names = ["a", "b", "c", "d"];
        let mut sim = Simulation::default();
        for me in names {
            let others: Vec<&str> = names.into_iter().filter(|name| *name != me).collect();
            let slices = [
                ids(&[others[0], others[1]]),
                ids(&[others[0], others[2]]),
                ids(&[others[1], others[2]]),
            ];
            sim.add_node(id(me), slices).unwrap();
        }
        sim
    }

    /// Delivers queued messages in random order until every inbox is empty.
    fn deliver_shuffled(sim: &mut Simulation<Val>, rng: &mut StdRng) {
        for _ in 0..10_000 {
            let busy = sim.busy();
            if busy.is_empty() {
                break;
            }
            let node = &busy[rng.gen_range(0..busy.len())];
            let index = rng.gen_range(0..sim.inbox_len(node));
            sim.deliver_at(node, index);
        }
    }

    /// Runs rounds without new proposals until every live node decides.
    fn settle_rounds(
        sim: &mut Simulation<Val>,
        slot: SlotId,
        mut deliver: impl FnMut(&mut Simulation<Val>),
    ) -> bool {
        for _ in 0..64 {
            deliver(sim);
            if sim.live().iter().all(|node| sim.externalized(node, slot).is_some()) {
                return true;
            }
            sim.advance_round();
            sim.fire_timers();
        }
        false
    }

    #[rstest]
    #[case::seed_1(1)]
    #[case::seed_7(7)]
    #[case::seed_42(42)]
    #[case::seed_1337(1337)]
    fn test_shuffled_delivery_agrees(#[case] seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut sim = pair();
        for node in sim.live() {
            sim.nominate(&node, 1, Val(5)).unwrap();
        }

        deliver_shuffled(&mut sim, &mut rng);

        let a = sim.externalized(&id("a"), 1).unwrap();
        let b = sim.externalized(&id("b"), 1).unwrap();
        assert_eq!(a.c, b.c);
        assert_eq!(sim.node(&id("a")).unwrap().phase(1), Some(Phase::Externalize));
    }

    #[rstest]
    #[case::seed_3(3)]
    #[case::seed_11(11)]
    #[case::seed_99(99)]
    #[case::seed_2024(2024)]
    fn test_conflicting_proposals_agree(#[case] seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut sim = two_of_three();
        for (value, node) in (1..).zip(sim.live()) {
            sim.nominate(&node, 1, Val(value)).unwrap();
        }

        assert!(settle_rounds(&mut sim, 1, |sim| deliver_shuffled(sim, &mut rng)));
        let values: Vec<Val> =
            sim.live().iter().map(|node| sim.externalized(node, 1).unwrap().c.value.clone()).collect();
        assert!(values.windows(2).all(|pair| pair[0] == pair[1]), "disagreement: {values:?}");
        assert!((1..=4).contains(&values[0].0));
    }

    #[test]
    fn test_single_proposal_is_decided() {
        let mut sim = triangle();
        sim.nominate(&id("c"), 1, Val(6)).unwrap();

        assert!(settle_rounds(&mut sim, 1, |sim| {
            sim.run(10_000);
        }));
        for node in ids(&["a", "b", "c"]) {
            assert_eq!(sim.externalized(&node, 1).unwrap().c.value, Val(6));
        }
    }
}
