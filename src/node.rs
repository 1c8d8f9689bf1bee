//! A consensus node: its identity, quorum slices, and per-slot state.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use alloy_primitives::{U256, U512};
use commonware_cryptography::{Hasher as _, sha256};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::{
    ballot::{Ballot, ValueSet},
    message::{ExtTopic, Msg, NomTopic, Topic},
    providers::{NoopScheduler, SystemClock},
    quorum::{NodeSet, QuorumSlices},
    slot::Slot,
    traits::{Clock, Scheduler, Value},
    types::{ConfigError, NodeError, NodeId, Phase, SlotId, TimerToken, Weight},
};

/// Hash tag for the neighbor-selection draw.
const NEIGHBOR_TAG: u8 = b'N';

/// Hash tag for the leader-priority draw.
const PRIORITY_TAG: u8 = b'P';

/// Timing parameters for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeConfig {
    /// Length of one nomination round.
    pub round_duration: Duration,
    /// Base interval of the deferred ballot-counter update. The update for
    /// counter `n` is armed for `(1 + n)` intervals.
    pub deferred_update_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            round_duration: Duration::from_millis(100),
            deferred_update_interval: Duration::from_millis(250),
        }
    }
}

/// A peer considered for nomination leadership in some round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedPeer {
    /// The peer.
    pub id: NodeId,
    /// Weight the local node assigns it.
    pub weight: Weight,
    /// Priority draw for the round. The highest wins.
    pub priority: U256,
}

/// Snapshot of an undecided or decided slot, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStatus<V> {
    /// Slot id.
    pub slot: SlotId,
    /// Current phase.
    pub phase: Phase,
    /// Current ballot, or the decided one once externalized.
    pub ballot: Option<Ballot<V>>,
    /// Number of peers heard from.
    pub peers_heard: usize,
}

/// Node-wide state shared by every slot.
#[derive(Debug)]
pub(crate) struct Core<V: Value> {
    pub(crate) id: NodeId,
    pub(crate) slices: QuorumSlices,
    pub(crate) config: NodeConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    externalized: BTreeMap<SlotId, ExtTopic<V>>,
}

impl<V: Value> Core<V> {
    pub(crate) fn message(&self, slot: SlotId, topic: Topic<V>) -> Msg<V> {
        Msg::new(self.id.clone(), slot, self.slices.clone(), topic)
    }

    /// Nomination round for a slot created at `created`.
    pub(crate) fn round(&self, created: Instant) -> u32 {
        let elapsed = self.clock.now().saturating_duration_since(created);
        let round = elapsed.as_nanos() / self.config.round_duration.as_nanos().max(1);
        u32::try_from(round).unwrap_or(u32::MAX)
    }

    pub(crate) fn weight(&self, id: &NodeId) -> Weight {
        if *id == self.id {
            return Weight::FULL;
        }
        self.slices.weight(id)
    }

    /// Neighbors for `round` with their priority, highest first.
    pub(crate) fn neighbors(&self, slot: SlotId, round: u32) -> Result<Vec<RankedPeer>, NodeError> {
        let prev = self.previous_value(slot)?;
        let mut ranked: Vec<RankedPeer> = std::iter::once(self.id.clone())
            .chain(self.slices.members())
            .filter_map(|id| {
                let weight = self.weight(&id);
                let neighbor = id == self.id
                    || is_neighbor(&draw(slot, &prev, NEIGHBOR_TAG, round, &id), weight);
                neighbor.then(|| {
                    let priority =
                        U256::from_be_slice(draw(slot, &prev, PRIORITY_TAG, round, &id).as_ref());
                    RankedPeer { id, weight, priority }
                })
            })
            .collect();
        ranked.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(ranked)
    }

    /// The neighbor with the highest priority for `round`.
    pub(crate) fn leader(&self, slot: SlotId, round: u32) -> Result<Option<NodeId>, NodeError> {
        Ok(self.neighbors(slot, round)?.into_iter().next().map(|peer| peer.id))
    }

    /// Bytes of the value decided in the slot before `slot`.
    fn previous_value(&self, slot: SlotId) -> Result<Vec<u8>, NodeError> {
        if slot <= 1 {
            return Ok(Vec::new());
        }
        let prev = slot - 1;
        self.externalized
            .get(&prev)
            .map(|ext| ext.c.value.bytes())
            .ok_or(NodeError::MissingPreviousValue { slot: prev })
    }
}

/// `sha256(slot ‖ prev ‖ tag ‖ round ‖ id)`, integers big-endian.
fn draw(slot: SlotId, prev: &[u8], tag: u8, round: u32, id: &NodeId) -> sha256::Digest {
    let mut hasher = sha256::Sha256::new();
    hasher.update(&slot.to_be_bytes());
    hasher.update(prev);
    hasher.update(&[tag]);
    hasher.update(&round.to_be_bytes());
    hasher.update(id.as_bytes());
    hasher.finalize()
}

/// `hash / 2^256 < count / total`, compared exactly as
/// `hash * total < (2^256 - 1) * count`.
fn is_neighbor(hash: &sha256::Digest, weight: Weight) -> bool {
    let hash = U512::from_be_slice(hash.as_ref());
    let max = U512::from_be_slice(&[0xff; 32]);
    hash * U512::from(weight.total as u64) < max * U512::from(weight.count as u64)
}

/// A federated-voting node.
///
/// All mutation goes through `&mut self`, so a node is a single logical
/// actor; wrap it in a mutex (see [`Conductor`](crate::Conductor)) to share
/// it between tasks.
#[derive(Debug)]
pub struct Node<V: Value> {
    pub(crate) core: Core<V>,
    pending: BTreeMap<SlotId, Slot<V>>,
    /// Slots below this were pruned and are no longer tracked.
    pruned_before: SlotId,
}

impl<V: Value> Node<V> {
    /// Creates a node with the default config, the system clock and a
    /// scheduler that never fires.
    ///
    /// # Errors
    ///
    /// Fails if `slices` is empty, contains an empty slice, or names `id`.
    pub fn new<I, S>(id: NodeId, slices: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: IntoIterator<Item = NodeId>,
    {
        let slices = QuorumSlices::new(&id, slices)?;
        debug!(node = %id, slices = slices.len(), "node created");
        Ok(Self {
            core: Core {
                id,
                slices,
                config: NodeConfig::default(),
                clock: Arc::new(SystemClock),
                scheduler: Arc::new(NoopScheduler),
                externalized: BTreeMap::new(),
            },
            pending: BTreeMap::new(),
            pruned_before: 0,
        })
    }

    /// Replaces the timing config.
    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.core.config = config;
        self
    }

    /// Replaces the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.core.clock = clock;
        self
    }

    /// Replaces the deferred-update scheduler.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.core.scheduler = scheduler;
        self
    }

    /// This node's id.
    pub const fn id(&self) -> &NodeId {
        &self.core.id
    }

    /// This node's quorum slices.
    pub const fn slices(&self) -> &QuorumSlices {
        &self.core.slices
    }

    /// Timing config.
    pub const fn config(&self) -> &NodeConfig {
        &self.core.config
    }

    /// Handles one inbound message and returns the node's updated state for
    /// that slot, if any, for the caller to broadcast.
    ///
    /// Messages for decided slots get the saved decision back, except for
    /// Externalize messages, which are only checked against it.
    ///
    /// # Errors
    ///
    /// Fails when the nomination leader for the slot cannot be computed
    /// because the previous slot's value is not known. No state changes.
    pub fn handle(&mut self, msg: Msg<V>) -> Result<Option<Msg<V>>, NodeError> {
        let slot_id = msg.slot;
        if slot_id < self.pruned_before {
            trace!(node = %self.core.id, slot = slot_id, "ignoring message for pruned slot");
            return Ok(None);
        }

        if let Some(saved) = self.core.externalized.get(&slot_id) {
            if let Topic::Externalize(theirs) = &msg.topic {
                if theirs.c.value != saved.c.value {
                    warn!(
                        node = %self.core.id,
                        slot = slot_id,
                        sender = %msg.sender,
                        ours = ?saved.c.value,
                        theirs = ?theirs.c.value,
                        "conflicting externalized value"
                    );
                }
                return Ok(None);
            }
            let replay = Topic::Externalize(saved.clone());
            return Ok(Some(self.core.message(slot_id, replay)));
        }

        let fresh = !self.pending.contains_key(&slot_id);
        let slot = self
            .pending
            .entry(slot_id)
            .or_insert_with(|| Slot::new(slot_id, self.core.clock.now()));
        let outcome = slot.handle(&self.core, msg);
        let decision = match &outcome {
            Ok(_) => slot.decision(),
            Err(_) => None,
        };

        if outcome.is_err() && fresh {
            self.pending.remove(&slot_id);
        }
        if let Some(decision) = decision {
            self.record_decision(slot_id, decision);
        }
        outcome
    }

    fn record_decision(&mut self, slot_id: SlotId, decision: ExtTopic<V>) {
        if let Some(mut slot) = self.pending.remove(&slot_id) {
            slot.cancel_timer(&self.core);
        }
        info!(
            node = %self.core.id,
            slot = slot_id,
            value = ?decision.c.value,
            counter = decision.c.counter,
            "externalized"
        );
        self.core.externalized.insert(slot_id, decision);
    }

    /// Proposes `value` for `slot` by handling a self-addressed nomination.
    ///
    /// The value is kept as a candidate for the slot. It is only voted for
    /// in rounds this node leads, so `Ok(None)` means the proposal is held
    /// until [`Node::renominate`] finds this node leading.
    ///
    /// # Errors
    ///
    /// See [`Node::handle`].
    pub fn nominate(&mut self, slot: SlotId, value: V) -> Result<Option<Msg<V>>, NodeError> {
        let topic = Topic::Nominate(NomTopic { x: ValueSet::from_iter([value]), y: ValueSet::new() });
        let msg = self.core.message(slot, topic);
        self.handle(msg)
    }

    /// Re-runs nomination on every undecided slot for its current round,
    /// voting for what the round's leader nominated. Call once per round.
    ///
    /// Returns the updated state of every slot that changed.
    pub fn renominate(&mut self) -> Vec<Msg<V>> {
        let mut out = Vec::new();
        let mut decided = Vec::new();
        for (slot_id, slot) in &mut self.pending {
            if let Some(msg) = slot.renominate(&self.core) {
                out.push(msg);
            }
            if let Some(decision) = slot.decision() {
                decided.push((*slot_id, decision));
            }
        }
        for (slot_id, decision) in decided {
            self.record_decision(slot_id, decision);
        }
        out
    }

    /// Applies a deferred ballot-counter update. Stale tokens are ignored.
    pub fn fire_timer(&mut self, slot: SlotId, token: TimerToken) -> Option<Msg<V>> {
        let pending = self.pending.get_mut(&slot)?;
        let out = pending.fire_timer(&self.core, token);
        if let Some(decision) = pending.decision() {
            self.record_decision(slot, decision);
        }
        out
    }

    /// The decision for `slot`, if externalized and not pruned.
    pub fn externalized(&self, slot: SlotId) -> Option<&ExtTopic<V>> {
        self.core.externalized.get(&slot)
    }

    /// The highest decided slot.
    pub fn last_externalized(&self) -> Option<(SlotId, &ExtTopic<V>)> {
        self.core.externalized.last_key_value().map(|(slot, ext)| (*slot, ext))
    }

    /// Decisions for slots strictly above `after`, in slot order.
    pub fn externalized_after(&self, after: SlotId) -> impl Iterator<Item = (SlotId, &ExtTopic<V>)> {
        self.core.externalized.range(after.saturating_add(1)..).map(|(slot, ext)| (*slot, ext))
    }

    /// The decision for `slot` as an Externalize message, for peers that
    /// are catching up.
    pub fn decision_message(&self, slot: SlotId) -> Option<Msg<V>> {
        let ext = self.core.externalized.get(&slot)?;
        Some(self.core.message(slot, Topic::Externalize(ext.clone())))
    }

    /// Current phase of `slot`, or `None` if the node has not seen it.
    pub fn phase(&self, slot: SlotId) -> Option<Phase> {
        if self.core.externalized.contains_key(&slot) {
            return Some(Phase::Externalize);
        }
        self.pending.get(&slot).map(Slot::phase)
    }

    /// Diagnostic snapshot of `slot`.
    pub fn status(&self, slot: SlotId) -> Option<SlotStatus<V>> {
        if let Some(ext) = self.core.externalized.get(&slot) {
            return Some(SlotStatus {
                slot,
                phase: Phase::Externalize,
                ballot: Some(ext.c.clone()),
                peers_heard: 0,
            });
        }
        self.pending.get(&slot).map(|pending| SlotStatus {
            slot,
            phase: pending.phase(),
            ballot: pending.ballot().cloned(),
            peers_heard: pending.messages().len(),
        })
    }

    /// Undecided slots, in order.
    pub fn pending_slots(&self) -> Vec<SlotId> {
        self.pending.keys().copied().collect()
    }

    /// Every node named in this node's own slices.
    pub fn peers(&self) -> NodeSet {
        self.core.slices.members()
    }

    /// Every node id this node knows of: itself, its peers, and every
    /// sender and slice member seen in stored messages.
    pub fn all_known(&self) -> NodeSet {
        let mut known = self.peers();
        known.insert(self.core.id.clone());
        for msg in self.pending.values().flat_map(|slot| slot.messages().values()) {
            known.insert(msg.sender.clone());
            known.extend(msg.slices.members());
        }
        known
    }

    /// Drops decisions for slots below `before` and stops tracking them.
    ///
    /// The decision for `before - 1` is needed to nominate in `before`, so
    /// callers keep at least the latest decided slot.
    pub fn prune(&mut self, before: SlotId) {
        self.core.externalized.retain(|slot, _| *slot >= before);
        let stale: Vec<SlotId> = self.pending.range(..before).map(|(slot, _)| *slot).collect();
        for slot in stale {
            if let Some(mut pending) = self.pending.remove(&slot) {
                pending.cancel_timer(&self.core);
            }
        }
        self.pruned_before = self.pruned_before.max(before);
        debug!(node = %self.core.id, before, "pruned slots");
    }

    /// Weight this node assigns to `id`.
    pub fn weight(&self, id: &NodeId) -> Weight {
        self.core.weight(id)
    }

    /// Neighbors of this node for nomination `round` of `slot`, highest
    /// priority first. The local node is always included.
    ///
    /// # Errors
    ///
    /// Fails with [`NodeError::MissingPreviousValue`] if `slot > 1` and the
    /// previous slot is not externalized here.
    pub fn neighbors_and_priority(
        &self,
        slot: SlotId,
        round: u32,
    ) -> Result<Vec<RankedPeer>, NodeError> {
        self.core.neighbors(slot, round)
    }

    /// Nomination leader for `round` of `slot`.
    ///
    /// # Errors
    ///
    /// See [`Node::neighbors_and_priority`].
    pub fn leader(&self, slot: SlotId, round: u32) -> Result<Option<NodeId>, NodeError> {
        self.core.leader(slot, round)
    }

    /// Current nomination round of an undecided slot.
    pub fn round(&self, slot: SlotId) -> Option<u32> {
        let pending = self.pending.get(&slot)?;
        Some(self.core.round(pending.created()))
    }
}
