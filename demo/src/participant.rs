//! Participant wrapper around the Conductor for the demo.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use fbas::{Ballot, Conductor, ConductorConfig, Node, NodeConfig, NodeError, NodeId, Phase, SlotId};

use crate::{
    config::{DemoConfig, participant_id},
    food::Food,
};

/// Type alias for the demo conductor.
pub type DemoConductor = Conductor<Food>;

/// View of a participant's state for the TUI.
#[derive(Debug, Clone)]
pub struct ParticipantView {
    /// Participant ID (1-indexed for display).
    pub id: usize,
    /// Whether the participant is exchanging messages.
    pub online: bool,
    /// The first day this participant has not decided yet.
    pub day: SlotId,
    /// Phase of that day, if it has started.
    pub phase: Option<Phase>,
    /// Current ballot for that day.
    pub ballot: Option<Ballot<Food>>,
    /// Whether this participant leads its own current nomination round.
    pub is_leader: bool,
    /// The most recent decision.
    pub last: Option<(SlotId, Food)>,
}

/// A demo participant wrapping a conductor.
pub struct Participant {
    /// Participant ID (1-indexed).
    id: usize,
    /// The underlying conductor.
    conductor: DemoConductor,
    /// Offline participants neither send nor receive.
    online: AtomicBool,
}

impl Participant {
    /// Creates participant `index` (0-indexed) with slices from `config`.
    pub fn new(index: usize, config: &DemoConfig) -> Result<Self, fbas::ConfigError> {
        let node = Node::new(participant_id(index), config.slices(index))?.with_config(NodeConfig {
            round_duration: Duration::from_millis(config.round_ms),
            deferred_update_interval: Duration::from_millis(config.deferred_update_ms),
        });
        let conductor = Conductor::new(node, ConductorConfig::default());

        Ok(Self { id: index + 1, conductor, online: AtomicBool::new(true) })
    }

    /// Returns the participant ID.
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Returns the node id.
    pub fn node_id(&self) -> &NodeId {
        self.conductor.id()
    }

    /// Returns a reference to the conductor.
    pub const fn conductor(&self) -> &DemoConductor {
        &self.conductor
    }

    /// Starts the conductor.
    pub async fn start(&self) {
        self.conductor.start().await;
    }

    /// Stops the conductor.
    pub async fn stop(&self) {
        self.conductor.stop().await;
    }

    /// Whether the participant is online.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    /// Flips the participant between online and offline.
    pub fn toggle(&self) {
        self.online.fetch_xor(true, Ordering::Relaxed);
    }

    /// The first undecided day.
    pub async fn next_day(&self) -> SlotId {
        self.conductor.last_externalized().await.map_or(1, |(slot, _)| slot + 1)
    }

    /// Proposes `food` for `day`.
    pub async fn propose(&self, day: SlotId, food: Food) -> Result<(), NodeError> {
        self.conductor.nominate(day, food).await.map(|_| ())
    }

    /// Gets a view of this participant's current state.
    pub async fn get_view(&self) -> ParticipantView {
        let last = self.conductor.last_externalized().await;
        let day = last.as_ref().map_or(1, |(slot, _)| slot + 1);
        let status = self.conductor.status(day).await;
        let is_leader = self.conductor.leader(day).await.as_ref() == Some(self.node_id());

        ParticipantView {
            id: self.id,
            online: self.is_online(),
            day,
            phase: status.as_ref().map(|s| s.phase),
            ballot: status.and_then(|s| s.ballot),
            is_leader,
            last: last.map(|(slot, ext)| (slot, ext.c.value)),
        }
    }
}

/// Shared participant reference for concurrent access.
pub type SharedParticipant = Arc<Participant>;
