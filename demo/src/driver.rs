//! Driver that moves messages between participants and keeps proposing.
//!
//! Every participant's outbound stream is forwarded to every other online
//! participant. On each tick the driver lets lagging participants catch up
//! from the others, then has every online participant propose its craving
//! for its next undecided day.

use std::{collections::HashMap, pin::pin, sync::Arc, time::Duration};

use fbas::SlotId;
use futures::StreamExt;
use rand::{SeedableRng, rngs::StdRng};
use tokio::{task::JoinHandle, time::interval};
use tracing::debug;

use crate::{
    food::Food,
    participant::SharedParticipant,
    status::{DriverStatus, StatusSender},
};

/// Number of decisions kept in the status history.
const HISTORY: usize = 8;

/// Configuration for the driver.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Interval between ticks.
    pub tick_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { tick_interval: Duration::from_millis(200) }
    }
}

/// Drives the demo.
pub struct Driver {
    /// All participants.
    participants: Vec<SharedParticipant>,
    /// Configuration.
    config: DriverConfig,
    /// Status sender for TUI updates.
    status_tx: StatusSender,
}

impl Driver {
    /// Creates a new driver.
    pub fn new(
        participants: Vec<SharedParticipant>,
        config: DriverConfig,
        status_tx: StatusSender,
    ) -> Self {
        Self { participants, config, status_tx }
    }

    /// Spawns one forwarding task per participant.
    pub fn spawn_routes(&self) -> Vec<JoinHandle<()>> {
        self.participants
            .iter()
            .map(|from| {
                let from = Arc::clone(from);
                let to: Vec<SharedParticipant> = self
                    .participants
                    .iter()
                    .filter(|p| p.id() != from.id())
                    .map(Arc::clone)
                    .collect();
                tokio::spawn(async move {
                    let mut outbound = pin!(from.conductor().outbound());
                    while let Some(msg) = outbound.next().await {
                        if !from.is_online() {
                            continue;
                        }
                        for peer in to.iter().filter(|p| p.is_online()) {
                            // Messages for days a lagging peer has not reached yet are
                            // rejected; catch-up brings it forward.
                            if let Err(e) = peer.conductor().handle(msg.clone()).await {
                                debug!(
                                    from = from.id(),
                                    to = peer.id(),
                                    error = %e,
                                    "message rejected"
                                );
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Spawns the driver as a background task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Sends a status update to the TUI.
    fn update_status(&self, action: String, decided_through: SlotId, history: Vec<(SlotId, Food)>) {
        let _ = self.status_tx.send(DriverStatus { action, decided_through, history });
    }

    /// Runs the driver loop.
    async fn run(&self) {
        let mut ticker = interval(self.config.tick_interval);
        let mut rng = StdRng::from_entropy();
        let mut cravings: HashMap<(usize, SlotId), Food> = HashMap::new();

        self.update_status("Initializing...".to_string(), 0, Vec::new());

        loop {
            ticker.tick().await;

            self.catch_up().await;

            let mut proposals = Vec::new();
            for participant in self.participants.iter().filter(|p| p.is_online()) {
                let day = participant.next_day().await;
                let food = *cravings
                    .entry((participant.id(), day))
                    .or_insert_with(|| Food::random(&mut rng));
                if participant.propose(day, food).await.is_ok() {
                    proposals.push(format!("P{} wants {food}", participant.id()));
                }
            }
            let decided_through = self.decided_through().await;
            cravings.retain(|(_, day), _| *day > decided_through);

            let action = if proposals.is_empty() {
                "Everyone is offline".to_string()
            } else {
                format!("Day {}: {}", decided_through + 1, proposals.join(", "))
            };
            let history = self.history(decided_through).await;
            self.update_status(action, decided_through, history);
        }
    }

    /// Feeds every online participant the decisions it missed.
    async fn catch_up(&self) {
        let online: Vec<&SharedParticipant> =
            self.participants.iter().filter(|p| p.is_online()).collect();
        for participant in &online {
            let after = participant.next_day().await - 1;
            for peer in online.iter().filter(|p| p.id() != participant.id()) {
                for msg in peer.conductor().decisions_after(after).await {
                    let slot = msg.slot;
                    if let Err(e) = participant.conductor().handle(msg).await {
                        debug!(
                            participant = participant.id(),
                            slot,
                            error = %e,
                            "catch-up message rejected"
                        );
                    }
                }
            }
        }
    }

    /// Highest day decided by any online participant.
    async fn decided_through(&self) -> SlotId {
        let mut highest = 0;
        for participant in self.participants.iter().filter(|p| p.is_online()) {
            highest = highest.max(participant.next_day().await - 1);
        }
        highest
    }

    /// The last few decisions up to `through`, from whoever has them.
    async fn history(&self, through: SlotId) -> Vec<(SlotId, Food)> {
        let after = through.saturating_sub(HISTORY as SlotId);
        for participant in &self.participants {
            if participant.next_day().await - 1 == through {
                return participant
                    .conductor()
                    .externalized_after(after)
                    .await
                    .into_iter()
                    .map(|(slot, ext)| (slot, ext.c.value))
                    .collect();
            }
        }
        Vec::new()
    }
}
