//! Status channel for communicating driver activity to the TUI.

use fbas::SlotId;
use tokio::sync::watch;

use crate::food::Food;

/// Status message from the driver.
#[derive(Debug, Clone, Default)]
pub struct DriverStatus {
    /// Current action description.
    pub action: String,
    /// Highest day decided by any online participant.
    pub decided_through: SlotId,
    /// Most recent decisions, oldest first.
    pub history: Vec<(SlotId, Food)>,
}

/// Sender for driver status updates.
pub type StatusSender = watch::Sender<DriverStatus>;

/// Receiver for driver status updates.
pub type StatusReceiver = watch::Receiver<DriverStatus>;

/// Creates a new status channel.
pub fn channel() -> (StatusSender, StatusReceiver) {
    watch::channel(DriverStatus::default())
}
