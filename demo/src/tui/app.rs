//! Lunch room state shown by the TUI.

use super::input::Action;
use crate::{
    participant::{ParticipantView, SharedParticipant},
    status::{DriverStatus, StatusReceiver},
};

/// Application state for the TUI.
pub struct App {
    participants: Vec<SharedParticipant>,
    /// Snapshot of every participant, refreshed once per frame.
    views: Vec<ParticipantView>,
    status_rx: StatusReceiver,
    /// Latest driver status.
    status: DriverStatus,
    /// Index of the participant under the cursor.
    selected: usize,
    should_quit: bool,
}

impl App {
    /// Creates the app with the cursor on the first participant.
    pub fn new(participants: Vec<SharedParticipant>, status_rx: StatusReceiver) -> Self {
        Self {
            views: Vec::with_capacity(participants.len()),
            participants,
            status_rx,
            status: DriverStatus::default(),
            selected: 0,
            should_quit: false,
        }
    }

    /// Refreshes the participant snapshots and the driver status.
    pub async fn refresh(&mut self) {
        let mut views = Vec::with_capacity(self.participants.len());
        for participant in &self.participants {
            views.push(participant.get_view().await);
        }
        self.views = views;
        self.status = self.status_rx.borrow().clone();
    }

    /// Participant snapshots, in id order.
    pub fn views(&self) -> &[ParticipantView] {
        &self.views
    }

    /// Latest driver status.
    pub const fn status(&self) -> &DriverStatus {
        &self.status
    }

    /// Index of the participant under the cursor.
    pub const fn selected(&self) -> usize {
        self.selected
    }

    /// Applies a key action.
    pub fn apply(&mut self, action: Action) {
        let count = self.participants.len().max(1);
        match action {
            Action::Quit => self.should_quit = true,
            Action::Toggle(id) => self.toggle(id),
            Action::SelectNext => self.selected = (self.selected + 1) % count,
            Action::SelectPrev => self.selected = (self.selected + count - 1) % count,
            Action::ToggleSelected => {
                if let Some(participant) = self.participants.get(self.selected) {
                    participant.toggle();
                }
            }
        }
    }

    /// Takes participant `id` (1-indexed) offline, or brings it back.
    fn toggle(&self, id: usize) {
        if let Some(participant) = self.participants.iter().find(|p| p.id() == id) {
            participant.toggle();
        }
    }

    /// Returns whether the user asked to leave.
    pub const fn should_quit(&self) -> bool {
        self.should_quit
    }
}
