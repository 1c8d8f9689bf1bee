//! fbas demo binary with TUI visualization.
#![allow(unreachable_pub, dead_code, clippy::missing_const_for_fn)]
//!
//! A handful of coworkers agree on what to order for lunch each day. Each
//! one only waits for a threshold of the others, so taking a minority
//! offline (keys 1-9) stalls nobody, and a participant brought back online
//! catches up on the lunches it missed.

mod config;
mod driver;
mod food;
mod participant;
mod status;
mod tui;

use std::sync::Arc;

use clap::Parser;

use crate::{
    config::DemoConfig,
    driver::{Driver, DriverConfig},
    participant::{Participant, SharedParticipant},
    tui::App,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration
    let config = DemoConfig::parse();
    if config.participants < 2 {
        return Err("the demo needs at least two participants".into());
    }

    // Create participants
    let mut participants: Vec<SharedParticipant> = Vec::with_capacity(config.participants);
    for index in 0..config.participants {
        participants.push(Arc::new(Participant::new(index, &config)?));
    }

    // Start all conductors
    for participant in &participants {
        participant.start().await;
    }

    // Create status channel for driver -> TUI communication
    let (status_tx, status_rx) = status::channel();

    // Spawn the message routes and the driver
    let driver_config = DriverConfig { tick_interval: config.tick_interval() };
    let driver = Arc::new(Driver::new(participants.clone(), driver_config, status_tx));
    let routes = driver.spawn_routes();
    let driver_handle = driver.spawn();

    // Run TUI
    let app = App::new(participants.clone(), status_rx);
    tui::run(app).await?;

    driver_handle.abort();
    for route in routes {
        route.abort();
    }

    // Stop all conductors
    for participant in &participants {
        participant.stop().await;
    }

    Ok(())
}
