//! Federated Byzantine agreement node over HTTP.
#![allow(unreachable_pub, dead_code, clippy::missing_const_for_fn, clippy::option_if_let_else)]
//!
//! This binary runs one fbas node with:
//! - Quorum slices naming peer URLs
//! - Message exchange via `POST /scp` on every peer
//! - A catch-up poller that pulls decisions a node missed
//!
//! ## Usage
//!
//! ```bash
//! # Three nodes, each trusting both others
//! fbas-node --bind-addr 127.0.0.1:8081 --slice http://127.0.0.1:8082,http://127.0.0.1:8083
//!
//! # Any one of two peers is enough
//! fbas-node --bind-addr 127.0.0.1:8081 --slice http://127.0.0.1:8082 --slice http://127.0.0.1:8083
//!
//! # Start with config file
//! fbas-node --config node.toml
//!
//! # Propose a value
//! curl -XPOST localhost:8081/nominate -H 'content-type: application/json' \
//!     -d '{"slot":1,"value":"0x00...01"}'
//! ```

mod config;
mod peers;
mod rpc;
mod value;

use commonware_cryptography::{Signer as _, ed25519};
use fbas::{Conductor, ConductorConfig, Node, NodeConfig, NodeId};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{config::Config, peers::Peers, rpc::create_router, value::BlockId};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;
    info!(?config, "loaded configuration");

    // Create ed25519 signer from identity seed
    let signer = ed25519::PrivateKey::from_seed(config.identity);
    let public_key = signer.public_key();
    info!(identity = %hex::encode(public_key.as_ref()), "initialized signer");

    // Build the node from the configured slices
    let node_id = NodeId::new(config.node_id());
    let slices = config.slices.iter().map(|slice| slice.iter().cloned().map(NodeId::new));
    let node = Node::<BlockId>::new(node_id.clone(), slices)?.with_config(NodeConfig {
        round_duration: config.round_duration(),
        deferred_update_interval: config.deferred_update_interval(),
    });
    info!(node = %node_id, slices = node.slices().len(), "node ready");

    // Create and start the conductor
    let conductor = Conductor::new(node, ConductorConfig::default());
    conductor.start().await;

    // Wire up the peer transport
    let peers = Peers::new(config.peers(), config.request_timeout())?;
    let _broadcast_handle = peers.clone().spawn_broadcaster(conductor.clone());
    let _catchup_handle =
        peers.clone().spawn_catchup(conductor.clone(), config.catchup_interval());

    // Create router
    let router = create_router(conductor.clone(), peers);

    // Start HTTP server
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "starting HTTP server");

    // Serve with graceful shutdown
    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;

    // Stop conductor
    conductor.stop().await;
    info!("conductor stopped");

    Ok(())
}

/// Waits for SIGINT or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        }
        () = terminate => {
            info!("received SIGTERM, shutting down");
        }
    }
}
