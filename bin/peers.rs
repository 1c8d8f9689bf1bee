//! Outbound transport to peer nodes.
//!
//! Every message the conductor produces is POSTed to each peer. Peers that
//! keep failing are skipped by the broadcaster until the catch-up poller,
//! which keeps probing every peer, reaches them again.

use std::{
    collections::HashMap,
    pin::pin,
    sync::Arc,
    time::{Duration, Instant},
};

use fbas::{Msg, SlotId};
use futures::{StreamExt, future::join_all};
use serde::{Deserialize, Serialize};
use tokio::{sync::RwLock, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{rpc::NodeConductor, value::BlockId};

/// Consecutive failures after which a peer is considered unhealthy.
const UNHEALTHY_AFTER: u32 = 3;

/// Tracked health status of a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHealth {
    /// Peer URL.
    pub url: String,
    /// Whether the peer is currently healthy.
    pub healthy: bool,
    /// Last successful request time.
    #[serde(skip)]
    pub last_seen: Option<Instant>,
    /// Number of consecutive failures.
    pub consecutive_failures: u32,
}

impl PeerHealth {
    /// Creates a new peer health tracker. Peers start out healthy.
    pub const fn new(url: String) -> Self {
        Self { url, healthy: true, last_seen: None, consecutive_failures: 0 }
    }

    /// Records a successful request.
    pub fn mark_healthy(&mut self) {
        self.healthy = true;
        self.last_seen = Some(Instant::now());
        self.consecutive_failures = 0;
    }

    /// Records a failed request.
    pub fn mark_failed(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= UNHEALTHY_AFTER {
            self.healthy = false;
        }
    }
}

/// HTTP client for the peer set.
#[derive(Debug, Clone)]
pub struct Peers {
    /// Map of peer URL to health status.
    peers: Arc<RwLock<HashMap<String, PeerHealth>>>,
    /// HTTP client.
    client: reqwest::Client,
}

impl Peers {
    /// Creates a client for `urls`.
    pub fn new(urls: Vec<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let peers = urls.into_iter().map(|url| (url.clone(), PeerHealth::new(url))).collect();
        Ok(Self {
            peers: Arc::new(RwLock::new(peers)),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    /// Sends `msg` to every healthy peer concurrently.
    pub async fn broadcast(&self, msg: &Msg<BlockId>) {
        let targets: Vec<String> = {
            let peers = self.peers.read().await;
            peers.values().filter(|peer| peer.healthy).map(|peer| peer.url.clone()).collect()
        };
        let sends = targets.iter().map(|url| async move {
            let sent = self.client.post(format!("{url}/scp")).json(msg).send().await;
            (url, sent.and_then(|response| response.error_for_status()))
        });
        for (url, result) in join_all(sends).await {
            match result {
                Ok(_) => self.record(url, true).await,
                Err(e) => {
                    debug!(peer = %url, error = %e, "send failed");
                    self.record(url, false).await;
                }
            }
        }
    }

    /// Fetches every decision `url` made above slot `after`.
    pub async fn fetch_decisions(
        &self,
        url: &str,
        after: SlotId,
    ) -> Result<Vec<Msg<BlockId>>, reqwest::Error> {
        let result = async {
            self.client
                .get(format!("{url}/externalized"))
                .query(&[("after", after)])
                .send()
                .await?
                .error_for_status()?
                .json::<Vec<Msg<BlockId>>>()
                .await
        }
        .await;
        self.record(url, result.is_ok()).await;
        result
    }

    /// Returns a sorted list of healthy peer URLs.
    pub async fn healthy_peers(&self) -> Vec<String> {
        let peers = self.peers.read().await;
        let mut healthy: Vec<_> =
            peers.values().filter(|p| p.healthy).map(|p| p.url.clone()).collect();
        healthy.sort();
        healthy
    }

    /// Returns all peer health statuses, sorted by URL.
    pub async fn all_peers(&self) -> Vec<PeerHealth> {
        let peers = self.peers.read().await;
        let mut all: Vec<_> = peers.values().cloned().collect();
        all.sort_by(|a, b| a.url.cmp(&b.url));
        all
    }

    async fn record(&self, url: &str, ok: bool) {
        let mut peers = self.peers.write().await;
        let Some(peer) = peers.get_mut(url) else { return };
        let was_healthy = peer.healthy;
        if ok {
            peer.mark_healthy();
        } else {
            peer.mark_failed();
        }
        if was_healthy != peer.healthy {
            if peer.healthy {
                info!(peer = %url, "peer recovered");
            } else {
                warn!(peer = %url, failures = peer.consecutive_failures, "peer unhealthy");
            }
        }
    }

    /// Spawns the task forwarding every outbound message to the peers.
    pub fn spawn_broadcaster(self, conductor: NodeConductor) -> JoinHandle<()> {
        let outbound = conductor.outbound();
        tokio::spawn(async move {
            let mut outbound = pin!(outbound);
            while let Some(msg) = outbound.next().await {
                self.broadcast(&msg).await;
            }
        })
    }

    /// Spawns the task pulling missed decisions from every peer and feeding
    /// them through the node.
    pub fn spawn_catchup(self, conductor: NodeConductor, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let after = conductor.last_externalized().await.map_or(0, |(slot, _)| slot);
                let urls: Vec<String> = self.peers.read().await.keys().cloned().collect();
                for url in urls {
                    let decisions = match self.fetch_decisions(&url, after).await {
                        Ok(decisions) => decisions,
                        Err(e) => {
                            debug!(peer = %url, error = %e, "catch-up failed");
                            continue;
                        }
                    };
                    for msg in decisions {
                        let slot = msg.slot;
                        if let Err(e) = conductor.handle(msg).await {
                            debug!(peer = %url, slot, error = %e, "catch-up message rejected");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_health_threshold() {
        let mut peer = PeerHealth::new("http://localhost:8080".to_string());
        assert!(peer.healthy);

        peer.mark_failed();
        peer.mark_failed();
        assert!(peer.healthy);
        peer.mark_failed();
        assert!(!peer.healthy);
        assert_eq!(peer.consecutive_failures, 3);

        peer.mark_healthy();
        assert!(peer.healthy);
        assert!(peer.last_seen.is_some());
        assert_eq!(peer.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_record_updates_healthy_peers() {
        let peers = Peers::new(
            vec!["http://a:8080".to_string(), "http://b:8080".to_string()],
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(peers.healthy_peers().await, vec!["http://a:8080", "http://b:8080"]);

        for _ in 0..UNHEALTHY_AFTER {
            peers.record("http://b:8080", false).await;
        }
        assert_eq!(peers.healthy_peers().await, vec!["http://a:8080"]);

        peers.record("http://b:8080", true).await;
        assert_eq!(peers.all_peers().await.iter().filter(|p| p.healthy).count(), 2);
    }
}
