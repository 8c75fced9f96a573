use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use common::constants::GOSSIP_ENDPOINT;
use common::schemas::{GossipBatch, ServerAd, ServerKind};

use crate::core::ads::AdStore;

#[derive(Clone, Debug)]
pub struct GossipConfig {
    pub peers: Vec<String>,
    pub interval: Duration,
    /// TTL for peer-received ads, shorter than native receipts so replica
    /// failures age out quickly.
    pub peer_ad_lifetime: Duration,
    pub push_deadline: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        GossipConfig {
            peers: Vec::new(),
            interval: Duration::from_secs(60),
            peer_ad_lifetime: Duration::from_secs(5 * 60),
            push_deadline: Duration::from_secs(10),
        }
    }
}

/// Store a batch of peer-replicated ads. Ownership conflicts resolve to the
/// newest receipt; losers are dropped. Peer ads never start supervisors —
/// the insertion hooks check provenance.
pub async fn ingest_peer_ads(
    store: &AdStore,
    batch: GossipBatch,
    peer_ad_lifetime: Duration,
) -> usize {
    let mut stored = 0usize;
    for mut ad in batch.ads {
        ad.received_from_peer = true;

        if let Some(existing) = store.get(ad.kind, &ad.name) {
            if existing.received_at >= ad.received_at {
                debug!(
                    server = %ad.name,
                    peer = %batch.director,
                    "ignoring peer ad older than the one we hold"
                );
                continue;
            }
            if !existing.received_from_peer {
                // A replica claims an ad we received directly. Newest receipt
                // wins, but this is worth being loud about.
                error!(
                    server = %ad.name,
                    peer = %batch.director,
                    "ownership collision: peer replicated an ad this director owns"
                );
            }
        }

        store.upsert(ad, peer_ad_lifetime).await;
        stored += 1;
    }
    stored
}

/// Periodically push the ads this replica owns to every known peer. One
/// slow or dead peer never blocks the others.
pub async fn gossip_push_loop(
    store: Arc<AdStore>,
    client: reqwest::Client,
    config: GossipConfig,
    self_endpoint: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut tick = tokio::time::interval(config.interval);

    loop {
        tokio::select! {
            _ = tick.tick() => {},
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
        }

        let owned: Vec<ServerAd> = store
            .list(&[ServerKind::Origin, ServerKind::Cache])
            .into_iter()
            .filter(|ad| !ad.received_from_peer)
            .collect();
        if owned.is_empty() {
            continue;
        }

        for peer in &config.peers {
            let batch = GossipBatch {
                director: self_endpoint.clone(),
                ads: owned.clone(),
            };
            let url = format!("{}{}", peer.trim_end_matches('/'), GOSSIP_ENDPOINT);
            match client
                .post(&url)
                .json(&batch)
                .timeout(config.push_deadline)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    debug!(peer = %peer, ads = owned.len(), "gossip push ok");
                }
                Ok(resp) => warn!(peer = %peer, status = %resp.status(), "gossip push rejected"),
                Err(e) => warn!(peer = %peer, "gossip push failed: {e}"),
            }
        }
    }

    info!("gossip push loop stopped");
    Ok(())
}
