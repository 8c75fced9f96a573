use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::constants::HEALTH_ENDPOINT;
use common::schemas::{HealthStatus, ServerAd, ServerKind};

use crate::core::ads::{AdKey, AdStore};
use crate::core::metrics::HEALTH_TRANSITIONS;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    Slow,
    Failed,
}

/// Probe transport for the periodic liveness check.
#[async_trait]
pub trait HealthBackend: Send + Sync {
    async fn check(&self, server_url: &str, deadline: Duration) -> HealthOutcome;
}

pub struct HttpHealthBackend {
    client: reqwest::Client,
    slow_threshold: Duration,
}

impl HttpHealthBackend {
    pub fn new(client: reqwest::Client, slow_threshold: Duration) -> Self {
        HttpHealthBackend {
            client,
            slow_threshold,
        }
    }
}

#[async_trait]
impl HealthBackend for HttpHealthBackend {
    async fn check(&self, server_url: &str, deadline: Duration) -> HealthOutcome {
        let url = format!("{server_url}{HEALTH_ENDPOINT}");
        let started = Instant::now();
        match self.client.get(&url).timeout(deadline).send().await {
            Ok(resp) if resp.status().is_success() => {
                if started.elapsed() > self.slow_threshold {
                    HealthOutcome::Slow
                } else {
                    HealthOutcome::Healthy
                }
            }
            Ok(resp) => {
                debug!(%url, status = %resp.status(), "health probe got non-success status");
                HealthOutcome::Failed
            }
            Err(e) => {
                debug!(%url, "health probe failed: {e}");
                HealthOutcome::Failed
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct HealthConfig {
    pub interval: Duration,
    pub probe_deadline: Duration,
    /// Sliding window size (`n`).
    pub window: usize,
    /// Slow/partial failures within the window before Ok degrades (`k`).
    pub degraded_threshold: usize,
    /// How long an eviction waits for the probe loop to wind down.
    pub grace: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            interval: Duration::from_secs(15),
            probe_deadline: Duration::from_secs(5),
            window: 4,
            degraded_threshold: 2,
            grace: Duration::from_secs(5),
        }
    }
}

/// Advance the per-server health state machine by one observation.
///
/// `unknown → ok` on first success; `ok ↔ degraded` on k-of-n slow or
/// partial failures; `* → down` once the whole window is hard failures;
/// recovery from down walks back through `unknown`.
fn next_status(
    current: HealthStatus,
    window: &VecDeque<HealthOutcome>,
    config: &HealthConfig,
    outcome: HealthOutcome,
) -> HealthStatus {
    let bad = window
        .iter()
        .filter(|o| **o != HealthOutcome::Healthy)
        .count();
    let all_failed = window.len() >= config.window
        && window.iter().all(|o| *o == HealthOutcome::Failed);

    match outcome {
        HealthOutcome::Healthy => match current {
            HealthStatus::Down => HealthStatus::Unknown,
            HealthStatus::Unknown => HealthStatus::Ok,
            HealthStatus::Degraded => {
                if bad >= config.degraded_threshold {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Ok
                }
            }
            HealthStatus::Ok => HealthStatus::Ok,
        },
        HealthOutcome::Slow | HealthOutcome::Failed => {
            if current == HealthStatus::Down {
                return HealthStatus::Down;
            }
            if all_failed {
                HealthStatus::Down
            } else if bad >= config.degraded_threshold {
                HealthStatus::Degraded
            } else {
                current
            }
        }
    }
}

/// Supervises one liveness loop per owned advertisement. Loops are started
/// from the ad store's insertion hook and drained on eviction, bounded by
/// the grace window.
pub struct HealthOrchestrator {
    config: HealthConfig,
    backend: Arc<dyn HealthBackend>,
    running: Mutex<HashMap<AdKey, JoinHandle<()>>>,
}

impl HealthOrchestrator {
    pub fn new(config: HealthConfig, backend: Arc<dyn HealthBackend>) -> Arc<Self> {
        Arc::new(HealthOrchestrator {
            config,
            backend,
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Register this orchestrator's hooks. Must be called after the stat
    /// registry's hooks so eviction tears stat state down first.
    pub fn attach(self: &Arc<Self>, store: &Arc<AdStore>) {
        let orch = Arc::clone(self);
        let weak_store: Weak<AdStore> = Arc::downgrade(store);
        store.on_insert(move |ad, cancel| {
            if ad.received_from_peer {
                // Peer replicas own the probing for their own ads.
                return;
            }
            orch.start(weak_store.clone(), ad, cancel.clone());
        });

        let orch = Arc::clone(self);
        store.on_evict(move |ad, _reason| {
            orch.drain(ad);
        });
    }

    fn start(self: &Arc<Self>, store: Weak<AdStore>, ad: &ServerAd, cancel: CancellationToken) {
        let key = AdKey::of(ad);
        let orch = Arc::clone(self);
        let kind = ad.kind;
        let name = ad.name.clone();
        let url = ad.url.clone();

        let handle = tokio::spawn(async move {
            orch.probe_loop(store, kind, name, url, cancel).await;
        });

        // A replaced ad already had its loop cancelled by the store; dropping
        // the stale handle here is enough.
        if let Some(stale) = self.running.lock().unwrap().insert(key, handle) {
            drop(stale);
        }
    }

    fn drain(self: &Arc<Self>, ad: &ServerAd) {
        let key = AdKey::of(ad);
        let handle = self.running.lock().unwrap().remove(&key);
        let Some(handle) = handle else {
            return;
        };

        let grace = self.config.grace;
        let name = ad.name.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!(server = %name, "health probe loop did not stop within grace window");
            } else {
                debug!(server = %name, "health probe loop drained");
            }
        });
    }

    async fn probe_loop(
        self: Arc<Self>,
        store: Weak<AdStore>,
        kind: ServerKind,
        name: String,
        url: String,
        cancel: CancellationToken,
    ) {
        let mut window: VecDeque<HealthOutcome> = VecDeque::with_capacity(self.config.window);
        let mut status = HealthStatus::Unknown;
        let mut tick = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                o = self.backend.check(&url, self.config.probe_deadline) => o,
            };

            if outcome == HealthOutcome::Healthy && status == HealthStatus::Down {
                // Fresh start after recovery.
                window.clear();
            }
            window.push_back(outcome);
            while window.len() > self.config.window {
                window.pop_front();
            }

            let next = next_status(status, &window, &self.config, outcome);

            let Some(store) = store.upgrade() else { break };
            let Some(prev) = store.set_health(kind, &name, next) else {
                // The ad is gone; the eviction path will reap us shortly.
                break;
            };

            if prev != next {
                info!(server = %name, from = %prev, to = %next, "server health transition");
                HEALTH_TRANSITIONS
                    .with_label_values(&[&name, &prev.to_string(), &next.to_string()])
                    .inc();
            }
            status = next;
        }
    }

    pub fn len(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(outcomes: &[HealthOutcome]) -> VecDeque<HealthOutcome> {
        outcomes.iter().copied().collect()
    }

    fn config() -> HealthConfig {
        HealthConfig {
            window: 4,
            degraded_threshold: 2,
            ..Default::default()
        }
    }

    #[test]
    fn first_success_moves_unknown_to_ok() {
        let next = next_status(
            HealthStatus::Unknown,
            &window(&[HealthOutcome::Healthy]),
            &config(),
            HealthOutcome::Healthy,
        );
        assert_eq!(next, HealthStatus::Ok);
    }

    #[test]
    fn k_of_n_bad_probes_degrade() {
        let w = window(&[
            HealthOutcome::Healthy,
            HealthOutcome::Slow,
            HealthOutcome::Failed,
        ]);
        let next = next_status(HealthStatus::Ok, &w, &config(), HealthOutcome::Failed);
        assert_eq!(next, HealthStatus::Degraded);

        // One bad probe alone is not enough.
        let w = window(&[HealthOutcome::Healthy, HealthOutcome::Slow]);
        let next = next_status(HealthStatus::Ok, &w, &config(), HealthOutcome::Slow);
        assert_eq!(next, HealthStatus::Ok);
    }

    #[test]
    fn full_window_of_failures_is_down() {
        let w = window(&[HealthOutcome::Failed; 4]);
        let next = next_status(HealthStatus::Degraded, &w, &config(), HealthOutcome::Failed);
        assert_eq!(next, HealthStatus::Down);
    }

    #[test]
    fn recovery_walks_through_unknown() {
        let next = next_status(
            HealthStatus::Down,
            &window(&[HealthOutcome::Healthy]),
            &config(),
            HealthOutcome::Healthy,
        );
        assert_eq!(next, HealthStatus::Unknown);

        let next = next_status(
            HealthStatus::Unknown,
            &window(&[HealthOutcome::Healthy, HealthOutcome::Healthy]),
            &config(),
            HealthOutcome::Healthy,
        );
        assert_eq!(next, HealthStatus::Ok);
    }

    #[test]
    fn degraded_recovers_once_window_clears() {
        let w = window(&[
            HealthOutcome::Slow,
            HealthOutcome::Healthy,
            HealthOutcome::Healthy,
            HealthOutcome::Healthy,
        ]);
        let next = next_status(HealthStatus::Degraded, &w, &config(), HealthOutcome::Healthy);
        assert_eq!(next, HealthStatus::Ok);
    }

    #[test]
    fn down_stays_down_on_partial_failure() {
        let w = window(&[HealthOutcome::Failed, HealthOutcome::Slow]);
        let next = next_status(HealthStatus::Down, &w, &config(), HealthOutcome::Slow);
        assert_eq!(next, HealthStatus::Down);
    }
}
