use async_trait::async_trait;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tracing::debug;

use common::api_error::ApiError;
use common::constants::OBJECT_STAT_ENDPOINT;
use common::time_utils::utc_now_ms;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatStatus {
    Present,
    Absent,
    Error,
    Timeout,
}

/// Outcome of a point-in-time existence probe for one object at one server.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StatResult {
    pub status: StatStatus,
    pub size_bytes: Option<u64>,
    pub mtime_ms: Option<i128>,
    pub observed_at: i128,
}

impl StatResult {
    pub fn of(status: StatStatus) -> Self {
        StatResult {
            status,
            size_bytes: None,
            mtime_ms: None,
            observed_at: utc_now_ms(),
        }
    }

    pub fn present(size_bytes: Option<u64>, mtime_ms: Option<i128>) -> Self {
        StatResult {
            status: StatStatus::Present,
            size_bytes,
            mtime_ms,
            observed_at: utc_now_ms(),
        }
    }
}

/// Probe transport. The orchestration below owns caching, coalescing and
/// deadlines; implementations just answer one question about one object.
#[async_trait]
pub trait StatBackend: Send + Sync {
    async fn stat(&self, server_url: &str, object_path: &str, deadline: Duration) -> StatResult;
}

/// Production backend: HEAD against the server's object API.
pub struct HttpStatBackend {
    client: reqwest::Client,
}

impl HttpStatBackend {
    pub fn new(client: reqwest::Client) -> Self {
        HttpStatBackend { client }
    }
}

#[async_trait]
impl StatBackend for HttpStatBackend {
    async fn stat(&self, server_url: &str, object_path: &str, deadline: Duration) -> StatResult {
        let url = format!("{server_url}{OBJECT_STAT_ENDPOINT}{object_path}");
        match self.client.head(&url).timeout(deadline).send().await {
            Ok(resp) if resp.status().is_success() => {
                let size = resp
                    .headers()
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                StatResult::present(size, None)
            }
            Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                StatResult::of(StatStatus::Absent)
            }
            Ok(resp) => {
                debug!(%url, status = %resp.status(), "stat probe got unexpected status");
                StatResult::of(StatStatus::Error)
            }
            Err(e) if e.is_timeout() => StatResult::of(StatStatus::Timeout),
            Err(e) => {
                debug!(%url, "stat probe failed: {e}");
                StatResult::of(StatStatus::Error)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct StatConfig {
    /// Per-server cache bound; LRU beyond this.
    pub presence_capacity: usize,
    /// How long a Present/Absent result stays fresh.
    pub fresh_window: Duration,
    /// Shorter freshness for Error results, enough to absorb a thundering
    /// herd without pinning a server as broken.
    pub error_window: Duration,
    /// Global cap on concurrently outstanding probes; beyond it callers get
    /// an immediate overload error instead of queueing.
    pub max_concurrency: usize,
}

impl Default for StatConfig {
    fn default() -> Self {
        StatConfig {
            presence_capacity: 100,
            fresh_window: Duration::from_secs(300),
            error_window: Duration::from_secs(15),
            max_concurrency: 64,
        }
    }
}

struct CachedStat {
    result: StatResult,
    stored_at: Instant,
}

struct ServerStats {
    lru: Mutex<LruCache<String, CachedStat>>,
    inflight: Mutex<HashMap<String, watch::Receiver<Option<StatResult>>>>,
}

impl ServerStats {
    fn new(capacity: usize) -> Self {
        ServerStats {
            lru: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

/// Per-server bounded caches of stat results plus a single-flight table:
/// concurrent probes for the same `(server, path)` collapse into one
/// outbound operation and share its result.
pub struct StatRegistry {
    config: StatConfig,
    backend: Arc<dyn StatBackend>,
    servers: Mutex<HashMap<String, Arc<ServerStats>>>,
    permits: Arc<Semaphore>,
}

impl StatRegistry {
    pub fn new(config: StatConfig, backend: Arc<dyn StatBackend>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency));
        StatRegistry {
            config,
            backend,
            servers: Mutex::new(HashMap::new()),
            permits,
        }
    }

    fn server(&self, server_url: &str) -> Arc<ServerStats> {
        let mut servers = self.servers.lock().unwrap();
        servers
            .entry(server_url.to_string())
            .or_insert_with(|| Arc::new(ServerStats::new(self.config.presence_capacity)))
            .clone()
    }

    fn fresh(&self, cached: &CachedStat) -> bool {
        let window = match cached.result.status {
            StatStatus::Error => self.config.error_window,
            _ => self.config.fresh_window,
        };
        cached.stored_at.elapsed() < window
    }

    /// Probe one object at one server, bounded by `deadline`.
    ///
    /// A fresh cached result short-circuits; otherwise the caller either
    /// joins an in-flight probe or becomes the one performing it. Timeouts
    /// are returned but never cached.
    pub async fn probe(
        &self,
        server_url: &str,
        object_path: &str,
        deadline: Duration,
    ) -> Result<StatResult, ApiError> {
        let stats = self.server(server_url);

        {
            let mut lru = stats.lru.lock().unwrap();
            if let Some(cached) = lru.get(object_path)
                && self.fresh(cached)
            {
                return Ok(cached.result.clone());
            }
        }

        // Join an existing flight if one is already out for this key,
        // otherwise become the task performing it.
        enum Role {
            Waiter(watch::Receiver<Option<StatResult>>),
            Owner(watch::Sender<Option<StatResult>>),
        }
        let role = {
            let mut inflight = stats.inflight.lock().unwrap();
            match inflight.get(object_path) {
                Some(rx) => Role::Waiter(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(object_path.to_string(), rx);
                    Role::Owner(tx)
                }
            }
        };
        let tx = match role {
            Role::Waiter(rx) => return Ok(Self::wait_for_flight(rx).await),
            Role::Owner(tx) => tx,
        };

        // We own the flight. Fail fast if the probe pool is exhausted.
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                stats.inflight.lock().unwrap().remove(object_path);
                return Err(ApiError::Overloaded { retry_after: 1 });
            }
        };

        let result = match tokio::time::timeout(
            deadline,
            self.backend.stat(server_url, object_path, deadline),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => StatResult::of(StatStatus::Timeout),
        };
        drop(permit);

        if result.status != StatStatus::Timeout {
            let mut lru = stats.lru.lock().unwrap();
            lru.put(
                object_path.to_string(),
                CachedStat {
                    result: result.clone(),
                    stored_at: Instant::now(),
                },
            );
        }

        stats.inflight.lock().unwrap().remove(object_path);
        // Waiters cloned the receiver before we got here; deliver last.
        let _ = tx.send(Some(result.clone()));

        Ok(result)
    }

    async fn wait_for_flight(mut rx: watch::Receiver<Option<StatResult>>) -> StatResult {
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                // The probing task went away without publishing.
                return StatResult::of(StatStatus::Timeout);
            }
        }
    }

    /// Drop all state for a server. Called from the ad store's eviction
    /// hook; an in-flight probe is allowed to finish and still serves its
    /// current waiters, but its result is cached nowhere.
    pub fn purge(&self, server_url: &str) {
        let removed = self.servers.lock().unwrap().remove(server_url);
        if let Some(stats) = removed {
            stats.lru.lock().unwrap().clear();
            debug!(server = server_url, "purged stat cache");
        }
    }

    pub fn server_count(&self) -> usize {
        self.servers.lock().unwrap().len()
    }

    pub fn entry_count(&self) -> usize {
        let servers: Vec<Arc<ServerStats>> =
            self.servers.lock().unwrap().values().cloned().collect();
        servers.iter().map(|s| s.lru.lock().unwrap().len()).sum()
    }

    pub fn inflight_count(&self) -> usize {
        let servers: Vec<Arc<ServerStats>> =
            self.servers.lock().unwrap().values().cloned().collect();
        servers
            .iter()
            .map(|s| s.inflight.lock().unwrap().len())
            .sum()
    }

    /// Cached entries for one server, for introspection and tests.
    pub fn cached_len(&self, server_url: &str) -> usize {
        let servers = self.servers.lock().unwrap();
        servers
            .get(server_url)
            .map(|s| s.lru.lock().unwrap().len())
            .unwrap_or(0)
    }
}
