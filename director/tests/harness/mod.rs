#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, head, post},
};
use axum_server::Server;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use common::schemas::{
    Capabilities, FederationDiscovery, HealthResponse, HealthStatus, NamespaceAd, ServerAd,
    ServerKind,
};
use common::time_utils::utc_now_ms;

use director::core::ads::AdStore;
use director::core::filter::FilterRegistry;
use director::core::health::{HealthConfig, HealthOrchestrator, HttpHealthBackend};
use director::core::metrics;
use director::core::routes::{
    advertise, federation_discovery, gossip, health, list_servers, prometheus_metrics,
    redirect_object,
};
use director::core::stat::{HttpStatBackend, StatConfig, StatRegistry};
use director::core::state::DirectorState;
use director::core::steering::{SortMethod, Steering, SteeringConfig};
use director::core::downtime::DowntimeDb;
use director::core::token::{AdVerifier, HmacTokenSigner, InsecureAdVerifier, RedirectTokenSigner};

/// Initialize tracing for tests
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it returns true or `timeout_ms` elapses.
pub async fn wait_until<F, Fut>(timeout_ms: u64, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if check().await? {
            return Ok(());
        }
        if Instant::now() > deadline {
            bail!("condition not met within {timeout_ms}ms");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn mk_ad(name: &str, kind: ServerKind, url: &str, ns_paths: &[&str]) -> ServerAd {
    ServerAd {
        name: name.to_string(),
        kind,
        url: url.trim_end_matches('/').to_string(),
        auth_url: None,
        web_url: None,
        from_topology: false,
        received_from_peer: false,
        signed_by_key_id: b"test-key".to_vec(),
        received_at: utc_now_ms(),
        caps: Capabilities {
            public_reads: true,
            reads: true,
            writes: kind == ServerKind::Origin,
            listings: kind == ServerKind::Origin,
            direct_reads: true,
        },
        io_load: 0.0,
        health_status: HealthStatus::Unknown,
        last_probe_at: None,
        latitude: None,
        longitude: None,
        namespaces: ns_paths
            .iter()
            .map(|p| NamespaceAd {
                path: p.to_string(),
                caps: Capabilities {
                    public_reads: true,
                    reads: true,
                    writes: true,
                    listings: true,
                    direct_reads: true,
                },
                token_issuers: vec![],
                token_generation: None,
                from_topology: false,
            })
            .collect(),
    }
}

// ---- fake origin / cache server ----

#[derive(Clone)]
pub struct FakeOriginState {
    pub health_calls: Arc<AtomicU64>,
    pub stat_calls: Arc<AtomicU64>,
    pub present: Arc<Mutex<HashSet<String>>>,
}

async fn fake_health(State(state): State<FakeOriginState>) -> Json<HealthResponse> {
    state.health_calls.fetch_add(1, Ordering::SeqCst);
    Json(HealthResponse {
        message: "origin is healthy".to_string(),
    })
}

async fn fake_stat(
    Path(path): Path<String>,
    State(state): State<FakeOriginState>,
) -> StatusCode {
    state.stat_calls.fetch_add(1, Ordering::SeqCst);
    let key = format!("/{}", path.trim_start_matches('/'));
    if state.present.lock().unwrap().contains(&key) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

pub struct FakeOrigin {
    pub base_url: String,
    pub state: FakeOriginState,
    pub shutdown_tx: watch::Sender<bool>,
    pub handle: JoinHandle<Result<(), anyhow::Error>>,
}

impl FakeOrigin {
    pub fn health_calls(&self) -> u64 {
        self.state.health_calls.load(Ordering::SeqCst)
    }

    pub fn stat_calls(&self) -> u64 {
        self.state.stat_calls.load(Ordering::SeqCst)
    }

    pub fn add_object(&self, path: &str) {
        self.state.present.lock().unwrap().insert(path.to_string());
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
        let _ = self.handle.await;
        Ok(())
    }
}

/// Spawn a minimal origin exposing the health and object-stat surface the
/// director probes.
pub async fn spawn_origin(objects: &[&str]) -> Result<FakeOrigin> {
    let state = FakeOriginState {
        health_calls: Arc::new(AtomicU64::new(0)),
        stat_calls: Arc::new(AtomicU64::new(0)),
        present: Arc::new(Mutex::new(
            objects.iter().map(|s| s.to_string()).collect(),
        )),
    };

    let app = Router::new()
        .route("/api/v1.0/health", get(fake_health))
        .route("/api/v1.0/objects/{*path}", head(fake_stat))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let base_url = format!("http://{}", addr);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let server = Server::from_tcp(listener.into_std()?).serve(app.into_make_service());
        tokio::select! {
            res = server => res.map_err(anyhow::Error::from),
            _ = shutdown_rx.changed() => Ok(()),
        }
    });

    Ok(FakeOrigin {
        base_url,
        state,
        shutdown_tx,
        handle,
    })
}

// ---- in-process director ----

pub struct DirectorOptions {
    pub startup_grace: Duration,
    pub ad_lifetime: Duration,
    pub sort_method: SortMethod,
    pub presence_capacity: usize,
    pub health_interval: Duration,
    pub health_grace: Duration,
    pub sign_redirects: bool,
    /// key_id -> secret; None disables signature enforcement.
    pub advertise_keys: Option<HashMap<String, Vec<u8>>>,
}

impl Default for DirectorOptions {
    fn default() -> Self {
        DirectorOptions {
            startup_grace: Duration::ZERO,
            ad_lifetime: Duration::from_secs(60),
            sort_method: SortMethod::Distance,
            presence_capacity: 16,
            health_interval: Duration::from_millis(50),
            health_grace: Duration::from_millis(500),
            sign_redirects: false,
            advertise_keys: None,
        }
    }
}

pub struct TestDirector {
    pub base_url: String,
    pub store: Arc<AdStore>,
    pub filter: Arc<FilterRegistry>,
    pub stats: Arc<StatRegistry>,
    pub orchestrator: Arc<HealthOrchestrator>,
    pub shutdown_tx: watch::Sender<bool>,
    pub handle: JoinHandle<Result<(), anyhow::Error>>,
}

impl TestDirector {
    pub fn url(&self) -> &str {
        &self.base_url
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
        let _ = self.handle.await;
        Ok(())
    }
}

/// Assemble a director with real HTTP probe backends and serve it on an
/// ephemeral port.
pub async fn spawn_director(opts: DirectorOptions) -> Result<TestDirector> {
    let http_client = reqwest::Client::new();
    let store = Arc::new(AdStore::new());
    let filter = Arc::new(FilterRegistry::new());
    let stats = Arc::new(StatRegistry::new(
        StatConfig {
            presence_capacity: opts.presence_capacity,
            ..Default::default()
        },
        Arc::new(HttpStatBackend::new(http_client.clone())),
    ));

    metrics::attach_server_count_hooks(&store);
    {
        let stats = Arc::clone(&stats);
        store.on_evict(move |ad, _reason| stats.purge(&ad.url));
    }
    let orchestrator = HealthOrchestrator::new(
        HealthConfig {
            interval: opts.health_interval,
            probe_deadline: Duration::from_secs(2),
            grace: opts.health_grace,
            ..Default::default()
        },
        Arc::new(HttpHealthBackend::new(
            http_client.clone(),
            Duration::from_millis(500),
        )),
    );
    orchestrator.attach(&store);

    let signer: Option<Arc<dyn RedirectTokenSigner>> = if opts.sign_redirects {
        Some(Arc::new(HmacTokenSigner::new(
            "test-kid",
            b"test-secret".to_vec(),
        )))
    } else {
        None
    };

    let steering = Arc::new(Steering::new(
        SteeringConfig {
            sort_method: opts.sort_method,
            ..Default::default()
        },
        Arc::clone(&store),
        Arc::clone(&filter),
        Arc::clone(&stats),
        signer,
    ));

    let verifier: Arc<dyn AdVerifier> = match &opts.advertise_keys {
        Some(keys) => Arc::new(director::core::token::HmacAdVerifier::new(keys.clone())),
        None => Arc::new(InsecureAdVerifier),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let base_url = format!("http://{}", addr);

    let state = DirectorState {
        http_client,
        store: Arc::clone(&store),
        filter: Arc::clone(&filter),
        stats: Arc::clone(&stats),
        steering,
        verifier,
        downtime_db: Arc::new(DowntimeDb::open_in_memory()?),
        discovery: FederationDiscovery {
            director_endpoint: base_url.clone(),
            namespace_registration_endpoint: "https://registry.test".to_string(),
            broker_endpoint: String::new(),
            jwks_uri: format!("{base_url}/.well-known/issuer.jwks"),
        },
        ad_lifetime: opts.ad_lifetime,
        started_at: Instant::now(),
        startup_grace: opts.startup_grace,
    };

    let app = Router::new()
        .route("/.well-known/pelican-configuration", get(federation_discovery))
        .route("/api/v1.0/health", get(health))
        .route("/api/v1.0/director/object/{*path}", get(redirect_object))
        .route("/api/v1.0/director/advertise", post(advertise))
        .route("/api/v1.0/director/servers", get(list_servers))
        .route("/api/v1.0/director/gossip", post(gossip))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let server = Server::from_tcp(listener.into_std()?).serve(app.into_make_service());
        tokio::select! {
            res = server => res.map_err(anyhow::Error::from),
            _ = shutdown_rx.changed() => Ok(()),
        }
    });

    Ok(TestDirector {
        base_url,
        store,
        filter,
        stats,
        orchestrator,
        shutdown_tx,
        handle,
    })
}
