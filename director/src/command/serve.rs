use axum::{
    Router,
    routing::{get, post},
};
use axum_server::Server;
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use common::schemas::FederationDiscovery;
use common::url_utils::parse_socket_addr;

use crate::core::ads::{self, AdStore};
use crate::core::downtime::{self, DowntimeDb};
use crate::core::filter::FilterRegistry;
use crate::core::gossip::{self, GossipConfig};
use crate::core::health::{HealthConfig, HealthOrchestrator, HttpHealthBackend};
use crate::core::ioload::{self, PrometheusIoSource};
use crate::core::metrics;
use crate::core::routes::{
    advertise, federation_discovery, gossip as gossip_route, health, list_servers,
    prometheus_metrics, redirect_object,
};
use crate::core::stat::{HttpStatBackend, StatConfig, StatRegistry};
use crate::core::state::DirectorState;
use crate::core::steering::{SortMethod, Steering, SteeringConfig};
use crate::core::token::{
    AdVerifier, HmacAdVerifier, HmacTokenSigner, InsecureAdVerifier, RedirectTokenSigner,
};
use crate::core::topology::{
    self, HttpTopologySource, TopologyConfig, TopologyImporter,
};

#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8444")]
    listen: String,

    /// Externally visible URL of this director
    #[arg(long, default_value = "https://director.example.com")]
    external_url: String,

    /// Namespace registry endpoint advertised in the discovery document
    #[arg(long, default_value = "https://registry.example.com")]
    registry_url: String,

    /// Broker endpoint advertised in the discovery document
    #[arg(long, default_value = "")]
    broker_url: String,

    /// JWKS endpoint advertised in the discovery document
    #[arg(long, default_value = "https://director.example.com/.well-known/issuer.jwks")]
    jwks_url: String,

    /// TTL for native advertisements (seconds)
    #[arg(long, default_value_t = 900)]
    ad_lifetime_secs: u64,

    /// Start-up warm-up window during which steering failures return 429 (seconds)
    #[arg(long, default_value_t = 360)]
    startup_grace_secs: u64,

    /// Legacy topology namespace manifest URL; topology import is off when unset
    #[arg(long)]
    topology_namespace_url: Option<String>,

    /// Legacy topology downtime feed URL
    #[arg(long, default_value = "")]
    topology_downtime_url: String,

    /// Cadence of topology re-import (seconds)
    #[arg(long, default_value_t = 600)]
    topology_reload_secs: u64,

    /// Skip origins listed by the topology feed
    #[arg(long, default_value_t = false)]
    disable_topology_origins: bool,

    /// Skip caches listed by the topology feed
    #[arg(long, default_value_t = false)]
    disable_topology_caches: bool,

    /// Skip the topology downtime feed
    #[arg(long, default_value_t = false)]
    disable_topology_downtime: bool,

    /// Per-server bound on cached object-presence probes
    #[arg(long, default_value_t = 100)]
    cache_presence_capacity: usize,

    /// Freshness window for cached probe results (seconds)
    #[arg(long, default_value_t = 300)]
    stat_fresh_secs: u64,

    /// Freshness window for cached probe errors (seconds)
    #[arg(long, default_value_t = 15)]
    stat_error_secs: u64,

    /// Global cap on concurrently outstanding probes
    #[arg(long, default_value_t = 64)]
    stat_max_concurrency: usize,

    /// Deadline for one object-presence probe (seconds)
    #[arg(long, default_value_t = 2)]
    stat_deadline_secs: u64,

    /// Candidates probed by strict-existence requests
    #[arg(long, default_value_t = 3)]
    strict_probe_count: usize,

    /// Primary ranking key: distance, load, or random
    #[arg(long, default_value = "distance")]
    cache_sort_method: String,

    /// Server names permanently excluded from routing (repeatable)
    #[arg(long)]
    filtered_servers: Vec<String>,

    /// Liveness probe interval (seconds)
    #[arg(long, default_value_t = 15)]
    health_probe_secs: u64,

    /// Liveness probe deadline (seconds)
    #[arg(long, default_value_t = 5)]
    health_probe_deadline_secs: u64,

    /// Grace window for draining a server's background work on eviction (seconds)
    #[arg(long, default_value_t = 5)]
    health_grace_secs: u64,

    /// Prometheus-compatible metrics backend for I/O load; scraping is off when unset
    #[arg(long)]
    prometheus_url: Option<String>,

    /// Peer director endpoints to replicate advertisements to (repeatable)
    #[arg(long)]
    peer: Vec<String>,

    /// Gossip push cadence (seconds)
    #[arg(long, default_value_t = 60)]
    gossip_interval_secs: u64,

    /// SQLite file holding locally declared downtimes
    #[arg(long, default_value = "./data/downtime.db")]
    downtime_db: PathBuf,

    /// HMAC secret for redirect tokens; redirects are unsigned when unset
    #[arg(long)]
    token_signing_key: Option<String>,

    /// Key id stamped into redirect token headers
    #[arg(long, default_value = "director-1")]
    token_key_id: String,

    /// Advertisement verification keys as key_id=secret (repeatable);
    /// signatures are not enforced when none are given
    #[arg(long)]
    advertise_key: Vec<String>,
}

pub async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    if let Some(parent) = args.downtime_db.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let downtime_db = Arc::new(DowntimeDb::open(&args.downtime_db)?);

    let http_client = reqwest::Client::new();
    let store = Arc::new(AdStore::new());

    let filter = Arc::new(FilterRegistry::new());
    filter.seed_permanent(&args.filtered_servers);

    let stats = Arc::new(StatRegistry::new(
        StatConfig {
            presence_capacity: args.cache_presence_capacity,
            fresh_window: Duration::from_secs(args.stat_fresh_secs),
            error_window: Duration::from_secs(args.stat_error_secs),
            max_concurrency: args.stat_max_concurrency,
        },
        Arc::new(HttpStatBackend::new(http_client.clone())),
    ));

    // Hook order matters: the metrics gauge first, then stat teardown, then
    // the health orchestrator, so evictions always drain stat state before
    // health state.
    metrics::attach_server_count_hooks(&store);
    {
        let stats = Arc::clone(&stats);
        store.on_evict(move |ad, _reason| stats.purge(&ad.url));
    }
    let health_orchestrator = HealthOrchestrator::new(
        HealthConfig {
            interval: Duration::from_secs(args.health_probe_secs),
            probe_deadline: Duration::from_secs(args.health_probe_deadline_secs),
            grace: Duration::from_secs(args.health_grace_secs),
            ..Default::default()
        },
        Arc::new(HttpHealthBackend::new(
            http_client.clone(),
            Duration::from_secs(1),
        )),
    );
    health_orchestrator.attach(&store);

    let signer: Option<Arc<dyn RedirectTokenSigner>> = args
        .token_signing_key
        .as_ref()
        .map(|key| {
            Arc::new(HmacTokenSigner::new(
                args.token_key_id.clone(),
                key.clone().into_bytes(),
            )) as Arc<dyn RedirectTokenSigner>
        });

    let steering = Arc::new(Steering::new(
        SteeringConfig {
            sort_method: args
                .cache_sort_method
                .parse::<SortMethod>()
                .map_err(|e| anyhow::anyhow!(e))?,
            strict_probe_count: args.strict_probe_count,
            probe_deadline: Duration::from_secs(args.stat_deadline_secs),
            probe_concurrency: args.strict_probe_count,
            token_lifetime: Duration::from_secs(300),
        },
        Arc::clone(&store),
        Arc::clone(&filter),
        Arc::clone(&stats),
        signer,
    ));

    let verifier: Arc<dyn AdVerifier> = if args.advertise_key.is_empty() {
        Arc::new(InsecureAdVerifier)
    } else {
        let mut keys = HashMap::new();
        for pair in &args.advertise_key {
            let Some((key_id, secret)) = pair.split_once('=') else {
                anyhow::bail!("--advertise-key must look like key_id=secret, got {pair:?}");
            };
            keys.insert(key_id.to_string(), secret.as_bytes().to_vec());
        }
        Arc::new(HmacAdVerifier::new(keys))
    };

    let state = DirectorState {
        http_client: http_client.clone(),
        store: Arc::clone(&store),
        filter: Arc::clone(&filter),
        stats: Arc::clone(&stats),
        steering,
        verifier,
        downtime_db: Arc::clone(&downtime_db),
        discovery: FederationDiscovery {
            director_endpoint: args.external_url.clone(),
            namespace_registration_endpoint: args.registry_url.clone(),
            broker_endpoint: args.broker_url.clone(),
            jwks_uri: args.jwks_url.clone(),
        },
        ad_lifetime: Duration::from_secs(args.ad_lifetime_secs),
        started_at: Instant::now(),
        startup_grace: Duration::from_secs(args.startup_grace_secs),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel::<bool>(false);
    let mut background: Vec<JoinHandle<anyhow::Result<()>>> = Vec::new();

    background.push(tokio::spawn(ads::sweep_loop(
        Arc::clone(&store),
        Duration::from_secs(1),
        shutdown_rx.clone(),
    )));

    if let Some(namespace_url) = &args.topology_namespace_url {
        let importer = TopologyImporter::new(
            TopologyConfig {
                ad_ttl: Duration::from_secs(args.ad_lifetime_secs),
                disable_origins: args.disable_topology_origins,
                disable_caches: args.disable_topology_caches,
                disable_downtime: args.disable_topology_downtime,
                ..Default::default()
            },
            Arc::new(HttpTopologySource::new(
                http_client.clone(),
                namespace_url.clone(),
                args.topology_downtime_url.clone(),
            )),
            Arc::clone(&store),
            Arc::clone(&filter),
        );
        background.push(tokio::spawn(topology::topology_reload_loop(
            importer,
            Duration::from_secs(args.topology_reload_secs),
            shutdown_rx.clone(),
        )));
    }

    if let Some(prometheus_url) = &args.prometheus_url {
        background.push(tokio::spawn(ioload::io_load_loop(
            Arc::clone(&store),
            Arc::new(PrometheusIoSource::new(http_client.clone(), prometheus_url)),
            Duration::from_secs(15),
            Duration::from_secs(10),
            shutdown_rx.clone(),
        )));
    }

    background.push(tokio::spawn(downtime::downtime_sweep_loop(
        Arc::clone(&downtime_db),
        Arc::clone(&filter),
        Duration::from_secs(60),
        shutdown_rx.clone(),
    )));

    if !args.peer.is_empty() {
        background.push(tokio::spawn(gossip::gossip_push_loop(
            Arc::clone(&store),
            http_client.clone(),
            GossipConfig {
                peers: args.peer.clone(),
                interval: Duration::from_secs(args.gossip_interval_secs),
                peer_ad_lifetime: Duration::from_secs(args.ad_lifetime_secs / 3),
                ..Default::default()
            },
            args.external_url.clone(),
            shutdown_rx.clone(),
        )));
    }

    background.push(tokio::spawn(metrics::map_metrics_loop(
        Arc::clone(&store),
        Arc::clone(&filter),
        Arc::clone(&stats),
        Duration::from_secs(10),
        shutdown_rx.clone(),
    )));

    let app = Router::new()
        .route("/.well-known/pelican-configuration", get(federation_discovery))
        .route("/api/v1.0/health", get(health))
        .route("/api/v1.0/director/object/{*path}", get(redirect_object))
        .route("/api/v1.0/director/advertise", post(advertise))
        .route("/api/v1.0/director/servers", get(list_servers))
        .route("/api/v1.0/director/gossip", post(gossip_route))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state);

    let socket_addr = parse_socket_addr(&args.listen)?;
    let server = Server::bind(socket_addr).serve(app.into_make_service());

    info!("director listening on {}", args.listen);

    // Graceful shutdown: ctrl+c
    tokio::select! {
        res = server => { res?; }
        _ = tokio::signal::ctrl_c() => {}
    }

    let _ = shutdown_tx.send(true);
    for handle in background {
        let _ = handle.await;
    }

    Ok(())
}
