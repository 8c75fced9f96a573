use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::{PrimitiveDateTime, UtcOffset, format_description};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use common::schemas::{
    Capabilities, HealthStatus, NamespaceAd, ServerAd, ServerKind, TokenGen, TokenIssuer,
};
use common::time_utils::utc_now_ms;
use common::url_utils::ensure_scheme;

use crate::core::ads::{AdKey, AdStore};
use crate::core::downtime::{DowntimeClass, DowntimeRecord, DowntimeSeverity, DowntimeSource};
use crate::core::filter::{FilterRegistry, FilterSource, FilterState};

// ---- namespace manifest (JSON) ----

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TopologyNamespaces {
    #[serde(default)]
    pub namespaces: Vec<TopoNamespace>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TopoNamespace {
    pub path: String,
    #[serde(default)]
    pub use_token_on_read: bool,
    #[serde(default)]
    pub read_https: bool,
    #[serde(default)]
    pub writeback_host: String,
    #[serde(default)]
    pub dirlist_host: String,
    #[serde(default)]
    pub credential_generation: Option<TopoCredentialGeneration>,
    #[serde(default)]
    pub scitokens: Vec<TopoScitoken>,
    #[serde(default)]
    pub origins: Vec<TopoServer>,
    #[serde(default)]
    pub caches: Vec<TopoServer>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TopoCredentialGeneration {
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub issuer: String,
    #[serde(default)]
    pub vault_server: String,
    #[serde(default)]
    pub max_scope_depth: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TopoScitoken {
    pub issuer: String,
    #[serde(default)]
    pub base_path: Vec<String>,
    #[serde(default)]
    pub restricted_path: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TopoServer {
    pub resource: String,
    pub endpoint: String,
    #[serde(default)]
    pub auth_endpoint: String,
}

// ---- downtime feed (XML) ----

#[derive(Debug, Default, Deserialize)]
pub struct TopoDowntimeInfo {
    #[serde(rename = "CurrentDowntimes", default)]
    pub current: TopoDowntimeList,
    #[serde(rename = "FutureDowntimes", default)]
    pub future: TopoDowntimeList,
}

#[derive(Debug, Default, Deserialize)]
pub struct TopoDowntimeList {
    #[serde(rename = "Downtime", default)]
    pub downtimes: Vec<TopoDowntime>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopoDowntime {
    #[serde(rename = "ResourceName")]
    pub resource_name: String,
    #[serde(rename = "Class")]
    pub class: String,
    #[serde(rename = "Severity", default)]
    pub severity: String,
    #[serde(rename = "StartTime")]
    pub start_time: String,
    #[serde(rename = "EndTime")]
    pub end_time: String,
    #[serde(rename = "CreatedTime", default)]
    pub created_time: String,
    #[serde(rename = "UpdateTime", default)]
    pub update_time: String,
    #[serde(rename = "Description", default)]
    pub description: String,
}

/// Parse the feed's fixed human-readable layout, e.g.
/// `Sep 10, 2024 14:30 PM UTC`. The hour is 24-based despite the trailing
/// period marker, which we therefore ignore; the zone is a small fixed set
/// of abbreviations.
pub fn parse_downtime_timestamp(raw: &str) -> anyhow::Result<i64> {
    let raw = raw.trim();
    let mut parts: Vec<&str> = raw.split_whitespace().collect();
    if parts.len() < 2 {
        anyhow::bail!("timestamp {raw:?} has too few fields");
    }

    let zone = parts.pop().unwrap();
    let offset = zone_offset(zone)
        .ok_or_else(|| anyhow::anyhow!("unknown zone abbreviation {zone:?} in {raw:?}"))?;

    // Drop the AM/PM marker; the hour field is already 24-based.
    if matches!(parts.last().copied(), Some("AM") | Some("PM")) {
        parts.pop();
    }

    // The feed never carries seconds; make them explicit for the parser.
    let stamp = format!("{}:00", parts.join(" "));
    let format = format_description::parse(
        "[month repr:short] [day padding:none], [year] [hour padding:none]:[minute]:[second]",
    )?;
    let dt = PrimitiveDateTime::parse(&stamp, &format)?;
    Ok((dt.assume_offset(offset).unix_timestamp_nanos() / 1_000_000) as i64)
}

fn zone_offset(abbrev: &str) -> Option<UtcOffset> {
    let hours = match abbrev {
        "UTC" | "GMT" => 0,
        "EST" => -5,
        "EDT" => -4,
        "CST" => -6,
        "CDT" => -5,
        "MST" => -7,
        "MDT" => -6,
        "PST" => -8,
        "PDT" => -7,
        _ => return None,
    };
    UtcOffset::from_hms(hours, 0, 0).ok()
}

fn parse_class(raw: &str) -> Option<DowntimeClass> {
    match raw {
        "SCHEDULED" => Some(DowntimeClass::Scheduled),
        "UNSCHEDULED" => Some(DowntimeClass::Unscheduled),
        _ => None,
    }
}

fn parse_severity(raw: &str) -> Option<DowntimeSeverity> {
    if raw.starts_with("Outage") {
        Some(DowntimeSeverity::Outage)
    } else if raw.starts_with("Severe") {
        Some(DowntimeSeverity::Severe)
    } else if raw.starts_with("Intermittent") {
        Some(DowntimeSeverity::IntermittentOutage)
    } else if raw.starts_with("No") {
        Some(DowntimeSeverity::NoSignificantOutageExpected)
    } else {
        None
    }
}

// ---- fetching ----

#[async_trait]
pub trait TopologySource: Send + Sync {
    async fn fetch_namespaces(&self, deadline: Duration) -> anyhow::Result<TopologyNamespaces>;
    /// Raw XML; parsing stays in the importer so tests can feed fixtures.
    async fn fetch_downtimes(&self, deadline: Duration) -> anyhow::Result<String>;
}

pub struct HttpTopologySource {
    client: reqwest::Client,
    namespace_url: String,
    downtime_url: String,
}

impl HttpTopologySource {
    pub fn new(client: reqwest::Client, namespace_url: String, downtime_url: String) -> Self {
        HttpTopologySource {
            client,
            namespace_url,
            downtime_url,
        }
    }
}

#[async_trait]
impl TopologySource for HttpTopologySource {
    async fn fetch_namespaces(&self, deadline: Duration) -> anyhow::Result<TopologyNamespaces> {
        Ok(self
            .client
            .get(&self.namespace_url)
            .timeout(deadline)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn fetch_downtimes(&self, deadline: Duration) -> anyhow::Result<String> {
        Ok(self
            .client
            .get(&self.downtime_url)
            .timeout(deadline)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?)
    }
}

// ---- the importer ----

#[derive(Clone, Debug)]
pub struct TopologyConfig {
    pub ad_ttl: Duration,
    pub fetch_deadline: Duration,
    pub disable_origins: bool,
    pub disable_caches: bool,
    pub disable_downtime: bool,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        TopologyConfig {
            ad_ttl: Duration::from_secs(15 * 60),
            fetch_deadline: Duration::from_secs(30),
            disable_origins: false,
            disable_caches: false,
            disable_downtime: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ImportStats {
    pub origins: usize,
    pub caches: usize,
    pub downtimes: usize,
}

/// Pulls the legacy namespace manifest and downtime feed, normalizes them
/// into advertisements and filter entries, and reconciles the ad store so
/// the feed's view replaces the previous import wholesale.
pub struct TopologyImporter {
    config: TopologyConfig,
    source: Arc<dyn TopologySource>,
    store: Arc<AdStore>,
    filter: Arc<FilterRegistry>,
    /// Latest topology downtime snapshot, soft state for introspection.
    downtimes: Mutex<Vec<DowntimeRecord>>,
}

impl TopologyImporter {
    pub fn new(
        config: TopologyConfig,
        source: Arc<dyn TopologySource>,
        store: Arc<AdStore>,
        filter: Arc<FilterRegistry>,
    ) -> Arc<Self> {
        Arc::new(TopologyImporter {
            config,
            source,
            store,
            filter,
            downtimes: Mutex::new(Vec::new()),
        })
    }

    pub async fn import(&self) -> anyhow::Result<ImportStats> {
        let namespaces = self
            .source
            .fetch_namespaces(self.config.fetch_deadline)
            .await?;

        if !self.config.disable_downtime {
            match self.source.fetch_downtimes(self.config.fetch_deadline).await {
                Ok(xml) => {
                    if let Err(e) = self.apply_downtimes(&xml) {
                        // Loud but non-fatal: the namespace import still runs.
                        error!("unable to apply topology downtimes: {e:#}");
                    }
                }
                Err(e) => error!("unable to fetch topology downtimes: {e:#}"),
            }
        }

        let ads = self.build_ads(&namespaces);
        let stats = ImportStats {
            origins: ads.iter().filter(|a| a.kind == ServerKind::Origin).count(),
            caches: ads.iter().filter(|a| a.kind == ServerKind::Cache).count(),
            downtimes: self.downtimes.lock().unwrap().len(),
        };

        let live_keys: Vec<AdKey> = ads.iter().map(AdKey::of).collect();
        for ad in ads {
            self.store.upsert(ad, self.config.ad_ttl).await;
        }

        // The feed is authoritative for its own ads: anything it stopped
        // listing disappears now rather than lingering until TTL.
        let stale: Vec<ServerAd> = self
            .store
            .list(&[ServerKind::Origin, ServerKind::Cache])
            .into_iter()
            .filter(|ad| ad.from_topology && !live_keys.contains(&AdKey::of(ad)))
            .collect();
        for ad in stale {
            self.store.delete(ad.kind, &ad.name).await;
        }

        info!(
            "topology import done: {} origins, {} caches, {} downtimes",
            stats.origins, stats.caches, stats.downtimes
        );
        Ok(stats)
    }

    fn build_ads(&self, namespaces: &TopologyNamespaces) -> Vec<ServerAd> {
        // Keyed by server URL so one server exporting many namespaces
        // coalesces into a single ad.
        let mut origin_ads: HashMap<String, ServerAd> = HashMap::new();
        let mut cache_ads: HashMap<String, ServerAd> = HashMap::new();

        for ns in &namespaces.namespaces {
            let caps = Capabilities {
                public_reads: !ns.use_token_on_read,
                reads: ns.read_https,
                writes: !ns.writeback_host.is_empty(),
                listings: !ns.dirlist_host.is_empty(),
                // Legacy namespaces are always directly readable.
                direct_reads: true,
            };

            let mut token_issuers = Vec::new();
            let mut token_generation = None;
            if ns.use_token_on_read {
                if let Some(cred) = &ns.credential_generation {
                    token_generation = Some(TokenGen {
                        strategy: cred.strategy.clone(),
                        vault_server: cred.vault_server.clone(),
                        max_scope_depth: cred.max_scope_depth,
                        credential_issuer: cred.issuer.clone(),
                    });
                }
                for scitok in &ns.scitokens {
                    match url::Url::parse(&scitok.issuer) {
                        Ok(parsed) => token_issuers.push(TokenIssuer {
                            issuer_url: parsed.to_string().trim_end_matches('/').to_string(),
                            base_paths: scitok.base_path.clone(),
                            restricted_paths: scitok.restricted_path.clone(),
                        }),
                        Err(e) => {
                            warn!(
                                namespace = %ns.path,
                                issuer = %scitok.issuer,
                                "skipping token issuer with invalid URL: {e}"
                            );
                        }
                    }
                }
                if token_issuers.is_empty() {
                    warn!(
                        namespace = %ns.path,
                        "namespace requires tokens but lists no usable issuer, skipping"
                    );
                    continue;
                }
            }

            let ns_ad = NamespaceAd {
                path: ns.path.clone(),
                caps,
                token_issuers,
                token_generation,
                from_topology: true,
            };

            if !self.config.disable_origins {
                for origin in &ns.origins {
                    Self::accumulate(
                        &mut origin_ads,
                        origin,
                        ServerKind::Origin,
                        caps,
                        &ns_ad,
                    );
                }
            }
            if !self.config.disable_caches {
                for cache in &ns.caches {
                    // These capabilities don't translate for caches; force
                    // the public read-only shape regardless of the manifest.
                    let cache_caps = Capabilities {
                        public_reads: true,
                        ..Default::default()
                    };
                    Self::accumulate(&mut cache_ads, cache, ServerKind::Cache, cache_caps, &ns_ad);
                }
            }
        }

        origin_ads.into_values().chain(cache_ads.into_values()).collect()
    }

    fn accumulate(
        ads: &mut HashMap<String, ServerAd>,
        server: &TopoServer,
        kind: ServerKind,
        caps: Capabilities,
        ns_ad: &NamespaceAd,
    ) {
        let default_scheme = "http"; // legacy public endpoints are plain http
        let url = match ensure_scheme(&server.endpoint, default_scheme) {
            Ok(u) => u,
            Err(e) => {
                warn!(
                    server = %server.resource,
                    endpoint = %server.endpoint,
                    "feed lists server with invalid endpoint: {e}"
                );
                return;
            }
        };
        let auth_url = if server.auth_endpoint.is_empty() {
            None
        } else {
            match ensure_scheme(&server.auth_endpoint, "https") {
                Ok(u) => Some(u),
                Err(e) => {
                    warn!(
                        server = %server.resource,
                        endpoint = %server.auth_endpoint,
                        "feed lists server with invalid auth endpoint: {e}"
                    );
                    None
                }
            }
        };

        match ads.get_mut(&url) {
            Some(existing) => {
                // Capability fields take the permissive union; everything
                // else keeps the first-seen values.
                existing.caps = existing.caps.union(&caps);
                if !existing.namespaces.iter().any(|n| n.path == ns_ad.path) {
                    existing.namespaces.push(ns_ad.clone());
                }
            }
            None => {
                ads.insert(
                    url.clone(),
                    ServerAd {
                        name: server.resource.clone(),
                        kind,
                        url,
                        auth_url,
                        web_url: None,
                        from_topology: true,
                        received_from_peer: false,
                        signed_by_key_id: Vec::new(),
                        received_at: utc_now_ms(),
                        caps,
                        io_load: 0.0, // the sort algorithm reads 0.0 as unknown
                        health_status: HealthStatus::Unknown,
                        last_probe_at: None,
                        latitude: None,
                        longitude: None,
                        namespaces: vec![ns_ad.clone()],
                    },
                );
            }
        }
    }

    fn apply_downtimes(&self, xml: &str) -> anyhow::Result<()> {
        let info: TopoDowntimeInfo = quick_xml::de::from_str(xml)?;
        let now_ms = utc_now_ms() as i64;

        // Each import owns the topology filter entries wholesale.
        self.filter.clear_source(FilterSource::Topology);

        let mut records = Vec::new();
        let all = info
            .current
            .downtimes
            .iter()
            .chain(info.future.downtimes.iter());

        for downtime in all {
            let start_ms = match parse_downtime_timestamp(&downtime.start_time) {
                Ok(t) => t,
                Err(e) => {
                    warn!(
                        server = %downtime.resource_name,
                        raw = %downtime.start_time,
                        "skipping downtime with unparseable start time: {e}"
                    );
                    continue;
                }
            };
            let end_ms = match parse_downtime_timestamp(&downtime.end_time) {
                Ok(t) => t,
                Err(e) => {
                    warn!(
                        server = %downtime.resource_name,
                        raw = %downtime.end_time,
                        "skipping downtime with unparseable end time: {e}"
                    );
                    continue;
                }
            };

            if end_ms <= now_ms {
                continue;
            }

            if start_ms <= now_ms {
                self.filter.set(
                    &downtime.resource_name,
                    FilterState::TopoFiltered,
                    FilterSource::Topology,
                );
            }

            let Some(class) = parse_class(&downtime.class) else {
                warn!(
                    server = %downtime.resource_name,
                    class = %downtime.class,
                    "skipping downtime with unrecognized class"
                );
                continue;
            };
            let Some(severity) = parse_severity(&downtime.severity) else {
                warn!(
                    server = %downtime.resource_name,
                    severity = %downtime.severity,
                    "skipping downtime with unrecognized severity"
                );
                continue;
            };

            let created_ms = parse_downtime_timestamp(&downtime.created_time).unwrap_or(start_ms);
            let updated_ms = parse_downtime_timestamp(&downtime.update_time).unwrap_or(created_ms);

            records.push(DowntimeRecord {
                server_name: downtime.resource_name.clone(),
                class,
                severity,
                source: DowntimeSource::Topology,
                start_ms,
                end_ms,
                description: downtime.description.clone(),
                created_ms,
                updated_ms,
            });
        }

        debug!("topology downtime snapshot holds {} records", records.len());
        *self.downtimes.lock().unwrap() = records;
        Ok(())
    }

    pub fn downtime_snapshot(&self) -> Vec<DowntimeRecord> {
        self.downtimes.lock().unwrap().clone()
    }
}

/// Re-import on a fixed cadence, comfortably inside the TTL of the ads the
/// import produces so healthy feed entries never expire between rounds.
pub async fn topology_reload_loop(
    importer: Arc<TopologyImporter>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut tick = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = tick.tick() => {},
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
        }

        if let Err(e) = importer.import().await {
            // Previous topology state stays in place until the next round.
            warn!("topology import failed, will retry next cycle: {e:#}");
        }
    }

    info!("topology reload loop stopped");
    Ok(())
}
