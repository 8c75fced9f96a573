use futures_util::future::join_all;
use rand::seq::SliceRandom;
use std::cmp::Ordering;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use common::schemas::{Capabilities, HealthStatus, NamespaceAd, ServerAd, ServerKind};
use common::time_utils::utc_now_ms;

use crate::core::ads::AdStore;
use crate::core::filter::FilterRegistry;
use crate::core::namespaces::{self, namespace_covers};
use crate::core::stat::{StatRegistry, StatStatus};
use crate::core::token::{RedirectClaims, RedirectTokenSigner};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    List,
    Stat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortMethod {
    Distance,
    Load,
    Random,
}

impl FromStr for SortMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "distance" => Ok(SortMethod::Distance),
            "load" => Ok(SortMethod::Load),
            "random" => Ok(SortMethod::Random),
            other => Err(format!("unknown sort method {other:?}")),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ClientInfo {
    pub ip: IpAddr,
    /// Optional geolocation hint (latitude, longitude).
    pub coord: Option<(f64, f64)>,
}

#[derive(Clone, Debug)]
pub struct SteeringConfig {
    pub sort_method: SortMethod,
    /// How many top candidates a strict-existence request probes.
    pub strict_probe_count: usize,
    pub probe_deadline: Duration,
    pub probe_concurrency: usize,
    pub token_lifetime: Duration,
}

impl Default for SteeringConfig {
    fn default() -> Self {
        SteeringConfig {
            sort_method: SortMethod::Distance,
            strict_probe_count: 3,
            probe_deadline: Duration::from_secs(2),
            probe_concurrency: 3,
            token_lifetime: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SteerError {
    #[error("no namespace registered for this path")]
    UnknownNamespace,
    #[error("no server is exporting this object")]
    NoCandidates,
    #[error("all matching servers are filtered or down")]
    AllUnavailable,
    #[error("probe pool exhausted")]
    Overloaded,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Clone, Debug)]
pub struct Candidate {
    pub ad: ServerAd,
    /// Server caps restricted by the matched namespace.
    pub caps: Capabilities,
    /// Component depth of the matched namespace prefix.
    pub depth: usize,
}

#[derive(Clone, Debug)]
pub struct SteeringOutcome {
    pub namespace: NamespaceAd,
    pub resolved_prefix: String,
    pub candidates: Vec<Candidate>,
    pub token: Option<String>,
}

/// Maps an object path plus client coordinates to a ranked candidate list.
pub struct Steering {
    config: SteeringConfig,
    store: Arc<AdStore>,
    filter: Arc<FilterRegistry>,
    stats: Arc<StatRegistry>,
    signer: Option<Arc<dyn RedirectTokenSigner>>,
}

impl Steering {
    pub fn new(
        config: SteeringConfig,
        store: Arc<AdStore>,
        filter: Arc<FilterRegistry>,
        stats: Arc<StatRegistry>,
        signer: Option<Arc<dyn RedirectTokenSigner>>,
    ) -> Self {
        Steering {
            config,
            store,
            filter,
            stats,
            signer,
        }
    }

    pub async fn steer(
        &self,
        object_path: &str,
        client: &ClientInfo,
        op: Operation,
        strict: bool,
    ) -> Result<SteeringOutcome, SteerError> {
        let origins = self.store.list(&[ServerKind::Origin]);
        let resolved =
            namespaces::resolve(&origins, object_path).ok_or(SteerError::UnknownNamespace)?;

        let kinds: &[ServerKind] = match op {
            Operation::Write | Operation::List => &[ServerKind::Origin],
            Operation::Read | Operation::Stat => &[ServerKind::Cache, ServerKind::Origin],
        };

        let mut matching = Vec::new();
        for ad in self.store.list(kinds) {
            let (depth, ns_caps) = match deepest_covering(&ad, object_path) {
                Some((depth, caps)) => (depth, caps),
                // A cache advertising no namespaces serves anything the
                // federation exports, fetching from an origin on miss.
                None if ad.kind == ServerKind::Cache && ad.namespaces.is_empty() => {
                    (0, resolved.namespace.caps)
                }
                None => continue,
            };
            let caps = ad.caps.intersect(&ns_caps);
            if !permits(&caps, op) {
                continue;
            }
            matching.push(Candidate { ad, caps, depth });
        }

        if matching.is_empty() {
            return Err(SteerError::NoCandidates);
        }

        // Filter registry and hard health exclusions.
        let available: Vec<Candidate> = matching
            .into_iter()
            .filter(|c| {
                let decision = self.filter.combine(&c.ad.name);
                if decision.excluded {
                    debug!(server = %c.ad.name, reason = ?decision.reason, "candidate filtered");
                    return false;
                }
                c.ad.health_status != HealthStatus::Down
            })
            .collect();

        if available.is_empty() {
            return Err(SteerError::AllUnavailable);
        }

        let mut ranked = if op == Operation::Write {
            self.pick_write_origin(available)
        } else {
            self.rank(available, client, object_path)
        };

        if strict {
            ranked = self.strict_probe(ranked, object_path).await?;
            if ranked.is_empty() {
                return Err(SteerError::NoCandidates);
            }
        }

        let token = match (&self.signer, ranked.first()) {
            (Some(signer), Some(top)) => {
                let claims = RedirectClaims {
                    sub: top.ad.url.clone(),
                    aud: client.ip.to_string(),
                    path: object_path.to_string(),
                    caps: top.caps.as_labels().iter().map(|s| s.to_string()).collect(),
                    exp: (utc_now_ms() / 1000) as i64 + self.config.token_lifetime.as_secs() as i64,
                };
                match signer.sign(&claims) {
                    Ok(token) => Some(token),
                    Err(e) => {
                        warn!("failed to sign redirect token: {e:#}");
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(SteeringOutcome {
            namespace: resolved.namespace,
            resolved_prefix: resolved.prefix,
            candidates: ranked,
            token,
        })
    }

    /// Writes land on exactly one origin: native ads outrank topology ones,
    /// then healthier, then stable name order.
    fn pick_write_origin(&self, mut candidates: Vec<Candidate>) -> Vec<Candidate> {
        candidates.retain(|c| c.ad.kind == ServerKind::Origin);
        candidates.sort_by(|a, b| {
            a.ad.from_topology
                .cmp(&b.ad.from_topology)
                .then(health_rank(a.ad.health_status).cmp(&health_rank(b.ad.health_status)))
                .then(a.ad.name.cmp(&b.ad.name))
        });
        candidates.truncate(1);
        candidates
    }

    /// Reads prefer caches, then fall back to origins; each group is ranked
    /// by the configured primary key with a stable hash tie-break.
    fn rank(
        &self,
        candidates: Vec<Candidate>,
        client: &ClientInfo,
        object_path: &str,
    ) -> Vec<Candidate> {
        let (caches, origins): (Vec<Candidate>, Vec<Candidate>) = candidates
            .into_iter()
            .partition(|c| c.ad.kind == ServerKind::Cache);

        let mut ranked = self.rank_group(caches, client, object_path);
        ranked.extend(self.rank_group(origins, client, object_path));
        ranked
    }

    fn rank_group(
        &self,
        mut group: Vec<Candidate>,
        client: &ClientInfo,
        object_path: &str,
    ) -> Vec<Candidate> {
        if group.len() <= 1 {
            return group;
        }

        if self.config.sort_method == SortMethod::Random {
            group.shuffle(&mut rand::rng());
            return group;
        }

        // Unknown distances and unknown loads (0.0) both rank as the median
        // of the known values so missing telemetry is neither a reward nor a
        // punishment.
        let known_dists: Vec<f64> = group
            .iter()
            .filter_map(|c| distance_km(client, &c.ad))
            .collect();
        let median_dist = median(&known_dists).unwrap_or(0.0);

        let known_loads: Vec<f64> = group
            .iter()
            .map(|c| c.ad.io_load)
            .filter(|l| *l > 0.0)
            .collect();
        let median_load = median(&known_loads).unwrap_or(0.0);

        let mut scored: Vec<(f64, f64, u128, Candidate)> = group
            .drain(..)
            .map(|c| {
                let dist = distance_km(client, &c.ad).unwrap_or(median_dist);
                let load = if c.ad.io_load > 0.0 {
                    c.ad.io_load
                } else {
                    median_load
                };
                let hash = hash_score(&c.ad.name, object_path);
                (dist, load, hash, c)
            })
            .collect();

        let method = self.config.sort_method;
        scored.sort_by(|a, b| {
            let primary = match method {
                SortMethod::Load => a.1.total_cmp(&b.1).then(a.0.total_cmp(&b.0)),
                _ => a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)),
            };
            primary.then(a.2.cmp(&b.2)).then(Ordering::Equal)
        });

        scored.into_iter().map(|(_, _, _, c)| c).collect()
    }

    /// Probe the top candidates in parallel and drop the ones that answer
    /// `absent`. Candidates past the first `k` tag along unprobed.
    async fn strict_probe(
        &self,
        ranked: Vec<Candidate>,
        object_path: &str,
    ) -> Result<Vec<Candidate>, SteerError> {
        let probe_n = self.config.strict_probe_count.min(ranked.len());
        let (head, tail) = ranked.split_at(probe_n);

        let semaphore = Arc::new(Semaphore::new(self.config.probe_concurrency));
        let probes = head.iter().map(|c| {
            let stats = Arc::clone(&self.stats);
            let semaphore = Arc::clone(&semaphore);
            let url = c.ad.url.clone();
            let path = object_path.to_string();
            let deadline = self.config.probe_deadline;
            async move {
                let _permit = semaphore.acquire().await;
                stats.probe(&url, &path, deadline).await
            }
        });

        let results = join_all(probes).await;

        let mut surviving = Vec::with_capacity(ranked.len());
        for (candidate, result) in head.iter().zip(results) {
            match result {
                Ok(stat) if stat.status == StatStatus::Absent => {
                    debug!(server = %candidate.ad.name, path = object_path, "object absent");
                }
                Ok(_) => surviving.push(candidate.clone()),
                Err(common::api_error::ApiError::Overloaded { .. }) => {
                    return Err(SteerError::Overloaded);
                }
                Err(e) => {
                    warn!(server = %candidate.ad.name, "stat probe error: {e}");
                    surviving.push(candidate.clone());
                }
            }
        }
        surviving.extend(tail.iter().cloned());
        Ok(surviving)
    }
}

fn permits(caps: &Capabilities, op: Operation) -> bool {
    match op {
        Operation::Read | Operation::Stat => caps.reads || caps.public_reads,
        Operation::Write => caps.writes,
        Operation::List => caps.listings,
    }
}

/// Deepest namespace of this ad covering the path, with its capabilities.
fn deepest_covering(ad: &ServerAd, object_path: &str) -> Option<(usize, Capabilities)> {
    ad.namespaces
        .iter()
        .filter_map(|ns| {
            namespace_covers(&ns.path, object_path).map(|(_, depth)| (depth, ns.caps))
        })
        .max_by_key(|(depth, _)| *depth)
}

fn health_rank(status: HealthStatus) -> u8 {
    match status {
        HealthStatus::Ok => 0,
        HealthStatus::Unknown => 1,
        HealthStatus::Degraded => 2,
        HealthStatus::Down => 3,
    }
}

/// Deterministic per-(server, path) score; same idea as hashing a key onto
/// placement nodes, reused here as the final tie-break.
fn hash_score(server_name: &str, object_path: &str) -> u128 {
    let mut h = blake3::Hasher::new();
    h.update(server_name.as_bytes());
    h.update(b"\0");
    h.update(object_path.as_bytes());
    let hash = h.finalize();
    let mut score = [0u8; 16];
    score.copy_from_slice(&hash.as_bytes()[0..16]);
    u128::from_be_bytes(score)
}

fn distance_km(client: &ClientInfo, ad: &ServerAd) -> Option<f64> {
    let (clat, clon) = client.coord?;
    let (slat, slon) = match (ad.latitude, ad.longitude) {
        (Some(lat), Some(lon)) => (lat, lon),
        _ => return None,
    };
    Some(haversine_km(clat, clon, slat, slon))
}

fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stat::{StatBackend, StatConfig, StatResult};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct MapBackend {
        absent: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl StatBackend for MapBackend {
        async fn stat(&self, server: &str, _path: &str, _deadline: Duration) -> StatResult {
            if self.absent.lock().unwrap().contains(server) {
                StatResult::of(StatStatus::Absent)
            } else {
                StatResult::present(Some(42), None)
            }
        }
    }

    fn mk_ad(name: &str, kind: ServerKind, ns_path: &str) -> ServerAd {
        ServerAd {
            name: name.to_string(),
            kind,
            url: format!("https://{name}.example.com"),
            auth_url: None,
            web_url: None,
            from_topology: false,
            received_from_peer: false,
            signed_by_key_id: vec![1],
            received_at: utc_now_ms(),
            caps: Capabilities {
                public_reads: true,
                reads: true,
                writes: kind == ServerKind::Origin,
                listings: kind == ServerKind::Origin,
                direct_reads: true,
            },
            io_load: 0.0,
            health_status: HealthStatus::Ok,
            last_probe_at: None,
            latitude: None,
            longitude: None,
            namespaces: vec![NamespaceAd {
                path: ns_path.to_string(),
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
            }],
        }
    }

    fn client() -> ClientInfo {
        ClientInfo {
            ip: "198.51.100.7".parse().unwrap(),
            coord: None,
        }
    }

    async fn harness(ads: Vec<ServerAd>, absent: &[&str]) -> Steering {
        let store = Arc::new(AdStore::new());
        for ad in ads {
            store.upsert(ad, Duration::from_secs(60)).await;
        }
        let filter = Arc::new(FilterRegistry::new());
        let backend = Arc::new(MapBackend {
            absent: Mutex::new(absent.iter().map(|s| s.to_string()).collect()),
        });
        let stats = Arc::new(StatRegistry::new(StatConfig::default(), backend));
        Steering::new(SteeringConfig::default(), store, filter, stats, None)
    }

    #[tokio::test]
    async fn unknown_namespace_is_an_error() {
        let steering = harness(vec![mk_ad("o1", ServerKind::Origin, "/data")], &[]).await;
        let err = steering
            .steer("/other/f", &client(), Operation::Read, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SteerError::UnknownNamespace));
    }

    #[tokio::test]
    async fn reads_prefer_caches_over_origins() {
        let steering = harness(
            vec![
                mk_ad("origin-1", ServerKind::Origin, "/data"),
                mk_ad("cache-1", ServerKind::Cache, "/data"),
            ],
            &[],
        )
        .await;
        let out = steering
            .steer("/data/f", &client(), Operation::Read, false)
            .await
            .unwrap();
        assert_eq!(out.candidates.len(), 2);
        assert_eq!(out.candidates[0].ad.name, "cache-1");
        assert_eq!(out.candidates[1].ad.name, "origin-1");
    }

    #[tokio::test]
    async fn equal_candidates_rank_deterministically() {
        let ads = vec![
            mk_ad("cache-a", ServerKind::Cache, "/data"),
            mk_ad("cache-b", ServerKind::Cache, "/data"),
        ];
        let steering = harness(ads, &[]).await;

        let first: Vec<String> = steering
            .steer("/data/f", &client(), Operation::Read, false)
            .await
            .unwrap()
            .candidates
            .iter()
            .map(|c| c.ad.name.clone())
            .collect();

        for _ in 0..10 {
            let again: Vec<String> = steering
                .steer("/data/f", &client(), Operation::Read, false)
                .await
                .unwrap()
                .candidates
                .iter()
                .map(|c| c.ad.name.clone())
                .collect();
            assert_eq!(first, again);
        }

        // The hash tie-break orders by score, matching a recomputation here.
        let mut expected = vec!["cache-a".to_string(), "cache-b".to_string()];
        expected.sort_by_key(|name| hash_score(name, "/data/f"));
        assert_eq!(first, expected);
    }

    #[tokio::test]
    async fn zero_load_ranks_as_median() {
        let mut busy = mk_ad("busy", ServerKind::Cache, "/data");
        busy.io_load = 10.0;
        let mut idle = mk_ad("idle", ServerKind::Cache, "/data");
        idle.io_load = 2.0;
        let unknown = mk_ad("unknown", ServerKind::Cache, "/data");

        let store = Arc::new(AdStore::new());
        for ad in [busy, idle, unknown] {
            store.upsert(ad, Duration::from_secs(60)).await;
        }
        let stats = Arc::new(StatRegistry::new(
            StatConfig::default(),
            Arc::new(MapBackend {
                absent: Mutex::new(HashSet::new()),
            }),
        ));
        let steering = Steering::new(
            SteeringConfig {
                sort_method: SortMethod::Load,
                ..Default::default()
            },
            store,
            Arc::new(FilterRegistry::new()),
            stats,
            None,
        );

        let names: Vec<String> = steering
            .steer("/data/f", &client(), Operation::Read, false)
            .await
            .unwrap()
            .candidates
            .iter()
            .map(|c| c.ad.name.clone())
            .collect();
        // Median of known loads {10, 2} is 6, so the unknown-load cache
        // lands between the two.
        assert_eq!(names, vec!["idle", "unknown", "busy"]);
    }

    #[tokio::test]
    async fn filtered_and_down_candidates_are_dropped() {
        let mut down = mk_ad("down-cache", ServerKind::Cache, "/data");
        down.health_status = HealthStatus::Down;
        let ads = vec![down, mk_ad("bad-cache", ServerKind::Cache, "/data")];

        let store = Arc::new(AdStore::new());
        for ad in ads {
            store.upsert(ad, Duration::from_secs(60)).await;
        }
        let filter = Arc::new(FilterRegistry::new());
        filter.set(
            "bad-cache",
            crate::core::filter::FilterState::PermFiltered,
            crate::core::filter::FilterSource::Config,
        );
        let stats = Arc::new(StatRegistry::new(
            StatConfig::default(),
            Arc::new(MapBackend {
                absent: Mutex::new(HashSet::new()),
            }),
        ));
        let steering = Steering::new(
            SteeringConfig::default(),
            store,
            filter,
            stats,
            None,
        );

        let err = steering
            .steer("/data/f", &client(), Operation::Read, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SteerError::AllUnavailable));
    }

    #[tokio::test]
    async fn writes_choose_a_single_native_origin() {
        let mut topo = mk_ad("topo-origin", ServerKind::Origin, "/data");
        topo.from_topology = true;
        let ads = vec![topo, mk_ad("native-origin", ServerKind::Origin, "/data")];
        let steering = harness(ads, &[]).await;

        let out = steering
            .steer("/data/f", &client(), Operation::Write, false)
            .await
            .unwrap();
        assert_eq!(out.candidates.len(), 1);
        assert_eq!(out.candidates[0].ad.name, "native-origin");
    }

    #[tokio::test]
    async fn strict_probe_drops_absent_candidates() {
        let ads = vec![
            mk_ad("cache-a", ServerKind::Cache, "/data"),
            mk_ad("cache-b", ServerKind::Cache, "/data"),
        ];
        let steering = harness(ads, &["https://cache-a.example.com"]).await;

        let out = steering
            .steer("/data/f", &client(), Operation::Read, true)
            .await
            .unwrap();
        let names: Vec<&str> = out.candidates.iter().map(|c| c.ad.name.as_str()).collect();
        assert_eq!(names, vec!["cache-b"]);
    }

    #[tokio::test]
    async fn strict_probe_all_absent_is_not_found() {
        let ads = vec![mk_ad("cache-a", ServerKind::Cache, "/data")];
        let steering = harness(ads, &["https://cache-a.example.com"]).await;

        let err = steering
            .steer("/data/f", &client(), Operation::Read, true)
            .await
            .unwrap_err();
        assert!(matches!(err, SteerError::NoCandidates));
    }

    #[test]
    fn haversine_is_sane() {
        // Madison to Chicago is roughly 200 km.
        let d = haversine_km(43.07, -89.40, 41.88, -87.63);
        assert!((150.0..250.0).contains(&d), "got {d}");
        assert!(haversine_km(0.0, 0.0, 0.0, 0.0) < 1e-9);
    }

    #[test]
    fn median_of_even_set_averages_middles() {
        assert_eq!(median(&[2.0, 10.0]), Some(6.0));
        assert_eq!(median(&[1.0, 2.0, 3.0]), Some(2.0));
        assert_eq!(median(&[]), None);
    }
}
