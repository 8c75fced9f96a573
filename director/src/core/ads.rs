use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use common::schemas::{HealthStatus, ServerAd, ServerKind};
use common::time_utils::utc_now_ms;

const STRIPES: usize = 64;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct AdKey {
    pub kind: ServerKind,
    pub name: String,
}

impl AdKey {
    pub fn of(ad: &ServerAd) -> Self {
        AdKey {
            kind: ad.kind,
            name: ad.name.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictReason {
    Ttl,
    Explicit,
    Replaced,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Refreshed,
    /// A topology ad collided with a native ad: capabilities were OR-merged
    /// into the native entry, which keeps its identity and expiry.
    Merged,
}

pub type InsertHook = Box<dyn Fn(&ServerAd, &CancellationToken) + Send + Sync>;
pub type EvictHook = Box<dyn Fn(&ServerAd, EvictReason) + Send + Sync>;

struct Entry {
    ad: ServerAd,
    expires_at: Instant,
    cancel: CancellationToken,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StoreMetrics {
    pub insertions: u64,
    pub evictions: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Soft-state table of server advertisements keyed by `(kind, name)` with a
/// per-entry TTL.
///
/// Hooks fire outside the entry lock and receive a detached snapshot, so a
/// hook may call back into the store for OTHER keys but must never block on
/// the key it was invoked for. Per-key ordering (an eviction fully publishes
/// before the next insertion of the same key) is enforced with striped async
/// locks; evict hooks for one key may run concurrently with inserts for
/// another.
pub struct AdStore {
    entries: Mutex<HashMap<AdKey, Entry>>,
    stripes: Vec<tokio::sync::Mutex<()>>,
    insert_hooks: RwLock<Vec<InsertHook>>,
    evict_hooks: RwLock<Vec<EvictHook>>,

    insertions: AtomicU64,
    evictions: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

enum UpsertPlan {
    Insert(ServerAd, CancellationToken),
    Replace {
        old: ServerAd,
        new: ServerAd,
        cancel: CancellationToken,
    },
    Refresh,
    Merge,
}

impl AdStore {
    pub fn new() -> Self {
        AdStore {
            entries: Mutex::new(HashMap::new()),
            stripes: (0..STRIPES).map(|_| tokio::sync::Mutex::new(())).collect(),
            insert_hooks: RwLock::new(Vec::new()),
            evict_hooks: RwLock::new(Vec::new()),
            insertions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Register an insertion hook. Hooks run in registration order; register
    /// stat teardown before health teardown so evictions always drain stat
    /// state first.
    pub fn on_insert(&self, f: impl Fn(&ServerAd, &CancellationToken) + Send + Sync + 'static) {
        self.insert_hooks.write().unwrap().push(Box::new(f));
    }

    pub fn on_evict(&self, f: impl Fn(&ServerAd, EvictReason) + Send + Sync + 'static) {
        self.evict_hooks.write().unwrap().push(Box::new(f));
    }

    fn stripe(&self, key: &AdKey) -> &tokio::sync::Mutex<()> {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        &self.stripes[(h.finish() as usize) % STRIPES]
    }

    /// Insert or refresh an advertisement.
    ///
    /// A re-advertisement carrying the same signing key refreshes the entry
    /// (expiry reset, no hooks). A new signing key is a new ad: the previous
    /// entry is evicted with `Replaced` and the insert hook fires again. A
    /// topology ad never overwrites a native one; its capabilities are
    /// union-merged into the native entry instead.
    pub async fn upsert(&self, ad: ServerAd, ttl: Duration) -> UpsertOutcome {
        let key = AdKey::of(&ad);
        let _serial = self.stripe(&key).lock().await;

        enum Action {
            Insert,
            Merge,
            Refresh,
            Replace,
        }

        let plan = {
            let mut entries = self.entries.lock().unwrap();
            let action = match entries.get(&key) {
                None => Action::Insert,
                Some(entry) if ad.from_topology && !entry.ad.from_topology => Action::Merge,
                Some(entry) if ad.signed_by_key_id == entry.ad.signed_by_key_id => Action::Refresh,
                Some(_) => Action::Replace,
            };

            match action {
                Action::Insert => {
                    let cancel = CancellationToken::new();
                    entries.insert(
                        key.clone(),
                        Entry {
                            ad: ad.clone(),
                            expires_at: Instant::now() + ttl,
                            cancel: cancel.clone(),
                        },
                    );
                    self.insertions.fetch_add(1, Ordering::Relaxed);
                    UpsertPlan::Insert(ad, cancel)
                }
                Action::Merge => {
                    // Native ads own their key; the topology feed can only
                    // widen their capabilities. Expiry is untouched: the feed
                    // says nothing about the server's liveness.
                    let entry = entries.get_mut(&key).unwrap();
                    entry.ad.caps = entry.ad.caps.union(&ad.caps);
                    for ns in ad.namespaces {
                        if !entry.ad.namespaces.iter().any(|n| n.path == ns.path) {
                            entry.ad.namespaces.push(ns);
                        }
                    }
                    UpsertPlan::Merge
                }
                Action::Refresh => {
                    let entry = entries.get_mut(&key).unwrap();
                    let mut refreshed = ad;
                    // Runtime state belongs to the attached routines, not to
                    // the advertiser.
                    refreshed.io_load = entry.ad.io_load;
                    refreshed.health_status = entry.ad.health_status;
                    refreshed.last_probe_at = entry.ad.last_probe_at;
                    entry.ad = refreshed;
                    entry.expires_at = Instant::now() + ttl;
                    UpsertPlan::Refresh
                }
                Action::Replace => {
                    let old_entry = entries.remove(&key).unwrap();
                    old_entry.cancel.cancel();
                    self.evictions.fetch_add(1, Ordering::Relaxed);

                    let mut new_ad = ad;
                    if old_entry.ad.from_topology && !new_ad.from_topology {
                        // Keep the permissive union when a native ad takes
                        // over a key previously synthesized from topology.
                        new_ad.caps = new_ad.caps.union(&old_entry.ad.caps);
                        for ns in &old_entry.ad.namespaces {
                            if !new_ad.namespaces.iter().any(|n| n.path == ns.path) {
                                new_ad.namespaces.push(ns.clone());
                            }
                        }
                    }

                    let cancel = CancellationToken::new();
                    entries.insert(
                        key.clone(),
                        Entry {
                            ad: new_ad.clone(),
                            expires_at: Instant::now() + ttl,
                            cancel: cancel.clone(),
                        },
                    );
                    self.insertions.fetch_add(1, Ordering::Relaxed);
                    UpsertPlan::Replace {
                        old: old_entry.ad,
                        new: new_ad,
                        cancel,
                    }
                }
            }
        };

        match plan {
            UpsertPlan::Insert(ad, cancel) => {
                self.run_insert_hooks(&ad, &cancel);
                UpsertOutcome::Inserted
            }
            UpsertPlan::Replace { old, new, cancel } => {
                self.run_evict_hooks(&old, EvictReason::Replaced);
                self.run_insert_hooks(&new, &cancel);
                UpsertOutcome::Inserted
            }
            UpsertPlan::Refresh => UpsertOutcome::Refreshed,
            UpsertPlan::Merge => UpsertOutcome::Merged,
        }
    }

    /// Remove an advertisement. Returns after the entry is unpublished, its
    /// cancellation token fired, and eviction hooks have been scheduled. No
    /// hook for this key fires after `delete` returns.
    pub async fn delete(&self, kind: ServerKind, name: &str) -> bool {
        let key = AdKey {
            kind,
            name: name.to_string(),
        };
        let _serial = self.stripe(&key).lock().await;

        let removed = {
            let mut entries = self.entries.lock().unwrap();
            entries.remove(&key)
        };

        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.run_evict_hooks(&entry.ad, EvictReason::Explicit);
                true
            }
            None => false,
        }
    }

    /// Snapshot of one ad. Never touches expiry.
    pub fn get(&self, kind: ServerKind, name: &str) -> Option<ServerAd> {
        let key = AdKey {
            kind,
            name: name.to_string(),
        };
        let entries = self.entries.lock().unwrap();
        match entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.ad.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Point-in-time snapshot of all live ads with one of the given kinds.
    pub fn list(&self, kinds: &[ServerKind]) -> Vec<ServerAd> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        entries
            .values()
            .filter(|e| e.expires_at > now && kinds.contains(&e.ad.kind))
            .map(|e| e.ad.clone())
            .collect()
    }

    /// Update the I/O load of the ad advertising `url`, if any. Deliberately
    /// does not touch expiry: a server that keeps answering metrics queries
    /// but stopped advertising must still age out.
    pub fn set_io_load(&self, url: &str, load: f64) -> bool {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.values_mut() {
            if entry.ad.url == url {
                entry.ad.io_load = load.max(0.0);
                return true;
            }
        }
        false
    }

    /// Update health state without touching expiry. Returns the previous
    /// status so callers can emit transition metrics.
    pub fn set_health(
        &self,
        kind: ServerKind,
        name: &str,
        status: HealthStatus,
    ) -> Option<HealthStatus> {
        let key = AdKey {
            kind,
            name: name.to_string(),
        };
        let mut entries = self.entries.lock().unwrap();
        entries.get_mut(&key).map(|entry| {
            let prev = entry.ad.health_status;
            entry.ad.health_status = status;
            entry.ad.last_probe_at = Some(utc_now_ms());
            prev
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> StoreMetrics {
        StoreMetrics {
            insertions: self.insertions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn run_insert_hooks(&self, ad: &ServerAd, cancel: &CancellationToken) {
        for hook in self.insert_hooks.read().unwrap().iter() {
            hook(ad, cancel);
        }
    }

    fn run_evict_hooks(&self, ad: &ServerAd, reason: EvictReason) {
        debug!(server = %ad.name, kind = %ad.kind, ?reason, "evicting server ad");
        for hook in self.evict_hooks.read().unwrap().iter() {
            hook(ad, reason);
        }
    }

    /// Evict everything whose TTL has passed. Exposed for tests; production
    /// runs it from `sweep_loop`.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<AdKey> = {
            let entries = self.entries.lock().unwrap();
            entries
                .iter()
                .filter(|(_, e)| e.expires_at <= now)
                .map(|(k, _)| k.clone())
                .collect()
        };

        let mut swept = 0usize;
        for key in expired {
            let _serial = self.stripe(&key).lock().await;
            let removed = {
                let mut entries = self.entries.lock().unwrap();
                // Re-check: the entry may have been refreshed while we
                // waited on the stripe.
                let still_expired = entries
                    .get(&key)
                    .map(|e| e.expires_at <= Instant::now())
                    .unwrap_or(false);
                if still_expired { entries.remove(&key) } else { None }
            };
            if let Some(entry) = removed {
                entry.cancel.cancel();
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.run_evict_hooks(&entry.ad, EvictReason::Ttl);
                swept += 1;
            }
        }
        swept
    }
}

impl Default for AdStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Background TTL sweeper for the ad store.
pub async fn sweep_loop(
    store: Arc<AdStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut tick = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = tick.tick() => {},
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
        }

        let swept = store.sweep_expired().await;
        if swept > 0 {
            debug!("ad sweeper evicted {swept} expired ads");
        }
    }

    info!("ad store sweeper stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::schemas::Capabilities;

    fn mk_ad(name: &str, kind: ServerKind, key_id: &[u8], from_topology: bool) -> ServerAd {
        ServerAd {
            name: name.to_string(),
            kind,
            url: format!("https://{name}.example.com"),
            auth_url: None,
            web_url: None,
            from_topology,
            received_from_peer: false,
            signed_by_key_id: key_id.to_vec(),
            received_at: utc_now_ms(),
            caps: Capabilities {
                public_reads: true,
                reads: true,
                ..Default::default()
            },
            io_load: 0.0,
            health_status: HealthStatus::Unknown,
            last_probe_at: None,
            latitude: None,
            longitude: None,
            namespaces: vec![],
        }
    }

    #[tokio::test]
    async fn ttl_zero_is_never_visible() {
        let store = AdStore::new();
        let ad = mk_ad("o1", ServerKind::Origin, b"k1", false);
        store.upsert(ad, Duration::ZERO).await;
        assert!(store.get(ServerKind::Origin, "o1").is_none());
        assert!(store.list(&[ServerKind::Origin]).is_empty());
        store.sweep_expired().await;
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn refresh_same_key_id_fires_no_hooks() {
        let store = AdStore::new();
        let inserts = Arc::new(AtomicU64::new(0));
        let evicts = Arc::new(AtomicU64::new(0));
        {
            let inserts = inserts.clone();
            store.on_insert(move |_, _| {
                inserts.fetch_add(1, Ordering::SeqCst);
            });
            let evicts = evicts.clone();
            store.on_evict(move |_, _| {
                evicts.fetch_add(1, Ordering::SeqCst);
            });
        }

        let ad = mk_ad("o1", ServerKind::Origin, b"k1", false);
        let outcome = store.upsert(ad.clone(), Duration::from_secs(60)).await;
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let outcome = store.upsert(ad.clone(), Duration::from_secs(60)).await;
        assert_eq!(outcome, UpsertOutcome::Refreshed);
        assert_eq!(inserts.load(Ordering::SeqCst), 1);
        assert_eq!(evicts.load(Ordering::SeqCst), 0);

        // Key rotation counts as a brand new ad.
        let rotated = mk_ad("o1", ServerKind::Origin, b"k2", false);
        let outcome = store.upsert(rotated, Duration::from_secs(60)).await;
        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert_eq!(inserts.load(Ordering::SeqCst), 2);
        assert_eq!(evicts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_preserves_runtime_state() {
        let store = AdStore::new();
        let ad = mk_ad("o1", ServerKind::Origin, b"k1", false);
        store.upsert(ad.clone(), Duration::from_secs(60)).await;

        store.set_io_load("https://o1.example.com", 12.5);
        store.set_health(ServerKind::Origin, "o1", HealthStatus::Ok);

        store.upsert(ad, Duration::from_secs(60)).await;
        let got = store.get(ServerKind::Origin, "o1").unwrap();
        assert_eq!(got.io_load, 12.5);
        assert_eq!(got.health_status, HealthStatus::Ok);
    }

    #[tokio::test]
    async fn topology_merge_keeps_native_identity() {
        let store = AdStore::new();

        let mut native = mk_ad("o1", ServerKind::Origin, b"k1", false);
        native.caps = Capabilities {
            reads: true,
            ..Default::default()
        };
        store.upsert(native, Duration::from_secs(60)).await;

        let mut topo = mk_ad("o1", ServerKind::Origin, b"", true);
        topo.caps = Capabilities {
            writes: true,
            public_reads: true,
            ..Default::default()
        };
        let outcome = store.upsert(topo, Duration::from_secs(60)).await;
        assert_eq!(outcome, UpsertOutcome::Merged);

        let got = store.get(ServerKind::Origin, "o1").unwrap();
        assert!(!got.from_topology);
        assert!(got.caps.reads && got.caps.writes && got.caps.public_reads);
    }

    #[tokio::test]
    async fn native_over_topology_keeps_capability_union() {
        let store = AdStore::new();

        let mut topo = mk_ad("o1", ServerKind::Origin, b"", true);
        topo.caps = Capabilities {
            writes: true,
            public_reads: true,
            ..Default::default()
        };
        store.upsert(topo, Duration::from_secs(60)).await;

        let mut native = mk_ad("o1", ServerKind::Origin, b"k1", false);
        native.caps = Capabilities {
            reads: true,
            ..Default::default()
        };
        let outcome = store.upsert(native, Duration::from_secs(60)).await;
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let got = store.get(ServerKind::Origin, "o1").unwrap();
        assert!(!got.from_topology);
        assert!(got.caps.reads && got.caps.writes && got.caps.public_reads);
    }

    #[tokio::test]
    async fn insert_then_delete_restores_prior_contents() {
        let store = AdStore::new();
        let a = mk_ad("a", ServerKind::Cache, b"k", false);
        store.upsert(a, Duration::from_secs(60)).await;

        let before: Vec<String> = {
            let mut names: Vec<String> = store
                .list(&[ServerKind::Origin, ServerKind::Cache])
                .into_iter()
                .map(|ad| ad.name)
                .collect();
            names.sort();
            names
        };

        let b = mk_ad("b", ServerKind::Cache, b"k", false);
        store.upsert(b, Duration::from_secs(60)).await;
        assert!(store.delete(ServerKind::Cache, "b").await);

        let after: Vec<String> = {
            let mut names: Vec<String> = store
                .list(&[ServerKind::Origin, ServerKind::Cache])
                .into_iter()
                .map(|ad| ad.name)
                .collect();
            names.sort();
            names
        };
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn delete_cancels_supervisor_token() {
        let store = AdStore::new();
        let token_slot: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
        {
            let slot = token_slot.clone();
            store.on_insert(move |_, cancel| {
                *slot.lock().unwrap() = Some(cancel.clone());
            });
        }

        let ad = mk_ad("o1", ServerKind::Origin, b"k1", false);
        store.upsert(ad, Duration::from_secs(60)).await;

        let token = token_slot.lock().unwrap().clone().unwrap();
        assert!(!token.is_cancelled());

        store.delete(ServerKind::Origin, "o1").await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn ttl_expiry_is_swept() {
        let store = AdStore::new();
        let ad = mk_ad("o1", ServerKind::Origin, b"k1", false);
        store.upsert(ad, Duration::from_millis(20)).await;
        assert!(store.get(ServerKind::Origin, "o1").is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get(ServerKind::Origin, "o1").is_none());
        assert_eq!(store.sweep_expired().await, 1);
        assert_eq!(store.len(), 0);
    }
}
