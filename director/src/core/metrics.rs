use once_cell::sync::Lazy;
use prometheus::{
    GaugeVec, IntCounterVec, IntGaugeVec, register_gauge_vec, register_int_counter_vec,
    register_int_gauge_vec,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::core::ads::AdStore;
use crate::core::filter::FilterRegistry;
use crate::core::stat::StatRegistry;

/// Number of servers currently known to the director, by identity.
/// Incremented on ad insertion, decremented on eviction.
pub static SERVER_COUNT: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "pelican_director_server_count",
        "Number of servers currently advertised to the director",
        &["server_name", "server_type", "from_topology"]
    )
    .unwrap()
});

/// Counters scraped off the ad store: insertions, evictions, hits, misses,
/// and the current total.
pub static TTL_CACHE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "pelican_director_ttl_cache",
        "Statistics for the director's TTL caches",
        &["name", "type"]
    )
    .unwrap()
});

/// Health state machine transitions, labelled by edge.
pub static HEALTH_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pelican_director_health_transitions_total",
        "Server health state machine transitions",
        &["server_name", "from", "to"]
    )
    .unwrap()
});

/// Sizes of the director's internal maps.
pub static MAP_ITEMS_TOTAL: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "pelican_director_map_items_total",
        "Number of items in the director's internal maps",
        &["name"]
    )
    .unwrap()
});

/// Render the default registry in Prometheus text exposition format.
pub fn render() -> anyhow::Result<String> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    encoder.encode(&families, &mut buf)?;
    Ok(String::from_utf8(buf)?)
}

/// Keep the server-count gauge in sync with the ad store.
pub fn attach_server_count_hooks(store: &AdStore) {
    store.on_insert(|ad, _cancel| {
        SERVER_COUNT
            .with_label_values(&[
                &ad.name,
                &ad.kind.to_string(),
                &ad.from_topology.to_string(),
            ])
            .inc();
    });
    store.on_evict(|ad, _reason| {
        SERVER_COUNT
            .with_label_values(&[
                &ad.name,
                &ad.kind.to_string(),
                &ad.from_topology.to_string(),
            ])
            .dec();
    });
}

/// Periodically scrape the ad store and the internal maps into gauges.
pub async fn map_metrics_loop(
    store: Arc<AdStore>,
    filter: Arc<FilterRegistry>,
    stats: Arc<StatRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut tick = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = tick.tick() => {},
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
        }

        let m = store.metrics();
        TTL_CACHE
            .with_label_values(&["serverAds", "insertions"])
            .set(m.insertions as f64);
        TTL_CACHE
            .with_label_values(&["serverAds", "evictions"])
            .set(m.evictions as f64);
        TTL_CACHE
            .with_label_values(&["serverAds", "hits"])
            .set(m.hits as f64);
        TTL_CACHE
            .with_label_values(&["serverAds", "misses"])
            .set(m.misses as f64);
        TTL_CACHE
            .with_label_values(&["serverAds", "total"])
            .set(store.len() as f64);

        MAP_ITEMS_TOTAL
            .with_label_values(&["filteredServers"])
            .set(filter.len() as i64);
        MAP_ITEMS_TOTAL
            .with_label_values(&["serverStatUtils"])
            .set(stats.server_count() as i64);
        MAP_ITEMS_TOTAL
            .with_label_values(&["serverStatEntries"])
            .set(stats.entry_count() as i64);
    }

    info!("map metrics loop stopped");
    Ok(())
}
