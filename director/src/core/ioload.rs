use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use common::constants::IO_RATE_QUERY;

use crate::core::ads::AdStore;

#[derive(Clone, Debug, PartialEq)]
pub struct IoLoadSample {
    pub server_url: String,
    pub rate: f64,
}

/// Source of per-server I/O rates. Production queries a Prometheus-style
/// range-rate API; tests feed canned samples.
#[async_trait]
pub trait IoStatSource: Send + Sync {
    async fn scrape(&self, deadline: Duration) -> anyhow::Result<Vec<IoLoadSample>>;
}

// Prometheus instant-query response, just the parts we read.
#[derive(Deserialize)]
struct PromResponse {
    status: String,
    data: PromData,
}

#[derive(Deserialize)]
struct PromData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<PromRow>,
}

#[derive(Deserialize)]
struct PromRow {
    metric: PromMetric,
    value: (f64, String),
}

#[derive(Deserialize)]
struct PromMetric {
    #[serde(default)]
    server_url: Option<String>,
}

pub struct PrometheusIoSource {
    client: reqwest::Client,
    query_url: String,
}

impl PrometheusIoSource {
    pub fn new(client: reqwest::Client, prometheus_base: &str) -> Self {
        PrometheusIoSource {
            client,
            query_url: format!("{}/api/v1/query", prometheus_base.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl IoStatSource for PrometheusIoSource {
    async fn scrape(&self, deadline: Duration) -> anyhow::Result<Vec<IoLoadSample>> {
        let resp: PromResponse = self
            .client
            .get(&self.query_url)
            .query(&[("query", IO_RATE_QUERY)])
            .timeout(deadline)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if resp.status != "success" {
            anyhow::bail!("metrics backend returned status {}", resp.status);
        }
        if resp.data.result_type != "vector" {
            anyhow::bail!(
                "metrics backend returned {} result, expected a vector",
                resp.data.result_type
            );
        }

        let mut samples = Vec::with_capacity(resp.data.result.len());
        for row in resp.data.result {
            let Some(server_url) = row.metric.server_url else {
                debug!("I/O rate row without a server_url label, skipping");
                continue;
            };
            let Ok(rate) = row.value.1.parse::<f64>() else {
                debug!(server = %server_url, raw = %row.value.1, "unparseable I/O rate");
                continue;
            };
            samples.push(IoLoadSample { server_url, rate });
        }
        Ok(samples)
    }
}

/// Every tick, pull the 5-minute I/O rate per server and attach it to the
/// matching advertisement. Uses the store's non-touching mutator: a dead
/// server that still answers metrics queries must not have its ad kept
/// alive by this loop.
pub async fn io_load_loop(
    store: Arc<AdStore>,
    source: Arc<dyn IoStatSource>,
    interval: Duration,
    deadline: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut tick = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = tick.tick() => {},
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
        }

        let samples = match source.scrape(deadline).await {
            Ok(samples) => samples,
            Err(e) => {
                warn!("failed to scrape I/O rates: {e:#}");
                continue;
            }
        };

        let mut applied = 0usize;
        for sample in &samples {
            if store.set_io_load(&sample.server_url, sample.rate) {
                applied += 1;
            } else {
                debug!(server = %sample.server_url, "I/O rate for unknown server");
            }
        }
        debug!("applied {applied}/{} I/O rate updates", samples.len());
    }

    info!("I/O load scraper stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prometheus_vector_response() {
        let raw = r#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"server_url": "https://o1.example.com"}, "value": [1700000000.0, "42.5"]},
                    {"metric": {}, "value": [1700000000.0, "1.0"]},
                    {"metric": {"server_url": "https://o2.example.com"}, "value": [1700000000.0, "nope"]}
                ]
            }
        }"#;
        let resp: PromResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.status, "success");
        assert_eq!(resp.data.result_type, "vector");
        assert_eq!(resp.data.result.len(), 3);
        assert_eq!(
            resp.data.result[0].metric.server_url.as_deref(),
            Some("https://o1.example.com")
        );
        assert_eq!(resp.data.result[0].value.1, "42.5");
    }
}
