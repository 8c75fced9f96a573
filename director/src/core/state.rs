use std::sync::Arc;
use std::time::{Duration, Instant};

use common::schemas::FederationDiscovery;

use crate::core::ads::AdStore;
use crate::core::downtime::DowntimeDb;
use crate::core::filter::FilterRegistry;
use crate::core::stat::StatRegistry;
use crate::core::steering::Steering;
use crate::core::token::AdVerifier;

#[derive(Clone)]
pub struct DirectorState {
    pub http_client: reqwest::Client,

    pub store: Arc<AdStore>,
    pub filter: Arc<FilterRegistry>,
    pub stats: Arc<StatRegistry>,
    pub steering: Arc<Steering>,
    pub verifier: Arc<dyn AdVerifier>,
    pub downtime_db: Arc<DowntimeDb>,

    pub discovery: FederationDiscovery,
    pub ad_lifetime: Duration,
    pub started_at: Instant,
    pub startup_grace: Duration,
}

impl DirectorState {
    /// During the first minutes after boot most of the federation has not
    /// re-advertised yet, so steering failures are "try again" rather than
    /// "not found".
    pub fn warming_up(&self) -> bool {
        self.started_at.elapsed() < self.startup_grace
    }

    pub fn warmup_retry_after(&self) -> u32 {
        self.startup_grace
            .saturating_sub(self.started_at.elapsed())
            .as_secs()
            .max(1) as u32
    }
}
