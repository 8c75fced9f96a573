pub const MAX_OBJECT_PATH_LEN: usize = 4096;

pub const HEALTH_ENDPOINT: &str = "/api/v1.0/health";
pub const OBJECT_STAT_ENDPOINT: &str = "/api/v1.0/objects";
pub const GOSSIP_ENDPOINT: &str = "/api/v1.0/director/gossip";

/// Rate query fired against the metrics backend for per-server I/O load.
pub const IO_RATE_QUERY: &str = "rate(server_io_total{job=\"origin_cache_servers\"}[5m])";
