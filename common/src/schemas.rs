use serde::{Deserialize, Serialize};
use std::fmt::Display;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Origin,
    Cache,
}

impl Display for ServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerKind::Origin => write!(f, "origin"),
            ServerKind::Cache => write!(f, "cache"),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Ok,
    Degraded,
    Down,
}

impl Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "unknown"),
            HealthStatus::Ok => write!(f, "ok"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Down => write!(f, "down"),
        }
    }
}

/// Permission bits carried by both servers and namespaces.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub public_reads: bool,
    pub reads: bool,
    pub writes: bool,
    pub listings: bool,
    pub direct_reads: bool,
}

impl Capabilities {
    /// Union of two capability sets. Merging colliding ads must only ever
    /// widen permissions.
    pub fn union(&self, other: &Capabilities) -> Capabilities {
        Capabilities {
            public_reads: self.public_reads || other.public_reads,
            reads: self.reads || other.reads,
            writes: self.writes || other.writes,
            listings: self.listings || other.listings,
            direct_reads: self.direct_reads || other.direct_reads,
        }
    }

    /// Both the server and the namespace have to permit an operation.
    pub fn intersect(&self, other: &Capabilities) -> Capabilities {
        Capabilities {
            public_reads: self.public_reads && other.public_reads,
            reads: self.reads && other.reads,
            writes: self.writes && other.writes,
            listings: self.listings && other.listings,
            direct_reads: self.direct_reads && other.direct_reads,
        }
    }

    pub fn as_labels(&self) -> Vec<&'static str> {
        let mut labels = Vec::new();
        if self.public_reads {
            labels.push("public-reads");
        }
        if self.reads {
            labels.push("reads");
        }
        if self.writes {
            labels.push("writes");
        }
        if self.listings {
            labels.push("listings");
        }
        if self.direct_reads {
            labels.push("direct-reads");
        }
        labels
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TokenIssuer {
    pub issuer_url: String,
    pub base_paths: Vec<String>,
    #[serde(default)]
    pub restricted_paths: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TokenGen {
    pub strategy: String,
    #[serde(default)]
    pub vault_server: String,
    pub max_scope_depth: u32,
    pub credential_issuer: String,
}

/// A prefix of the object space exported by an origin.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NamespaceAd {
    pub path: String,
    pub caps: Capabilities,
    #[serde(default)]
    pub token_issuers: Vec<TokenIssuer>,
    #[serde(default)]
    pub token_generation: Option<TokenGen>,
    #[serde(default)]
    pub from_topology: bool,
}

impl NamespaceAd {
    /// Non-public namespaces must name at least one token issuer, otherwise
    /// no client could ever authorize against them.
    pub fn validate(&self) -> Result<(), String> {
        if !self.caps.public_reads && self.token_issuers.is_empty() {
            return Err(format!(
                "namespace {} requires tokens on read but lists no token issuer",
                self.path
            ));
        }
        Ok(())
    }
}

/// Soft-state record by which an origin or cache announces itself.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ServerAd {
    pub name: String,
    pub kind: ServerKind,
    pub url: String,
    #[serde(default)]
    pub auth_url: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,

    #[serde(default)]
    pub from_topology: bool,
    #[serde(default)]
    pub received_from_peer: bool,
    #[serde(default)]
    pub signed_by_key_id: Vec<u8>,
    pub received_at: i128, // epoch ms

    pub caps: Capabilities,

    // Runtime state, mutated only by attached background routines.
    #[serde(default)]
    pub io_load: f64, // 0.0 = unknown
    #[serde(default = "default_health")]
    pub health_status: HealthStatus,
    #[serde(default)]
    pub last_probe_at: Option<i128>,

    // Optional coordinate used for distance ranking.
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,

    #[serde(default)]
    pub namespaces: Vec<NamespaceAd>,
}

fn default_health() -> HealthStatus {
    HealthStatus::Unknown
}

/// Envelope for `POST /api/v1.0/director/advertise`. The signature covers the
/// serialized `ad` field; key management lives outside the director.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdvertiseRequest {
    pub ad: ServerAd,
    pub key_id: String,
    pub signature: String, // base64url, no padding
}

/// Batch of advertisements replicated between director replicas.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipBatch {
    pub director: String,
    pub ads: Vec<ServerAd>,
}

/// `GET /.well-known/pelican-configuration` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FederationDiscovery {
    pub director_endpoint: String,
    pub namespace_registration_endpoint: String,
    pub broker_endpoint: String,
    pub jwks_uri: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub message: String,
}
