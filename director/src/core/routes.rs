use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::{info, warn};

use common::api_error::ApiError;
use common::path_utils::normalize_object_path;
use common::schemas::{
    AdvertiseRequest, FederationDiscovery, GossipBatch, HealthResponse, ServerAd, ServerKind,
};
use common::time_utils::utc_now_ms;

use crate::core::filter::FilterState;
use crate::core::gossip::ingest_peer_ads;
use crate::core::metrics;
use crate::core::state::DirectorState;
use crate::core::steering::{ClientInfo, Operation, SteerError};

// GET /.well-known/pelican-configuration
pub async fn federation_discovery(
    State(ctx): State<DirectorState>,
) -> Json<FederationDiscovery> {
    Json(ctx.discovery.clone())
}

// GET /api/v1.0/health
pub async fn health(State(_ctx): State<DirectorState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        message: "Director daemon is running and serving traffic".to_string(),
    })
}

#[derive(Deserialize)]
pub struct RedirectQuery {
    /// Probe top candidates and drop servers that do not hold the object.
    #[serde(default)]
    strict: bool,
    /// Optional client geolocation hint.
    lat: Option<f64>,
    lon: Option<f64>,
}

fn client_info(headers: &HeaderMap, query: &RedirectQuery) -> ClientInfo {
    let ip: IpAddr = headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(IpAddr::from([0, 0, 0, 0]));

    let coord = match (query.lat, query.lon) {
        (Some(lat), Some(lon)) => Some((lat, lon)),
        _ => None,
    };

    ClientInfo { ip, coord }
}

// GET /api/v1.0/director/object/{*path}
//
// 307 with an empty body; the ranked alternatives ride in the Link header.
#[tracing::instrument(name = "director.redirect", skip(ctx, headers, query), fields(path = raw_path))]
pub async fn redirect_object(
    Path(raw_path): Path<String>,
    Query(query): Query<RedirectQuery>,
    State(ctx): State<DirectorState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let object_path = normalize_object_path(&format!("/{}", raw_path.trim_start_matches('/')))?;
    let client = client_info(&headers, &query);

    let outcome = match ctx
        .steering
        .steer(&object_path, &client, Operation::Read, query.strict)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => return Err(steer_error(&ctx, e)),
    };

    let top = outcome
        .candidates
        .first()
        .ok_or(ApiError::NoCandidates)?;

    let mut location = format!("{}{}", top.ad.url, object_path);
    if let Some(token) = &outcome.token {
        location = format!("{location}?authz={token}");
    }

    let mut resp_headers = HeaderMap::new();
    resp_headers.insert(
        header::LOCATION,
        HeaderValue::from_str(&location)
            .map_err(|e| ApiError::Any(anyhow::anyhow!("bad location header: {e}")))?,
    );

    let links: Vec<String> = outcome
        .candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "<{}{}>; rel=\"duplicate\"; pri={}; depth={}",
                c.ad.url,
                object_path,
                i + 1,
                c.depth
            )
        })
        .collect();
    if let Ok(v) = HeaderValue::from_str(&links.join(", ")) {
        resp_headers.insert(header::LINK, v);
    }

    let ns = &outcome.namespace;
    if let Ok(v) = HeaderValue::from_str(&format!(
        "namespace={}, require-token={}",
        outcome.resolved_prefix, !ns.caps.public_reads
    )) {
        resp_headers.insert("X-Pelican-Namespace", v);
    }
    if !ns.caps.public_reads && !ns.token_issuers.is_empty() {
        let issuers: Vec<String> = ns
            .token_issuers
            .iter()
            .map(|iss| format!("issuer={}", iss.issuer_url))
            .collect();
        if let Ok(v) = HeaderValue::from_str(&issuers.join(", ")) {
            resp_headers.insert("X-Pelican-Authorization", v);
        }
    }
    if let Some(generation) = &ns.token_generation
        && let Ok(v) = HeaderValue::from_str(&format!(
            "issuer={}; strategy={}; max-scope-depth={}",
            generation.credential_issuer, generation.strategy, generation.max_scope_depth
        ))
    {
        resp_headers.insert("X-Pelican-Token-Generation", v);
    }

    Ok((StatusCode::TEMPORARY_REDIRECT, resp_headers))
}

fn steer_error(ctx: &DirectorState, err: SteerError) -> ApiError {
    // While the director warms up, an empty or half-empty ad store is the
    // expected state; tell clients to come back rather than 404/503.
    if ctx.warming_up()
        && matches!(
            err,
            SteerError::UnknownNamespace | SteerError::NoCandidates | SteerError::AllUnavailable
        )
    {
        return ApiError::WarmingUp {
            retry_after: ctx.warmup_retry_after(),
        };
    }

    match err {
        SteerError::UnknownNamespace => ApiError::UnknownNamespace,
        SteerError::NoCandidates => ApiError::NoCandidates,
        SteerError::AllUnavailable => ApiError::AllUnavailable { retry_after: 30 },
        SteerError::Overloaded => ApiError::Overloaded { retry_after: 1 },
        SteerError::Internal(e) => ApiError::Any(e),
    }
}

// POST /api/v1.0/director/advertise
#[tracing::instrument(name = "director.advertise", skip(ctx, req), fields(server = %req.ad.name, kind = %req.ad.kind))]
pub async fn advertise(
    State(ctx): State<DirectorState>,
    Json(req): Json<AdvertiseRequest>,
) -> Result<StatusCode, ApiError> {
    let payload = serde_json::to_vec(&req.ad)
        .map_err(|e| ApiError::BadRequest(format!("unserializable ad: {e}")))?;
    if !ctx.verifier.verify(&req.key_id, &payload, &req.signature) {
        return Err(ApiError::BadSignature);
    }

    for ns in &req.ad.namespaces {
        ns.validate().map_err(ApiError::BadRequest)?;
    }

    let mut ad = req.ad;
    common::url_utils::sanitize_url(&ad.url)
        .map_err(|e| ApiError::BadRequest(format!("bad server URL: {e}")))?;

    // The ingest endpoint is authoritative for provenance fields.
    ad.from_topology = false;
    ad.received_from_peer = false;
    ad.received_at = utc_now_ms();
    ad.signed_by_key_id = req.key_id.clone().into_bytes();

    // Same name, same kind, different endpoint, different key: a second
    // party is claiming an identity someone else registered.
    if let Some(existing) = ctx.store.get(ad.kind, &ad.name)
        && !existing.from_topology
        && existing.url != ad.url
        && existing.signed_by_key_id != ad.signed_by_key_id
    {
        warn!(server = %ad.name, "rejecting advertisement for an identity owned by another key");
        return Err(ApiError::IdentityConflict);
    }

    let outcome = ctx.store.upsert(ad, ctx.ad_lifetime).await;
    info!(?outcome, "processed advertisement");
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
pub struct ServersQuery {
    /// Restrict to "origin" or "cache".
    #[serde(rename = "type")]
    server_type: Option<String>,
    /// When set, only servers whose filtered state matches.
    filtered: Option<bool>,
}

#[derive(Serialize)]
pub struct ServerEntry {
    #[serde(flatten)]
    pub ad: ServerAd,
    pub filtered: bool,
    pub filter_reason: Option<FilterState>,
}

// GET /api/v1.0/director/servers
#[tracing::instrument(name = "director.list_servers", skip(ctx, query))]
pub async fn list_servers(
    State(ctx): State<DirectorState>,
    Query(query): Query<ServersQuery>,
) -> Result<Json<Vec<ServerEntry>>, ApiError> {
    let kinds: Vec<ServerKind> = match query.server_type.as_deref() {
        Some("origin") => vec![ServerKind::Origin],
        Some("cache") => vec![ServerKind::Cache],
        Some(other) => {
            return Err(ApiError::BadRequest(format!(
                "unknown server type {other:?}"
            )));
        }
        None => vec![ServerKind::Origin, ServerKind::Cache],
    };

    let mut entries: Vec<ServerEntry> = ctx
        .store
        .list(&kinds)
        .into_iter()
        .map(|ad| {
            let decision = ctx.filter.combine(&ad.name);
            ServerEntry {
                ad,
                filtered: decision.excluded,
                filter_reason: decision.reason,
            }
        })
        .filter(|entry| match query.filtered {
            Some(want) => entry.filtered == want,
            None => true,
        })
        .collect();
    entries.sort_by(|a, b| a.ad.name.cmp(&b.ad.name));

    Ok(Json(entries))
}

// POST /api/v1.0/director/gossip
#[tracing::instrument(name = "director.gossip", skip(ctx, batch), fields(peer = %batch.director, ads = batch.ads.len()))]
pub async fn gossip(
    State(ctx): State<DirectorState>,
    Json(batch): Json<GossipBatch>,
) -> Result<StatusCode, ApiError> {
    // Peer replicas keep their shorter lifetime even though the local ad
    // lifetime may be longer.
    let peer_ttl = ctx.ad_lifetime / 3;
    ingest_peer_ads(&ctx.store, batch, peer_ttl).await;
    Ok(StatusCode::OK)
}

// GET /metrics
pub async fn prometheus_metrics(State(_ctx): State<DirectorState>) -> Result<impl IntoResponse, ApiError> {
    let body = metrics::render()?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
