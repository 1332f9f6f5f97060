//! Fixed system routes: status, health, route listing, manual refresh.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use cerro_core::Tier;

use crate::auth::RequestContext;
use crate::error::ApiError;
use crate::refresh::RefreshReport;
use crate::server::AppState;

/// Service status document served at `/`.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct StatusResponse {
    /// Always `"online"` while the process serves.
    pub status: String,
    /// Service name.
    pub service: String,
    /// Service version.
    pub version: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
}

/// One synthesized endpoint in the `/v1/system/routes` listing.
#[derive(Debug, Serialize)]
pub struct RouteEntry {
    /// Endpoint path under `/v1`.
    pub path: String,
    /// Display grouping key.
    pub group: String,
    /// Required access tier.
    pub tier: Tier,
    /// Source model name.
    pub model: String,
    /// Human title.
    pub summary: String,
}

/// Route table summary wrapping the listing.
#[derive(Debug, Serialize)]
pub struct RouteListing {
    /// Manifest fingerprint the table was built from.
    pub manifest_fingerprint: String,
    /// When the table was built.
    pub built_at: chrono::DateTime<chrono::Utc>,
    /// Synthesized endpoints, sorted by path.
    pub routes: Vec<RouteEntry>,
}

/// Root status endpoint handler (no auth).
pub async fn root() -> impl IntoResponse {
    Json(StatusResponse {
        status: "online".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Health check endpoint handler (no auth).
///
/// Shallow liveness only; does not touch the query backend.
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Lists the endpoints of the current route-table snapshot.
///
/// GET /v1/system/routes
pub async fn list_routes(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
) -> Result<Json<RouteListing>, ApiError> {
    let path = "/v1/system/routes";
    ctx.authorize(Tier::Tier0, path)?;
    state.rate_limit.enforce(&ctx, path).await?;

    let table = state.table.load();
    let routes = table
        .paths()
        .iter()
        .filter_map(|p| table.lookup(p))
        .map(|endpoint| RouteEntry {
            path: endpoint.spec.path.clone(),
            group: endpoint.spec.group.clone(),
            tier: endpoint.spec.required_tier,
            model: endpoint.spec.model.clone(),
            summary: endpoint.spec.summary.clone(),
        })
        .collect();

    Ok(Json(RouteListing {
        manifest_fingerprint: table.fingerprint().to_string(),
        built_at: table.built_at(),
        routes,
    }))
}

/// Triggers an immediate out-of-band manifest refresh.
///
/// POST /v1/system/manifest/refresh (tier3 only).
pub async fn refresh_manifest(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
) -> Result<Json<RefreshReport>, ApiError> {
    let path = "/v1/system/manifest/refresh";
    ctx.authorize(Tier::Tier3, path)?;
    state.rate_limit.enforce(&ctx, path).await?;

    tracing::info!(user = %ctx.user, request_id = %ctx.request_id, "manual manifest refresh");
    let report = state.refresher.refresh("manual").await;
    Ok(Json(report))
}

/// Fallback for paths outside the API surface.
pub async fn not_found() -> ApiError {
    ApiError::not_found("Not Found")
}
