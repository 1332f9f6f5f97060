//! The generic data dispatcher.
//!
//! Every manifest-derived endpoint is served by this one handler: it takes
//! a single route-table snapshot, resolves the path against it, walks the
//! remaining access-control steps (tier, rate limit), binds the query
//! parameters, and executes against the backend under the configured
//! timeout. Because resolution happens entirely against one snapshot, a
//! concurrent table swap can never mix old and new route state within a
//! request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::Json;
use tokio::time::timeout;

use crate::auth::RequestContext;
use crate::error::ApiError;
use crate::query::Row;
use crate::server::AppState;

/// Serves `GET /v1/*path` for all synthesized endpoints.
pub async fn dispatch(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(rest): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Row>>, ApiError> {
    let path = format!("/{}", rest.trim_matches('/').to_ascii_lowercase());

    // One snapshot per request; the swap is invisible to us from here on.
    let table = state.table.load();
    let Some(endpoint) = table.lookup(&path) else {
        return Err(ApiError::not_found(format!("Unknown endpoint: {path}")));
    };

    ctx.authorize(endpoint.spec.required_tier, &path)?;
    state.rate_limit.enforce(&ctx, &path).await?;

    let bound = endpoint.bind(&params)?;

    tracing::debug!(
        user = %ctx.user,
        path = %path,
        model = %endpoint.spec.model,
        request_id = %ctx.request_id,
        "executing endpoint query"
    );

    // Dropping the future on timeout (or client disconnect) aborts the
    // backend call; the bridge must not leak in-progress queries.
    let rows = timeout(
        Duration::from_secs(state.config.query_timeout_secs),
        state.backend.execute(&bound.sql, &bound.params),
    )
    .await
    .map_err(|_| {
        tracing::warn!(path = %path, request_id = %ctx.request_id, "backend query timed out");
        ApiError::query_timeout()
    })?
    .map_err(|err| {
        tracing::error!(
            path = %path,
            request_id = %ctx.request_id,
            transient = err.is_transient(),
            error = %err,
            "backend query failed"
        );
        ApiError::from(err)
    })?;

    Ok(Json(rows))
}
