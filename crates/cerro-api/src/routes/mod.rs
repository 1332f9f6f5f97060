//! HTTP route handlers.
//!
//! Almost the entire surface is synthesized: one generic dispatcher in
//! [`data`] serves every manifest-derived path. The handful of fixed
//! routes (status, health, refresh, route listing) live in [`system`].

pub mod data;
pub mod system;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;

use crate::server::AppState;

/// Concurrent backend queries allowed through the dispatcher.
const MAX_QUERY_CONCURRENCY: usize = 8;

/// `/v1` routes (authenticated).
///
/// The fixed `system` paths win over the wildcard; the router matches
/// most-specific first.
pub fn v1_routes() -> Router<Arc<AppState>> {
    let data = Router::new()
        .route("/*path", get(data::dispatch))
        .layer(ConcurrencyLimitLayer::new(MAX_QUERY_CONCURRENCY));

    Router::new()
        .route("/system/routes", get(system::list_routes))
        .route("/system/manifest/refresh", post(system::refresh_manifest))
        .merge(data)
}
