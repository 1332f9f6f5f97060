//! # cerro-api
//!
//! HTTP surface for Cerro: a data API whose route set is synthesized at
//! runtime from the analytics pipeline's manifest.
//!
//! This crate handles:
//!
//! - **Route synthesis**: manifest → route table snapshots, atomically
//!   swapped on refresh with zero downtime
//! - **Access control**: API-key authentication, tier hierarchy, and
//!   per-credential rate limiting
//! - **Query bridging**: compiled per-endpoint queries against ClickHouse
//! - **Observability**: structured logs, Prometheus metrics, health checks
//!
//! ## Design Principles
//!
//! Endpoint semantics (the tag convention, tier ordering, parameter
//! detection) live in `cerro-core`; this crate decides *how* to serve
//! them. There is no per-route registration: one generic dispatcher
//! resolves every request against the current immutable table snapshot.
//!
//! ## Endpoints
//!
//! ```text
//! GET  /                              - Service status
//! GET  /health                        - Health check
//! GET  /metrics                       - Prometheus metrics
//! GET  /v1/<category>/<resource>[/<granularity>] - Synthesized data endpoints
//! GET  /v1/system/routes              - Current route table listing
//! POST /v1/system/manifest/refresh    - Manual refresh (tier3)
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod auth;
pub mod config;
pub mod error;
pub mod manifest_loader;
pub mod metrics;
pub mod query;
pub mod rate_limit;
pub mod refresh;
pub mod route_table;
pub mod routes;
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::auth::{ApiKeyStore, RequestContext};
    pub use crate::config::Config;
    pub use crate::error::{ApiError, ApiResult};
    pub use crate::server::{Server, ServerBuilder};
}
