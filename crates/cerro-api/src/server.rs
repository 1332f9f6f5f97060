//! API server implementation.
//!
//! Wires the manifest loader, route table, access control, and query
//! backend into an axum router. The first table build happens synchronously
//! here and is fatal on failure; after that the background refresher owns
//! rebuilds and the server only ever swaps in complete tables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use axum::middleware;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use cerro_core::{Error, Result, Tier, TierPolicy};

use crate::auth::ApiKeyStore;
use crate::config::{Config, CorsConfig};
use crate::manifest_loader::{LoadOutcome, ManifestLoader};
use crate::query::{ClickHouseBackend, MemoryBackend, QueryBackend};
use crate::rate_limit::RateLimitState;
use crate::refresh::Refresher;
use crate::route_table::{RouteTable, RouteTableHandle};

/// Shared application state for all request handlers.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Token trust store (read-only after load).
    pub key_store: Arc<ApiKeyStore>,
    /// Per-credential rate limiters.
    pub rate_limit: Arc<RateLimitState>,
    /// The published route-table pointer.
    pub table: Arc<RouteTableHandle>,
    /// Query execution backend.
    pub backend: Arc<dyn QueryBackend>,
    /// Manifest refresher (interval task + manual trigger).
    pub refresher: Arc<Refresher>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("key_store", &self.key_store)
            .field("rate_limit", &self.rate_limit)
            .field("table", &"<RouteTableHandle>")
            .field("backend", &"<QueryBackend>")
            .field("refresher", &"<Refresher>")
            .finish()
    }
}

/// The Cerro API server.
pub struct Server {
    config: Config,
    backend: Option<Arc<dyn QueryBackend>>,
    key_store: Option<ApiKeyStore>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("backend", &self.backend.is_some())
            .field("key_store", &self.key_store)
            .finish()
    }
}

impl Server {
    /// Creates a new server with the given configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            backend: None,
            key_store: None,
        }
    }

    /// Creates a new `ServerBuilder`.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Returns the server configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Builds shared state: trust store, backend, and the initial route
    /// table. The first build is synchronous and fatal on failure: there
    /// is nothing to serve without it.
    async fn build_state(&self) -> Result<Arc<AppState>> {
        let config = self.config.clone();

        let key_store = match &self.key_store {
            Some(store) => store.clone(),
            None => load_key_store(config.api_keys_file.as_deref())?,
        };
        if key_store.is_empty() {
            tracing::warn!("no API keys loaded; every request will be rejected");
        } else {
            tracing::info!(keys = key_store.len(), "API key trust store loaded");
        }

        let backend = match &self.backend {
            Some(backend) => Arc::clone(backend),
            None => build_backend(&config)?,
        };

        let loader = ManifestLoader::new(config.manifest.clone());
        let table = match loader.load(false).await? {
            LoadOutcome::Loaded(loaded) => {
                RouteTable::build(&loaded.bytes, &loaded.models, config.default_endpoint_tier)?
            }
            LoadOutcome::Unchanged => {
                return Err(Error::unavailable(
                    "manifest source returned 304 on initial load",
                ));
            }
        };
        tracing::info!(
            models = table.model_count(),
            endpoints = table.endpoint_count(),
            excluded = table.warnings().len(),
            fingerprint = %table.fingerprint(),
            "initial route table built"
        );

        let handle = Arc::new(RouteTableHandle::new(table));
        let refresher = Arc::new(Refresher::new(
            loader,
            Arc::clone(&handle),
            config.default_endpoint_tier,
        ));
        let rate_limit = Arc::new(RateLimitState::new(
            config.rate_limit_enabled,
            TierPolicy::default(),
        ));

        Ok(Arc::new(AppState {
            config,
            key_store: Arc::new(key_store),
            rate_limit,
            table: handle,
            backend,
            refresher,
        }))
    }

    /// Creates the router with all routes and middleware.
    fn create_router(&self, state: Arc<AppState>) -> Router {
        let cors = build_cors_layer(&self.config.cors);
        let auth_layer =
            middleware::from_fn_with_state(Arc::clone(&state), crate::auth::auth_middleware);
        let metrics_layer = middleware::from_fn(crate::metrics::metrics_middleware);

        Router::new()
            // Status, health, and metrics endpoints (no auth required)
            .route("/", get(crate::routes::system::root))
            .route("/health", get(crate::routes::system::health))
            .route("/metrics", get(crate::metrics::serve_metrics))
            // The synthesized surface (auth via RequestContext middleware)
            .nest("/v1", crate::routes::v1_routes().layer(auth_layer))
            .fallback(crate::routes::system::not_found)
            // Middleware (order matters): metrics outermost for timing,
            // then trace, then CORS.
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(metrics_layer)
            .with_state(state)
    }

    /// Starts the server and blocks until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid, the initial route
    /// table cannot be built, or the listener cannot bind.
    pub async fn serve(&self) -> Result<()> {
        self.config.validate()?;
        crate::metrics::init_metrics();

        let state = self.build_state().await?;
        let router = self.create_router(Arc::clone(&state));

        let cancel = CancellationToken::new();
        if state.config.manifest.refresh_enabled {
            let interval = Duration::from_secs(state.config.manifest.refresh_interval_secs);
            tokio::spawn(
                Arc::clone(&state.refresher).run_background(interval, cancel.child_token()),
            );
        } else {
            tracing::info!("manifest background refresh disabled");
        }
        let _refresh_guard = cancel.drop_guard();

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        tracing::info!(http_port = self.config.http_port, "Starting Cerro API server");

        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            Error::Internal {
                message: format!("failed to bind to {addr}: {e}"),
            }
        })?;

        axum::serve(listener, router)
            .await
            .map_err(|e| Error::Internal {
                message: format!("server error: {e}"),
            })?;

        Ok(())
    }

    /// Creates a test router for integration tests, building real state
    /// (trust store, table, backend) without binding a port.
    ///
    /// # Errors
    ///
    /// Returns an error when state building fails, exactly as `serve` would.
    #[doc(hidden)]
    pub async fn test_router(&self) -> Result<Router> {
        let state = self.build_state().await?;
        Ok(self.create_router(state))
    }
}

fn load_key_store(path: Option<&std::path::Path>) -> Result<ApiKeyStore> {
    match path {
        Some(path) => ApiKeyStore::from_file(path),
        None => {
            tracing::warn!("CERRO_API_KEYS_FILE not set; starting with an empty trust store");
            Ok(ApiKeyStore::default())
        }
    }
}

fn build_backend(config: &Config) -> Result<Arc<dyn QueryBackend>> {
    if config.clickhouse.is_configured() {
        let timeout = Duration::from_secs(config.query_timeout_secs);
        let backend = ClickHouseBackend::new(&config.clickhouse, timeout);
        tracing::info!(backend = ?backend, "Using ClickHouse query backend");
        return Ok(Arc::new(backend));
    }
    if config.debug {
        tracing::warn!("ClickHouse not configured; using in-memory query backend (debug only)");
        return Ok(Arc::new(MemoryBackend::new()));
    }
    Err(Error::InvalidInput(
        "CERRO_CLICKHOUSE_URL or CERRO_CLICKHOUSE_HOST is required when CERRO_DEBUG=false"
            .to_string(),
    ))
}

fn build_cors_layer(cors_config: &CorsConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::HEAD, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::HeaderName::from_static("x-api-key"),
            header::HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-request-id"),
        ])
        .max_age(Duration::from_secs(cors_config.max_age_seconds));

    if cors_config.allowed_origins.is_empty() {
        return cors;
    }
    if cors_config.allowed_origins.iter().any(|origin| origin == "*") {
        return cors.allow_origin(Any);
    }

    let mut allowed = Vec::new();
    for origin in &cors_config.allowed_origins {
        match HeaderValue::from_str(origin) {
            Ok(value) => allowed.push(value),
            Err(_) => {
                tracing::error!(
                    origin = %origin,
                    "Invalid CORS origin; expected a valid HeaderValue"
                );
            }
        }
    }

    if allowed.is_empty() {
        tracing::warn!("All configured CORS origins were invalid; disabling CORS");
        cors
    } else {
        tracing::info!(origins = ?cors_config.allowed_origins, "CORS configured");
        cors.allow_origin(AllowOrigin::list(allowed))
    }
}

/// Builder for constructing a server.
pub struct ServerBuilder {
    config: Config,
    backend: Option<Arc<dyn QueryBackend>>,
    key_store: Option<ApiKeyStore>,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("backend", &self.backend.is_some())
            .field("key_store", &self.key_store)
            .finish()
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            backend: None,
            key_store: None,
        }
    }
}

impl ServerBuilder {
    /// Creates a new server builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the HTTP port.
    #[must_use]
    pub fn http_port(mut self, port: u16) -> Self {
        self.config.http_port = port;
        self
    }

    /// Enables debug mode.
    #[must_use]
    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    /// Sets the local manifest path.
    #[must_use]
    pub fn manifest_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.manifest.path = Some(path.into());
        self
    }

    /// Sets the remote manifest URL.
    #[must_use]
    pub fn manifest_url(mut self, url: impl Into<String>) -> Self {
        self.config.manifest.url = Some(url.into());
        self
    }

    /// Sets the required tier for untagged endpoints.
    #[must_use]
    pub fn default_endpoint_tier(mut self, tier: Tier) -> Self {
        self.config.default_endpoint_tier = tier;
        self
    }

    /// Enables or disables rate limiting.
    #[must_use]
    pub fn rate_limit_enabled(mut self, enabled: bool) -> Self {
        self.config.rate_limit_enabled = enabled;
        self
    }

    /// Sets the query backend used by the dispatcher.
    ///
    /// By default the backend is derived from configuration (ClickHouse,
    /// or in-memory in debug mode).
    #[must_use]
    pub fn query_backend(mut self, backend: Arc<dyn QueryBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Sets the API-key trust store directly, bypassing the file load.
    #[must_use]
    pub fn key_store(mut self, store: ApiKeyStore) -> Self {
        self.key_store = Some(store);
        self
    }

    /// Builds the server.
    #[must_use]
    pub fn build(self) -> Server {
        Server {
            config: self.config,
            backend: self.backend,
            key_store: self.key_store,
        }
    }
}
