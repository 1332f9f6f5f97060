//! Manifest refresh: rebuild the route table without downtime.
//!
//! A refresh loads the manifest, derives endpoints, builds a brand-new
//! [`RouteTable`](crate::route_table::RouteTable), and only on success
//! publishes it. Any failure, at any stage, leaves the currently published
//! table untouched: stale-but-serving. Refreshes are serialized by an
//! internal mutex so the interval task and a manual trigger can't race each
//! other's builds.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use cerro_core::observability::refresh_span;
use cerro_core::Tier;

use crate::manifest_loader::{LoadOutcome, ManifestLoader};
use crate::route_table::{fingerprint, RouteTable, RouteTableHandle};

/// Terminal state of one refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshStatus {
    /// A new table was built and published.
    Reloaded,
    /// The manifest had not changed; the table was kept.
    Unchanged,
    /// The refresh failed; the previous table remains published.
    Error,
}

/// Report returned by a refresh cycle (and by the manual refresh endpoint).
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    /// What the cycle did.
    pub status: RefreshStatus,
    /// Models in the currently published table's manifest.
    pub models: usize,
    /// Endpoints in the currently published table.
    pub endpoints: usize,
    /// Failure description when `status` is `error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Rebuilds and publishes route tables from fresh manifests.
#[derive(Debug)]
pub struct Refresher {
    loader: ManifestLoader,
    handle: Arc<RouteTableHandle>,
    default_tier: Tier,
    gate: Mutex<()>,
}

impl Refresher {
    /// Creates a refresher bound to the published table handle.
    #[must_use]
    pub fn new(loader: ManifestLoader, handle: Arc<RouteTableHandle>, default_tier: Tier) -> Self {
        Self {
            loader,
            handle,
            default_tier,
            gate: Mutex::new(()),
        }
    }

    /// Runs one refresh cycle and reports the outcome.
    ///
    /// Never fails: errors are contained here, logged, counted, and the
    /// previous table stays published.
    pub async fn refresh(&self, trigger: &str) -> RefreshReport {
        self.refresh_inner().instrument(refresh_span(trigger)).await
    }

    async fn refresh_inner(&self) -> RefreshReport {
        let _serialized = self.gate.lock().await;

        let current = self.handle.load();

        let loaded = match self.loader.load(true).await {
            Ok(LoadOutcome::Unchanged) => {
                crate::metrics::record_manifest_refresh("unchanged");
                return self.report(RefreshStatus::Unchanged, None);
            }
            Ok(LoadOutcome::Loaded(loaded)) => loaded,
            Err(err) => {
                tracing::warn!(error = %err, "manifest refresh failed; keeping current table");
                crate::metrics::record_manifest_refresh("error");
                return self.report(RefreshStatus::Error, Some(err.to_string()));
            }
        };

        // The file fallback has no 304 short-circuit; the fingerprint
        // provides the same skip.
        if fingerprint(&loaded.bytes) == current.fingerprint() {
            crate::metrics::record_manifest_refresh("unchanged");
            return self.report(RefreshStatus::Unchanged, None);
        }

        match RouteTable::build(&loaded.bytes, &loaded.models, self.default_tier) {
            Ok(table) => {
                tracing::info!(
                    models = table.model_count(),
                    endpoints = table.endpoint_count(),
                    excluded = table.warnings().len(),
                    "route table rebuilt and published"
                );
                self.handle.publish(table);
                crate::metrics::record_manifest_refresh("reloaded");
                self.report(RefreshStatus::Reloaded, None)
            }
            Err(err) => {
                tracing::error!(error = %err, "route table build failed; keeping current table");
                crate::metrics::record_manifest_refresh("error");
                self.report(RefreshStatus::Error, Some(err.to_string()))
            }
        }
    }

    fn report(&self, status: RefreshStatus, detail: Option<String>) -> RefreshReport {
        let current = self.handle.load();
        RefreshReport {
            status,
            models: current.model_count(),
            endpoints: current.endpoint_count(),
            detail,
        }
    }

    /// Runs the periodic refresh loop until cancelled.
    ///
    /// Request handling never blocks on this task; it builds off to the
    /// side and swaps a single pointer.
    pub async fn run_background(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        tracing::info!(interval_secs = interval.as_secs(), "manifest refresh task started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("manifest refresh task cancelled");
                    return;
                }
                () = tokio::time::sleep(interval) => {
                    let report = self.refresh("interval").await;
                    if report.status == RefreshStatus::Error {
                        tracing::warn!(detail = ?report.detail, "periodic refresh failed");
                    }
                }
            }
        }
    }
}
