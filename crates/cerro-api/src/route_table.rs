//! The synthesized route table and its published handle.
//!
//! A [`RouteTable`] is an immutable snapshot: every endpoint the manifest
//! derives, each bound to its compiled query skeleton, plus the SHA-256
//! fingerprint of the manifest it was built from. Tables are built off to
//! the side and published wholesale through [`RouteTableHandle`], an
//! `ArcSwap` pointer: readers take one lock-free snapshot per request and
//! resolve everything against it, so a concurrent swap can never show a
//! request a half-built table.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use cerro_core::endpoint::DeriveWarning;
use cerro_core::{derive_endpoints, ModelDescriptor, Result, Tier};

use crate::query::CompiledEndpoint;

/// Immutable snapshot of all synthesized endpoints.
#[derive(Debug)]
pub struct RouteTable {
    endpoints: HashMap<String, Arc<CompiledEndpoint>>,
    paths: Vec<String>,
    fingerprint: String,
    model_count: usize,
    warnings: Vec<DeriveWarning>,
    built_at: DateTime<Utc>,
}

impl RouteTable {
    /// Builds a table from manifest bytes and their parsed descriptors.
    ///
    /// # Errors
    ///
    /// Returns [`cerro_core::Error::DuplicatePath`] when two descriptors
    /// derive the same path; the caller keeps the previous table published.
    pub fn build(
        manifest_bytes: &[u8],
        models: &[ModelDescriptor],
        default_tier: Tier,
    ) -> Result<Self> {
        let derived = derive_endpoints(models, default_tier)?;

        let mut endpoints = HashMap::with_capacity(derived.endpoints.len());
        let mut paths = Vec::with_capacity(derived.endpoints.len());
        for spec in derived.endpoints {
            paths.push(spec.path.clone());
            endpoints.insert(spec.path.clone(), Arc::new(CompiledEndpoint::compile(spec)));
        }
        paths.sort_unstable();

        Ok(Self {
            endpoints,
            paths,
            fingerprint: fingerprint(manifest_bytes),
            model_count: models.len(),
            warnings: derived.warnings,
            built_at: Utc::now(),
        })
    }

    /// Resolves a request path to its compiled endpoint.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&Arc<CompiledEndpoint>> {
        self.endpoints.get(path)
    }

    /// Endpoint paths in sorted order.
    #[must_use]
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Number of synthesized endpoints.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Number of models in the source manifest.
    #[must_use]
    pub const fn model_count(&self) -> usize {
        self.model_count
    }

    /// SHA-256 fingerprint of the manifest this table was built from.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Descriptors excluded during derivation, with reasons.
    #[must_use]
    pub fn warnings(&self) -> &[DeriveWarning] {
        &self.warnings
    }

    /// When this snapshot was built.
    #[must_use]
    pub const fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }
}

/// Hex SHA-256 of the raw manifest bytes.
#[must_use]
pub fn fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// The published route-table pointer: single writer, lock-free readers.
#[derive(Debug)]
pub struct RouteTableHandle {
    current: ArcSwap<RouteTable>,
}

impl RouteTableHandle {
    /// Publishes the initial table.
    #[must_use]
    pub fn new(initial: RouteTable) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// Takes a snapshot. In-flight requests hold their snapshot across a
    /// concurrent publish.
    #[must_use]
    pub fn load(&self) -> Arc<RouteTable> {
        self.current.load_full()
    }

    /// Atomically replaces the published table.
    pub fn publish(&self, table: RouteTable) {
        self.current.store(Arc::new(table));
    }
}
