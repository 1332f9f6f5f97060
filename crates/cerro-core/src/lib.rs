//! # cerro-core
//!
//! Core domain logic for Cerro, the manifest-driven analytics data API.
//!
//! This crate is pure computation, no I/O:
//!
//! - **Manifest parsing**: typed [`manifest::ModelDescriptor`]s from the
//!   pipeline's metadata document
//! - **Endpoint derivation**: the tag convention that turns descriptors
//!   into URL paths, groups, parameters, and access tiers
//! - **Access tiers**: the ordered tier hierarchy and per-tier budgets
//! - **Error types**: shared error definitions and result types
//!
//! Fetching manifests, serving HTTP, and executing queries live in
//! `cerro-api`; everything there that decides *what* an endpoint is
//! delegates to this crate.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod endpoint;
pub mod error;
pub mod manifest;
pub mod observability;
pub mod tier;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::endpoint::{Derived, EndpointSpec, Operator, ParamSpec, ValueType};
    pub use crate::error::{Error, Result};
    pub use crate::manifest::{Column, ModelDescriptor};
    pub use crate::tier::{Tier, TierPolicy};
}

pub use endpoint::{derive_endpoints, Derived, DeriveWarning, EndpointSpec, ParamSpec};
pub use error::{Error, Result};
pub use manifest::{parse_models, Column, ModelDescriptor};
pub use observability::{init_logging, LogFormat};
pub use tier::{Tier, TierPolicy};
