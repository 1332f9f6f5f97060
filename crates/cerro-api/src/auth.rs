//! API-key trust store and request authentication.
//!
//! Every `/v1` request presents an opaque token in `X-API-Key`. The token
//! resolves to `{user, tier, org}` in a JSON trust store loaded at startup.
//! Authentication (header presence + lookup) runs in middleware; tier
//! authorization runs per endpoint once the route is resolved, because the
//! required tier is a property of the route table entry.
//!
//! Tokens are never logged; Debug impls on everything that holds one
//! redact it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{FromRequestParts, State};
use axum::http::header::HeaderName;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use ulid::Ulid;

use cerro_core::{Error, Tier};

use crate::error::{ApiError, API_KEY_HEADER};
use crate::server::AppState;

/// Header name for request IDs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Identity a token resolves to.
#[derive(Debug, Clone)]
pub struct KeyInfo {
    /// User identifier, for authorization error messages and logs.
    pub user: String,
    /// Access tier of the credential.
    pub tier: Tier,
    /// Optional organization label.
    pub org: Option<String>,
}

/// Token → identity mapping, immutable after load.
#[derive(Default, Clone)]
pub struct ApiKeyStore {
    keys: HashMap<String, KeyInfo>,
}

impl std::fmt::Debug for ApiKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyStore")
            .field("keys", &format!("<{} redacted>", self.keys.len()))
            .finish()
    }
}

impl ApiKeyStore {
    /// Loads the trust store from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or is not a JSON
    /// object.
    pub fn from_file(path: &Path) -> cerro_core::Result<Self> {
        let raw = std::fs::read(path).map_err(|e| {
            Error::InvalidInput(format!("failed to read {}: {e}", path.display()))
        })?;
        let value: Value = serde_json::from_slice(&raw).map_err(|e| {
            Error::InvalidInput(format!("invalid API keys JSON in {}: {e}", path.display()))
        })?;
        Self::from_value(&value)
    }

    /// Builds the trust store from a parsed JSON document.
    ///
    /// Two entry forms are accepted: `"<token>": "tier1"` (anonymous user)
    /// and `"<token>": {"user": …, "tier": …, "org": …}`. Entries of any
    /// other shape are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error when the document is not a JSON object.
    pub fn from_value(value: &Value) -> cerro_core::Result<Self> {
        let Some(entries) = value.as_object() else {
            return Err(Error::InvalidInput(
                "API keys document must be a JSON object".to_string(),
            ));
        };

        let mut keys = HashMap::new();
        for (token, info) in entries {
            match normalize_entry(info) {
                Some(info) => {
                    keys.insert(token.clone(), info);
                }
                None => {
                    tracing::warn!("skipping malformed API key entry");
                }
            }
        }
        Ok(Self { keys })
    }

    /// Resolves a presented token.
    #[must_use]
    pub fn lookup(&self, token: &str) -> Option<&KeyInfo> {
        self.keys.get(token)
    }

    /// Number of loaded credentials.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the store holds no credentials.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn normalize_entry(value: &Value) -> Option<KeyInfo> {
    match value {
        Value::String(tier) => Some(KeyInfo {
            user: "anonymous".to_string(),
            tier: Tier::from_tag(tier)?,
            org: None,
        }),
        Value::Object(fields) => {
            let tier = match fields.get("tier").and_then(Value::as_str) {
                Some(tier) => Tier::from_tag(tier)?,
                None => Tier::Tier0,
            };
            Some(KeyInfo {
                user: fields
                    .get("user")
                    .and_then(Value::as_str)
                    .unwrap_or("anonymous")
                    .to_string(),
                tier,
                org: fields
                    .get("org")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        }
        _ => None,
    }
}

/// Per-request context derived from the presented credential.
#[derive(Clone)]
pub struct RequestContext {
    /// The raw token, used as the rate-limit counter key. Never logged.
    pub token: String,
    /// Resolved user identifier.
    pub user: String,
    /// Resolved access tier.
    pub tier: Tier,
    /// Resolved organization, if any.
    pub org: Option<String>,
    /// Request ID for tracing/correlation.
    pub request_id: String,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("token", &"[REDACTED]")
            .field("user", &self.user)
            .field("tier", &self.tier)
            .field("org", &self.org)
            .field("request_id", &self.request_id)
            .finish()
    }
}

impl RequestContext {
    /// Tier comparison: step three of the access state machine.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::insufficient_tier`] when this credential's rank
    /// is below `required`.
    pub fn authorize(&self, required: Tier, path: &str) -> Result<(), ApiError> {
        if self.tier.allows(required) {
            return Ok(());
        }
        tracing::warn!(
            user = %self.user,
            tier = %self.tier,
            required = %required,
            path = %path,
            request_id = %self.request_id,
            "tier authorization failed"
        );
        Err(ApiError::insufficient_tier(
            required, self.tier, &self.user, path,
        ))
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequestContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if let Some(existing) = parts.extensions.get::<Self>() {
            return Ok(existing.clone());
        }

        let request_id = header_string(&parts.headers, REQUEST_ID_HEADER)
            .unwrap_or_else(|| Ulid::new().to_string());

        // Step one: header presence.
        let Some(token) = header_string(&parts.headers, API_KEY_HEADER) else {
            return Err(ApiError::missing_credential());
        };

        // Step two: trust store lookup.
        let Some(info) = state.key_store.lookup(&token) else {
            tracing::warn!(request_id = %request_id, "unknown API key presented");
            return Err(ApiError::invalid_credential());
        };

        let ctx = Self {
            token,
            user: info.user.clone(),
            tier: info.tier,
            org: info.org.clone(),
            request_id,
        };
        parts.extensions.insert(ctx.clone());
        Ok(ctx)
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Authentication middleware for `/v1` routes.
///
/// Runs steps one and two of the access state machine and injects a
/// verified [`RequestContext`] into request extensions. The request ID is
/// echoed on the response.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let (mut parts, body) = req.into_parts();

    let ctx = match RequestContext::from_request_parts(&mut parts, &state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };

    let mut req = Request::from_parts(parts, body);
    let request_id = ctx.request_id.clone();
    req.extensions_mut().insert(ctx);

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}
