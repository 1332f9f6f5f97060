//! API error types and HTTP response mapping.
//!
//! Every request-path failure is translated 1:1 to an HTTP status and a
//! JSON body of the shape `{"detail": "<message>"}`. Manifest and table
//! build errors never surface here; they are contained in the refresh
//! path.

use axum::http::header::{HeaderName, RETRY_AFTER};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use cerro_core::Tier;

use crate::query::QueryBackendError;

/// API result type.
pub type ApiResult<T> = Result<T, ApiError>;

/// Name of the credential header.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Standard JSON error response body.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    /// Human-readable message (safe for clients).
    pub detail: String,
}

/// HTTP API error carrying its status and client-facing detail message.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
    retry_after_secs: Option<u64>,
    rate_limit: Option<u32>,
}

impl ApiError {
    /// The credential header was absent.
    #[must_use]
    pub fn missing_credential() -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            format!("Missing authentication header: {API_KEY_HEADER}"),
        )
    }

    /// The presented token is not in the trust store.
    #[must_use]
    pub fn invalid_credential() -> Self {
        Self::new(StatusCode::FORBIDDEN, "Invalid API Key")
    }

    /// The credential's tier rank is below the endpoint's requirement.
    ///
    /// Names the required tier, the caller's tier, and the caller's user so
    /// the rejection is debuggable without leaking other users' data.
    #[must_use]
    pub fn insufficient_tier(required: Tier, actual: Tier, user: &str, path: &str) -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            format!(
                "Access denied to {path}: requires {required}, API key of user '{user}' is {actual}"
            ),
        )
    }

    /// The credential exhausted its tier's per-minute budget.
    #[must_use]
    pub fn rate_limited(limit: u32, retry_after_secs: u64) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            detail: format!(
                "Rate limit exceeded: {limit} requests per minute. Retry after {retry_after_secs} seconds."
            ),
            retry_after_secs: Some(retry_after_secs),
            rate_limit: Some(limit),
        }
    }

    /// A supplied query parameter is unknown, missing, or out of range.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }

    /// No endpoint at the requested path.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// An internal error that should not happen in normal operation.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// The backend query timed out; surfaced as 503 to invite retry.
    #[must_use]
    pub fn query_timeout() -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "Query timed out")
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the client-facing detail message.
    #[must_use]
    pub fn detail(&self) -> &str {
        &self.detail
    }

    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
            retry_after_secs: None,
            rate_limit: None,
        }
    }
}

impl From<QueryBackendError> for ApiError {
    fn from(err: QueryBackendError) -> Self {
        // Transient backend failures invite a client retry (503);
        // permanent ones are a plain bad gateway (502).
        let status = if err.is_transient() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::BAD_GATEWAY
        };
        Self::new(status, format!("Query backend error: {err}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            Json(ApiErrorBody {
                detail: self.detail,
            }),
        )
            .into_response();

        let headers = response.headers_mut();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                headers.insert(RETRY_AFTER, value);
            }
        }
        if let Some(limit) = self.rate_limit {
            if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
                headers.insert(HeaderName::from_static("x-ratelimit-limit"), value);
            }
            headers.insert(
                HeaderName::from_static("x-ratelimit-remaining"),
                HeaderValue::from_static("0"),
            );
        }

        response
    }
}
