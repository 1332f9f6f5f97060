//! Per-credential rate limiting.
//!
//! Step four of the access state machine. Each credential gets one
//! `governor` limiter sized by its tier's per-minute budget; the counter is
//! keyed by credential identity, not by endpoint, so a single budget is
//! shared across every endpoint the credential calls.
//!
//! Limiters are created lazily on first use. Memory stays bounded because
//! unknown tokens are rejected by the trust-store lookup before reaching
//! this step, so the arena can never exceed the credential store size.
//!
//! When rate limited, responses carry `Retry-After`, `X-RateLimit-Limit`,
//! and `X-RateLimit-Remaining: 0`.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::RwLock;

use cerro_core::{Tier, TierPolicy};

use crate::auth::RequestContext;
use crate::error::ApiError;

type CredentialLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Rate limiting state shared across all request handlers.
pub struct RateLimitState {
    enabled: bool,
    policy: TierPolicy,
    limiters: RwLock<HashMap<String, Arc<CredentialLimiter>>>,
}

impl std::fmt::Debug for RateLimitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitState")
            .field("enabled", &self.enabled)
            .field("policy", &self.policy)
            .field("limiters", &"<HashMap>")
            .finish()
    }
}

impl RateLimitState {
    /// Creates rate limit state with the given tier policy.
    #[must_use]
    pub fn new(enabled: bool, policy: TierPolicy) -> Self {
        Self {
            enabled,
            policy,
            limiters: RwLock::new(HashMap::new()),
        }
    }

    /// Checks the budget for one request by `credential` at `tier`.
    pub async fn check(&self, credential: &str, tier: Tier) -> RateLimitResult {
        if !self.enabled {
            return RateLimitResult::Allowed { limit: 0 };
        }

        let limit = self.policy.requests_per_minute(tier);
        let limiter = self.get_or_create_limiter(credential, limit).await;

        match limiter.check() {
            Ok(()) => RateLimitResult::Allowed { limit },
            Err(not_until) => {
                let retry_after =
                    not_until.wait_time_from(governor::clock::Clock::now(&DefaultClock::default()));
                RateLimitResult::Limited {
                    limit,
                    // Round up so clients never retry a moment too early.
                    retry_after_secs: retry_after.as_secs().max(1),
                }
            }
        }
    }

    /// Checks the budget and converts a limited outcome into the API error,
    /// recording the hit.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::rate_limited`] when the credential is over its
    /// tier budget.
    pub async fn enforce(&self, ctx: &RequestContext, path: &str) -> Result<(), ApiError> {
        match self.check(&ctx.token, ctx.tier).await {
            RateLimitResult::Allowed { .. } => Ok(()),
            RateLimitResult::Limited {
                limit,
                retry_after_secs,
            } => {
                tracing::warn!(
                    user = %ctx.user,
                    tier = %ctx.tier,
                    path = %path,
                    request_id = %ctx.request_id,
                    limit = limit,
                    retry_after_secs = retry_after_secs,
                    "rate limit exceeded"
                );
                crate::metrics::record_rate_limit_hit(path);
                Err(ApiError::rate_limited(limit, retry_after_secs))
            }
        }
    }

    async fn get_or_create_limiter(
        &self,
        credential: &str,
        requests_per_minute: u32,
    ) -> Arc<CredentialLimiter> {
        // Fast path: limiter exists.
        {
            let read_guard = self.limiters.read().await;
            if let Some(limiter) = read_guard.get(credential) {
                return Arc::clone(limiter);
            }
        }

        // Slow path: create under the write lock, double-checking after
        // acquisition.
        let mut write_guard = self.limiters.write().await;
        if let Some(limiter) = write_guard.get(credential) {
            return Arc::clone(limiter);
        }

        let limiter = Arc::new(RateLimiter::direct(tier_quota(requests_per_minute)));
        write_guard.insert(credential.to_string(), Arc::clone(&limiter));
        limiter
    }
}

/// The whole per-minute budget is available as burst: N requests in any
/// window succeed, the (N+1)th fails until cells replenish.
fn tier_quota(requests_per_minute: u32) -> Quota {
    let budget = NonZeroU32::new(requests_per_minute.max(1)).unwrap_or(NonZeroU32::MIN);
    Quota::per_minute(budget).allow_burst(budget)
}

/// Result of a rate limit check.
#[derive(Debug)]
pub enum RateLimitResult {
    /// Request is allowed.
    Allowed {
        /// Configured limit (0 when limiting is disabled).
        limit: u32,
    },
    /// Request is rate limited.
    Limited {
        /// Configured limit.
        limit: u32,
        /// Seconds until the client can retry.
        retry_after_secs: u64,
    },
}
