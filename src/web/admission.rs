//! Per-route admission control.
//!
//! [`with_rate_limit`] wraps a route so every inbound request makes exactly
//! one `is_allowed` call on the route's limiter before the handler runs.
//! Rejections are synthesized here as 429s carrying the standard
//! `Retry-After` and `X-RateLimit-*` headers; nothing is retried server-side.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::MethodRouter;
use axum::Json;
use serde_json::json;
use tracing::info;

use super::client_key::client_key_from_headers;
use crate::error::ChatRelayError;
use crate::rate_limit::{LimiterRegistry, RateLimitConfig, RateLimitTier, RateLimiter};

#[derive(Clone)]
pub struct Admission {
    feature: Arc<str>,
    limiter: Arc<RateLimiter>,
    config: RateLimitConfig,
}

/// Outcome of a rejected admission check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub limit: usize,
    pub retry_after_secs: u64,
    pub reset_epoch_secs: u64,
}

impl Admission {
    pub fn new(feature: &str, limiter: Arc<RateLimiter>, config: RateLimitConfig) -> Self {
        Self {
            feature: Arc::from(feature),
            limiter,
            config,
        }
    }

    /// Admission for `feature` using its server-enforced tier.
    pub fn for_feature(registry: &LimiterRegistry, feature: &str) -> Result<Self, ChatRelayError> {
        let config = registry
            .config(feature, RateLimitTier::Server)
            .cloned()
            .ok_or_else(|| {
                ChatRelayError::Config(format!("no rate limit preset named '{feature}'"))
            })?;
        Ok(Self::new(feature, registry.rate_limiter(feature), config))
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }

    pub fn check(&self, caller_key: &str) -> Result<(), Rejection> {
        let window_ms = self.config.window_ms;
        if self
            .limiter
            .is_allowed(caller_key, self.config.max_requests, window_ms)
        {
            return Ok(());
        }
        let retry_after_ms = self.limiter.retry_after_ms(caller_key, window_ms);
        let now_ms = self.limiter.now_ms();
        Err(Rejection {
            limit: self.config.max_requests,
            // A rejected caller always waits at least a second.
            retry_after_secs: retry_after_ms.div_ceil(1000).max(1),
            reset_epoch_secs: now_ms.saturating_add(retry_after_ms).div_ceil(1000),
        })
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": "Rate limit exceeded",
            "message": format!(
                "Too many requests. Please try again in {} seconds.",
                self.retry_after_secs
            ),
            "retryAfter": self.retry_after_secs,
        }));
        let mut resp = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
        let headers = resp.headers_mut();
        headers.insert(
            axum::http::header::RETRY_AFTER,
            HeaderValue::from(self.retry_after_secs),
        );
        headers.insert(
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderValue::from(self.limit),
        );
        headers.insert(
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderValue::from_static("0"),
        );
        headers.insert(
            HeaderName::from_static("x-ratelimit-reset"),
            HeaderValue::from(self.reset_epoch_secs),
        );
        resp
    }
}

async fn admit(State(admission): State<Admission>, request: Request, next: Next) -> Response {
    let caller_key = client_key_from_headers(request.headers());
    match admission.check(&caller_key) {
        Ok(()) => next.run(request).await,
        Err(rejection) => {
            info!(
                target: "rate_limit",
                feature = %admission.feature(),
                client_key = %caller_key,
                retry_after_secs = rejection.retry_after_secs,
                "Request rejected by limiter"
            );
            rejection.into_response()
        }
    }
}

/// Gates `handler` behind `admission`.
pub fn with_rate_limit<S>(admission: Admission, handler: MethodRouter<S>) -> MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    handler.route_layer(from_fn_with_state(admission, admit))
}
