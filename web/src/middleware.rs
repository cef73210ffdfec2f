//! Axum middleware for request tracking and admission.
//!
//! - **Correlation ID**: extract or generate, expose to handlers, echo back
//! - **Rate limiting**: per-caller windows from a [`RateLimitPreset`]
//!
//! # Example
//!
//! ```ignore
//! use axum::{Router, middleware::from_fn_with_state, routing::post};
//! use maprelay_web::middleware::{RateLimitState, correlation_id_layer, rate_limit};
//!
//! let uploads = RateLimitState::new(limiter, RateLimitPreset::Upload);
//! let app = Router::new()
//!     .route("/jobs", post(submit))
//!     .layer(from_fn_with_state(uploads, rate_limit))
//!     .layer(correlation_id_layer());
//! ```

use crate::error::{
    AppError, RATE_LIMIT_LIMIT_HEADER, RATE_LIMIT_REMAINING_HEADER, RATE_LIMIT_RESET_HEADER,
};
use crate::extractors::caller_identity;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use maprelay_runtime::rate_limiter::{RateLimitDecision, RateLimitPreset, RateLimiter};
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::Instrument;
use uuid::Uuid;

/// Header name for correlation ID.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// Create a layer that adds correlation ID tracking to all requests.
///
/// The ID is read from `X-Correlation-ID` (a new UUID if absent or
/// malformed), stored in request extensions, recorded on an `http_request`
/// span and echoed in the response.
#[must_use]
pub const fn correlation_id_layer() -> CorrelationIdLayer {
    CorrelationIdLayer
}

/// Layer for correlation ID tracking.
#[derive(Clone, Debug)]
pub struct CorrelationIdLayer;

impl<S> Layer<S> for CorrelationIdLayer {
    type Service = CorrelationIdMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorrelationIdMiddleware { inner }
    }
}

/// Middleware service for correlation ID tracking.
#[derive(Clone, Debug)]
pub struct CorrelationIdMiddleware<S> {
    inner: S,
}

impl<S> Service<Request> for CorrelationIdMiddleware<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let correlation_id = req
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);

        req.extensions_mut().insert(correlation_id);

        let span = tracing::info_span!(
            "http_request",
            correlation_id = %correlation_id,
            method = %req.method(),
            uri = %req.uri(),
        );

        let fut = self.inner.call(req);

        Box::pin(async move {
            let mut response = fut.instrument(span).await?;
            if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
                response.headers_mut().insert(CORRELATION_ID_HEADER, value);
            }
            Ok(response)
        })
    }
}

/// Correlation ID injected by [`correlation_id_layer`].
pub trait CorrelationIdExt {
    /// `None` if the correlation ID middleware is not installed.
    fn correlation_id(&self) -> Option<Uuid>;
}

impl CorrelationIdExt for Request {
    fn correlation_id(&self) -> Option<Uuid> {
        self.extensions().get::<Uuid>().copied()
    }
}

/// State of one [`rate_limit`] layer: the shared limiter and the preset it enforces.
#[derive(Clone, Debug)]
pub struct RateLimitState {
    limiter: RateLimiter,
    preset: RateLimitPreset,
}

impl RateLimitState {
    /// Enforce `preset` through `limiter`.
    #[must_use]
    pub const fn new(limiter: RateLimiter, preset: RateLimitPreset) -> Self {
        Self { limiter, preset }
    }
}

/// Admit or reject a request against the caller's window.
///
/// Rejected requests get a 429 with `Retry-After`; admitted responses carry
/// the `X-RateLimit-*` headers of the window they were counted in.
pub async fn rate_limit(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let identity = caller_identity(request.headers());
    match state.limiter.enforce(state.preset, &identity) {
        Ok(decision) => {
            let mut response = next.run(request).await;
            insert_limit_headers(response.headers_mut(), &decision);
            response
        }
        Err(err) => AppError::from(err).into_response(),
    }
}

fn insert_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    let values = [
        (RATE_LIMIT_LIMIT_HEADER, decision.limit.to_string()),
        (RATE_LIMIT_REMAINING_HEADER, decision.remaining.to_string()),
        (RATE_LIMIT_RESET_HEADER, decision.reset_at.to_rfc3339()),
    ];
    for (name, value) in values {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}
