//! Axum integration for MapRelay.
//!
//! The HTTP edge of the upload front end. Domain services return
//! [`RelayError`](maprelay_core::RelayError); this crate turns those into
//! responses and supplies the cross-cutting request handling:
//!
//! ```text
//! request ─▶ correlation id ─▶ rate limit ─▶ handler ─▶ AppError / JSON
//!                                  │
//!                                  └─▶ 429 + Retry-After
//! ```
//!
//! - [`AppError`]: `RelayError` → status code and backoff headers
//! - [`middleware`]: correlation IDs and the [`rate_limit`](middleware::rate_limit) layer
//! - [`extractors`]: caller identity and [`VerifiedWebhook`]
//! - [`handlers`]: liveness and dependency health
//!
//! # Example
//!
//! ```ignore
//! let state = AppState::new(breakers, limiter, WebhookSecret::new(secret));
//! let app = maprelay_web::router(state.clone())
//!     .merge(job_routes(state));
//! ```

use axum::{Router, routing::get};

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod state;

pub use error::AppError;
pub use extractors::{CallerIdentity, CorrelationId, VerifiedWebhook, WebhookSecret};
pub use middleware::{
    CORRELATION_ID_HEADER, CorrelationIdExt, RateLimitState, correlation_id_layer, rate_limit,
};
pub use state::AppState;

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;

/// Health routes with correlation tracking.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/health/dependencies", get(handlers::dependency_health))
        .layer(correlation_id_layer())
        .with_state(state)
}
