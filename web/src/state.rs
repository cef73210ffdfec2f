//! Application state for Axum handlers.

use crate::extractors::WebhookSecret;
use axum::extract::FromRef;
use maprelay_runtime::breakers::DependencyBreakers;
use maprelay_runtime::rate_limiter::RateLimiter;

/// Process-wide state shared across the MapRelay routes.
///
/// Breakers and the limiter are created once at startup; clones share them.
/// Domain services are added by the application alongside this state.
#[derive(Clone, Debug, FromRef)]
pub struct AppState {
    /// Breakers guarding the external dependencies
    pub breakers: DependencyBreakers,
    /// Request admission
    pub limiter: RateLimiter,
    /// Secret inbound webhooks are verified with
    pub webhook_secret: WebhookSecret,
}

impl AppState {
    /// Create the state from its parts.
    #[must_use]
    pub const fn new(
        breakers: DependencyBreakers,
        limiter: RateLimiter,
        webhook_secret: WebhookSecret,
    ) -> Self {
        Self {
            breakers,
            limiter,
            webhook_secret,
        }
    }
}
