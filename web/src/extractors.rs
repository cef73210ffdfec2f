//! Custom Axum extractors.
//!
//! - [`CorrelationId`]: the request's correlation ID
//! - [`CallerIdentity`]: who a request is counted against
//! - [`VerifiedWebhook`]: an inbound webhook whose signature checked out
//!
//! # Examples
//!
//! ```ignore
//! async fn receive(
//!     correlation_id: CorrelationId,
//!     webhook: VerifiedWebhook,
//! ) -> Result<StatusCode, AppError> {
//!     let event: serde_json::Value = webhook.json()?;
//!     tracing::info!(correlation_id = %correlation_id.0, "Webhook received");
//!     Ok(StatusCode::NO_CONTENT)
//! }
//! ```

use crate::error::AppError;
use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRef, FromRequest, FromRequestParts, Request},
    http::{HeaderMap, request::Parts},
};
use maprelay_webhooks::signing::{EVENT_HEADER, SIGNATURE_HEADER};
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Header carrying the authenticated user, set by the gateway.
pub const USER_ID_HEADER: &str = "X-User-Id";

/// Identity used when a request carries neither a user nor a client address.
pub const ANONYMOUS: &str = "anonymous";

/// Correlation ID for request tracing.
///
/// Extracts the correlation ID from the `X-Correlation-ID` header,
/// or generates a new UUID v4 if not present.
#[derive(Debug, Clone, Copy)]
pub struct CorrelationId(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for CorrelationId
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let correlation_id = parts
            .extensions
            .get::<Uuid>()
            .copied()
            .or_else(|| {
                parts
                    .headers
                    .get(crate::middleware::CORRELATION_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| Uuid::parse_str(s).ok())
            })
            .unwrap_or_else(Uuid::new_v4);

        Ok(Self(correlation_id))
    }
}

/// Who a request is attributed to for rate limiting.
///
/// # Priority
///
/// 1. `X-User-Id`
/// 2. `X-Forwarded-For` (first address)
/// 3. `anonymous`
#[must_use]
pub fn caller_identity(headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(user) = header(USER_ID_HEADER) {
        return user.to_string();
    }
    header("X-Forwarded-For")
        .and_then(|forwarded| forwarded.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty())
        .map_or_else(|| ANONYMOUS.to_string(), str::to_string)
}

/// Extractor form of [`caller_identity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(caller_identity(&parts.headers)))
    }
}

/// Shared secret inbound webhooks are signed with.
#[derive(Clone)]
pub struct WebhookSecret(Arc<str>);

impl WebhookSecret {
    /// Wrap a secret.
    pub fn new(secret: impl Into<Arc<str>>) -> Self {
        Self(secret.into())
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WebhookSecret(..)")
    }
}

/// An inbound webhook whose `X-Webhook-Signature` matched its raw body.
///
/// The signature is checked over the exact bytes received, before any JSON
/// parsing. Missing or wrong signatures are rejected with 401.
#[derive(Debug, Clone)]
pub struct VerifiedWebhook {
    /// `X-Webhook-Event`, if sent
    pub event: Option<String>,
    /// Raw body
    pub body: Bytes,
}

impl VerifiedWebhook {
    /// Decode the body.
    ///
    /// # Errors
    ///
    /// Returns a 400 `AppError` if the body is not the expected JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AppError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| AppError::bad_request(format!("Invalid webhook body: {e}")))
    }
}

#[async_trait]
impl<S> FromRequest<S> for VerifiedWebhook
where
    S: Send + Sync,
    WebhookSecret: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let secret = WebhookSecret::from_ref(state);
        let (signature, event) = {
            let header = |name: &str| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            (header(SIGNATURE_HEADER), header(EVENT_HEADER))
        };

        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| AppError::bad_request(format!("Unreadable webhook body: {e}")))?;

        let Some(signature) = signature else {
            tracing::warn!("Webhook rejected: missing signature");
            return Err(AppError::unauthorized("Missing webhook signature"));
        };
        if !maprelay_webhooks::verify(secret.as_bytes(), &body, &signature) {
            tracing::warn!(event = ?event, "Webhook rejected: signature mismatch");
            return Err(AppError::unauthorized("Invalid webhook signature"));
        }

        Ok(Self { event, body })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn user_header_wins() {
        let h = headers(&[("x-user-id", "user-1"), ("x-forwarded-for", "10.0.0.1")]);
        assert_eq!(caller_identity(&h), "user-1");
    }

    #[test]
    fn first_forwarded_address_is_used() {
        let h = headers(&[("x-forwarded-for", " 203.0.113.7, 10.0.0.1")]);
        assert_eq!(caller_identity(&h), "203.0.113.7");
    }

    #[test]
    fn anonymous_without_hints() {
        assert_eq!(caller_identity(&HeaderMap::new()), ANONYMOUS);
        assert_eq!(caller_identity(&headers(&[("x-user-id", "  ")])), ANONYMOUS);
    }
}
