//! Error types for web handlers.
//!
//! [`AppError`] bridges [`RelayError`] and HTTP responses. Admission and
//! availability errors carry the headers a client needs to back off.

use axum::{
    Json,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use maprelay_core::RelayError;
use serde::Serialize;
use std::fmt;

/// Ceiling of the caller's rate-limit window.
pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
/// Requests left in the caller's window.
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
/// Window reset time, ISO-8601.
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// Application error type for web handlers.
///
/// Implements Axum's `IntoResponse`, so handlers can return
/// `Result<_, AppError>` and use `?` on service calls.
///
/// # Examples
///
/// ```ignore
/// async fn job(
///     State(service): State<Arc<Service>>,
///     Path(job_id): Path<String>,
/// ) -> Result<Json<JobView>, AppError> {
///     Ok(Json(service.job_view(&JobId::new(job_id)).await?))
/// }
/// ```
#[derive(Debug)]
pub struct AppError {
    /// HTTP status code
    status: StatusCode,
    /// Error message (user-facing)
    message: String,
    /// Error code (for client error handling)
    code: String,
    /// Extra response headers
    headers: HeaderMap,
    /// Internal error (for logging, not exposed to client)
    source: Option<anyhow::Error>,
}

impl AppError {
    /// Create a new application error.
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: code.into(),
            headers: HeaderMap::new(),
            source: None,
        }
    }

    /// Attach the underlying error for logging.
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// Add a response header. Values that are not valid header text are dropped.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: impl fmt::Display) -> Self {
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Status code of the response.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Extra response headers.
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Create a 401 Unauthorized error.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message, "UNAUTHORIZED")
    }

    /// Create a 400 Bad Request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, "BAD_REQUEST")
    }

    /// Create a 500 Internal Server Error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message, "INTERNAL_SERVER_ERROR")
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        let message = err.to_string();
        match err {
            RelayError::RateLimited {
                limit,
                remaining,
                reset_at,
                retry_after_secs,
            } => Self::new(StatusCode::TOO_MANY_REQUESTS, message, "RATE_LIMITED")
                .with_header(header::RETRY_AFTER, retry_after_secs)
                .with_header(HeaderName::from_static(RATE_LIMIT_LIMIT_HEADER), limit)
                .with_header(HeaderName::from_static(RATE_LIMIT_REMAINING_HEADER), remaining)
                .with_header(HeaderName::from_static(RATE_LIMIT_RESET_HEADER), reset_at.to_rfc3339()),
            RelayError::Unavailable {
                retry_after_secs, ..
            } => Self::new(StatusCode::SERVICE_UNAVAILABLE, message, "SERVICE_UNAVAILABLE")
                .with_header(header::RETRY_AFTER, retry_after_secs),
            RelayError::Duplicate { .. } => Self::new(StatusCode::CONFLICT, message, "DUPLICATE"),
            RelayError::InvalidTransition { .. } => {
                Self::new(StatusCode::CONFLICT, message, "INVALID_TRANSITION")
            }
            RelayError::Validation(_) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, message, "VALIDATION_ERROR")
            }
            RelayError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, message, "NOT_FOUND"),
            other @ (RelayError::Dependency { .. }
            | RelayError::ConditionFailed
            | RelayError::Serialization(_)
            | RelayError::Configuration(_)) => {
                Self::internal("An internal error occurred").with_source(anyhow::Error::new(other))
            }
        }
    }
}

/// Error response body (JSON).
#[derive(Debug, Serialize)]
struct ErrorResponse {
    /// Error code (for client error handling).
    code: String,
    /// Human-readable error message.
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            match &self.source {
                Some(source) => tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    error = %source,
                    "Request failed"
                ),
                None => tracing::error!(status = %self.status, code = %self.code, "Request failed"),
            }
        }

        let body = ErrorResponse {
            code: self.code,
            message: self.message,
        };
        (self.status, self.headers, Json(body)).into_response()
    }
}

/// Convert `anyhow::Error` to `AppError`.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal("An internal error occurred").with_source(err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    #[test]
    fn rate_limited_carries_backoff_headers() {
        let reset_at = DateTime::<Utc>::from_timestamp(1_735_689_660, 0).unwrap();
        let err = AppError::from(RelayError::RateLimited {
            limit: 10,
            remaining: 0,
            reset_at,
            retry_after_secs: 42,
        });

        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.headers()[header::RETRY_AFTER], "42");
        assert_eq!(err.headers()[RATE_LIMIT_LIMIT_HEADER], "10");
        assert_eq!(err.headers()[RATE_LIMIT_REMAINING_HEADER], "0");
        assert_eq!(
            err.headers()[RATE_LIMIT_RESET_HEADER],
            "2025-01-01T00:01:00+00:00"
        );
    }

    #[test]
    fn open_circuit_is_a_temporary_unavailability() {
        let err = AppError::from(RelayError::Unavailable {
            dependency: "task-scheduler".into(),
            retry_after_secs: 30,
        });
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.headers()[header::RETRY_AFTER], "30");
    }

    #[test]
    fn user_errors_map_to_client_statuses() {
        let cases = [
            (
                RelayError::Duplicate {
                    map_id: "map_1".into(),
                    map_name: "1_123456.zip".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                RelayError::InvalidTransition {
                    from: "QUEUED".into(),
                    to: "COMPLETED".into(),
                },
                StatusCode::CONFLICT,
            ),
            (RelayError::Validation("empty".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (
                RelayError::NotFound {
                    resource: "job",
                    id: "JobId-1".into(),
                },
                StatusCode::NOT_FOUND,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status(), status);
        }
    }

    #[test]
    fn dependency_failures_hide_details() {
        let err = AppError::from(RelayError::dependency("kv-store", "connection reset"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "[INTERNAL_SERVER_ERROR] An internal error occurred");
        assert!(std::error::Error::source(&err).is_some());
    }
}
