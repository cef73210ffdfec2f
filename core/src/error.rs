//! Error taxonomy shared by every MapRelay component.
//!
//! A single enum crosses all dependency boundaries so that the rate limiter,
//! the circuit-protected clients, the batch executor and the job service can
//! hand errors to each other without conversion layers.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for MapRelay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors produced by the orchestration core.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RelayError {
    // ═══════════════════════════════════════════════════════════
    // Admission
    // ═══════════════════════════════════════════════════════════

    /// Caller exceeded the request ceiling for its current window.
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited {
        /// Window ceiling
        limit: u32,
        /// Requests left in the window (always 0 when rejected)
        remaining: u32,
        /// When the current window resets
        reset_at: DateTime<Utc>,
        /// Whole seconds until the window resets
        retry_after_secs: u64,
    },

    // ═══════════════════════════════════════════════════════════
    // Dependencies
    // ═══════════════════════════════════════════════════════════

    /// Dependency is fail-fasting behind an open circuit.
    #[error("{dependency} is temporarily unavailable, retry after {retry_after_secs}s")]
    Unavailable {
        /// Dependency name
        dependency: String,
        /// Whole seconds until the breaker admits a probe
        retry_after_secs: u64,
    },

    /// A call into a dependency failed outright.
    #[error("{dependency} call failed: {message}")]
    Dependency {
        /// Dependency name
        dependency: String,
        /// Failure description
        message: String,
    },

    /// A conditional write was rejected because its condition did not hold.
    #[error("Conditional check failed")]
    ConditionFailed,

    // ═══════════════════════════════════════════════════════════
    // User errors
    // ═══════════════════════════════════════════════════════════

    /// Identical name and content already submitted.
    #[error("Duplicate map: {map_name} ({map_id})")]
    Duplicate {
        /// Content-derived map id
        map_id: String,
        /// File name
        map_name: String,
    },

    /// Request failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Requested resource does not exist.
    #[error("{resource} {id} not found")]
    NotFound {
        /// Resource kind
        resource: &'static str,
        /// Resource identifier
        id: String,
    },

    /// Status change not permitted by the lifecycle.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    // ═══════════════════════════════════════════════════════════
    // System errors
    // ═══════════════════════════════════════════════════════════

    /// Record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl RelayError {
    /// Build a hard dependency failure.
    pub fn dependency(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dependency {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    /// Returns `true` if the caller caused this error and retrying unchanged cannot help.
    ///
    /// # Examples
    ///
    /// ```
    /// # use maprelay_core::RelayError;
    /// assert!(RelayError::Validation("empty".into()).is_user_error());
    /// assert!(!RelayError::ConditionFailed.is_user_error());
    /// ```
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::Duplicate { .. }
                | Self::Validation(_)
                | Self::NotFound { .. }
                | Self::InvalidTransition { .. }
        )
    }

    /// Returns `true` if the same call may succeed later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Unavailable { .. } | Self::Dependency { .. }
        )
    }

    /// Failure classification handed to circuit breakers.
    ///
    /// Only hard dependency failures count; a rejected condition or a bad
    /// request proves the dependency is answering.
    #[must_use]
    pub const fn counts_as_dependency_failure(&self) -> bool {
        matches!(self, Self::Dependency { .. })
    }

    /// Seconds the caller should wait before retrying, when known.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited {
                retry_after_secs, ..
            }
            | Self::Unavailable {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
