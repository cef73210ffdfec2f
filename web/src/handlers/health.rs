//! Health check endpoints.
//!
//! These endpoints are used by load balancers and monitoring systems
//! to verify service health.

use axum::{Json, extract::State, http::StatusCode};
use maprelay_runtime::HealthReport;
use maprelay_runtime::breakers::DependencyBreakers;

/// Simple health check endpoint (for basic liveness).
///
/// Returns 200 OK to indicate the service is running.
/// This endpoint does NOT check dependencies.
///
/// # Endpoint
///
/// ```text
/// GET /health
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Breaker state of every external dependency.
///
/// # Status Codes
///
/// - 200 OK: every breaker is closed or probing recovery
/// - 503 Service Unavailable: at least one breaker is open
///
/// # Endpoint
///
/// ```text
/// GET /health/dependencies
/// ```
///
/// # Response
///
/// ```json
/// {
///   "status": "unhealthy",
///   "checks": [
///     { "component": "task-scheduler", "status": "unhealthy", "message": "circuit open",
///       "metadata": [["recent_failures", "3"], ["next_attempt_at", "2025-01-01T00:01:00+00:00"]] }
///   ],
///   "timestamp": "2025-01-01T00:00:00Z"
/// }
/// ```
pub async fn dependency_health(
    State(breakers): State<DependencyBreakers>,
) -> (StatusCode, Json<HealthReport>) {
    let report = breakers.health().await;
    let status = if report.is_unhealthy() {
        tracing::warn!(status = %report.status, "Dependency health check failing");
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use maprelay_runtime::HealthStatus;

    #[tokio::test]
    async fn test_simple_health_check() {
        let (status, body) = health_check().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn open_breaker_fails_the_check() {
        let breakers = DependencyBreakers::default();
        let (status, Json(report)) = dependency_health(State(breakers.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report.checks.len(), 3);

        for _ in 0..3 {
            let _ = breakers
                .scheduler
                .execute(|| async { Err::<(), _>("no capacity") })
                .await;
        }

        let (status, Json(report)) = dependency_health(State(breakers)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let scheduler = report
            .checks
            .iter()
            .find(|c| c.component == "task-scheduler")
            .unwrap();
        assert_eq!(scheduler.status, HealthStatus::Unhealthy);
    }
}
