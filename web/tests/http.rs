//! Request handling through the assembled router.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use maprelay_runtime::breakers::DependencyBreakers;
use maprelay_runtime::rate_limiter::{RateLimiter, RateLimiterConfig};
use maprelay_testing::mocks::ManualClock;
use maprelay_web::{AppError, AppState, CORRELATION_ID_HEADER, VerifiedWebhook, WebhookSecret};
use maprelay_webhooks::signing::{EVENT_HEADER, SIGNATURE_HEADER};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

const SECRET: &str = "receiver-secret";

fn state(clock: &ManualClock) -> AppState {
    AppState::new(
        DependencyBreakers::with_clock(Arc::new(clock.clone())),
        RateLimiter::with_clock(RateLimiterConfig::default(), Arc::new(clock.clone())),
        WebhookSecret::new(SECRET),
    )
}

async fn receive(webhook: VerifiedWebhook) -> Result<Json<Value>, AppError> {
    let body: Value = webhook.json()?;
    Ok(Json(json!({ "event": webhook.event, "jobId": body["data"]["jobId"] })))
}

fn receiver(state: AppState) -> Router {
    Router::new()
        .route("/hooks", post(receive))
        .with_state(state)
}

fn signed(body: &[u8], signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/hooks")
        .header(EVENT_HEADER, "job.completed");
    if let Some(signature) = signature {
        builder = builder.header(SIGNATURE_HEADER, signature);
    }
    builder.body(Body::from(body.to_vec())).unwrap()
}

#[tokio::test]
async fn correctly_signed_webhook_is_accepted() {
    let app = receiver(state(&ManualClock::default()));
    let body = br#"{"event":"job.completed","data":{"jobId":"JobId-1"}}"#;
    let signature = maprelay_webhooks::sign(SECRET.as_bytes(), body).unwrap();

    let response = app.oneshot(signed(body, Some(signature))).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let echoed: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(echoed, json!({ "event": "job.completed", "jobId": "JobId-1" }));
}

#[tokio::test]
async fn tampered_body_is_unauthorized() {
    let app = receiver(state(&ManualClock::default()));
    let signature = maprelay_webhooks::sign(SECRET.as_bytes(), br#"{"amount":1}"#).unwrap();

    let response = app
        .clone()
        .oneshot(signed(br#"{"amount":100}"#, Some(signature)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let unsigned = app.oneshot(signed(b"{}", None)).await.unwrap();
    assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn signed_garbage_is_a_bad_request() {
    let app = receiver(state(&ManualClock::default()));
    let body = b"not json";
    let signature = maprelay_webhooks::sign(SECRET.as_bytes(), body).unwrap();

    let response = app.oneshot(signed(body, Some(signature))).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn dependency_health_reports_open_breakers() {
    let clock = ManualClock::default();
    let state = state(&clock);
    let app = maprelay_web::router(state.clone());
    let get = || {
        Request::builder()
            .uri("/health/dependencies")
            .body(Body::empty())
            .unwrap()
    };

    let healthy = app.clone().oneshot(get()).await.unwrap();
    assert_eq!(healthy.status(), StatusCode::OK);
    assert!(healthy.headers().contains_key(CORRELATION_ID_HEADER));

    for _ in 0..5 {
        let _ = state
            .breakers
            .store
            .execute(|| async { Err::<(), _>("connection reset") })
            .await;
    }

    let failing = app.oneshot(get()).await.unwrap();
    assert_eq!(failing.status(), StatusCode::SERVICE_UNAVAILABLE);
    let bytes = to_bytes(failing.into_body(), usize::MAX).await.unwrap();
    let report: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(report["status"], "unhealthy");
}
