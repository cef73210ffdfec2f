//! Fan-out to registered subscribers.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use maprelay_core::WebhookId;
use maprelay_core::providers::{EventKind, EventNotifier, Notification};
use maprelay_runtime::retry::BackoffSchedule;
use maprelay_testing::mocks::InMemoryStore;
use maprelay_webhooks::registry::KEY_ATTRIBUTES;
use maprelay_webhooks::{
    DeliveryOptions, DeliveryReport, DispatcherConfig, NewWebhook, WebhookClient, WebhookDispatcher,
    WebhookRegistry, verify,
};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn dispatcher(shared_secret: Option<&str>) -> WebhookDispatcher<InMemoryStore> {
    let store = InMemoryStore::new().with_table("webhooks", KEY_ATTRIBUTES);
    let config = DispatcherConfig {
        shared_secret: shared_secret.map(str::to_string),
        options: DeliveryOptions {
            max_retries: 2,
            timeout: Duration::from_secs(2),
            backoff: BackoffSchedule::new(vec![Duration::from_millis(10)]),
            secret: None,
            auth: None,
        },
    };
    WebhookDispatcher::new(
        WebhookRegistry::new(store, "webhooks"),
        WebhookClient::new().unwrap(),
        config,
    )
}

fn subscription(url: String, events: Vec<EventKind>, secret: Option<&str>) -> NewWebhook {
    NewWebhook {
        url,
        events,
        secret: secret.map(str::to_string),
        ..NewWebhook::default()
    }
}

fn job_completed(owner: &str) -> Notification {
    Notification {
        event: EventKind::JobCompleted,
        owner_id: owner.into(),
        data: json!({ "jobId": "JobId-1" }),
    }
}

fn report_for<'a>(reports: &'a [(WebhookId, DeliveryReport)], id: &WebhookId) -> &'a DeliveryReport {
    &reports.iter().find(|(w, _)| w == id).unwrap().1
}

#[tokio::test]
async fn one_failing_subscriber_does_not_block_the_others() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(410))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = dispatcher(Some("shared"));
    let registry = dispatcher.registry();
    let ok = registry
        .register("user-1", subscription(format!("{}/ok", server.uri()), vec![EventKind::JobCompleted], None))
        .await
        .unwrap();
    let broken = registry
        .register("user-1", subscription(format!("{}/broken", server.uri()), vec![EventKind::JobCompleted], None))
        .await
        .unwrap();
    let gone = registry
        .register("user-1", subscription(format!("{}/gone", server.uri()), vec![EventKind::JobCompleted], None))
        .await
        .unwrap();

    let reports = dispatcher.dispatch(job_completed("user-1")).await;
    assert_eq!(reports.len(), 3);

    assert!(report_for(&reports, &ok.webhook_id).success);
    assert_eq!(report_for(&reports, &broken.webhook_id).attempts, 2);
    assert!(!report_for(&reports, &broken.webhook_id).success);
    assert_eq!(report_for(&reports, &gone.webhook_id).attempts, 1);
    assert_eq!(report_for(&reports, &gone.webhook_id).status_code, Some(410));
}

#[tokio::test]
async fn only_matching_enabled_subscribers_of_the_owner_are_called() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/wanted"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/unwanted"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dispatcher = dispatcher(None);
    let registry = dispatcher.registry();
    registry
        .register("user-1", subscription(format!("{}/wanted", server.uri()), vec![EventKind::JobCompleted], None))
        .await
        .unwrap();
    registry
        .register("user-1", subscription(format!("{}/unwanted", server.uri()), vec![EventKind::MapFailed], None))
        .await
        .unwrap();
    registry
        .register("user-2", subscription(format!("{}/unwanted", server.uri()), vec![EventKind::JobCompleted], None))
        .await
        .unwrap();
    let disabled = registry
        .register("user-1", subscription(format!("{}/unwanted", server.uri()), vec![EventKind::JobCompleted], None))
        .await
        .unwrap();
    registry
        .set_enabled("user-1", &disabled.webhook_id, false)
        .await
        .unwrap();

    let reports = dispatcher.dispatch(job_completed("user-1")).await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].1.success);
}

#[tokio::test]
async fn per_webhook_secret_overrides_shared_secret() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dispatcher = dispatcher(Some("shared"));
    dispatcher
        .registry()
        .register(
            "user-1",
            subscription(server.uri(), vec![EventKind::JobCompleted], Some("own")),
        )
        .await
        .unwrap();

    dispatcher.notify(job_completed("user-1")).await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let signature = requests[0]
        .headers
        .get("x-webhook-signature")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(verify(b"own", &requests[0].body, signature));
    assert!(!verify(b"shared", &requests[0].body, signature));
}

#[tokio::test]
async fn no_subscribers_means_no_reports() {
    let dispatcher = dispatcher(None);
    assert!(dispatcher.dispatch(job_completed("nobody")).await.is_empty());
}
