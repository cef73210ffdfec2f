//! Single-URL delivery with bounded, fixed-schedule retries.
//!
//! Classification of one attempt:
//!
//! | outcome              | action                        |
//! |----------------------|-------------------------------|
//! | 2xx                  | success, stop                 |
//! | 4xx                  | terminal failure, stop        |
//! | 5xx, network, timeout| retry if attempts remain      |
//!
//! Each attempt is cancelled after [`DeliveryOptions::timeout`]. Waits between
//! attempts follow [`DeliveryOptions::backoff`] and do not grow.

use crate::config::WebhookAuth;
use crate::signing::{DELIVERY_ID_HEADER, EVENT_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER, sign};
use chrono::{DateTime, SecondsFormat, Utc};
use maprelay_core::providers::EventKind;
use maprelay_core::{RelayError, Result};
use maprelay_runtime::metrics::names;
use maprelay_runtime::retry::BackoffSchedule;
use serde::Serialize;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Body posted to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// Event name
    pub event: EventKind,
    /// Correlation id, identical across retries
    pub delivery_id: String,
    /// Creation time of the event
    pub timestamp: DateTime<Utc>,
    /// Event body
    pub data: serde_json::Value,
}

/// Per-delivery settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOptions {
    /// Total attempts, including the first
    pub max_retries: usize,
    /// Per-attempt deadline
    pub timeout: Duration,
    /// Waits between attempts
    pub backoff: BackoffSchedule,
    /// Signing secret; unsigned if absent
    pub secret: Option<String>,
    /// Extra credentials
    pub auth: Option<WebhookAuth>,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(10),
            backoff: BackoffSchedule::default(),
            secret: None,
            auth: None,
        }
    }
}

impl DeliveryOptions {
    /// Same options signed with `secret`.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Same options with credentials attached.
    #[must_use]
    pub fn with_auth(mut self, auth: Option<WebhookAuth>) -> Self {
        self.auth = auth;
        self
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Whether a 2xx was received
    pub success: bool,
    /// Last HTTP status seen
    pub status_code: Option<u16>,
    /// Attempts made
    pub attempts: usize,
    /// Last failure, if any
    pub error: Option<String>,
}

enum Attempt {
    Delivered(u16),
    Rejected(u16),
    Retryable { status: Option<u16>, error: String },
}

/// HTTP client for webhook deliveries.
#[derive(Debug, Clone, Default)]
pub struct WebhookClient {
    http: reqwest::Client,
}

impl WebhookClient {
    /// Client with a fresh connection pool.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Configuration` if the HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("maprelay-webhooks/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RelayError::Configuration(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }

    /// Reuse an existing client.
    #[must_use]
    pub const fn from_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// POST `payload` to `url` until it is accepted, rejected, or attempts run out.
    ///
    /// Never returns an error: every failure is reported in the result.
    pub async fn deliver(
        &self,
        url: &str,
        payload: &WebhookPayload,
        options: &DeliveryOptions,
    ) -> DeliveryReport {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => return failed_before_sending(format!("Failed to serialize payload: {e}")),
        };
        let signature = match options.secret.as_deref().map(|s| sign(s.as_bytes(), &body)) {
            Some(Err(e)) => return failed_before_sending(e.to_string()),
            Some(Ok(signature)) => Some(signature),
            None => None,
        };
        let timestamp = payload.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);

        let max_attempts = options.max_retries.max(1);
        let mut last_status = None;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let mut request = self
                .http
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(EVENT_HEADER, payload.event.as_str())
                .header(TIMESTAMP_HEADER, &timestamp)
                .header(DELIVERY_ID_HEADER, &payload.delivery_id)
                .body(body.clone());
            if let Some(signature) = &signature {
                request = request.header(SIGNATURE_HEADER, signature);
            }
            if let Some(auth) = &options.auth {
                request = auth.apply(request);
            }

            match send(request, options.timeout).await {
                Attempt::Delivered(status) => {
                    tracing::debug!(url, attempt, status, delivery_id = %payload.delivery_id, "Webhook delivered");
                    metrics::counter!(names::WEBHOOK_DELIVERIES, "outcome" => "delivered").increment(1);
                    return DeliveryReport {
                        success: true,
                        status_code: Some(status),
                        attempts: attempt,
                        error: None,
                    };
                }
                Attempt::Rejected(status) => {
                    tracing::warn!(url, attempt, status, delivery_id = %payload.delivery_id, "Webhook rejected, not retrying");
                    metrics::counter!(names::WEBHOOK_DELIVERIES, "outcome" => "rejected").increment(1);
                    return DeliveryReport {
                        success: false,
                        status_code: Some(status),
                        attempts: attempt,
                        error: Some(format!("receiver rejected delivery with status {status}")),
                    };
                }
                Attempt::Retryable { status, error } => {
                    tracing::warn!(
                        url,
                        attempt,
                        status = status.unwrap_or_default(),
                        error = %error,
                        delivery_id = %payload.delivery_id,
                        "Webhook attempt failed"
                    );
                    last_status = status.or(last_status);
                    last_error = Some(error);
                }
            }

            if attempt < max_attempts {
                let delay = options.backoff.delay_after(attempt);
                tracing::debug!(url, attempt, delay_ms = delay.as_millis(), "Retrying webhook");
                sleep(delay).await;
            }
        }

        tracing::error!(url, attempts = max_attempts, delivery_id = %payload.delivery_id, "Webhook delivery exhausted");
        metrics::counter!(names::WEBHOOK_DELIVERIES, "outcome" => "exhausted").increment(1);
        DeliveryReport {
            success: false,
            status_code: last_status,
            attempts: max_attempts,
            error: last_error,
        }
    }
}

async fn send(request: reqwest::RequestBuilder, deadline: Duration) -> Attempt {
    match timeout(deadline, request.send()).await {
        Err(_) => Attempt::Retryable {
            status: None,
            error: format!("timed out after {}ms", deadline.as_millis()),
        },
        Ok(Err(e)) => Attempt::Retryable {
            status: None,
            error: format!("request failed: {e}"),
        },
        Ok(Ok(response)) => {
            let status = response.status();
            if status.is_success() {
                Attempt::Delivered(status.as_u16())
            } else if status.is_client_error() {
                Attempt::Rejected(status.as_u16())
            } else {
                Attempt::Retryable {
                    status: Some(status.as_u16()),
                    error: format!("receiver responded with status {}", status.as_u16()),
                }
            }
        }
    }
}

fn failed_before_sending(error: String) -> DeliveryReport {
    tracing::error!(error = %error, "Webhook delivery could not be prepared");
    DeliveryReport {
        success: false,
        status_code: None,
        attempts: 0,
        error: Some(error),
    }
}
