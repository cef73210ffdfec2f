//! Concurrent fan-out of one notification to every matching subscriber.

use crate::delivery::{DeliveryOptions, DeliveryReport, WebhookClient, WebhookPayload};
use crate::registry::WebhookRegistry;
use futures::future::join_all;
use maprelay_core::environment::{Clock, SystemClock};
use maprelay_core::providers::{EventNotifier, KeyValueStore, Notification};
use maprelay_core::{RelayError, Result, WebhookId};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Dispatcher settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Secret for webhooks registered without their own
    pub shared_secret: Option<String>,
    /// Delivery settings applied to every subscriber
    pub options: DeliveryOptions,
}

impl DispatcherConfig {
    /// Read settings from the environment.
    ///
    /// - `MAPRELAY_WEBHOOK_SECRET`: shared signing secret (optional)
    /// - `MAPRELAY_WEBHOOK_TIMEOUT_SECS`: per-attempt timeout (default 10)
    /// - `MAPRELAY_WEBHOOK_MAX_RETRIES`: total attempts (default 3)
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Configuration` if a numeric value does not parse.
    pub fn from_env() -> Result<Self> {
        let mut options = DeliveryOptions::default();
        if let Some(secs) = env_number("MAPRELAY_WEBHOOK_TIMEOUT_SECS")? {
            options.timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = env_number("MAPRELAY_WEBHOOK_MAX_RETRIES")? {
            options.max_retries = usize::try_from(attempts).map_err(|e| {
                RelayError::Configuration(format!("MAPRELAY_WEBHOOK_MAX_RETRIES: {e}"))
            })?;
        }
        Ok(Self {
            shared_secret: std::env::var("MAPRELAY_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            options,
        })
    }
}

fn env_number(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| RelayError::Configuration(format!("{name}='{raw}': {e}"))),
        Err(_) => Ok(None),
    }
}

/// Delivers notifications to the owner's subscribed webhooks.
///
/// Subscribers are delivered concurrently and settle independently; a slow or
/// failing receiver delays nobody else.
pub struct WebhookDispatcher<S> {
    registry: WebhookRegistry<S>,
    client: WebhookClient,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
}

impl<S> std::fmt::Debug for WebhookDispatcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookDispatcher")
            .field("registry", &self.registry)
            .field("options", &self.config.options)
            .finish_non_exhaustive()
    }
}

impl<S: KeyValueStore> WebhookDispatcher<S> {
    /// Build a dispatcher.
    pub fn new(registry: WebhookRegistry<S>, client: WebhookClient, config: DispatcherConfig) -> Self {
        Self {
            registry,
            client,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used for payload timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The underlying registry.
    pub const fn registry(&self) -> &WebhookRegistry<S> {
        &self.registry
    }

    /// Deliver `notification` to every enabled subscriber of its owner.
    ///
    /// Returns one report per subscriber. A failed lookup yields no reports.
    pub async fn dispatch(&self, notification: Notification) -> Vec<(WebhookId, DeliveryReport)> {
        let subscribers = match self
            .registry
            .subscribers(&notification.owner_id, notification.event)
            .await
        {
            Ok(subscribers) => subscribers,
            Err(e) => {
                tracing::error!(
                    event = notification.event.as_str(),
                    owner_id = %notification.owner_id,
                    error = %e,
                    "Failed to load webhook subscribers"
                );
                return Vec::new();
            }
        };
        if subscribers.is_empty() {
            tracing::debug!(event = notification.event.as_str(), "No webhook subscribers");
            return Vec::new();
        }

        let timestamp = self.clock.now();
        let deliveries = subscribers.into_iter().map(|webhook| {
            let payload = WebhookPayload {
                event: notification.event,
                delivery_id: format!("dlv_{}", Uuid::new_v4().simple()),
                timestamp,
                data: notification.data.clone(),
            };
            let mut options = self.config.options.clone().with_auth(webhook.auth.clone());
            options.secret = webhook
                .secret
                .clone()
                .or_else(|| self.config.shared_secret.clone());
            async move {
                let report = self.client.deliver(&webhook.url, &payload, &options).await;
                if !report.success {
                    tracing::warn!(
                        webhook_id = %webhook.webhook_id,
                        event = payload.event.as_str(),
                        attempts = report.attempts,
                        status = report.status_code.unwrap_or_default(),
                        error = report.error.as_deref().unwrap_or_default(),
                        "Webhook delivery failed"
                    );
                }
                (webhook.webhook_id, report)
            }
        });

        let reports = join_all(deliveries).await;
        let delivered = reports.iter().filter(|(_, r)| r.success).count();
        tracing::info!(
            event = notification.event.as_str(),
            owner_id = %notification.owner_id,
            delivered,
            total = reports.len(),
            "Webhook fan-out settled"
        );
        reports
    }
}

impl<S: KeyValueStore> EventNotifier for WebhookDispatcher<S> {
    async fn notify(&self, notification: Notification) {
        self.dispatch(notification).await;
    }
}
