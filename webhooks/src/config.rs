//! Webhook registration records.

use chrono::{DateTime, Utc};
use maprelay_core::WebhookId;
use maprelay_core::providers::EventKind;
use serde::{Deserialize, Serialize};

/// Extra credentials sent with every delivery.
///
/// A closed set instead of free-form headers, so every accepted
/// configuration is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WebhookAuth {
    /// `Authorization: Bearer {token}`
    Bearer {
        /// Token
        token: String,
    },
    /// `X-API-Key: {key}`
    ApiKey {
        /// Key
        key: String,
    },
    /// `Authorization: Basic base64({username}:{password})`
    Basic {
        /// User name
        username: String,
        /// Password
        password: String,
    },
}

impl WebhookAuth {
    /// Attach the credentials to an outgoing request.
    #[must_use]
    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Self::Bearer { token } => request.bearer_auth(token),
            Self::ApiKey { key } => request.header("X-API-Key", key),
            Self::Basic { username, password } => request.basic_auth(username, Some(password)),
        }
    }
}

/// A stored webhook subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    /// Registration id
    pub webhook_id: WebhookId,
    /// Owning user; only this user's events are delivered
    pub owner_id: String,
    /// Target URL (http or https)
    pub url: String,
    /// Subscribed events
    pub events: Vec<EventKind>,
    /// Disabled webhooks receive nothing
    pub enabled: bool,
    /// Per-webhook signing secret; the dispatcher's shared secret otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Extra credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<WebhookAuth>,
    /// Free-text label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Registration time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl WebhookConfig {
    /// Whether this webhook should receive `event`.
    #[must_use]
    pub fn wants(&self, event: EventKind) -> bool {
        self.enabled && self.events.contains(&event)
    }
}

/// Registration request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewWebhook {
    /// Target URL
    pub url: String,
    /// Events to subscribe to
    pub events: Vec<EventKind>,
    /// Optional signing secret
    #[serde(default)]
    pub secret: Option<String>,
    /// Optional credentials
    #[serde(default)]
    pub auth: Option<WebhookAuth>,
    /// Optional label
    #[serde(default)]
    pub description: Option<String>,
}

/// Partial update; `None` fields are left alone.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookUpdate {
    /// New target URL
    #[serde(default)]
    pub url: Option<String>,
    /// New event list
    #[serde(default)]
    pub events: Option<Vec<EventKind>>,
    /// New label
    #[serde(default)]
    pub description: Option<String>,
    /// New credentials
    #[serde(default)]
    pub auth: Option<WebhookAuth>,
}
