//! Webhook registrations persisted in the key/value store.
//!
//! Every operation is scoped to an owner: a webhook belonging to another user
//! behaves exactly like a missing one.

use crate::config::{NewWebhook, WebhookConfig, WebhookUpdate};
use maprelay_core::environment::{Clock, SystemClock};
use maprelay_core::item::{Condition, Key, attr, from_item, to_item};
use maprelay_core::providers::{EventKind, KeyValueStore};
use maprelay_core::{RelayError, Result, WebhookId};
use serde_json::{Map, Value};
use std::sync::Arc;

const OWNER_ID: &str = "ownerId";

/// Registration table used when `MAPRELAY_WEBHOOKS_TABLE` is unset.
pub const DEFAULT_TABLE: &str = "maprelay-webhooks";

/// Registration table named by `MAPRELAY_WEBHOOKS_TABLE` in `lookup`.
#[must_use]
pub fn table_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> String {
    lookup("MAPRELAY_WEBHOOKS_TABLE")
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_TABLE.to_string())
}

/// CRUD over webhook registrations.
#[derive(Clone)]
pub struct WebhookRegistry<S> {
    store: S,
    table: String,
    clock: Arc<dyn Clock>,
}

impl<S> std::fmt::Debug for WebhookRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookRegistry")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl<S: KeyValueStore> WebhookRegistry<S> {
    /// Registry over `table`, using wall-clock time.
    pub fn new(store: S, table: impl Into<String>) -> Self {
        Self::with_clock(store, table, Arc::new(SystemClock))
    }

    /// Registry over the table named by `MAPRELAY_WEBHOOKS_TABLE`.
    pub fn from_env(store: S) -> Self {
        Self::new(store, table_from_lookup(|name| std::env::var(name).ok()))
    }

    /// Registry with an injected clock.
    pub fn with_clock(store: S, table: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            table: table.into(),
            clock,
        }
    }

    /// Register a new webhook for `owner_id`.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Validation` for a bad URL or an empty event list,
    /// or the store's error.
    pub async fn register(&self, owner_id: &str, request: NewWebhook) -> Result<WebhookConfig> {
        validate_url(&request.url)?;
        let events = normalize_events(request.events)?;
        let now = self.clock.now();

        let config = WebhookConfig {
            webhook_id: WebhookId::generate(),
            owner_id: owner_id.to_string(),
            url: request.url,
            events,
            enabled: true,
            secret: request.secret,
            auth: request.auth,
            description: request.description,
            created_at: now,
            updated_at: now,
        };

        self.store
            .put_item(&self.table, to_item(&config)?, Some(Condition::NotExists))
            .await?;
        tracing::info!(webhook_id = %config.webhook_id, owner_id, url = %config.url, "Webhook registered");
        Ok(config)
    }

    /// Fetch one webhook.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::NotFound` if it does not exist or belongs to someone else.
    pub async fn get(&self, owner_id: &str, webhook_id: &WebhookId) -> Result<WebhookConfig> {
        let item = self
            .store
            .get_item(&self.table, &Key::webhook(webhook_id))
            .await?
            .ok_or_else(|| not_found(webhook_id))?;
        let config: WebhookConfig = from_item(item)?;
        if config.owner_id != owner_id {
            return Err(not_found(webhook_id));
        }
        Ok(config)
    }

    /// Apply a partial update.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::NotFound` or `RelayError::Validation`.
    pub async fn update(
        &self,
        owner_id: &str,
        webhook_id: &WebhookId,
        update: WebhookUpdate,
    ) -> Result<WebhookConfig> {
        let mut config = self.get(owner_id, webhook_id).await?;
        if let Some(url) = update.url {
            validate_url(&url)?;
            config.url = url;
        }
        if let Some(events) = update.events {
            config.events = normalize_events(events)?;
        }
        if let Some(description) = update.description {
            config.description = Some(description);
        }
        if let Some(auth) = update.auth {
            config.auth = Some(auth);
        }
        config.updated_at = self.clock.now();

        self.store
            .put_item(&self.table, to_item(&config)?, Some(owned_by(owner_id)))
            .await
            .map_err(|e| condition_to_not_found(e, webhook_id))?;
        tracing::info!(webhook_id = %webhook_id, owner_id, "Webhook updated");
        Ok(config)
    }

    /// Enable or disable a webhook.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::NotFound` if the webhook is missing or not owned by `owner_id`.
    pub async fn set_enabled(
        &self,
        owner_id: &str,
        webhook_id: &WebhookId,
        enabled: bool,
    ) -> Result<WebhookConfig> {
        let mut changes = Map::new();
        changes.insert("enabled".into(), Value::Bool(enabled));
        changes.insert("updatedAt".into(), serde_json::to_value(self.clock.now())?);

        let item = self
            .store
            .update_item(
                &self.table,
                &Key::webhook(webhook_id),
                changes,
                Some(owned_by(owner_id)),
            )
            .await
            .map_err(|e| condition_to_not_found(e, webhook_id))?
            .ok_or_else(|| not_found(webhook_id))?;
        tracing::info!(webhook_id = %webhook_id, enabled, "Webhook toggled");
        from_item(item)
    }

    /// Remove a webhook.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::NotFound` if the webhook is missing or not owned by `owner_id`.
    pub async fn delete(&self, owner_id: &str, webhook_id: &WebhookId) -> Result<()> {
        self.store
            .delete_item(&self.table, &Key::webhook(webhook_id), Some(owned_by(owner_id)))
            .await
            .map_err(|e| condition_to_not_found(e, webhook_id))?;
        tracing::info!(webhook_id = %webhook_id, owner_id, "Webhook deleted");
        Ok(())
    }

    /// All webhooks of one owner, oldest first.
    ///
    /// # Errors
    ///
    /// Returns the store's error or `RelayError::Serialization` for a corrupt record.
    pub async fn list_for_owner(&self, owner_id: &str) -> Result<Vec<WebhookConfig>> {
        let mut configs = self
            .store
            .query(&self.table, OWNER_ID, owner_id)
            .await?
            .into_iter()
            .map(from_item::<WebhookConfig>)
            .collect::<Result<Vec<_>>>()?;
        configs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.webhook_id.as_str().cmp(b.webhook_id.as_str()))
        });
        Ok(configs)
    }

    /// Enabled webhooks of `owner_id` subscribed to `event`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::list_for_owner`].
    pub async fn subscribers(&self, owner_id: &str, event: EventKind) -> Result<Vec<WebhookConfig>> {
        Ok(self
            .list_for_owner(owner_id)
            .await?
            .into_iter()
            .filter(|config| config.wants(event))
            .collect())
    }
}

fn owned_by(owner_id: &str) -> Condition {
    Condition::equals(OWNER_ID, owner_id)
}

fn not_found(webhook_id: &WebhookId) -> RelayError {
    RelayError::NotFound {
        resource: "webhook",
        id: webhook_id.to_string(),
    }
}

fn condition_to_not_found(err: RelayError, webhook_id: &WebhookId) -> RelayError {
    match err {
        RelayError::ConditionFailed => not_found(webhook_id),
        other => other,
    }
}

fn normalize_events(events: Vec<EventKind>) -> Result<Vec<EventKind>> {
    let mut unique = Vec::with_capacity(events.len());
    for event in events {
        if !unique.contains(&event) {
            unique.push(event);
        }
    }
    if unique.is_empty() {
        return Err(RelayError::Validation(
            "webhook must subscribe to at least one event".into(),
        ));
    }
    Ok(unique)
}

/// Reject anything that is not an absolute `http`/`https` URL.
///
/// Private and loopback hosts are allowed but logged.
///
/// # Errors
///
/// Returns `RelayError::Validation` describing the problem.
pub fn validate_url(raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| RelayError::Validation(format!("Invalid webhook URL '{raw}': {e}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(RelayError::Validation(format!(
            "Webhook URL scheme '{}' not allowed; only http/https permitted",
            parsed.scheme()
        )));
    }
    let Some(host) = parsed.host_str() else {
        return Err(RelayError::Validation(format!("Webhook URL '{raw}' has no host")));
    };
    if host == "localhost"
        || host == "127.0.0.1"
        || host == "[::1]"
        || host.starts_with("10.")
        || host.starts_with("172.")
        || host.starts_with("192.168.")
        || host == "169.254.169.254"
    {
        tracing::warn!(url = %raw, "Webhook targets a private or loopback address");
    }
    Ok(())
}

/// Key attributes of the webhooks table.
pub const KEY_ATTRIBUTES: &[&str] = &[attr::WEBHOOK_ID];
