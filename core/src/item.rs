//! Key/value store record shapes.
//!
//! Records are JSON objects; keys are the subset of string attributes that
//! the table is keyed on.

use crate::error::Result;
use crate::model::{JobId, MapKey, WebhookId};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Largest number of writes the store accepts in one batch call.
pub const MAX_BATCH_ITEMS: usize = 25;

/// A stored record.
pub type Item = Map<String, Value>;

/// Key attribute names.
pub mod attr {
    /// Job partition key
    pub const JOB_ID: &str = "jobId";
    /// Map partition key
    pub const MAP_ID: &str = "mapId";
    /// Map sort key
    pub const MAP_NAME: &str = "mapName";
    /// Webhook partition key
    pub const WEBHOOK_ID: &str = "webhookId";
    /// Lifecycle status
    pub const STATUS: &str = "status";
}

/// Primary key of a record: attribute name to string value.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(BTreeMap<String, String>);

impl Key {
    /// Empty key.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key attribute.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Key of a Job record.
    #[must_use]
    pub fn job(job_id: &JobId) -> Self {
        Self::new().with(attr::JOB_ID, job_id.as_str())
    }

    /// Key of a Map record.
    #[must_use]
    pub fn map(key: &MapKey) -> Self {
        Self::new()
            .with(attr::MAP_ID, key.map_id.as_str())
            .with(attr::MAP_NAME, key.map_name.clone())
    }

    /// Key of a webhook registration.
    #[must_use]
    pub fn webhook(webhook_id: &WebhookId) -> Self {
        Self::new().with(attr::WEBHOOK_ID, webhook_id.as_str())
    }

    /// Extract the key named by `attributes` from an item.
    ///
    /// Returns `None` if any attribute is missing or not a string.
    #[must_use]
    pub fn from_item(item: &Item, attributes: &[&str]) -> Option<Self> {
        let mut key = Self::new();
        for name in attributes {
            let value = item.get(*name)?.as_str()?;
            key = key.with(*name, value);
        }
        Some(key)
    }

    /// Iterate key attributes.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Look up one attribute.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// Serialize a record into an item.
///
/// # Errors
///
/// Returns `RelayError::Serialization` if the value is not a JSON object.
pub fn to_item<T: Serialize>(value: &T) -> Result<Item> {
    match serde_json::to_value(value)? {
        Value::Object(item) => Ok(item),
        other => Err(crate::RelayError::Serialization(format!(
            "expected object, got {other}"
        ))),
    }
}

/// Deserialize an item into a record.
///
/// # Errors
///
/// Returns `RelayError::Serialization` if the item does not match `T`.
pub fn from_item<T: DeserializeOwned>(item: Item) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(item))?)
}

/// Guard evaluated atomically with a write.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// No record with this key exists yet.
    NotExists,
    /// The stored attribute equals the given value.
    AttributeEquals {
        /// Attribute name
        name: String,
        /// Expected value
        value: Value,
    },
}

impl Condition {
    /// Condition on a string attribute.
    pub fn equals(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::AttributeEquals {
            name: name.into(),
            value: Value::String(value.into()),
        }
    }

    /// Evaluate against the currently stored item.
    #[must_use]
    pub fn holds(&self, current: Option<&Item>) -> bool {
        match self {
            Self::NotExists => current.is_none(),
            Self::AttributeEquals { name, value } => {
                current.and_then(|item| item.get(name)) == Some(value)
            }
        }
    }
}

/// One write inside a batch mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    /// Insert or replace an item.
    Put {
        /// Target table
        table: String,
        /// Full record
        item: Item,
    },
    /// Remove an item.
    Delete {
        /// Target table
        table: String,
        /// Record key
        key: Key,
    },
}

impl WriteRequest {
    /// Target table.
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::Put { table, .. } | Self::Delete { table, .. } => table,
        }
    }
}

/// Response of one physical batch call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchWriteOutput {
    /// Writes the store did not apply and expects to be resubmitted.
    pub unprocessed: Vec<WriteRequest>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{ContentHash, MapId};
    use serde_json::json;

    #[test]
    fn map_key_matches_item_attributes() {
        let key = MapKey::new(MapId::from_content(&ContentHash::of(b"x")), "1_123456.zip");
        let item = to_item(&json!({
            "mapId": key.map_id.as_str(),
            "mapName": "1_123456.zip",
            "status": "QUEUED",
        }))
        .unwrap();
        assert_eq!(
            Key::from_item(&item, &[attr::MAP_ID, attr::MAP_NAME]),
            Some(Key::map(&key))
        );
    }

    #[test]
    fn missing_key_attribute_yields_none() {
        let item = to_item(&json!({ "mapId": "map_1" })).unwrap();
        assert_eq!(Key::from_item(&item, &[attr::MAP_ID, attr::MAP_NAME]), None);
    }

    #[test]
    fn conditions_evaluate_against_current_item() {
        let item = to_item(&json!({ "status": "FAILED" })).unwrap();
        assert!(Condition::NotExists.holds(None));
        assert!(!Condition::NotExists.holds(Some(&item)));
        assert!(Condition::equals("status", "FAILED").holds(Some(&item)));
        assert!(!Condition::equals("status", "QUEUED").holds(Some(&item)));
        assert!(!Condition::equals("status", "FAILED").holds(None));
    }

    #[test]
    fn non_object_values_are_not_items() {
        assert!(to_item(&42).is_err());
    }
}
