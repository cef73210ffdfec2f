//! Boundaries to the external collaborators.
//!
//! The core never talks to a concrete store, blob service or scheduler; it is
//! generic over these traits. Production adapters and the in-memory doubles in
//! `maprelay-testing` implement them.

use crate::error::Result;
use crate::item::{BatchWriteOutput, Condition, Item, Key, WriteRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Key/value store holding Job, Map and webhook records.
pub trait KeyValueStore: Send + Sync {
    /// Write a full item, optionally guarded by a condition.
    ///
    /// # Errors
    ///
    /// - Condition not met → `RelayError::ConditionFailed`
    /// - Store failure → `RelayError::Dependency`
    fn put_item(
        &self,
        table: &str,
        item: Item,
        condition: Option<Condition>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Read one item by key.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Dependency` on store failure.
    fn get_item(&self, table: &str, key: &Key)
    -> impl Future<Output = Result<Option<Item>>> + Send;

    /// Merge `changes` into an existing item and return the updated item.
    ///
    /// A `null` value removes the attribute. Missing items are not created;
    /// `Ok(None)` is returned instead.
    ///
    /// # Errors
    ///
    /// - Condition not met → `RelayError::ConditionFailed`
    /// - Store failure → `RelayError::Dependency`
    fn update_item(
        &self,
        table: &str,
        key: &Key,
        changes: Item,
        condition: Option<Condition>,
    ) -> impl Future<Output = Result<Option<Item>>> + Send;

    /// Remove one item, optionally guarded by a condition.
    ///
    /// Deleting a missing item without a condition succeeds.
    ///
    /// # Errors
    ///
    /// - Condition not met → `RelayError::ConditionFailed`
    /// - Store failure → `RelayError::Dependency`
    fn delete_item(
        &self,
        table: &str,
        key: &Key,
        condition: Option<Condition>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Return every item whose string attribute equals `value`.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Dependency` on store failure.
    fn query(
        &self,
        table: &str,
        attribute: &str,
        value: &str,
    ) -> impl Future<Output = Result<Vec<Item>>> + Send;

    /// Apply up to [`crate::item::MAX_BATCH_ITEMS`] writes in one call.
    ///
    /// The store may apply only part of the batch; the rest comes back in
    /// [`BatchWriteOutput::unprocessed`] and must be resubmitted.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Dependency` if the call failed as a whole.
    fn batch_write(
        &self,
        requests: Vec<WriteRequest>,
    ) -> impl Future<Output = Result<BatchWriteOutput>> + Send;
}

/// Bucket + key address of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    /// Bucket name
    pub bucket: String,
    /// Object key
    pub key: String,
}

impl ObjectLocation {
    /// Build a location.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Time-limited, pre-authorized upload target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUpload {
    /// URL the client writes the archive to
    pub url: String,
    /// Where the object will land
    pub location: ObjectLocation,
    /// Expiry of the URL
    pub expires_at: DateTime<Utc>,
}

/// Stored object facts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectMetadata {
    /// Object size
    pub size_bytes: u64,
    /// User metadata attached at upload
    pub metadata: BTreeMap<String, String>,
}

/// Blob store the archives are uploaded to.
pub trait BlobStore: Send + Sync {
    /// Issue a pre-authorized upload URL.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Dependency` on blob store failure.
    fn presign_upload(
        &self,
        location: &ObjectLocation,
        metadata: &BTreeMap<String, String>,
        expires_in: Duration,
    ) -> impl Future<Output = Result<PresignedUpload>> + Send;

    /// Fetch object metadata, `None` if the object does not exist.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Dependency` on blob store failure.
    fn head_object(
        &self,
        location: &ObjectLocation,
    ) -> impl Future<Output = Result<Option<ObjectMetadata>>> + Send;
}

/// Parameters of one compute task, one per dispatched Map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    /// Owning job
    pub job_id: String,
    /// Map id
    pub map_id: String,
    /// Map file name
    pub map_name: String,
    /// Uploaded archive
    pub input: ObjectLocation,
    /// Bucket the task writes results to
    pub output_bucket: String,
    /// Map table the task reports into
    pub maps_table: String,
    /// Job table the task reports into
    pub jobs_table: String,
}

/// Handle returned by the scheduler for a started task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    /// Scheduler-assigned task id
    pub task_id: String,
}

/// External container scheduler.
pub trait TaskScheduler: Send + Sync {
    /// Start one processing task.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Dependency` if the scheduler refused or failed.
    fn run_task(&self, request: &TaskRequest) -> impl Future<Output = Result<TaskHandle>> + Send;
}

/// Outcome events published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Every Map in a Job completed
    #[serde(rename = "job.completed")]
    JobCompleted,
    /// A Job settled with at least one failed Map
    #[serde(rename = "job.failed")]
    JobFailed,
    /// One Map completed
    #[serde(rename = "map.completed")]
    MapCompleted,
    /// One Map failed
    #[serde(rename = "map.failed")]
    MapFailed,
}

impl EventKind {
    /// All events, for subscription validation.
    pub const ALL: [Self; 4] = [
        Self::JobCompleted,
        Self::JobFailed,
        Self::MapCompleted,
        Self::MapFailed,
    ];

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::JobCompleted => "job.completed",
            Self::JobFailed => "job.failed",
            Self::MapCompleted => "map.completed",
            Self::MapFailed => "map.failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event for one owner's subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Event kind
    pub event: EventKind,
    /// User whose webhooks receive it
    pub owner_id: String,
    /// Event body
    pub data: serde_json::Value,
}

/// Sink for lifecycle notifications.
///
/// Implementations absorb their own failures: a notification can never fail
/// the transition that produced it.
pub trait EventNotifier: Send + Sync {
    /// Publish one notification.
    fn notify(&self, notification: Notification) -> impl Future<Output = ()> + Send;
}

/// Notifier that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl EventNotifier for NoopNotifier {
    async fn notify(&self, _notification: Notification) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_names_match_serde() {
        for event in EventKind::ALL {
            let json = serde_json::to_value(event).unwrap_or_default();
            assert_eq!(json, serde_json::Value::String(event.as_str().to_string()));
        }
    }
}
