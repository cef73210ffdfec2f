//! Stored Job and Map records.

use crate::lifecycle::MapStatus;
use chrono::{DateTime, Utc};
use maprelay_core::item::{Item, Key, from_item, to_item};
use maprelay_core::providers::ObjectLocation;
use maprelay_core::{JobId, MapId, MapKey, Result};
use serde::{Deserialize, Serialize};

/// Longest error message kept on a Map record.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 1000;

/// Where a Job's Maps came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MapSource {
    /// Uploaded by a user through a presigned URL
    UserUpload,
}

/// Job metadata. Deliberately carries no status: that is derived from the Maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    /// Job id
    pub job_id: JobId,
    /// Submitting user
    pub submitted_by: String,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// Maps accepted in the submission
    pub batch_size: usize,
    /// Origin of the Maps
    pub map_source: MapSource,
}

impl JobRecord {
    /// Store key.
    #[must_use]
    pub fn key(&self) -> Key {
        Key::job(&self.job_id)
    }
}

/// One archive moving through the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapRecord {
    /// Content-derived id
    pub map_id: MapId,
    /// Sanitized file name
    pub map_name: String,
    /// Owning job
    pub job_id: JobId,
    /// Submitting user, who receives notifications
    pub owner_id: String,
    /// SHA-256 of the archive
    pub content_hash: String,
    /// Declared archive size
    pub size_bytes: u64,
    /// Sheet number parsed from the name
    pub sheet_number: String,
    /// Lifecycle status
    pub status: MapStatus,
    /// Operator retries so far
    #[serde(default)]
    pub retry_count: u32,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
    /// Scheduler task id of the current attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// When the task reported it started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_started_at: Option<DateTime<Utc>>,
    /// When the task stopped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_stopped_at: Option<DateTime<Utc>>,
    /// When output was recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    /// Failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Processed output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ObjectLocation>,
}

impl MapRecord {
    /// Composite identity.
    #[must_use]
    pub fn map_key(&self) -> MapKey {
        MapKey::new(self.map_id.clone(), self.map_name.clone())
    }

    /// Store key.
    #[must_use]
    pub fn key(&self) -> Key {
        Key::map(&self.map_key())
    }

    /// Encode for the store.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Serialization` if encoding fails.
    pub fn to_item(&self) -> Result<Item> {
        to_item(self)
    }

    /// Decode a stored item.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Serialization` for a malformed record.
    pub fn from_item(item: Item) -> Result<Self> {
        from_item(item)
    }
}

/// Cut `message` to [`MAX_ERROR_MESSAGE_CHARS`] characters.
#[must_use]
pub fn truncate_error(message: &str) -> String {
    message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}
