//! Identifiers shared across crates.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Identifier of a Job (one batch submission).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh job id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("JobId-{}", Uuid::new_v4()))
    }

    /// Wrap an existing id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 digest of a Map's archive bytes, lowercase hex.
///
/// Deserialization goes through [`ContentHash::from_hex`], so a decoded value
/// is always a well-formed digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash raw archive bytes.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Accept a client-computed digest.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Validation` unless the value is 64 hex characters.
    pub fn from_hex(value: &str) -> Result<Self> {
        let value = value.trim().to_ascii_lowercase();
        if value.len() != 64 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RelayError::Validation(format!(
                "content hash must be 64 hex characters, got '{value}'"
            )));
        }
        Ok(Self(value))
    }

    /// Borrow the hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ContentHash {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(&value)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content-derived Map identifier.
///
/// Two uploads with the same bytes share a `MapId`; the `(MapId, name)` pair
/// is what identifies a Map record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MapId(String);

impl MapId {
    const PREFIX_HEX_LEN: usize = 24;

    /// Derive the id from a content hash.
    #[must_use]
    pub fn from_content(hash: &ContentHash) -> Self {
        Self(format!("map_{}", &hash.as_str()[..Self::PREFIX_HEX_LEN]))
    }

    /// Wrap an existing id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Composite identity of a Map record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MapKey {
    /// Content-derived id
    pub map_id: MapId,
    /// Sanitized file name
    pub map_name: String,
}

impl MapKey {
    /// Build a key.
    pub fn new(map_id: MapId, map_name: impl Into<String>) -> Self {
        Self {
            map_id,
            map_name: map_name.into(),
        }
    }
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.map_id, self.map_name)
    }
}

/// Identifier of a registered webhook.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebhookId(String);

impl WebhookId {
    /// Generate a fresh webhook id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("wh_{}", Uuid::new_v4().simple()))
    }

    /// Wrap an existing id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WebhookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
