//! Content-hash deduplication.
//!
//! A Map is identified by `(mapId, mapName)` where `mapId` derives from the
//! archive hash. The same bytes under the same name are a duplicate; the same
//! bytes under a new name are a new Map.

use maprelay_core::item::Key;
use maprelay_core::providers::KeyValueStore;
use maprelay_core::{RelayError, Result};
use maprelay_core::{ContentHash, MapId, MapKey};
use std::collections::HashSet;

/// Identity a file would get if accepted.
#[must_use]
pub fn map_key(content_hash: &ContentHash, map_name: &str) -> MapKey {
    MapKey::new(MapId::from_content(content_hash), map_name)
}

/// Duplicate detection for one submission.
///
/// Checks against stored Maps and against files earlier in the same
/// submission.
#[derive(Debug)]
pub struct Deduplicator<'a, S> {
    store: &'a S,
    maps_table: &'a str,
    seen: HashSet<MapKey>,
}

impl<'a, S: KeyValueStore> Deduplicator<'a, S> {
    /// Start a submission.
    pub fn new(store: &'a S, maps_table: &'a str) -> Self {
        Self {
            store,
            maps_table,
            seen: HashSet::new(),
        }
    }

    /// Claim `key` for this submission.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Duplicate` if the Map already exists or was already
    /// claimed, or the store's error.
    pub async fn claim(&mut self, key: &MapKey) -> Result<()> {
        if self.seen.contains(key) {
            return Err(duplicate(key));
        }
        if self
            .store
            .get_item(self.maps_table, &Key::map(key))
            .await?
            .is_some()
        {
            tracing::info!(map_id = %key.map_id, map_name = %key.map_name, "Duplicate map rejected");
            return Err(duplicate(key));
        }
        self.seen.insert(key.clone());
        Ok(())
    }
}

fn duplicate(key: &MapKey) -> RelayError {
    RelayError::Duplicate {
        map_id: key.map_id.to_string(),
        map_name: key.map_name.clone(),
    }
}
