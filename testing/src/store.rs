//! In-memory key/value store with fault injection.

use maprelay_core::item::{BatchWriteOutput, Condition, Item, Key, MAX_BATCH_ITEMS, WriteRequest};
use maprelay_core::providers::KeyValueStore;
use maprelay_core::{RelayError, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Dependency name used in injected errors.
pub const STORE_DEPENDENCY: &str = "kv-store";

type WritePredicate = Box<dyn Fn(&WriteRequest) -> bool + Send + Sync>;

#[derive(Default)]
struct Table {
    key_attributes: Vec<String>,
    items: BTreeMap<Key, Item>,
}

#[derive(Default)]
struct Faults {
    failing_calls: usize,
    failing_batch_writes: usize,
    deferred_once: Option<WritePredicate>,
    never_applied: Option<WritePredicate>,
    already_deferred: HashSet<(String, Key)>,
}

#[derive(Default)]
struct StoreState {
    tables: HashMap<String, Table>,
    faults: Faults,
    batch_calls: Vec<usize>,
}

/// Key/value store backed by ordered in-memory maps.
///
/// Tables must be declared with their key attributes before use. Writes to an
/// undeclared table fail the way a missing table does in a real store.
///
/// # Example
///
/// ```
/// use maprelay_core::item::{Key, to_item};
/// use maprelay_core::providers::KeyValueStore;
/// use maprelay_testing::InMemoryStore;
///
/// # async fn example() -> maprelay_core::Result<()> {
/// let store = InMemoryStore::new().with_table("jobs", &["jobId"]);
/// store
///     .put_item("jobs", to_item(&serde_json::json!({ "jobId": "JobId-1" }))?, None)
///     .await?;
/// let key = Key::new().with("jobId", "JobId-1");
/// assert!(store.get_item("jobs", &key).await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<StoreState>>,
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("InMemoryStore")
            .field("tables", &state.tables.keys().collect::<Vec<_>>())
            .field("batch_calls", &state.batch_calls)
            .finish_non_exhaustive()
    }
}

impl InMemoryStore {
    /// Create an empty store with no tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a table and the attributes its items are keyed on.
    #[must_use]
    pub fn with_table(self, name: &str, key_attributes: &[&str]) -> Self {
        self.write().tables.insert(
            name.to_string(),
            Table {
                key_attributes: key_attributes.iter().map(ToString::to_string).collect(),
                items: BTreeMap::new(),
            },
        );
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ═══════════════════════════════════════════════════════════
    // Fault injection
    // ═══════════════════════════════════════════════════════════

    /// Fail the next `n` calls of any kind with a dependency error.
    pub fn fail_next_calls(&self, n: usize) {
        self.write().faults.failing_calls = n;
    }

    /// Fail the next `n` batch writes as a whole.
    pub fn fail_next_batch_writes(&self, n: usize) {
        self.write().faults.failing_batch_writes = n;
    }

    /// Report matching writes as unprocessed the first time each is seen.
    pub fn defer_once_where<F>(&self, predicate: F)
    where
        F: Fn(&WriteRequest) -> bool + Send + Sync + 'static,
    {
        self.write().faults.deferred_once = Some(Box::new(predicate));
    }

    /// Never apply matching writes; always report them unprocessed.
    pub fn never_apply_where<F>(&self, predicate: F)
    where
        F: Fn(&WriteRequest) -> bool + Send + Sync + 'static,
    {
        self.write().faults.never_applied = Some(Box::new(predicate));
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        self.write().faults = Faults::default();
    }

    // ═══════════════════════════════════════════════════════════
    // Inspection
    // ═══════════════════════════════════════════════════════════

    /// Sizes of every batch write call received, in order.
    #[must_use]
    pub fn batch_call_sizes(&self) -> Vec<usize> {
        self.read().batch_calls.clone()
    }

    /// All items of a table in key order.
    #[must_use]
    pub fn items(&self, table: &str) -> Vec<Item> {
        self.read()
            .tables
            .get(table)
            .map(|t| t.items.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of items in a table.
    #[must_use]
    pub fn len(&self, table: &str) -> usize {
        self.read().tables.get(table).map_or(0, |t| t.items.len())
    }

    /// Whether a table holds no items.
    #[must_use]
    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    fn injected_failure(state: &mut StoreState) -> Result<()> {
        if state.faults.failing_calls > 0 {
            state.faults.failing_calls -= 1;
            return Err(RelayError::dependency(STORE_DEPENDENCY, "injected failure"));
        }
        Ok(())
    }
}

fn table_mut<'a>(state: &'a mut StoreState, name: &str) -> Result<&'a mut Table> {
    state
        .tables
        .get_mut(name)
        .ok_or_else(|| RelayError::dependency(STORE_DEPENDENCY, format!("table '{name}' does not exist")))
}

fn item_key(table: &Table, item: &Item) -> Result<Key> {
    let attributes: Vec<&str> = table.key_attributes.iter().map(String::as_str).collect();
    Key::from_item(item, &attributes).ok_or_else(|| {
        RelayError::Validation(format!(
            "item is missing key attributes {:?}",
            table.key_attributes
        ))
    })
}

impl KeyValueStore for InMemoryStore {
    async fn put_item(&self, table: &str, item: Item, condition: Option<Condition>) -> Result<()> {
        let mut state = self.write();
        Self::injected_failure(&mut state)?;
        let table = table_mut(&mut state, table)?;
        let key = item_key(table, &item)?;

        if let Some(condition) = condition {
            if !condition.holds(table.items.get(&key)) {
                return Err(RelayError::ConditionFailed);
            }
        }
        table.items.insert(key, item);
        Ok(())
    }

    async fn get_item(&self, table: &str, key: &Key) -> Result<Option<Item>> {
        let mut state = self.write();
        Self::injected_failure(&mut state)?;
        Ok(table_mut(&mut state, table)?.items.get(key).cloned())
    }

    async fn update_item(
        &self,
        table: &str,
        key: &Key,
        changes: Item,
        condition: Option<Condition>,
    ) -> Result<Option<Item>> {
        let mut state = self.write();
        Self::injected_failure(&mut state)?;
        let table = table_mut(&mut state, table)?;

        if let Some(condition) = condition {
            if !condition.holds(table.items.get(key)) {
                return Err(RelayError::ConditionFailed);
            }
        }
        let Some(item) = table.items.get_mut(key) else {
            return Ok(None);
        };
        for (name, value) in changes {
            if value.is_null() {
                item.remove(&name);
            } else {
                item.insert(name, value);
            }
        }
        Ok(Some(item.clone()))
    }

    async fn delete_item(&self, table: &str, key: &Key, condition: Option<Condition>) -> Result<()> {
        let mut state = self.write();
        Self::injected_failure(&mut state)?;
        let table = table_mut(&mut state, table)?;

        if let Some(condition) = condition {
            if !condition.holds(table.items.get(key)) {
                return Err(RelayError::ConditionFailed);
            }
        }
        table.items.remove(key);
        Ok(())
    }

    async fn query(&self, table: &str, attribute: &str, value: &str) -> Result<Vec<Item>> {
        let mut state = self.write();
        Self::injected_failure(&mut state)?;
        Ok(table_mut(&mut state, table)?
            .items
            .values()
            .filter(|item| item.get(attribute).and_then(Value::as_str) == Some(value))
            .cloned()
            .collect())
    }

    async fn batch_write(&self, requests: Vec<WriteRequest>) -> Result<BatchWriteOutput> {
        let mut state = self.write();
        if requests.len() > MAX_BATCH_ITEMS {
            return Err(RelayError::Validation(format!(
                "batch of {} exceeds {MAX_BATCH_ITEMS} items",
                requests.len()
            )));
        }
        state.batch_calls.push(requests.len());
        Self::injected_failure(&mut state)?;
        if state.faults.failing_batch_writes > 0 {
            state.faults.failing_batch_writes -= 1;
            return Err(RelayError::dependency(STORE_DEPENDENCY, "injected batch failure"));
        }

        let mut unprocessed = Vec::new();
        for request in requests {
            let key = {
                let table = table_mut(&mut state, request.table())?;
                match &request {
                    WriteRequest::Put { item, .. } => item_key(table, item)?,
                    WriteRequest::Delete { key, .. } => key.clone(),
                }
            };

            let faults = &mut state.faults;
            if faults.never_applied.as_ref().is_some_and(|p| p(&request)) {
                unprocessed.push(request);
                continue;
            }
            if faults.deferred_once.as_ref().is_some_and(|p| p(&request))
                && faults
                    .already_deferred
                    .insert((request.table().to_string(), key.clone()))
            {
                unprocessed.push(request);
                continue;
            }

            let table = table_mut(&mut state, request.table())?;
            match request {
                WriteRequest::Put { item, .. } => {
                    table.items.insert(key, item);
                }
                WriteRequest::Delete { .. } => {
                    table.items.remove(&key);
                }
            }
        }

        Ok(BatchWriteOutput { unprocessed })
    }
}
