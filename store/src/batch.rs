//! Batch operation executor.
//!
//! Turns an arbitrary number of writes into physical batch calls the store
//! accepts, and settles partial responses:
//!
//! 1. Requests are grouped by table (first-seen order) and chunked to
//!    [`MAX_BATCH_ITEMS`].
//! 2. Each chunk is sent through the store. If the store hands back
//!    unprocessed writes, exactly those are resubmitted after
//!    `min(initial_delay * 2^attempt, max_delay)`.
//! 3. A failed call resubmits everything still pending in that chunk with the
//!    same backoff.
//! 4. Once `max_retries` resubmissions are spent, whatever is still pending is
//!    counted failed and the next chunk starts. One chunk's exhaustion never
//!    aborts the others.

use maprelay_core::item::{Item, Key, MAX_BATCH_ITEMS, WriteRequest};
use maprelay_core::providers::KeyValueStore;
use maprelay_core::{RelayError, Result};
use maprelay_runtime::metrics::names;
use maprelay_runtime::retry::RetryPolicy;
use std::collections::HashMap;
use tokio::time::sleep;

/// Aggregate result of a batch operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Writes the store applied
    pub successful: usize,
    /// Writes still unapplied after retries were exhausted
    pub failed: usize,
    /// Physical batches the input was split into
    pub batches: usize,
}

impl BatchOutcome {
    /// Whether every write was applied.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// Executes multi-item writes with partial-failure recovery.
///
/// # Example
///
/// ```
/// use maprelay_core::item::to_item;
/// use maprelay_store::batch::BatchExecutor;
/// use maprelay_testing::InMemoryStore;
///
/// # async fn example() -> maprelay_core::Result<()> {
/// let store = InMemoryStore::new().with_table("jobs", &["jobId"]);
/// let executor = BatchExecutor::new(store);
/// let items = (0..40)
///     .map(|i| Ok(("jobs".to_string(), to_item(&serde_json::json!({ "jobId": format!("JobId-{i}") }))?)))
///     .collect::<maprelay_core::Result<Vec<_>>>()?;
///
/// let outcome = executor.batch_write(items).await?;
/// assert_eq!(outcome.successful, 40);
/// assert_eq!(outcome.batches, 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct BatchExecutor<S> {
    store: S,
    policy: RetryPolicy,
}

impl<S: KeyValueStore> BatchExecutor<S> {
    /// Executor with the default backoff (100 ms doubling to 5 s, 3 retries).
    pub fn new(store: S) -> Self {
        Self::with_policy(store, RetryPolicy::default())
    }

    /// Executor with an explicit retry policy.
    pub const fn with_policy(store: S, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// The store writes go to.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Put every `(table, item)` pair.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Validation` if a table name is empty. Partial
    /// failure is reported through [`BatchOutcome::failed`], never as an error.
    pub async fn batch_write(&self, items: Vec<(String, Item)>) -> Result<BatchOutcome> {
        self.execute(
            items
                .into_iter()
                .map(|(table, item)| WriteRequest::Put { table, item })
                .collect(),
        )
        .await
    }

    /// Delete every `(table, key)` pair.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Validation` if a table name is empty.
    pub async fn batch_delete(&self, keys: Vec<(String, Key)>) -> Result<BatchOutcome> {
        self.execute(
            keys.into_iter()
                .map(|(table, key)| WriteRequest::Delete { table, key })
                .collect(),
        )
        .await
    }

    /// Apply a mixed list of writes.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Validation` if a table name is empty.
    pub async fn execute(&self, requests: Vec<WriteRequest>) -> Result<BatchOutcome> {
        let batches = partition(requests)?;
        let mut outcome = BatchOutcome {
            batches: batches.len(),
            ..BatchOutcome::default()
        };

        for (index, batch) in batches.into_iter().enumerate() {
            let size = batch.len();
            let applied = self.run_batch(index, batch).await;
            outcome.successful += applied;
            outcome.failed += size - applied;
        }

        metrics::counter!(names::BATCH_ITEMS, "outcome" => "successful")
            .increment(outcome.successful as u64);
        if outcome.failed > 0 {
            metrics::counter!(names::BATCH_ITEMS, "outcome" => "failed")
                .increment(outcome.failed as u64);
        }
        tracing::debug!(
            batches = outcome.batches,
            successful = outcome.successful,
            failed = outcome.failed,
            "Batch operation finished"
        );

        Ok(outcome)
    }

    /// Run one physical batch to completion or exhaustion; returns applied count.
    async fn run_batch(&self, index: usize, batch: Vec<WriteRequest>) -> usize {
        let total = batch.len();
        let mut pending = batch;
        let mut attempt = 0;

        loop {
            match self.store.batch_write(pending.clone()).await {
                Ok(output) if output.unprocessed.is_empty() => return total,
                Ok(output) => {
                    pending.retain(|request| output.unprocessed.contains(request));
                    if pending.is_empty() {
                        return total;
                    }
                    tracing::warn!(
                        batch = index,
                        attempt,
                        unprocessed = pending.len(),
                        "Store left writes unprocessed"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        batch = index,
                        attempt,
                        pending = pending.len(),
                        error = %err,
                        "Batch call failed"
                    );
                }
            }

            if attempt >= self.policy.max_retries {
                tracing::error!(
                    batch = index,
                    failed = pending.len(),
                    max_retries = self.policy.max_retries,
                    "Batch retries exhausted"
                );
                return total - pending.len();
            }

            let delay = self.policy.delay_for_attempt(attempt);
            tracing::debug!(batch = index, attempt, delay_ms = delay.as_millis(), "Retrying batch");
            sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Group by table in first-seen order, then chunk.
fn partition(requests: Vec<WriteRequest>) -> Result<Vec<Vec<WriteRequest>>> {
    let mut order: Vec<Vec<WriteRequest>> = Vec::new();
    let mut by_table: HashMap<String, usize> = HashMap::new();

    for request in requests {
        if request.table().is_empty() {
            return Err(RelayError::Validation(
                "batch request has an empty table name".into(),
            ));
        }
        let slot = *by_table.entry(request.table().to_string()).or_insert_with(|| {
            order.push(Vec::new());
            order.len() - 1
        });
        order[slot].push(request);
    }

    Ok(order
        .into_iter()
        .flat_map(|group| {
            let mut chunks = Vec::with_capacity(group.len().div_ceil(MAX_BATCH_ITEMS));
            let mut group = group.into_iter().peekable();
            while group.peek().is_some() {
                chunks.push(group.by_ref().take(MAX_BATCH_ITEMS).collect::<Vec<_>>());
            }
            chunks
        })
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn put(table: &str, n: usize) -> WriteRequest {
        WriteRequest::Put {
            table: table.to_string(),
            item: Item::from_iter([("id".to_string(), n.to_string().into())]),
        }
    }

    #[test]
    fn partitions_by_table_then_size() {
        let mut requests: Vec<_> = (0..30).map(|n| put("maps", n)).collect();
        requests.insert(3, put("jobs", 99));

        let batches = partition(requests).unwrap();
        let sizes: Vec<_> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![25, 5, 1]);
        assert!(batches[2].iter().all(|r| r.table() == "jobs"));
    }

    #[test]
    fn empty_input_has_no_batches() {
        assert!(partition(vec![]).unwrap().is_empty());
    }

    #[test]
    fn empty_table_name_is_a_setup_error() {
        let err = partition(vec![put("", 1)]).unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }
}
