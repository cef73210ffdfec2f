//! Batch executor behavior against the in-memory store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use maprelay_core::item::{Item, Key, WriteRequest, to_item};
use maprelay_runtime::breakers::DependencyBreakers;
use maprelay_runtime::circuit_breaker::State;
use maprelay_runtime::retry::RetryPolicy;
use maprelay_store::{BatchExecutor, BatchOutcome, ProtectedStore};
use maprelay_testing::mocks::{InMemoryStore, ManualClock};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

const MAPS: &str = "maps";

fn store() -> InMemoryStore {
    InMemoryStore::new().with_table(MAPS, &["mapId", "mapName"])
}

fn map_item(seq: u64) -> Item {
    to_item(&json!({
        "mapId": format!("map_{seq:03}"),
        "mapName": format!("{seq}_123456.zip"),
        "seq": seq,
    }))
    .unwrap()
}

fn items(range: std::ops::RangeInclusive<u64>) -> Vec<(String, Item)> {
    range.map(|seq| (MAPS.to_string(), map_item(seq))).collect()
}

fn seq_above(threshold: u64) -> impl Fn(&WriteRequest) -> bool + Send + Sync + 'static {
    move |request| match request {
        WriteRequest::Put { item, .. } => item
            .get("seq")
            .and_then(Value::as_u64)
            .is_some_and(|seq| seq > threshold),
        WriteRequest::Delete { .. } => false,
    }
}

#[tokio::test(start_paused = true)]
async fn unprocessed_subset_is_retried_in_isolation() {
    let store = store();
    store.defer_once_where(seq_above(25));
    let executor = BatchExecutor::new(store.clone());

    let outcome = executor.batch_write(items(1..=30)).await.unwrap();

    assert_eq!(
        outcome,
        BatchOutcome {
            successful: 30,
            failed: 0,
            batches: 2
        }
    );
    assert_eq!(store.batch_call_sizes(), vec![25, 5, 5]);
    assert_eq!(store.len(MAPS), 30);
}

#[tokio::test(start_paused = true)]
async fn items_fail_only_after_retries_are_exhausted() {
    let store = store();
    store.never_apply_where(seq_above(25));
    let executor = BatchExecutor::new(store.clone());

    let outcome = executor.batch_write(items(1..=30)).await.unwrap();

    assert_eq!(outcome.successful, 25);
    assert_eq!(outcome.failed, 5);
    assert!(!outcome.is_complete());
    // Initial call plus three retries of the five stragglers.
    assert_eq!(store.batch_call_sizes(), vec![25, 5, 5, 5, 5]);
}

#[tokio::test(start_paused = true)]
async fn backoff_is_exponential_between_retries() {
    let store = store();
    store.never_apply_where(seq_above(0));
    let executor = BatchExecutor::new(store);

    let started = tokio::time::Instant::now();
    let outcome = executor.batch_write(items(1..=1)).await.unwrap();

    assert_eq!(outcome.failed, 1);
    // 100ms + 200ms + 400ms
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(700), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(800), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn hard_failure_resubmits_the_whole_batch() {
    let store = store();
    store.fail_next_batch_writes(2);
    let executor = BatchExecutor::new(store.clone());

    let outcome = executor.batch_write(items(1..=30)).await.unwrap();

    assert_eq!(outcome.successful, 30);
    assert_eq!(store.batch_call_sizes(), vec![25, 25, 25, 5]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_batch_does_not_abort_the_next() {
    let store = store();
    store.fail_next_batch_writes(4);
    let executor = BatchExecutor::new(store.clone());

    let outcome = executor.batch_write(items(1..=30)).await.unwrap();

    assert_eq!(outcome.failed, 25);
    assert_eq!(outcome.successful, 5);
    assert_eq!(store.len(MAPS), 5);
}

#[tokio::test(start_paused = true)]
async fn zero_retries_counts_leftovers_immediately() {
    let store = store();
    store.never_apply_where(seq_above(28));
    let executor = BatchExecutor::with_policy(store.clone(), RetryPolicy::default().with_max_retries(0));

    let outcome = executor.batch_write(items(1..=30)).await.unwrap();

    assert_eq!(outcome.successful, 28);
    assert_eq!(outcome.failed, 2);
    assert_eq!(store.batch_call_sizes(), vec![25, 5]);
}

#[tokio::test(start_paused = true)]
async fn batches_go_through_the_store_breaker() {
    let clock = ManualClock::default();
    let breakers = DependencyBreakers::with_clock(Arc::new(clock));
    let raw = store();
    raw.fail_next_batch_writes(100);
    let executor = BatchExecutor::new(ProtectedStore::new(raw.clone(), breakers.store.clone()));

    let outcome = executor.batch_write(items(1..=30)).await.unwrap();

    assert_eq!(outcome.successful, 0);
    assert_eq!(outcome.failed, 30);
    assert_eq!(breakers.store.state().await, State::Open);
    // Four calls for the first batch, one for the second before the breaker opened.
    assert_eq!(raw.batch_call_sizes(), vec![25, 25, 25, 25, 5]);
    assert_eq!(breakers.store.metrics().total_rejections, 3);
}

#[tokio::test(start_paused = true)]
async fn batch_delete_removes_records() {
    let store = store();
    let executor = BatchExecutor::new(store.clone());
    executor.batch_write(items(1..=3)).await.unwrap();

    let keys = (1..=2)
        .map(|seq| {
            (
                MAPS.to_string(),
                Key::new()
                    .with("mapId", format!("map_{seq:03}"))
                    .with("mapName", format!("{seq}_123456.zip")),
            )
        })
        .collect();
    let outcome = executor.batch_delete(keys).await.unwrap();

    assert_eq!(outcome.successful, 2);
    assert_eq!(store.len(MAPS), 1);
}

#[tokio::test]
async fn empty_input_is_a_no_op() {
    let store = store();
    let outcome = BatchExecutor::new(store.clone()).batch_write(vec![]).await.unwrap();
    assert_eq!(outcome, BatchOutcome::default());
    assert!(store.batch_call_sizes().is_empty());
}
