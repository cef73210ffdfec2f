//! Dependency clients wrapped in their circuit breakers.
//!
//! Each wrapper implements the same boundary trait as the client it wraps, so
//! callers cannot reach a dependency without passing its breaker. Only
//! [`RelayError::Dependency`] counts toward tripping; a failed condition or a
//! validation error proves the dependency is answering.
//!
//! An open breaker surfaces as [`RelayError::Unavailable`] carrying the
//! remaining cooldown.

use maprelay_core::item::{BatchWriteOutput, Condition, Item, Key, WriteRequest};
use maprelay_core::providers::{
    BlobStore, KeyValueStore, ObjectLocation, ObjectMetadata, PresignedUpload, TaskHandle,
    TaskRequest, TaskScheduler,
};
use maprelay_core::{RelayError, Result};
use maprelay_runtime::breakers::DependencyBreakers;
use maprelay_runtime::circuit_breaker::CircuitBreaker;
use std::collections::BTreeMap;
use std::time::Duration;

async fn guarded<T, F, Fut>(breaker: &CircuitBreaker, operation: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    breaker
        .execute_classified(operation, RelayError::counts_as_dependency_failure)
        .await
        .map_err(RelayError::from)
}

/// Key/value store behind the store breaker.
#[derive(Debug, Clone)]
pub struct ProtectedStore<S> {
    inner: S,
    breaker: CircuitBreaker,
}

impl<S> ProtectedStore<S> {
    /// Wrap `inner` with `breaker`.
    pub const fn new(inner: S, breaker: CircuitBreaker) -> Self {
        Self { inner, breaker }
    }

    /// The unprotected client.
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    /// The guarding breaker.
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

impl<S: KeyValueStore> KeyValueStore for ProtectedStore<S> {
    async fn put_item(&self, table: &str, item: Item, condition: Option<Condition>) -> Result<()> {
        guarded(&self.breaker, || self.inner.put_item(table, item, condition)).await
    }

    async fn get_item(&self, table: &str, key: &Key) -> Result<Option<Item>> {
        guarded(&self.breaker, || self.inner.get_item(table, key)).await
    }

    async fn update_item(
        &self,
        table: &str,
        key: &Key,
        changes: Item,
        condition: Option<Condition>,
    ) -> Result<Option<Item>> {
        guarded(&self.breaker, || {
            self.inner.update_item(table, key, changes, condition)
        })
        .await
    }

    async fn delete_item(&self, table: &str, key: &Key, condition: Option<Condition>) -> Result<()> {
        guarded(&self.breaker, || self.inner.delete_item(table, key, condition)).await
    }

    async fn query(&self, table: &str, attribute: &str, value: &str) -> Result<Vec<Item>> {
        guarded(&self.breaker, || self.inner.query(table, attribute, value)).await
    }

    async fn batch_write(&self, requests: Vec<WriteRequest>) -> Result<BatchWriteOutput> {
        guarded(&self.breaker, || self.inner.batch_write(requests)).await
    }
}

/// Blob store behind the blob breaker.
#[derive(Debug, Clone)]
pub struct ProtectedBlobStore<B> {
    inner: B,
    breaker: CircuitBreaker,
}

impl<B> ProtectedBlobStore<B> {
    /// Wrap `inner` with `breaker`.
    pub const fn new(inner: B, breaker: CircuitBreaker) -> Self {
        Self { inner, breaker }
    }

    /// The unprotected client.
    pub const fn inner(&self) -> &B {
        &self.inner
    }
}

impl<B: BlobStore> BlobStore for ProtectedBlobStore<B> {
    async fn presign_upload(
        &self,
        location: &ObjectLocation,
        metadata: &BTreeMap<String, String>,
        expires_in: Duration,
    ) -> Result<PresignedUpload> {
        guarded(&self.breaker, || {
            self.inner.presign_upload(location, metadata, expires_in)
        })
        .await
    }

    async fn head_object(&self, location: &ObjectLocation) -> Result<Option<ObjectMetadata>> {
        guarded(&self.breaker, || self.inner.head_object(location)).await
    }
}

/// Task scheduler behind the scheduler breaker.
#[derive(Debug, Clone)]
pub struct ProtectedScheduler<T> {
    inner: T,
    breaker: CircuitBreaker,
}

impl<T> ProtectedScheduler<T> {
    /// Wrap `inner` with `breaker`.
    pub const fn new(inner: T, breaker: CircuitBreaker) -> Self {
        Self { inner, breaker }
    }

    /// The unprotected client.
    pub const fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: TaskScheduler> TaskScheduler for ProtectedScheduler<T> {
    async fn run_task(&self, request: &TaskRequest) -> Result<TaskHandle> {
        guarded(&self.breaker, || self.inner.run_task(request)).await
    }
}

/// The three dependency clients, each behind its own breaker.
#[derive(Debug, Clone)]
pub struct ProtectedClients<S, B, T> {
    /// Key/value store
    pub store: ProtectedStore<S>,
    /// Blob store
    pub blobs: ProtectedBlobStore<B>,
    /// Task scheduler
    pub scheduler: ProtectedScheduler<T>,
}

impl<S, B, T> ProtectedClients<S, B, T> {
    /// Wrap raw clients with the shared breaker set.
    pub fn new(store: S, blobs: B, scheduler: T, breakers: &DependencyBreakers) -> Self {
        Self {
            store: ProtectedStore::new(store, breakers.store.clone()),
            blobs: ProtectedBlobStore::new(blobs, breakers.blob.clone()),
            scheduler: ProtectedScheduler::new(scheduler, breakers.scheduler.clone()),
        }
    }
}
