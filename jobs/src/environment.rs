//! Job service environment.
//!
//! All external dependencies of the job service, injected so tests can swap
//! in the in-memory implementations.

use maprelay_core::environment::{Clock, SystemClock};
use maprelay_core::providers::{BlobStore, EventNotifier, KeyValueStore, TaskScheduler};
use maprelay_runtime::breakers::DependencyBreakers;
use maprelay_store::{ProtectedBlobStore, ProtectedClients, ProtectedScheduler, ProtectedStore};
use std::sync::Arc;

/// Dependencies of [`JobService`](crate::service::JobService).
///
/// # Type Parameters
///
/// - `S`: key/value store
/// - `B`: blob store
/// - `T`: task scheduler
/// - `N`: notifier
///
/// The three remote clients are only reachable through their breakers.
#[derive(Clone)]
pub struct JobEnvironment<S, B, T, N> {
    /// Key/value store behind its breaker
    pub store: ProtectedStore<S>,
    /// Blob store behind its breaker
    pub blobs: ProtectedBlobStore<B>,
    /// Scheduler behind its breaker
    pub scheduler: ProtectedScheduler<T>,
    /// Outcome notifications
    pub notifier: N,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl<S, B, T, N> JobEnvironment<S, B, T, N>
where
    S: KeyValueStore,
    B: BlobStore,
    T: TaskScheduler,
    N: EventNotifier,
{
    /// Wrap raw clients with `breakers`.
    pub fn new(store: S, blobs: B, scheduler: T, notifier: N, breakers: &DependencyBreakers) -> Self {
        Self::from_clients(ProtectedClients::new(store, blobs, scheduler, breakers), notifier)
    }

    /// Build from already protected clients.
    pub fn from_clients(clients: ProtectedClients<S, B, T>, notifier: N) -> Self {
        Self {
            store: clients.store,
            blobs: clients.blobs,
            scheduler: clients.scheduler,
            notifier,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
