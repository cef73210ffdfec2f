//! # MapRelay Store
//!
//! Access to the external dependencies, always through their circuit breakers,
//! plus the batch operation executor used for multi-item writes.
//!
//! - [`protected`]: breaker-wrapped key/value store, blob store and scheduler
//! - [`batch`]: physical batching, partial-response retries, aggregate counts

pub mod batch;
pub mod protected;

pub use batch::{BatchExecutor, BatchOutcome};
pub use protected::{ProtectedBlobStore, ProtectedClients, ProtectedScheduler, ProtectedStore};
