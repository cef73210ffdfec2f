//! # MapRelay Core
//!
//! Domain types and dependency boundaries for the MapRelay upload front end.
//!
//! MapRelay sits between request handlers and three unreliable external
//! services: a key/value store, a blob store and a container scheduler. This
//! crate holds what every layer agrees on:
//!
//! - **Errors**: the single [`RelayError`] taxonomy
//! - **Identifiers**: [`JobId`], content-derived [`MapId`], [`MapKey`], [`WebhookId`]
//! - **Records**: [`item::Item`], [`item::Key`], batch [`item::WriteRequest`]s
//! - **Boundaries**: [`providers::KeyValueStore`], [`providers::BlobStore`],
//!   [`providers::TaskScheduler`], [`providers::EventNotifier`]
//! - **Time**: [`environment::Clock`]

pub use chrono::{DateTime, Utc};

pub mod environment;
pub mod error;
pub mod item;
pub mod model;
pub mod providers;

pub use error::{RelayError, Result};
pub use model::{ContentHash, JobId, MapId, MapKey, WebhookId};
