//! # MapRelay Webhooks
//!
//! Outbound, signed HTTP callbacks for job and map outcomes.
//!
//! - [`signing`]: HMAC-SHA256 signatures and constant-time verification
//! - [`delivery`]: one URL, bounded attempts, fixed backoff, per-attempt timeout
//! - [`registry`]: owner-scoped registrations in the key/value store
//! - [`dispatcher`]: concurrent fan-out, usable as an
//!   [`EventNotifier`](maprelay_core::providers::EventNotifier)
//!
//! Delivery is at-most-`max_retries` attempts; nothing is persisted and
//! failures never propagate to the caller that triggered the event.

pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod registry;
pub mod signing;

pub use config::{NewWebhook, WebhookAuth, WebhookConfig, WebhookUpdate};
pub use delivery::{DeliveryOptions, DeliveryReport, WebhookClient, WebhookPayload};
pub use dispatcher::{DispatcherConfig, WebhookDispatcher};
pub use registry::WebhookRegistry;
pub use signing::{sign, verify};
