//! HTTP handlers.

pub mod health;

pub use health::{dependency_health, health_check};
