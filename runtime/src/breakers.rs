//! One breaker per external dependency, tuned to its failure profile.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, State};
use crate::{HealthCheck, HealthReport};
use maprelay_core::environment::{Clock, SystemClock};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// External dependencies guarded by a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dependency {
    /// Key/value store holding Job, Map and webhook records
    KeyValueStore,
    /// Blob store receiving uploads
    BlobStore,
    /// Container scheduler running Map tasks
    TaskScheduler,
}

impl Dependency {
    /// Every dependency.
    pub const ALL: [Self; 3] = [Self::KeyValueStore, Self::BlobStore, Self::TaskScheduler];

    /// Breaker name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::KeyValueStore => "kv-store",
            Self::BlobStore => "blob-store",
            Self::TaskScheduler => "task-scheduler",
        }
    }

    /// Default breaker tuning.
    ///
    /// The scheduler trips sooner and cools down longer: a failed task launch
    /// is expensive and rarely recovers within seconds.
    #[must_use]
    pub fn profile(self) -> CircuitBreakerConfig {
        let builder = CircuitBreakerConfig::builder().failure_window(Duration::from_secs(60));
        match self {
            Self::KeyValueStore | Self::BlobStore => builder
                .failure_threshold(5)
                .reset_timeout(Duration::from_secs(30))
                .success_threshold(2),
            Self::TaskScheduler => builder
                .failure_threshold(3)
                .reset_timeout(Duration::from_secs(60))
                .success_threshold(1),
        }
        .build()
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The long-lived breaker set, created once at startup.
#[derive(Debug, Clone)]
pub struct DependencyBreakers {
    /// Key/value store breaker
    pub store: CircuitBreaker,
    /// Blob store breaker
    pub blob: CircuitBreaker,
    /// Scheduler breaker
    pub scheduler: CircuitBreaker,
}

impl Default for DependencyBreakers {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl DependencyBreakers {
    /// Breakers with default profiles on an injected clock.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let breaker = |dependency: Dependency| {
            CircuitBreaker::with_clock(dependency.as_str(), dependency.profile(), Arc::clone(&clock))
        };
        Self {
            store: breaker(Dependency::KeyValueStore),
            blob: breaker(Dependency::BlobStore),
            scheduler: breaker(Dependency::TaskScheduler),
        }
    }

    /// Breaker guarding `dependency`.
    #[must_use]
    pub const fn get(&self, dependency: Dependency) -> &CircuitBreaker {
        match dependency {
            Dependency::KeyValueStore => &self.store,
            Dependency::BlobStore => &self.blob,
            Dependency::TaskScheduler => &self.scheduler,
        }
    }

    /// Current state of every breaker.
    pub async fn states(&self) -> Vec<(Dependency, State)> {
        let mut states = Vec::with_capacity(Dependency::ALL.len());
        for dependency in Dependency::ALL {
            states.push((dependency, self.get(dependency).state().await));
        }
        states
    }

    /// Health of every dependency, worst status first in `status`.
    pub async fn health(&self) -> HealthReport {
        let mut checks: Vec<HealthCheck> = Vec::with_capacity(Dependency::ALL.len());
        for dependency in Dependency::ALL {
            checks.push(self.get(dependency).health().await);
        }
        HealthReport::new(checks)
    }
}
