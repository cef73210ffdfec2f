//! Circuit breaker pattern for preventing cascading failures.
//!
//! A circuit breaker monitors calls into one dependency and "opens" (stops
//! allowing calls) when too many of them fail inside a sliding time window.
//!
//! # States
//!
//! ```text
//! Closed ──[failure_threshold failures within failure_window]──> Open
//!                                                                 │
//!                                                                 │ [now >= next_attempt_at]
//!                                                                 ▼
//!                                                              HalfOpen
//!                                                                 │
//!                      ┌──────────────────────────────────────────┴──────┐
//!           [success_threshold successes]                          [any failure]
//!                      ▼                                                 ▼
//!                   Closed (history cleared)                 Open (timer restarted)
//! ```
//!
//! The breaker performs no I/O and does not interpret errors: callers decide
//! which errors count as failures via [`CircuitBreaker::execute_classified`].
//!
//! # Example
//!
//! ```rust
//! use maprelay_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(5)
//!     .failure_window(Duration::from_secs(60))
//!     .reset_timeout(Duration::from_secs(30))
//!     .success_threshold(2)
//!     .build();
//!
//! let breaker = CircuitBreaker::new("kv-store", config);
//!
//! match breaker.execute(|| async { Ok::<_, String>(42) }).await {
//!     Ok(result) => println!("Success: {result}"),
//!     Err(e) => println!("Failed: {e}"),
//! }
//! # }
//! ```

use crate::metrics::names;
use crate::{HealthCheck, HealthStatus};
use chrono::{DateTime, Utc};
use maprelay_core::RelayError;
use maprelay_core::environment::{Clock, SystemClock};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures inside `failure_window` that open the circuit
    pub failure_threshold: usize,
    /// How far back failures are counted
    pub failure_window: Duration,
    /// How long the circuit stays open before admitting a probe
    pub reset_timeout: Duration,
    /// Probe successes in `HalfOpen` that close the circuit
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            failure_window: None,
            reset_timeout: None,
            success_threshold: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<usize>,
    failure_window: Option<Duration>,
    reset_timeout: Option<Duration>,
    success_threshold: Option<usize>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set the window failures are counted in.
    #[must_use]
    pub const fn failure_window(mut self, window: Duration) -> Self {
        self.failure_window = Some(window);
        self
    }

    /// Set how long to wait in Open state before trying `HalfOpen`.
    #[must_use]
    pub const fn reset_timeout(mut self, duration: Duration) -> Self {
        self.reset_timeout = Some(duration);
        self
    }

    /// Set the success threshold.
    #[must_use]
    pub const fn success_threshold(mut self, threshold: usize) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    /// Build the configuration. Thresholds below 1 are raised to 1.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            failure_threshold: self
                .failure_threshold
                .unwrap_or(defaults.failure_threshold)
                .max(1),
            failure_window: self.failure_window.unwrap_or(defaults.failure_window),
            reset_timeout: self.reset_timeout.unwrap_or(defaults.reset_timeout),
            success_threshold: self
                .success_threshold
                .unwrap_or(defaults.success_threshold)
                .max(1),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, testing if service recovered
    HalfOpen,
}

impl State {
    /// Log/metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from circuit breaker operations.
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, request rejected without calling the dependency
    #[error("Circuit breaker '{breaker}' is open, retry after {}s", ceil_secs(*.retry_after))]
    Open {
        /// Breaker name
        breaker: String,
        /// Time until a probe is admitted
        retry_after: Duration,
    },
    /// Operation failed
    #[error("Operation failed: {0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// Whole seconds until the breaker admits a call, rounded up.
    #[must_use]
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Open { retry_after, .. } => Some(ceil_secs(*retry_after)),
            Self::Inner(_) => None,
        }
    }
}

impl From<CircuitBreakerError<RelayError>> for RelayError {
    fn from(err: CircuitBreakerError<RelayError>) -> Self {
        match err {
            CircuitBreakerError::Open {
                breaker,
                retry_after,
            } => Self::Unavailable {
                dependency: breaker,
                retry_after_secs: ceil_secs(retry_after),
            },
            CircuitBreakerError::Inner(inner) => inner,
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

fn add_std(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Internal state of the circuit breaker.
#[derive(Debug)]
struct BreakerState {
    state: State,
    /// Oldest first.
    failures: VecDeque<DateTime<Utc>>,
    successes_in_half_open: usize,
    next_attempt_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: State,
    /// Failures currently inside the window
    pub recent_failures: usize,
    /// When an open circuit admits its next probe
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Circuit breaker guarding one dependency.
///
/// Cloning is cheap and clones share state, so one instance per dependency
/// can be handed to every client that talks to it.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<BreakerState>>,
    // Metrics
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a breaker on the system clock.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    /// Create a breaker on an injected clock.
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            config: Arc::new(config),
            clock,
            state: Arc::new(Mutex::new(BreakerState {
                state: State::Closed,
                failures: VecDeque::new(),
                successes_in_half_open: 0,
                next_attempt_at: None,
            })),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Breaker name (the dependency it guards).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker.
    pub async fn state(&self) -> State {
        self.state.lock().await.state
    }

    /// Current state plus failure history.
    pub async fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        self.prune(&mut state, now);
        BreakerSnapshot {
            name: self.name.to_string(),
            state: state.state,
            recent_failures: state.failures.len(),
            next_attempt_at: state.next_attempt_at,
        }
    }

    /// Run `operation` through the breaker, counting every error as a failure.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the circuit is open.
    /// Returns `CircuitBreakerError::Inner` if the operation fails.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_classified(operation, |_| true).await
    }

    /// Run `operation` through the breaker with caller-supplied failure classification.
    ///
    /// Errors for which `is_failure` returns `false` are passed back to the
    /// caller but recorded as a healthy response from the dependency.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the circuit is open.
    /// Returns `CircuitBreakerError::Inner` if the operation fails.
    pub async fn execute_classified<F, Fut, T, E, C>(
        &self,
        operation: F,
        is_failure: C,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        if let Err(retry_after) = self.admit().await {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(names::BREAKER_REJECTIONS, "breaker" => self.name.to_string())
                .increment(1);
            tracing::warn!(
                breaker = %self.name,
                retry_after_ms = retry_after.as_millis(),
                "Circuit breaker is OPEN, rejecting call"
            );
            return Err(CircuitBreakerError::Open {
                breaker: self.name.to_string(),
                retry_after,
            });
        }

        match operation().await {
            Ok(result) => {
                self.total_successes.fetch_add(1, Ordering::Relaxed);
                self.on_success().await;
                Ok(result)
            }
            Err(err) => {
                if is_failure(&err) {
                    self.total_failures.fetch_add(1, Ordering::Relaxed);
                    self.on_failure().await;
                } else {
                    self.total_successes.fetch_add(1, Ordering::Relaxed);
                    self.on_success().await;
                }
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    /// Admission check. `Err` carries the remaining cooldown.
    async fn admit(&self) -> Result<(), Duration> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        match state.state {
            State::Closed | State::HalfOpen => Ok(()),
            State::Open => match state.next_attempt_at {
                Some(next_attempt_at) if now < next_attempt_at => Err((next_attempt_at - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO)),
                _ => {
                    self.transition(&mut state, State::HalfOpen);
                    state.successes_in_half_open = 0;
                    Ok(())
                }
            },
        }
    }

    async fn on_success(&self) {
        let mut state = self.state.lock().await;

        if state.state == State::HalfOpen {
            state.successes_in_half_open += 1;
            if state.successes_in_half_open >= self.config.success_threshold {
                tracing::info!(
                    breaker = %self.name,
                    successes = state.successes_in_half_open,
                    "Circuit breaker recovered"
                );
                self.transition(&mut state, State::Closed);
                state.failures.clear();
                state.successes_in_half_open = 0;
                state.next_attempt_at = None;
            }
        }
    }

    async fn on_failure(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        match state.state {
            State::Closed => {
                state.failures.push_back(now);
                self.prune(&mut state, now);
                if state.failures.len() >= self.config.failure_threshold {
                    tracing::warn!(
                        breaker = %self.name,
                        failures = state.failures.len(),
                        threshold = self.config.failure_threshold,
                        window_secs = self.config.failure_window.as_secs(),
                        "Failure threshold reached"
                    );
                    self.trip(&mut state, now);
                }
            }
            State::HalfOpen => {
                tracing::warn!(breaker = %self.name, "Probe failed, reopening circuit");
                state.failures.push_back(now);
                self.trip(&mut state, now);
            }
            State::Open => {
                // A call admitted before the trip finished late.
                state.failures.push_back(now);
                self.prune(&mut state, now);
            }
        }
    }

    fn trip(&self, state: &mut BreakerState, now: DateTime<Utc>) {
        self.transition(state, State::Open);
        state.successes_in_half_open = 0;
        state.next_attempt_at = Some(add_std(now, self.config.reset_timeout));
    }

    fn transition(&self, state: &mut BreakerState, to: State) {
        if state.state == to {
            return;
        }
        tracing::info!(
            breaker = %self.name,
            from = %state.state,
            to = %to,
            "Circuit breaker transition"
        );
        metrics::counter!(
            names::BREAKER_TRANSITIONS,
            "breaker" => self.name.to_string(),
            "to" => to.as_str()
        )
        .increment(1);
        state.state = to;
    }

    fn prune(&self, state: &mut BreakerState, now: DateTime<Utc>) {
        let window = chrono::Duration::from_std(self.config.failure_window)
            .unwrap_or(chrono::Duration::MAX);
        while let Some(oldest) = state.failures.front() {
            if now.signed_duration_since(*oldest) > window {
                state.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Get circuit breaker metrics.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Health of the guarded dependency as seen by this breaker.
    pub async fn health(&self) -> HealthCheck {
        let snapshot = self.snapshot().await;
        let check = match snapshot.state {
            State::Closed => HealthCheck::healthy(snapshot.name),
            State::HalfOpen => HealthCheck::degraded(snapshot.name, "probing recovery"),
            State::Open => HealthCheck::unhealthy(snapshot.name, "circuit open"),
        };
        let check = check.with_metadata("recent_failures", snapshot.recent_failures.to_string());
        match snapshot.next_attempt_at {
            Some(at) if check.status == HealthStatus::Unhealthy => {
                check.with_metadata("next_attempt_at", at.to_rfc3339())
            }
            _ => check,
        }
    }

    /// Reset the circuit breaker to closed state.
    ///
    /// Operator override; clears failure history.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset to CLOSED");
        self.transition(&mut state, State::Closed);
        state.failures.clear();
        state.successes_in_half_open = 0;
        state.next_attempt_at = None;
    }
}

/// Metrics for circuit breaker monitoring.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerMetrics {
    /// Total number of calls attempted
    pub total_calls: u64,
    /// Total number of calls the dependency answered
    pub total_successes: u64,
    /// Total number of calls classified as failures
    pub total_failures: u64,
    /// Total number of rejected calls (circuit open)
    pub total_rejections: u64,
}

impl CircuitBreakerMetrics {
    /// Calculate rejection rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_rejections as f64 / self.total_calls as f64
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use maprelay_testing::mocks::ManualClock;
    use std::sync::atomic::AtomicUsize;

    fn breaker(config: CircuitBreakerConfig) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::default();
        let breaker = CircuitBreaker::with_clock("kv-store", config, Arc::new(clock.clone()));
        (breaker, clock)
    }

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder()
            .failure_threshold(3)
            .failure_window(Duration::from_secs(60))
            .reset_timeout(Duration::from_secs(30))
            .success_threshold(2)
            .build()
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.execute(|| async { Err::<(), _>("boom") }).await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        let _ = breaker.execute(|| async { Ok::<_, String>(()) }).await;
    }

    #[tokio::test]
    async fn stays_closed_on_success() {
        let (breaker, _) = breaker(config());
        let result = breaker.execute(|| async { Ok::<_, String>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fails_fast_without_calling() {
        let (breaker, clock) = breaker(config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, State::Open);

        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invoked);
        clock.advance(Duration::from_secs(10));
        let result = breaker
            .execute(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;

        match result {
            Err(CircuitBreakerError::Open { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(20));
            }
            other => panic!("expected open rejection, got {other:?}"),
        }
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.metrics().total_rejections, 1);
    }

    #[tokio::test]
    async fn failures_outside_window_do_not_count() {
        let (breaker, clock) = breaker(config());
        fail(&breaker).await;
        fail(&breaker).await;
        clock.advance(Duration::from_secs(61));
        fail(&breaker).await;
        assert_eq!(breaker.state().await, State::Closed);
        assert_eq!(breaker.snapshot().await.recent_failures, 1);
    }

    #[tokio::test]
    async fn probe_admitted_after_reset_timeout() {
        let (breaker, clock) = breaker(config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        clock.advance(Duration::from_secs(30));
        succeed(&breaker).await;
        assert_eq!(breaker.state().await, State::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_and_restarts_timer() {
        let (breaker, clock) = breaker(config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        clock.advance(Duration::from_secs(30));
        fail(&breaker).await;
        assert_eq!(breaker.state().await, State::Open);

        let snapshot = breaker.snapshot().await;
        assert_eq!(
            snapshot.next_attempt_at,
            Some(clock.now() + chrono::Duration::seconds(30))
        );

        clock.advance(Duration::from_secs(29));
        let result = breaker.execute(|| async { Ok::<_, String>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
    }

    #[tokio::test]
    async fn success_threshold_closes_and_clears_history() {
        let (breaker, clock) = breaker(config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        clock.advance(Duration::from_secs(30));
        succeed(&breaker).await;
        succeed(&breaker).await;
        assert_eq!(breaker.state().await, State::Closed);
        assert_eq!(breaker.snapshot().await.recent_failures, 0);

        // History was cleared: two fresh failures are not enough to trip.
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn unclassified_errors_do_not_trip() {
        let (breaker, _) = breaker(config());
        for _ in 0..5 {
            let result = breaker
                .execute_classified(
                    || async { Err::<(), _>(RelayError::ConditionFailed) },
                    RelayError::counts_as_dependency_failure,
                )
                .await;
            assert!(matches!(
                result,
                Err(CircuitBreakerError::Inner(RelayError::ConditionFailed))
            ));
        }
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn open_maps_to_unavailable() {
        let (breaker, _) = breaker(config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        let err = breaker
            .execute(|| async { Ok::<(), RelayError>(()) })
            .await
            .unwrap_err();
        assert_eq!(err.retry_after_secs(), Some(30));
        assert_eq!(
            RelayError::from(err),
            RelayError::Unavailable {
                dependency: "kv-store".into(),
                retry_after_secs: 30
            }
        );
    }

    #[tokio::test]
    async fn health_reflects_state() {
        let (breaker, _) = breaker(config());
        assert_eq!(breaker.health().await.status, HealthStatus::Healthy);
        for _ in 0..3 {
            fail(&breaker).await;
        }
        let health = breaker.health().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.metadata.iter().any(|(k, _)| k == "next_attempt_at"));
    }

    #[tokio::test]
    async fn reset_closes_circuit() {
        let (breaker, _) = breaker(config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        breaker.reset().await;
        assert_eq!(breaker.state().await, State::Closed);
        succeed(&breaker).await;
        let metrics = breaker.metrics();
        assert_eq!(metrics.total_calls, 4);
        assert_eq!(metrics.total_successes, 1);
    }

    #[tokio::test]
    async fn concurrent_calls_share_state() {
        let (breaker, _) = breaker(CircuitBreakerConfig::default());
        let mut handles = vec![];
        for _ in 0..50 {
            let breaker = breaker.clone();
            handles.push(tokio::spawn(async move {
                breaker.execute(|| async { Ok::<_, String>(()) }).await.is_ok()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(breaker.metrics().total_successes, 50);
    }
}
