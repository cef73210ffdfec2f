//! Per-caller request admission with reset-based windows.
//!
//! A window is opened with `count = 0` and `reset_at = now + window` the first
//! time a key is seen, or the first time it is seen after its previous window
//! expired. Every call increments the counter *before* comparing, so the call
//! that crosses the ceiling is itself counted:
//!
//! ```text
//! allowed   = count <= max_requests
//! remaining = max_requests - count   (saturating)
//! ```
//!
//! Expired windows are swept lazily from the hot path, at most once per
//! [`RateLimiterConfig::cleanup_interval`]. There is no background task.
//!
//! State is process-local. Replicas each keep their own counters.
//!
//! # Example
//!
//! ```rust
//! use maprelay_runtime::rate_limiter::{RateLimitPreset, RateLimiter};
//!
//! let limiter = RateLimiter::new();
//! let decision = limiter.check_preset(RateLimitPreset::Upload, "user-42");
//! assert!(decision.allowed);
//! assert_eq!(decision.remaining, 9);
//! ```

use crate::metrics::names;
use chrono::{DateTime, Utc};
use maprelay_core::environment::{Clock, SystemClock};
use maprelay_core::{RelayError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Ceiling and window length for one class of requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    pub max_requests: u32,
    /// Window length
    pub window: Duration,
}

impl RateLimitConfig {
    /// Build a config.
    #[must_use]
    pub const fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

/// Named endpoint classes with fixed limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitPreset {
    /// Batch submissions: 10 per minute
    Upload,
    /// General API traffic: 100 per minute
    Api,
    /// Job status polling: 120 per minute
    StatusPoll,
    /// Webhook CRUD: 20 per minute
    WebhookManagement,
    /// Authentication attempts: 5 per 15 minutes
    Auth,
}

impl RateLimitPreset {
    /// Every preset.
    pub const ALL: [Self; 5] = [
        Self::Upload,
        Self::Api,
        Self::StatusPoll,
        Self::WebhookManagement,
        Self::Auth,
    ];

    /// Limits for this preset.
    #[must_use]
    pub const fn config(self) -> RateLimitConfig {
        match self {
            Self::Upload => RateLimitConfig::new(10, Duration::from_secs(60)),
            Self::Api => RateLimitConfig::new(100, Duration::from_secs(60)),
            Self::StatusPoll => RateLimitConfig::new(120, Duration::from_secs(60)),
            Self::WebhookManagement => RateLimitConfig::new(20, Duration::from_secs(60)),
            Self::Auth => RateLimitConfig::new(5, Duration::from_secs(15 * 60)),
        }
    }

    /// Key prefix and metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Api => "api",
            Self::StatusPoll => "status",
            Self::WebhookManagement => "webhooks",
            Self::Auth => "auth",
        }
    }
}

impl fmt::Display for RateLimitPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Window ceiling
    pub limit: u32,
    /// Requests left in the window
    pub remaining: u32,
    /// When the window resets
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Whole seconds from `now` until the window resets, rounded up.
    #[must_use]
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds();
        u64::try_from(millis).map_or(0, |ms| ms.div_ceil(1000))
    }
}

/// Limiter settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Minimum time between sweeps of expired windows
    pub cleanup_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: DateTime<Utc>,
}

#[derive(Debug)]
struct LimiterState {
    windows: HashMap<String, Window>,
    last_cleanup: DateTime<Utc>,
}

/// In-process rate limiter shared by every handler.
///
/// Cloning shares the same counters. The lock is held only for the
/// read-increment-compare step, so concurrent calls for one key never
/// double count.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<LimiterState>>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Limiter on the system clock with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(RateLimiterConfig::default(), Arc::new(SystemClock))
    }

    /// Limiter on an injected clock.
    #[must_use]
    pub fn with_clock(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            state: Arc::new(Mutex::new(LimiterState {
                windows: HashMap::new(),
                last_cleanup: now,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count one request for `identifier` and decide whether it is admitted.
    #[must_use]
    pub fn check(&self, identifier: &str, config: &RateLimitConfig) -> RateLimitDecision {
        let now = self.clock.now();
        let mut state = self.lock();
        self.maybe_cleanup(&mut state, now);

        let window = state
            .windows
            .entry(identifier.to_string())
            .or_insert_with(|| fresh_window(now, config.window));
        if now >= window.reset_at {
            *window = fresh_window(now, config.window);
        }

        window.count = window.count.saturating_add(1);

        RateLimitDecision {
            allowed: window.count <= config.max_requests,
            limit: config.max_requests,
            remaining: config.max_requests.saturating_sub(window.count),
            reset_at: window.reset_at,
        }
    }

    /// [`check`](Self::check) against a preset, keyed `"{preset}:{identifier}"`.
    #[must_use]
    pub fn check_preset(&self, preset: RateLimitPreset, identifier: &str) -> RateLimitDecision {
        self.check(&format!("{preset}:{identifier}"), &preset.config())
    }

    /// Admit or reject a request against a preset.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::RateLimited` when the ceiling is exceeded.
    pub fn enforce(&self, preset: RateLimitPreset, identifier: &str) -> Result<RateLimitDecision> {
        let decision = self.check_preset(preset, identifier);
        if decision.allowed {
            return Ok(decision);
        }

        let retry_after_secs = decision.retry_after_secs(self.clock.now());
        metrics::counter!(names::RATE_LIMIT_REJECTIONS, "preset" => preset.as_str()).increment(1);
        tracing::warn!(
            key = %identifier,
            preset = %preset,
            limit = decision.limit,
            retry_after_secs,
            "Rate limit exceeded"
        );

        Err(RelayError::RateLimited {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_at: decision.reset_at,
            retry_after_secs,
        })
    }

    /// Forget a key's window.
    pub fn reset(&self, identifier: &str) {
        self.lock().windows.remove(identifier);
    }

    /// Number of windows currently held, expired or not.
    #[must_use]
    pub fn tracked_windows(&self) -> usize {
        self.lock().windows.len()
    }

    fn maybe_cleanup(&self, state: &mut LimiterState, now: DateTime<Utc>) {
        let since_last = (now - state.last_cleanup).to_std().unwrap_or(Duration::ZERO);
        if since_last < self.config.cleanup_interval {
            return;
        }

        let before = state.windows.len();
        state.windows.retain(|_, window| window.reset_at > now);
        state.last_cleanup = now;

        let removed = before - state.windows.len();
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!(names::RATE_LIMIT_WINDOWS).set(state.windows.len() as f64);
        if removed > 0 {
            tracing::debug!(removed, remaining = state.windows.len(), "Swept expired rate-limit windows");
        }
    }
}

fn fresh_window(now: DateTime<Utc>, window: Duration) -> Window {
    let reset_at = chrono::Duration::from_std(window)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    Window { count: 0, reset_at }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use maprelay_testing::mocks::ManualClock;

    fn limiter() -> (RateLimiter, ManualClock) {
        let clock = ManualClock::default();
        let limiter = RateLimiter::with_clock(RateLimiterConfig::default(), Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[test]
    fn call_past_ceiling_is_rejected_with_zero_remaining() {
        let (limiter, _) = limiter();
        let config = RateLimitConfig::new(3, Duration::from_secs(60));

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check("caller", &config);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let rejected = limiter.check("caller", &config);
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(rejected.limit, 3);
    }

    #[test]
    fn window_restarts_after_reset_time() {
        let (limiter, clock) = limiter();
        let config = RateLimitConfig::new(1, Duration::from_secs(60));

        assert!(limiter.check("caller", &config).allowed);
        assert!(!limiter.check("caller", &config).allowed);

        clock.advance(Duration::from_secs(60));
        let decision = limiter.check("caller", &config);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_at, clock.now() + chrono::Duration::seconds(60));
    }

    #[test]
    fn rejected_calls_do_not_extend_window() {
        let (limiter, clock) = limiter();
        let config = RateLimitConfig::new(1, Duration::from_secs(60));
        let first = limiter.check("caller", &config);

        clock.advance(Duration::from_secs(30));
        let rejected = limiter.check("caller", &config);
        assert_eq!(rejected.reset_at, first.reset_at);
        assert_eq!(rejected.retry_after_secs(clock.now()), 30);
    }

    #[test]
    fn keys_are_independent() {
        let (limiter, _) = limiter();
        let config = RateLimitConfig::new(1, Duration::from_secs(60));
        assert!(limiter.check("a", &config).allowed);
        assert!(limiter.check("b", &config).allowed);
        assert!(!limiter.check("a", &config).allowed);
    }

    #[test]
    fn presets_use_separate_keys() {
        let (limiter, _) = limiter();
        for _ in 0..5 {
            assert!(limiter.check_preset(RateLimitPreset::Auth, "u1").allowed);
        }
        assert!(!limiter.check_preset(RateLimitPreset::Auth, "u1").allowed);
        assert!(limiter.check_preset(RateLimitPreset::Api, "u1").allowed);
    }

    #[test]
    fn enforce_returns_typed_rejection() {
        let (limiter, clock) = limiter();
        for _ in 0..10 {
            limiter.enforce(RateLimitPreset::Upload, "u1").unwrap();
        }
        clock.advance(Duration::from_millis(500));

        match limiter.enforce(RateLimitPreset::Upload, "u1") {
            Err(RelayError::RateLimited {
                limit,
                remaining,
                retry_after_secs,
                ..
            }) => {
                assert_eq!(limit, 10);
                assert_eq!(remaining, 0);
                assert_eq!(retry_after_secs, 60);
            }
            other => panic!("expected rate limit rejection, got {other:?}"),
        }
    }

    #[test]
    fn cleanup_is_throttled() {
        let (limiter, clock) = limiter();
        let short = RateLimitConfig::new(5, Duration::from_secs(1));

        let _ = limiter.check("a", &short);
        let _ = limiter.check("b", &short);
        clock.advance(Duration::from_secs(2));

        // Expired, but the sweep interval has not elapsed yet.
        let _ = limiter.check("c", &short);
        assert_eq!(limiter.tracked_windows(), 3);

        clock.advance(Duration::from_secs(59));
        let _ = limiter.check("d", &short);
        assert_eq!(limiter.tracked_windows(), 1);
    }

    #[test]
    fn concurrent_checks_never_double_count() {
        let (limiter, _) = limiter();
        let config = RateLimitConfig::new(50, Duration::from_secs(60));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .filter(|_| limiter.check("shared", &config).allowed)
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
