//! Injected time source.

use chrono::{DateTime, Utc};

/// Clock trait - abstracts time operations for testability
///
/// Breakers, limiters and the job service read time only through this trait,
/// so tests can drive windows and cooldowns deterministically.
///
/// # Examples
///
/// ```
/// use maprelay_core::environment::{Clock, SystemClock};
///
/// let clock = SystemClock;
/// let earlier = clock.now();
/// assert!(clock.now() >= earlier);
/// ```
pub trait Clock: Send + Sync {
    /// Get the current time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
