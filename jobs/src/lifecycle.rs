//! Map lifecycle and derived Job status.
//!
//! ```text
//! QUEUED ──▶ DISPATCHED ──▶ PROCESSING ──▶ COMPLETED
//!   ▲             │              │
//!   │             ▼              ▼
//!   └────────── FAILED ◀─────────┘
//!    (operator retry)
//! ```
//!
//! Transitions are pure; persistence applies them with a conditional write on
//! the expected current status.

use maprelay_core::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of one Map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MapStatus {
    /// Accepted, waiting for dispatch
    Queued,
    /// Handed to the scheduler
    Dispatched,
    /// Task reported it started
    Processing,
    /// Output written
    Completed,
    /// Task failed or was rejected
    Failed,
}

impl MapStatus {
    /// Every status.
    pub const ALL: [Self; 5] = [
        Self::Queued,
        Self::Dispatched,
        Self::Processing,
        Self::Completed,
        Self::Failed,
    ];

    /// Stored representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Dispatched => "DISPATCHED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Whether work on the Map is still pending or running.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Queued | Self::Dispatched | Self::Processing)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Dispatched)
                | (Self::Dispatched, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Dispatched | Self::Processing, Self::Failed)
                | (Self::Failed, Self::Queued)
        )
    }

    /// Validate a transition.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidTransition` if the lifecycle forbids it.
    pub fn transition(self, next: Self) -> Result<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(RelayError::InvalidTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }
}

impl fmt::Display for MapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a Job, always computed from its Maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// No Map has left the queue
    Queued,
    /// Some work is pending or running
    InProgress,
    /// Every Map completed
    Completed,
    /// Nothing in flight and at least one Map failed
    Failed,
}

impl JobStatus {
    /// Derive the Job status from its Maps.
    ///
    /// - `COMPLETED` iff there is at least one Map and all are completed
    /// - `FAILED` iff some Map failed and none is in flight
    /// - `QUEUED` if every Map is still queued (or there are none)
    /// - `IN_PROGRESS` otherwise
    ///
    /// # Examples
    ///
    /// ```
    /// use maprelay_jobs::lifecycle::{JobStatus, MapStatus};
    ///
    /// let status = JobStatus::derive([MapStatus::Completed, MapStatus::Failed]);
    /// assert_eq!(status, JobStatus::Failed);
    /// ```
    pub fn derive(statuses: impl IntoIterator<Item = MapStatus>) -> Self {
        StatusCounts::tally(statuses).job_status()
    }

    /// Whether the Job has settled.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    /// Waiting for dispatch
    pub queued: usize,
    /// Handed to the scheduler
    pub dispatched: usize,
    /// Running
    pub processing: usize,
    /// Done
    pub completed: usize,
    /// Failed
    pub failed: usize,
}

impl StatusCounts {
    /// Count statuses.
    pub fn tally(statuses: impl IntoIterator<Item = MapStatus>) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            match status {
                MapStatus::Queued => counts.queued += 1,
                MapStatus::Dispatched => counts.dispatched += 1,
                MapStatus::Processing => counts.processing += 1,
                MapStatus::Completed => counts.completed += 1,
                MapStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Total Maps counted.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.queued + self.dispatched + self.processing + self.completed + self.failed
    }

    /// Maps still pending or running.
    #[must_use]
    pub const fn in_flight(&self) -> usize {
        self.queued + self.dispatched + self.processing
    }

    /// Job status implied by these counts.
    #[must_use]
    pub const fn job_status(&self) -> JobStatus {
        let total = self.total();
        if total > 0 && self.completed == total {
            JobStatus::Completed
        } else if self.failed > 0 && self.in_flight() == 0 {
            JobStatus::Failed
        } else if self.queued == total {
            JobStatus::Queued
        } else {
            JobStatus::InProgress
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn happy_path_is_allowed() {
        let status = MapStatus::Queued
            .transition(MapStatus::Dispatched)
            .and_then(|s| s.transition(MapStatus::Processing))
            .and_then(|s| s.transition(MapStatus::Completed))
            .unwrap();
        assert_eq!(status, MapStatus::Completed);
    }

    #[test]
    fn failure_only_from_dispatched_or_processing() {
        assert!(MapStatus::Dispatched.can_transition_to(MapStatus::Failed));
        assert!(MapStatus::Processing.can_transition_to(MapStatus::Failed));
        assert!(!MapStatus::Queued.can_transition_to(MapStatus::Failed));
        assert!(!MapStatus::Completed.can_transition_to(MapStatus::Failed));
    }

    #[test]
    fn retry_goes_back_to_queue_never_straight_to_completed() {
        assert!(MapStatus::Failed.can_transition_to(MapStatus::Queued));
        assert!(!MapStatus::Failed.can_transition_to(MapStatus::Completed));
        assert!(!MapStatus::Failed.can_transition_to(MapStatus::Dispatched));
        let err = MapStatus::Failed.transition(MapStatus::Completed).unwrap_err();
        assert_eq!(
            err,
            RelayError::InvalidTransition {
                from: "FAILED".into(),
                to: "COMPLETED".into()
            }
        );
    }

    #[test]
    fn completed_is_final() {
        for next in MapStatus::ALL {
            assert!(!MapStatus::Completed.can_transition_to(next));
        }
    }

    #[test]
    fn serde_uses_stored_names() {
        for status in MapStatus::ALL {
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::Value::String(status.as_str().to_string())
            );
        }
        assert_eq!(
            serde_json::to_value(JobStatus::InProgress).unwrap(),
            serde_json::json!("IN_PROGRESS")
        );
    }

    #[test]
    fn derived_job_status_examples() {
        use MapStatus::{Completed, Dispatched, Failed, Processing, Queued};
        assert_eq!(JobStatus::derive([]), JobStatus::Queued);
        assert_eq!(JobStatus::derive([Queued, Queued]), JobStatus::Queued);
        assert_eq!(JobStatus::derive([Queued, Dispatched]), JobStatus::InProgress);
        assert_eq!(JobStatus::derive([Completed, Processing]), JobStatus::InProgress);
        assert_eq!(JobStatus::derive([Completed, Completed]), JobStatus::Completed);
        assert_eq!(JobStatus::derive([Failed, Processing]), JobStatus::InProgress);
        assert_eq!(JobStatus::derive([Failed, Completed]), JobStatus::Failed);
    }

    fn status() -> impl Strategy<Value = MapStatus> {
        prop::sample::select(MapStatus::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn completed_iff_all_completed(statuses in prop::collection::vec(status(), 1..20)) {
            let all_completed = statuses.iter().all(|s| *s == MapStatus::Completed);
            prop_assert_eq!(JobStatus::derive(statuses) == JobStatus::Completed, all_completed);
        }

        #[test]
        fn failed_iff_some_failed_and_none_in_flight(statuses in prop::collection::vec(status(), 0..20)) {
            let any_failed = statuses.contains(&MapStatus::Failed);
            let any_in_flight = statuses.iter().any(|s| s.is_in_flight());
            prop_assert_eq!(
                JobStatus::derive(statuses) == JobStatus::Failed,
                any_failed && !any_in_flight
            );
        }

        #[test]
        fn counts_cover_every_map(statuses in prop::collection::vec(status(), 0..20)) {
            let counts = StatusCounts::tally(statuses.iter().copied());
            prop_assert_eq!(counts.total(), statuses.len());
        }
    }
}
