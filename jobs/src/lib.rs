//! # MapRelay Jobs
//!
//! Batch submission and the Map lifecycle.
//!
//! A submission becomes one Job and one Map per accepted archive. Maps move
//! through a fixed state machine:
//!
//! ```text
//! QUEUED → DISPATCHED → PROCESSING → COMPLETED
//!              │             │
//!              └─────────────┴──→ FAILED ──(retry)──→ QUEUED
//! ```
//!
//! The Job's status is never stored; it is derived from its Maps on read.
//!
//! ## Modules
//!
//! - [`filename`]: name sanitizing and the `<id>_<sheet>.zip` convention
//! - [`dedup`]: content-derived identity and duplicate detection
//! - [`lifecycle`]: [`MapStatus`] transitions and derived [`JobStatus`]
//! - [`records`]: stored Job and Map shapes
//! - [`service`]: [`JobService`], the orchestration entry point
//! - [`config`]: tables, buckets and limits

pub mod config;
pub mod dedup;
pub mod environment;
pub mod filename;
pub mod lifecycle;
pub mod records;
pub mod service;

pub use config::JobsConfig;
pub use environment::JobEnvironment;
pub use lifecycle::{JobStatus, MapStatus, StatusCounts};
pub use records::{JobRecord, MapRecord, MapSource};
pub use service::{
    AcceptedMap, DispatchOutcome, JobService, JobView, RejectedFile, SubmitResponse,
    SubmittedFile,
};
