//! Pipeline Execution Module
//!
//! Drives a built task graph to completion.
//!
//! # Architecture
//!
//! - [`scheduler`]: dependency-ordered dispatch, node state, cancellation
//! - [`runner`]: execution of a single node's work unit
//! - [`backend`]: where shell commands actually run
//! - [`report`]: per-node records and the run summary

pub mod backend;
pub mod report;
pub mod runner;
pub mod scheduler;

pub use backend::{JobBackend, JobHandle, JobRequest, JobStatus, LocalBackend, Submission};
pub use report::{ExecutionRecord, NodeState, RunReport};
pub use runner::WorkUnitRunner;
pub use scheduler::{CancelHandle, CancelToken, ForceMode, RunOptions, Scheduler};
