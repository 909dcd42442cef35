//! # Asynchronous Jobs
//!
//! - `registry`: the job table, its state machine and garbage collection
//! - `executor`: the background task that runs queued jobs one at a time

pub mod executor;
pub mod registry;

pub use executor::JobExecutor;
pub use registry::{spawn_gc, JobCounts, JobLookupError, JobRegistry, JobStatus};
