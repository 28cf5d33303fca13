//! Batch job submission with bounded concurrency.
//!
//! A [`JobSpec`] describes one unit of cluster work. [`JobRunner`] hands specs
//! to a [`BatchScheduler`] backend, keeps at most `k` of them in flight at a
//! time, polls each to completion and retries failed attempts with
//! exponential backoff. Results come back keyed by the caller's ids.
#![deny(missing_docs)]

mod local;
mod runner;
pub mod scheduler;
pub mod script;
mod slurm;
mod spec;
mod state;
pub mod testing;

pub use local::LocalScheduler;
pub use runner::{CancelToken, JobBoard, JobRunner, RetryPolicy};
pub use scheduler::{scheduler_for, BatchScheduler, JobHandle, PollStatus};
pub use slurm::{parse_sacct_state, SlurmScheduler};
pub use spec::{CommandLine, JobSpec};
pub use state::{JobResult, JobState, StageSummary};
