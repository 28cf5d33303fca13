//! The pipeline stages. Each stage validates its preconditions, builds one
//! `JobSpec` per unit of work and hands them to the job runner.

pub mod cluster;
pub mod merge;
pub mod quantify;
pub mod tools;

use job_runner::{CancelToken, JobRunner};
use std::path::Path;
use te_types::config::ClusterConfig;

/// What every stage needs to submit jobs.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub cluster: &'a ClusterConfig,
    pub runner: &'a JobRunner,
    /// The `tepipe` binary invoked by jobs for in-pipeline work.
    pub worker_exe: &'a Path,
    pub cancel: &'a CancelToken,
}
