//! The seam between the dispatcher and whatever actually runs the jobs.

use crate::local::LocalScheduler;
use crate::slurm::SlurmScheduler;
use crate::spec::JobSpec;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use te_types::config::{ClusterConfig, JobManager, ModuleConfig};

/// A submitted job as known to the scheduler.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct JobHandle {
    /// Scheduler-assigned id.
    pub id: String,
    /// Name of the submitted [`JobSpec`].
    pub job_name: String,
}

/// What a poll reports about a submitted job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollStatus {
    /// Accepted but not started.
    Queued,
    /// Started and not finished.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully, with the scheduler's reason.
    Failed(String),
}

impl PollStatus {
    /// True for `Completed` and `Failed`.
    pub fn is_finished(&self) -> bool {
        matches!(self, PollStatus::Completed | PollStatus::Failed(_))
    }
}

/// A batch system that accepts jobs and reports on them.
///
/// Implementations must be callable from many dispatcher threads at once.
pub trait BatchScheduler: Send + Sync {
    /// Submit one job. An error here counts as a failed attempt.
    fn submit(&self, job: &JobSpec) -> Result<JobHandle>;

    /// Report the current status of a submitted job.
    fn poll(&self, handle: &JobHandle) -> Result<PollStatus>;
}

/// The backend selected by `cluster.job_manager`.
pub fn scheduler_for(cluster: &ClusterConfig, modules: &ModuleConfig) -> Arc<dyn BatchScheduler> {
    match cluster.job_manager {
        JobManager::Slurm => Arc::new(SlurmScheduler::new(cluster.clone(), modules.clone())),
        JobManager::Local => Arc::new(LocalScheduler::new(cluster.clone(), modules.clone())),
    }
}
