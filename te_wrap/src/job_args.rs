use clap::Parser;
use te_types::config::{ClusterConfig, JobManager};

/// Command line overrides of the cluster submission settings.
#[derive(Parser, Debug, Clone, Default)]
pub struct JobArgs {
    /// Job manager to use. Valid options: slurm (default) or local.
    #[clap(long, value_name = "MODE")]
    jobmode: Option<JobManager>,

    /// Set max jobs submitted to the cluster at one time, per stage.
    /// Overrides the limits in the run file.
    #[clap(long, value_name = "NUM")]
    maxjobs: Option<usize>,

    /// Set delay between submitting jobs to the cluster, in ms.
    #[clap(long, value_name = "NUM")]
    jobinterval: Option<u64>,

    /// Attempts per job before it is reported as failed.
    #[clap(long, value_name = "NUM")]
    maxattempts: Option<u32>,

    /// Cores requested by every job.
    #[clap(long, value_name = "NUM")]
    jobcores: Option<usize>,
}

impl JobArgs {
    /// Apply the given overrides on top of the site configuration.
    pub fn apply(&self, cluster: &mut ClusterConfig) {
        if let Some(mode) = self.jobmode {
            cluster.job_manager = mode;
        }
        if let Some(ms) = self.jobinterval {
            cluster.submit_interval_ms = ms;
        }
        if let Some(n) = self.maxattempts {
            cluster.max_attempts = n;
        }
        if let Some(n) = self.jobcores {
            cluster.cores_per_job = n;
        }
    }

    /// The stage concurrency limit, `run_file` unless overridden.
    pub fn max_jobs(&self, run_file: usize) -> usize {
        self.maxjobs.unwrap_or(run_file)
    }
}
