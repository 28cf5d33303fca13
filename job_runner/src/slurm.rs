use crate::scheduler::{BatchScheduler, JobHandle, PollStatus};
use crate::script::write_script;
use crate::spec::JobSpec;
use anyhow::{bail, Context, Result};
use log::{debug, warn};
use std::process::Command;
use std::str::FromStr;
use strum_macros::EnumString;
use te_types::config::{ClusterConfig, ModuleConfig};

/// Submits job scripts with `sbatch` and polls them with `sacct`.
pub struct SlurmScheduler {
    cluster: ClusterConfig,
    modules: ModuleConfig,
}

impl SlurmScheduler {
    /// A scheduler submitting to `cluster.queue_name`.
    pub fn new(cluster: ClusterConfig, modules: ModuleConfig) -> Self {
        SlurmScheduler { cluster, modules }
    }

    fn clusters_arg(&self, cmd: &mut Command) {
        if let Some(endpoint) = &self.cluster.scheduler_endpoint {
            cmd.arg(format!("--clusters={endpoint}"));
        }
    }
}

fn run(cmd: &mut Command) -> Result<String> {
    let output = cmd.output().with_context(|| format!("running {cmd:?}"))?;
    if !output.status.success() {
        bail!(
            "{cmd:?} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl BatchScheduler for SlurmScheduler {
    fn submit(&self, job: &JobSpec) -> Result<JobHandle> {
        let script = write_script(job, &self.cluster, &self.modules, true)?;
        let mut cmd = Command::new("sbatch");
        cmd.arg("--parsable").arg(&script).current_dir(&job.working_dir);
        let stdout = run(&mut cmd)?;
        // --parsable prints "<jobid>" or "<jobid>;<cluster>"
        let id = stdout.trim().split(';').next().unwrap_or_default().to_string();
        if id.is_empty() {
            bail!("sbatch printed no job id for {}", script.display());
        }
        debug!("submitted {} as slurm job {id}", job.name);
        Ok(JobHandle {
            id,
            job_name: job.name.clone(),
        })
    }

    fn poll(&self, handle: &JobHandle) -> Result<PollStatus> {
        let mut cmd = Command::new("sacct");
        cmd.args(["-n", "-P", "-X", "-o", "State", "-j", &handle.id]);
        self.clusters_arg(&mut cmd);
        let stdout = run(&mut cmd)?;
        let status = parse_sacct_state(stdout.lines().next().unwrap_or_default());
        debug!("slurm job {} ({}): {status:?}", handle.id, handle.job_name);
        Ok(status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
enum SacctState {
    Pending,
    Requeued,
    RequeueFed,
    RequeueHold,
    Configuring,
    Suspended,
    ResvDelHold,
    Running,
    Completing,
    StageOut,
    Resizing,
    Signaling,
    Stopped,
    Completed,
    Failed,
    Timeout,
    OutOfMemory,
    NodeFail,
    Preempted,
    BootFail,
    Deadline,
    Cancelled,
    Revoked,
    SpecialExit,
}

/// Map one line of `sacct -o State` output to a poll status.
///
/// A job that is not in the accounting database yet prints nothing and is
/// reported as queued. A state this function does not know is reported as
/// failed so that the job's slot is released.
pub fn parse_sacct_state(line: &str) -> PollStatus {
    // "CANCELLED by 1234"
    let word = line.split_whitespace().next().unwrap_or_default();
    if word.is_empty() {
        return PollStatus::Queued;
    }
    match SacctState::from_str(word.trim_end_matches('+')) {
        Ok(SacctState::Pending)
        | Ok(SacctState::Requeued)
        | Ok(SacctState::RequeueFed)
        | Ok(SacctState::RequeueHold)
        | Ok(SacctState::Configuring)
        | Ok(SacctState::Suspended)
        | Ok(SacctState::ResvDelHold) => PollStatus::Queued,
        Ok(SacctState::Running)
        | Ok(SacctState::Completing)
        | Ok(SacctState::StageOut)
        | Ok(SacctState::Resizing)
        | Ok(SacctState::Signaling)
        | Ok(SacctState::Stopped) => PollStatus::Running,
        Ok(SacctState::Completed) => PollStatus::Completed,
        Ok(_) => PollStatus::Failed(line.trim().to_string()),
        Err(_) => {
            warn!("unrecognized sacct state '{}'", line.trim());
            PollStatus::Failed(format!("unrecognized job state: {}", line.trim()))
        }
    }
}
