use crate::scheduler::{BatchScheduler, JobHandle, PollStatus};
use crate::script::write_script;
use crate::spec::JobSpec;
use anyhow::{anyhow, Context, Result};
use log::debug;
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, PoisonError};
use te_types::config::{ClusterConfig, ModuleConfig};

/// Runs job scripts as `bash` child processes of this process.
///
/// Each job's stdout and stderr go to its log file in the working directory.
pub struct LocalScheduler {
    cluster: ClusterConfig,
    modules: ModuleConfig,
    children: Mutex<HashMap<String, (Child, PathBuf)>>,
}

impl LocalScheduler {
    /// A scheduler running jobs on this machine.
    pub fn new(cluster: ClusterConfig, modules: ModuleConfig) -> Self {
        LocalScheduler {
            cluster,
            modules,
            children: Mutex::new(HashMap::new()),
        }
    }
}

impl BatchScheduler for LocalScheduler {
    fn submit(&self, job: &JobSpec) -> Result<JobHandle> {
        let script = write_script(job, &self.cluster, &self.modules, false)?;
        let log_path = job.log_path();
        let log = File::create(&log_path).with_context(|| log_path.display().to_string())?;
        let child = Command::new("bash")
            .arg(&script)
            .current_dir(&job.working_dir)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()
            .with_context(|| format!("spawning bash {}", script.display()))?;
        let id = child.id().to_string();
        debug!("started {} as pid {id}", job.name);
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), (child, log_path));
        Ok(JobHandle {
            id,
            job_name: job.name.clone(),
        })
    }

    fn poll(&self, handle: &JobHandle) -> Result<PollStatus> {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        let (child, log_path) = children
            .get_mut(&handle.id)
            .ok_or_else(|| anyhow!("no local job with pid {}", handle.id))?;
        let Some(status) = child.try_wait()? else {
            return Ok(PollStatus::Running);
        };
        let result = if status.success() {
            PollStatus::Completed
        } else {
            PollStatus::Failed(format!("{status}, see {}", log_path.display()))
        };
        children.remove(&handle.id);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    fn wait(scheduler: &LocalScheduler, handle: &JobHandle) -> PollStatus {
        loop {
            let status = scheduler.poll(handle).unwrap();
            if status.is_finished() {
                return status;
            }
            sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_local_jobs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let scheduler = LocalScheduler::new(ClusterConfig::new("local"), ModuleConfig::default());

        let out = dir.path().join("w").join("done.txt");
        let job = JobSpec::new("ok", "echo hello > done.txt", dir.path().join("w"));
        let handle = scheduler.submit(&job)?;
        assert_eq!(wait(&scheduler, &handle), PollStatus::Completed);
        assert_eq!(std::fs::read_to_string(out)?, "hello\n");

        let job = JobSpec::new("bad", "exit 3", dir.path().join("w"));
        let handle = scheduler.submit(&job)?;
        let PollStatus::Failed(detail) = wait(&scheduler, &handle) else {
            panic!("expected failure");
        };
        assert!(detail.contains("_bad.log"), "{detail}");
        assert!(scheduler.poll(&handle).is_err());
        Ok(())
    }
}
