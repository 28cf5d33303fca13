//! An in-memory scheduler for tests, so pipelines can run without a cluster.

use crate::scheduler::{BatchScheduler, JobHandle, PollStatus};
use crate::spec::JobSpec;
use anyhow::Result;
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

type Executor = Box<dyn Fn(&JobSpec) -> Result<()> + Send + Sync>;
type SubmitHook = Box<dyn Fn(&JobSpec) + Send + Sync>;

struct MockJob {
    job: JobSpec,
    started: Instant,
    scripted_failure: bool,
}

/// A [`BatchScheduler`] that "runs" each job by calling an executor closure
/// once the configured run time has passed.
///
/// The default executor creates every expected output as an empty file.
pub struct MockScheduler {
    run_time: Duration,
    failures: Mutex<HashMap<String, u32>>,
    executor: Executor,
    on_submit: Option<SubmitHook>,
    jobs: Mutex<HashMap<String, MockJob>>,
    submissions: Mutex<Vec<String>>,
    next_id: AtomicU64,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for MockScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Create every expected output of `job` as an empty file.
pub fn touch_outputs(job: &JobSpec) -> Result<()> {
    for path in &job.expected_outputs {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, "")?;
    }
    Ok(())
}

impl MockScheduler {
    /// Jobs finish on their first poll and succeed.
    pub fn new() -> Self {
        MockScheduler {
            run_time: Duration::ZERO,
            failures: Mutex::new(HashMap::new()),
            executor: Box::new(touch_outputs),
            on_submit: None,
            jobs: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Keep each job running for at least `run_time`.
    pub fn with_run_time(mut self, run_time: Duration) -> Self {
        self.run_time = run_time;
        self
    }

    /// Replace what a job does when it finishes. An error fails the attempt.
    pub fn with_executor(mut self, f: impl Fn(&JobSpec) -> Result<()> + Send + Sync + 'static) -> Self {
        self.executor = Box::new(f);
        self
    }

    /// Call `f` on every submission, before the job starts.
    pub fn on_submit(mut self, f: impl Fn(&JobSpec) + Send + Sync + 'static) -> Self {
        self.on_submit = Some(Box::new(f));
        self
    }

    /// Fail the first `n` attempts of the named job.
    pub fn fail_times(self, job_name: &str, n: u32) -> Self {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_name.to_string(), n);
        self
    }

    /// Fail every attempt of the named job.
    pub fn fail_always(self, job_name: &str) -> Self {
        self.fail_times(job_name, u32::MAX)
    }

    /// Names of all submitted jobs, in submission order, one entry per attempt.
    pub fn submissions(&self) -> Vec<String> {
        self.submissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Highest number of jobs submitted and not yet finished at one time.
    pub fn peak_running(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl BatchScheduler for MockScheduler {
    fn submit(&self, job: &JobSpec) -> Result<JobHandle> {
        if let Some(hook) = &self.on_submit {
            hook(job);
        }
        fs::create_dir_all(&job.working_dir)?;
        let scripted_failure = {
            let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
            match failures.get_mut(&job.name) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };
        self.submissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(job.name.clone());

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).insert(
            id.clone(),
            MockJob {
                job: job.clone(),
                started: Instant::now(),
                scripted_failure,
            },
        );
        Ok(JobHandle {
            id,
            job_name: job.name.clone(),
        })
    }

    fn poll(&self, handle: &JobHandle) -> Result<PollStatus> {
        let finished = {
            let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            match jobs.get(&handle.id) {
                None => anyhow::bail!("unknown mock job {}", handle.id),
                Some(j) if j.started.elapsed() < self.run_time => None,
                Some(_) => jobs.remove(&handle.id),
            }
        };
        let Some(job) = finished else {
            return Ok(PollStatus::Running);
        };
        self.running.fetch_sub(1, Ordering::SeqCst);

        if job.scripted_failure {
            return Ok(PollStatus::Failed(format!("scripted failure of {}", job.job.name)));
        }
        Ok(match (self.executor)(&job.job) {
            Ok(()) => PollStatus::Completed,
            Err(e) => PollStatus::Failed(format!("{e:#}")),
        })
    }
}
