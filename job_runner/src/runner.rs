use crate::scheduler::{scheduler_for, BatchScheduler, JobHandle, PollStatus};
use crate::spec::JobSpec;
use crate::state::{JobResult, JobState};
use anyhow::{anyhow, bail, ensure, Result};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use itertools::Itertools;
use log::{debug, info, warn};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::{fs, io};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::sleep;
use std::time::{Duration, Instant};
use te_types::config::{ClusterConfig, ModuleConfig};

/// How long the dispatcher waits for a slot before re-checking cancellation.
const SLOT_WAIT: Duration = Duration::from_millis(50);

/// Consecutive poll errors tolerated before an attempt is declared failed.
const MAX_POLL_ERRORS: u32 = 5;

/// A shared flag checked by the dispatcher before every submission.
///
/// Cancelling never touches jobs that are already submitted.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop submitting new jobs.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once [`CancelToken::cancel`] was called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Attempt ceiling and backoff for failed jobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Submissions per job, at least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt. Doubles for each further attempt.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1 << exp)
    }
}

/// Live view of job states across dispatcher threads.
#[derive(Debug, Default)]
pub struct JobBoard {
    states: Mutex<BTreeMap<String, JobState>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl JobBoard {
    fn set(&self, job: &str, state: JobState) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let was_running = states.insert(job.to_string(), state) == Some(JobState::Running);
        let is_running = state == JobState::Running;
        if is_running && !was_running {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        } else if was_running && !is_running {
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Current state of the named job.
    pub fn state(&self, job: &str) -> Option<JobState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job)
            .copied()
    }

    /// Number of jobs currently in the `Running` state.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running jobs seen so far.
    pub fn peak_running(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Returns the submission slot when dropped, even if the job thread panics.
struct Slot(Sender<()>);

impl Drop for Slot {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

/// Submits jobs to a [`BatchScheduler`] with bounded concurrency and retries.
pub struct JobRunner {
    scheduler: Arc<dyn BatchScheduler>,
    retry: RetryPolicy,
    poll_interval: Duration,
    submit_interval: Duration,
    board: Arc<JobBoard>,
}

impl JobRunner {
    /// A runner with the default retry policy polling every 30 seconds.
    pub fn new(scheduler: Arc<dyn BatchScheduler>) -> Self {
        JobRunner {
            scheduler,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(30),
            submit_interval: Duration::ZERO,
            board: Arc::new(JobBoard::default()),
        }
    }

    /// A runner using the backend, intervals and retry settings in `cluster`.
    pub fn from_config(cluster: &ClusterConfig, modules: &ModuleConfig) -> Self {
        JobRunner::new(scheduler_for(cluster, modules))
            .with_retry(RetryPolicy {
                max_attempts: cluster.max_attempts,
                backoff: Duration::from_secs(cluster.retry_backoff_secs),
            })
            .with_poll_interval(Duration::from_secs(cluster.poll_interval_secs))
            .with_submit_interval(Duration::from_millis(cluster.submit_interval_ms))
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the delay between polls of one job.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the minimum delay between consecutive submissions.
    pub fn with_submit_interval(mut self, interval: Duration) -> Self {
        self.submit_interval = interval;
        self
    }

    /// The board tracking every job this runner has seen.
    pub fn board(&self) -> &JobBoard {
        &self.board
    }

    /// Run every job and return one result per key.
    ///
    /// At most `max_concurrent` jobs are submitted and unfinished at any time;
    /// the next submission waits only for a free slot. Jobs whose expected
    /// outputs exist and whose command stamp matches are skipped, jobs with missing inputs fail without being
    /// submitted, and after `cancel` fires the remaining jobs are returned as
    /// cancelled while submitted ones are still collected. Job failures are
    /// reported in the results; an error is returned only for invalid
    /// arguments or a panicked job thread.
    pub fn run_all<K>(
        &self,
        jobs: Vec<(K, JobSpec)>,
        max_concurrent: usize,
        cancel: &CancelToken,
    ) -> Result<BTreeMap<K, JobResult>>
    where
        K: Ord + Clone + Display + Send,
    {
        ensure!(max_concurrent > 0, "max_concurrent_jobs must be at least 1");
        {
            let mut keys = BTreeSet::new();
            if let Some(dup) = jobs.iter().map(|(k, _)| k).find(|k| !keys.insert(*k)) {
                bail!("job key '{dup}' is used more than once");
            }
        }

        let (slot_tx, slot_rx) = bounded(max_concurrent);
        for _ in 0..max_concurrent {
            slot_tx.send(())?;
        }

        let r = crossbeam_utils::thread::scope(|s| -> Result<BTreeMap<K, JobResult>> {
            let mut results = BTreeMap::new();
            let mut handles = Vec::new();
            let mut last_submit: Option<Instant> = None;

            for (key, job) in jobs {
                if job.is_complete() {
                    info!("{key}: expected outputs present, skipping {}", job.name);
                    self.board.set(&job.name, JobState::Skipped);
                    results.insert(key, JobResult::skipped(job));
                    continue;
                }
                if job.outputs_present() {
                    info!("{key}: outputs of {} came from another command, resubmitting", job.name);
                }
                let missing = job.missing_inputs();
                if !missing.is_empty() {
                    let detail = format!(
                        "missing inputs: {}",
                        missing.iter().map(|p| p.display()).join(", ")
                    );
                    warn!("{key}: {detail}");
                    self.board.set(&job.name, JobState::Failed);
                    results.insert(key, JobResult::failed(job, detail));
                    continue;
                }

                self.board.set(&job.name, JobState::Pending);
                let mut acquired = false;
                while !cancel.is_cancelled() {
                    match slot_rx.recv_timeout(SLOT_WAIT) {
                        Ok(()) => {
                            acquired = true;
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                if acquired && cancel.is_cancelled() {
                    drop(Slot(slot_tx.clone()));
                    acquired = false;
                }
                if !acquired {
                    info!("{key}: cancelled before submission");
                    self.board.set(&job.name, JobState::Cancelled);
                    results.insert(key, JobResult::cancelled(job));
                    continue;
                }

                if let Some(last) = last_submit {
                    let elapsed = last.elapsed();
                    if elapsed < self.submit_interval {
                        sleep(self.submit_interval - elapsed);
                    }
                }
                last_submit = Some(Instant::now());

                let slot = Slot(slot_tx.clone());
                let handle = s.spawn(move |_| {
                    let result = self.drive(job, cancel);
                    drop(slot);
                    result
                });
                handles.push((key, handle));
            }

            for (key, handle) in handles {
                match handle.join() {
                    Ok(result) => {
                        results.insert(key, result);
                    }
                    Err(e) => return Err(anyhow!("job {key} panicked: {}", decipher_panic(e))),
                }
            }
            Ok(results)
        });

        match r {
            Ok(v) => v,
            Err(e) => Err(anyhow!(decipher_panic(e))),
        }
    }

    /// Submit and poll one job until it succeeds or runs out of attempts.
    fn drive(&self, job: JobSpec, cancel: &CancelToken) -> JobResult {
        clear_stamp(&job);
        let mut result = JobResult::pending(job);
        let max_attempts = self.retry.max_attempts.max(1);
        loop {
            result.attempt_count += 1;
            let attempt = result.attempt_count;
            let outcome = self.attempt(&mut result);
            self.board.set(&result.job.name, result.state);
            let detail = match outcome {
                Ok(()) => {
                    info!(
                        "{} succeeded after {attempt} attempt(s)",
                        result.job.name
                    );
                    return result;
                }
                Err(detail) => detail,
            };

            if attempt >= max_attempts {
                warn!(
                    "{} failed after {attempt} attempt(s): {detail}",
                    result.job.name
                );
                result.state = JobState::Failed;
                result.error_detail = Some(detail);
                self.board.set(&result.job.name, JobState::Failed);
                return result;
            }

            let delay = self.retry.delay(attempt);
            warn!(
                "{} attempt {attempt} failed: {detail}; retrying in {delay:?}",
                result.job.name
            );
            result.state = JobState::Retried;
            result.error_detail = Some(detail);
            self.board.set(&result.job.name, JobState::Retried);

            if !wait_unless_cancelled(delay, cancel) {
                let detail = result.error_detail.take().unwrap_or_default();
                result.state = JobState::Failed;
                result.error_detail = Some(format!("cancelled before retry; last error: {detail}"));
                self.board.set(&result.job.name, JobState::Failed);
                return result;
            }
        }
    }

    /// One submission. Leaves `result.state` at `Succeeded` or `Failed`.
    fn attempt(&self, result: &mut JobResult) -> Result<(), String> {
        result.state = JobState::Failed;
        let handle = self
            .scheduler
            .submit(&result.job)
            .map_err(|e| format!("submission failed: {e:#}"))?;
        result.scheduler_id = Some(handle.id.clone());
        result.state = JobState::Running;
        self.board.set(&result.job.name, JobState::Running);
        debug!("{} submitted as {}", result.job.name, handle.id);

        let finished = self.wait_for(&handle);
        result.state = JobState::Failed;
        finished?;

        let missing = result.job.missing_outputs();
        if !missing.is_empty() {
            return Err(format!(
                "job completed but expected outputs are missing: {}",
                missing.iter().map(|p| p.display()).join(", ")
            ));
        }
        result.state = JobState::Succeeded;
        result.error_detail = None;
        write_stamp(&result.job);
        Ok(())
    }

    fn wait_for(&self, handle: &JobHandle) -> Result<(), String> {
        let mut poll_errors = 0;
        loop {
            match self.scheduler.poll(handle) {
                Ok(PollStatus::Completed) => return Ok(()),
                Ok(PollStatus::Failed(detail)) => return Err(detail),
                Ok(PollStatus::Queued | PollStatus::Running) => poll_errors = 0,
                Err(e) => {
                    poll_errors += 1;
                    warn!("polling job {} ({}): {e:#}", handle.id, handle.job_name);
                    if poll_errors >= MAX_POLL_ERRORS {
                        return Err(format!("lost track of job {}: {e:#}", handle.id));
                    }
                }
            }
            sleep(self.poll_interval);
        }
    }
}

fn clear_stamp(job: &JobSpec) {
    let path = job.stamp_path();
    match fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("removing {}: {e}", path.display()),
    }
}

/// A job without a stamp is resubmitted on the next run.
fn write_stamp(job: &JobSpec) {
    let path = job.stamp_path();
    if let Err(e) = fs::write(&path, job.identity_stamp()) {
        warn!("writing {}: {e}", path.display());
    }
}

/// Sleep for `delay`, returning false early if `cancel` fires.
fn wait_unless_cancelled(delay: Duration, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        sleep((deadline - now).min(SLOT_WAIT));
    }
}

fn decipher_panic(p: Box<dyn Any + 'static + Send>) -> String {
    if let Some(&s) = p.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Ok(s) = p.downcast::<String>() {
        *s
    } else {
        "thread panicked with unrecognized type".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockScheduler;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn runner(mock: &Arc<MockScheduler>) -> JobRunner {
        JobRunner::new(mock.clone())
            .with_poll_interval(Duration::from_millis(2))
            .with_retry(RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(1),
            })
    }

    fn jobs(dir: &Path, n: usize) -> Vec<(String, JobSpec)> {
        (0..n)
            .map(|i| {
                let id = format!("S{i}");
                let wd = dir.join(&id);
                let job = JobSpec::new(format!("job_{id}"), "true", &wd)
                    .with_expected_outputs([wd.join("done")]);
                (id, job)
            })
            .collect()
    }

    #[test]
    fn test_concurrency_bound() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mock = Arc::new(MockScheduler::new().with_run_time(Duration::from_millis(20)));
        let runner = runner(&mock);
        let results = runner.run_all(jobs(dir.path(), 10), 3, &CancelToken::new())?;
        assert_eq!(results.len(), 10);
        assert!(results.values().all(|r| r.state == JobState::Succeeded));
        assert!(mock.peak_running() <= 3, "peak {}", mock.peak_running());
        assert!(runner.board().peak_running() <= 3);
        assert!(runner.board().peak_running() >= 2);
        assert_eq!(runner.board().running(), 0);
        Ok(())
    }

    #[test]
    fn test_retries_then_success_and_isolation() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mock = Arc::new(
            MockScheduler::new()
                .fail_times("job_S1", 2)
                .fail_always("job_S2"),
        );
        let results = runner(&mock).run_all(jobs(dir.path(), 4), 2, &CancelToken::new())?;

        assert_eq!(results["S0"].state, JobState::Succeeded);
        assert_eq!(results["S0"].attempt_count, 1);
        assert_eq!(results["S1"].state, JobState::Succeeded);
        assert_eq!(results["S1"].attempt_count, 3);
        assert_eq!(results["S1"].error_detail, None);
        assert_eq!(results["S2"].state, JobState::Failed);
        assert_eq!(results["S2"].attempt_count, 3);
        assert!(results["S2"]
            .error_detail
            .as_deref()
            .unwrap()
            .contains("scripted failure"));
        assert_eq!(results["S3"].state, JobState::Succeeded);
        Ok(())
    }

    #[test]
    fn test_skip_when_outputs_present() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mock = Arc::new(MockScheduler::new());
        let runner = runner(&mock);
        let first = runner.run_all(jobs(dir.path(), 2), 2, &CancelToken::new())?;
        assert!(first.values().all(|r| r.state == JobState::Succeeded));
        assert_eq!(mock.submissions().len(), 2);

        let second = runner.run_all(jobs(dir.path(), 2), 2, &CancelToken::new())?;
        assert!(second.values().all(|r| r.state == JobState::Skipped));
        assert_eq!(mock.submissions().len(), 2);
        Ok(())
    }

    #[test]
    fn test_changed_command_is_resubmitted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mock = Arc::new(MockScheduler::new());
        let runner = runner(&mock);
        let first = runner.run_all(jobs(dir.path(), 2), 2, &CancelToken::new())?;
        assert!(first.values().all(|r| r.state == JobState::Succeeded));

        let mut changed = jobs(dir.path(), 2);
        changed[1].1.command = "true --unique".to_string();
        let second = runner.run_all(changed.clone(), 2, &CancelToken::new())?;
        assert_eq!(second["S0"].state, JobState::Skipped);
        assert_eq!(second["S1"].state, JobState::Succeeded);
        assert_eq!(mock.submissions(), vec!["job_S0", "job_S1", "job_S1"]);

        let third = runner.run_all(changed, 2, &CancelToken::new())?;
        assert!(third.values().all(|r| r.state == JobState::Skipped));
        Ok(())
    }

    #[test]
    fn test_outputs_without_stamp_are_rebuilt() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mock = Arc::new(MockScheduler::new());
        let (key, job) = jobs(dir.path(), 1).remove(0);
        std::fs::create_dir_all(&job.working_dir)?;
        std::fs::write(&job.expected_outputs[0], "")?;
        let results = runner(&mock).run_all(vec![(key, job.clone())], 1, &CancelToken::new())?;
        assert_eq!(results["S0"].state, JobState::Succeeded);
        assert!(job.is_complete());
        Ok(())
    }

    #[test]
    fn test_missing_outputs_fail_the_attempt() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mock = Arc::new(MockScheduler::new().with_executor(|_| Ok(())));
        let results = runner(&mock).run_all(jobs(dir.path(), 1), 1, &CancelToken::new())?;
        let r = &results["S0"];
        assert_eq!(r.state, JobState::Failed);
        assert_eq!(r.attempt_count, 3);
        assert!(r.error_detail.as_deref().unwrap().contains("expected outputs"));
        Ok(())
    }

    #[test]
    fn test_missing_inputs_are_not_submitted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mock = Arc::new(MockScheduler::new());
        let job = JobSpec::new("needs_input", "true", dir.path())
            .with_inputs([dir.path().join("absent.bam")]);
        let results = runner(&mock).run_all(vec![("A", job)], 1, &CancelToken::new())?;
        assert_eq!(results["A"].state, JobState::Failed);
        assert_eq!(results["A"].attempt_count, 0);
        assert!(mock.submissions().is_empty());
        Ok(())
    }

    #[test]
    fn test_cancel_before_run() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mock = Arc::new(MockScheduler::new());
        let cancel = CancelToken::new();
        cancel.cancel();
        let results = runner(&mock).run_all(jobs(dir.path(), 3), 2, &cancel)?;
        assert!(results.values().all(|r| r.state == JobState::Cancelled));
        assert!(mock.submissions().is_empty());
        Ok(())
    }

    #[test]
    fn test_cancel_midway_keeps_submitted_jobs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let mock = Arc::new(
            MockScheduler::new()
                .with_run_time(Duration::from_millis(100))
                .on_submit(move |_| trigger.cancel()),
        );
        let results = runner(&mock).run_all(jobs(dir.path(), 5), 1, &cancel)?;
        assert_eq!(results.len(), 5);
        assert_eq!(results["S0"].state, JobState::Succeeded);
        for id in ["S1", "S2", "S3", "S4"] {
            assert_eq!(results[id].state, JobState::Cancelled, "{id}");
        }
        assert_eq!(mock.submissions(), vec!["job_S0".to_string()]);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_arguments() {
        let mock = Arc::new(MockScheduler::new());
        let runner = runner(&mock);
        let job = JobSpec::new("j", "true", "/tmp");
        assert!(runner
            .run_all(vec![(1, job.clone())], 0, &CancelToken::new())
            .is_err());
        assert!(runner
            .run_all(vec![(1, job.clone()), (1, job)], 1, &CancelToken::new())
            .is_err());
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff: Duration::from_secs(10),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(10));
        assert_eq!(policy.delay(3), Duration::from_secs(40));
    }
}
