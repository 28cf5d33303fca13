use crate::spec::JobSpec;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use strum_macros::{Display as StrumDisplay, EnumString};

/// Lifecycle state of a submitted job.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, StrumDisplay, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    /// Waiting for a submission slot.
    Pending,
    /// Submitted and not yet finished.
    Running,
    /// Finished and produced its expected outputs.
    Succeeded,
    /// Exhausted its attempts, or could not be submitted.
    Failed,
    /// An attempt failed and another one is scheduled.
    Retried,
    /// Expected outputs were already present, nothing was submitted.
    Skipped,
    /// Never submitted because the call was cancelled.
    Cancelled,
}

impl JobState {
    /// True for states a job never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Skipped | JobState::Cancelled
        )
    }

    /// True when the job's outputs can be used.
    pub fn is_success(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Skipped)
    }
}

/// Outcome of running one [`JobSpec`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct JobResult {
    /// The job as submitted.
    pub job: JobSpec,
    /// Last known state.
    pub state: JobState,
    /// Number of submissions made.
    pub attempt_count: u32,
    /// Why the last attempt failed, or why the job was not run.
    pub error_detail: Option<String>,
    /// Scheduler id of the last submission.
    pub scheduler_id: Option<String>,
}

impl JobResult {
    /// A result for a job that has not been submitted yet.
    pub fn pending(job: JobSpec) -> Self {
        JobResult {
            job,
            state: JobState::Pending,
            attempt_count: 0,
            error_detail: None,
            scheduler_id: None,
        }
    }

    /// A job skipped because its outputs already exist.
    pub fn skipped(job: JobSpec) -> Self {
        JobResult {
            state: JobState::Skipped,
            ..JobResult::pending(job)
        }
    }

    /// A job that was never submitted because the call was cancelled.
    pub fn cancelled(job: JobSpec) -> Self {
        JobResult {
            state: JobState::Cancelled,
            error_detail: Some("cancelled before submission".to_string()),
            ..JobResult::pending(job)
        }
    }

    /// A job that failed without being submitted.
    pub fn failed(job: JobSpec, detail: impl ToString) -> Self {
        JobResult {
            state: JobState::Failed,
            error_detail: Some(detail.to_string()),
            ..JobResult::pending(job)
        }
    }

    /// See [`JobState::is_success`].
    pub fn is_success(&self) -> bool {
        self.state.is_success()
    }
}

/// Counts of outcomes over one stage call, with the ids in each bucket.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct StageSummary {
    /// Ids whose job succeeded.
    pub succeeded: Vec<String>,
    /// Ids whose job failed, with the failure detail.
    pub failed: Vec<(String, String)>,
    /// Ids whose outputs already existed.
    pub skipped: Vec<String>,
    /// Ids never submitted because of cancellation.
    pub cancelled: Vec<String>,
}

impl StageSummary {
    /// Summarize results keyed by any displayable id.
    pub fn from_results<'a, K: Display + 'a>(
        results: impl IntoIterator<Item = (&'a K, &'a JobResult)>,
    ) -> Self {
        let mut summary = StageSummary::default();
        for (key, result) in results {
            let key = key.to_string();
            match result.state {
                JobState::Succeeded => summary.succeeded.push(key),
                JobState::Skipped => summary.skipped.push(key),
                JobState::Cancelled => summary.cancelled.push(key),
                _ => summary
                    .failed
                    .push((key, result.error_detail.clone().unwrap_or_default())),
            }
        }
        summary
    }

    /// True when any job failed.
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Total number of jobs summarized.
    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len() + self.cancelled.len()
    }

    /// True when nothing was summarized.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Display for StageSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped, {} cancelled",
            self.succeeded.len(),
            self.failed.len(),
            self.skipped.len(),
            self.cancelled.len()
        )?;
        if self.has_failures() {
            write!(
                f,
                " (failed: {})",
                self.failed.iter().map(|(id, _)| id).join(", ")
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_summary() {
        let job = JobSpec::new("j", "true", "/tmp");
        let mut ok = JobResult::pending(job.clone());
        ok.state = JobState::Succeeded;
        let results = BTreeMap::from([
            ("A", ok),
            ("B", JobResult::failed(job.clone(), "exit status 1")),
            ("C", JobResult::skipped(job.clone())),
            ("D", JobResult::cancelled(job)),
        ]);
        let summary = StageSummary::from_results(&results);
        assert_eq!(summary.len(), 4);
        assert!(summary.has_failures());
        assert_eq!(summary.failed, vec![("B".to_string(), "exit status 1".to_string())]);
        assert_eq!(
            summary.to_string(),
            "1 succeeded, 1 failed, 1 skipped, 1 cancelled (failed: B)"
        );
        assert!(JobState::Skipped.is_success());
        assert!(!JobState::Retried.is_terminal());
        assert_eq!(JobState::Succeeded.to_string(), "succeeded");
    }
}
