use itertools::Itertools;
use std::path::PathBuf;

/// Precondition failures that abort a stage call before any job is submitted.
///
/// Individual job failures are never reported through this type; they are
/// recorded on the per-sample or per-group `JobResult` instead.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("The path {path:?} does not exist ({what}).")]
    MissingPath { path: PathBuf, what: &'static str },

    #[error("Sample '{sample_id}' was never registered in this experiment.")]
    UnknownSample { sample_id: String },

    #[error(
        "The following group members are not registered in this experiment: {}",
        missing.join(", ")
    )]
    MissingGroupMembers { missing: Vec<String> },

    #[error(
        "The following samples have no quantification output directory: {}. \
         Run quantification or set their output directories before merging.",
        sample_ids.join(", ")
    )]
    IncompleteQuantification { sample_ids: Vec<String> },

    #[error("The {stage} stage has not been configured: {hint}")]
    StageNotConfigured {
        stage: &'static str,
        hint: &'static str,
    },

    #[error("Invalid groups:\n{}", problems.iter().map(|p| format!("- {p}")).join("\n"))]
    InvalidGroups { problems: Vec<String> },
}

impl PipelineError {
    pub fn configuration(message: impl ToString) -> Self {
        PipelineError::Configuration {
            message: message.to_string(),
        }
    }

    /// Return `MissingPath` unless `path` exists.
    pub fn require_path(path: &std::path::Path, what: &'static str) -> Result<(), Self> {
        if path.exists() {
            Ok(())
        } else {
            Err(PipelineError::MissingPath {
                path: path.to_path_buf(),
                what,
            })
        }
    }

    /// True for the variants that count as configuration errors.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PipelineError::Configuration { .. } | PipelineError::MissingPath { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_offending_ids() {
        let err = PipelineError::MissingGroupMembers {
            missing: vec!["D".to_string(), "E".to_string()],
        };
        assert!(err.to_string().ends_with("D, E"));

        let err = PipelineError::IncompleteQuantification {
            sample_ids: vec!["A".to_string(), "B".to_string(), "C".to_string()],
        };
        assert!(err.to_string().contains("A, B, C"));

        let err = PipelineError::InvalidGroups {
            problems: vec!["one".to_string(), "two".to_string()],
        };
        assert_eq!(err.to_string(), "Invalid groups:\n- one\n- two");
    }

    #[test]
    fn test_require_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PipelineError::require_path(dir.path(), "scratch").is_ok());
        let missing = dir.path().join("nope");
        let err = PipelineError::require_path(&missing, "STAR index").unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("STAR index"));
    }
}
