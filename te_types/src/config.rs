//! Cluster submission and software environment configuration.
//!
//! Both files are JSON, one per site. They are passed through to the job
//! runner and rendered into every job script; nothing else interprets them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| path.display().to_string())?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Error parsing {}", path.display()))
}

/// Which backend runs the jobs.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, Default)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobManager {
    #[default]
    Slurm,
    /// Run job scripts as child processes on this machine.
    Local,
}

const fn default_poll_interval_secs() -> u64 {
    30
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_retry_backoff_secs() -> u64 {
    60
}

const fn default_cores_per_job() -> usize {
    1
}

fn default_walltime() -> String {
    "7-00:00:00".to_string()
}

/// Cluster submission settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Cluster name passed to `--clusters` on federated installations.
    #[serde(default)]
    pub scheduler_endpoint: Option<String>,
    /// Partition the jobs are submitted to.
    #[serde(alias = "partition")]
    pub queue_name: String,
    /// Walltime in the scheduler's own syntax.
    #[serde(default = "default_walltime", alias = "time")]
    pub default_walltime: String,
    #[serde(default, alias = "account")]
    pub accounting_project: Option<String>,
    #[serde(default)]
    pub job_manager: JobManager,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Delay between consecutive submissions.
    #[serde(default)]
    pub submit_interval_ms: u64,
    /// Attempts per job before it is reported as failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay, doubled on every further attempt.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_cores_per_job")]
    pub cores_per_job: usize,
    /// Extra `#SBATCH` lines, without the prefix.
    #[serde(default)]
    pub extra_directives: Vec<String>,
}

impl ClusterConfig {
    pub fn new(queue_name: impl ToString) -> Self {
        ClusterConfig {
            scheduler_endpoint: None,
            queue_name: queue_name.to_string(),
            default_walltime: default_walltime(),
            accounting_project: None,
            job_manager: JobManager::default(),
            poll_interval_secs: default_poll_interval_secs(),
            submit_interval_ms: 0,
            max_attempts: default_max_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
            cores_per_job: default_cores_per_job(),
            extra_directives: Vec::new(),
        }
    }

    pub fn from_json(path: &Path) -> Result<Self> {
        read_json(path)
    }
}

/// External tools a job may need from the module system.
#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
pub enum Tool {
    #[serde(rename = "cellranger", alias = "CellRanger")]
    #[strum(serialize = "cellranger")]
    CellRanger,
    #[serde(rename = "samtools")]
    #[strum(serialize = "samtools")]
    Samtools,
    #[serde(rename = "STAR", alias = "star")]
    #[strum(serialize = "STAR")]
    Star,
    #[serde(rename = "TEcount", alias = "tecount")]
    #[strum(serialize = "TEcount")]
    TeCount,
    #[serde(rename = "featureCounts", alias = "subread")]
    #[strum(serialize = "featureCounts")]
    FeatureCounts,
    /// The subsetting worker shipped with this pipeline.
    #[serde(rename = "tepipe")]
    #[strum(serialize = "tepipe")]
    TePipe,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnvModType {
    /// Replace the variable, e.g. `export KEY=value`
    #[serde(alias = "string")]
    Set,
    /// Prepend to a path list, e.g. `export KEY=value:$KEY`
    #[serde(alias = "path_prepend")]
    Prepend,
    /// Append to a path list, e.g. `export KEY=$KEY:value`
    #[serde(alias = "path_append")]
    Append,
    /// Unset the variable. The value is ignored.
    Unset,
}

/// One environment modification rendered into job scripts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentMod {
    pub key: String,

    #[serde(default)]
    pub value: String,

    #[serde(rename = "type")]
    pub mod_type: EnvModType,
}

impl EnvironmentMod {
    /// The shell line applying this modification.
    pub fn shell_line(&self) -> String {
        let key = &self.key;
        let value = shell_quote(&self.value);
        match self.mod_type {
            EnvModType::Set => format!("export {key}={value}"),
            EnvModType::Prepend => format!("export {key}={value}${{{key}:+:${key}}}"),
            EnvModType::Append => format!("export {key}=${{{key}:+${key}:}}{value}"),
            EnvModType::Unset => format!("unset {key}"),
        }
    }
}

/// Quote a value for a POSIX shell, leaving simple words alone.
pub fn shell_quote(s: &str) -> String {
    shell_escape::escape(s.into()).into_owned()
}

/// Software environment settings: which modules each tool needs and any extra environment.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleConfig {
    /// Prepended to MODULEPATH before any module is loaded.
    #[serde(default)]
    pub modules_path: Option<PathBuf>,
    /// Modules to load, in order, for each tool.
    #[serde(default)]
    pub tools: BTreeMap<Tool, Vec<String>>,
    #[serde(default)]
    pub env: Vec<EnvironmentMod>,
}

impl ModuleConfig {
    pub fn from_json(path: &Path) -> Result<Self> {
        read_json(path)
    }

    pub fn with_modules_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.modules_path = Some(path.into());
        self
    }

    /// The modules needed for a set of tools, de-duplicated, in first-use order.
    pub fn modules_for<'a>(&'a self, tools: impl IntoIterator<Item = &'a Tool>) -> Vec<&'a str> {
        let mut modules: Vec<&str> = Vec::new();
        for tool in tools {
            for m in self.tools.get(tool).into_iter().flatten() {
                if !modules.contains(&m.as_str()) {
                    modules.push(m);
                }
            }
        }
        modules
    }

    /// Shell lines setting up the environment for a job using `tools`.
    pub fn setup_lines(&self, tools: &[Tool]) -> Vec<String> {
        let mut lines = Vec::new();
        let modules = self.modules_for(tools);
        if !modules.is_empty() {
            lines.push("module purge".to_string());
            if let Some(path) = &self.modules_path {
                lines.push(format!(
                    "module use {}",
                    shell_quote(&path.display().to_string())
                ));
            }
            for m in modules {
                lines.push(format!("module load {}", shell_quote(m)));
            }
        }
        lines.extend(self.env.iter().map(EnvironmentMod::shell_line));
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_cluster_config_defaults_and_aliases() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"{{"partition": "lu48", "time": "2-00:00:00", "account": "lsens2018-3-3"}}"#
        )?;
        let config = ClusterConfig::from_json(file.path())?;
        assert_eq!(config.queue_name, "lu48");
        assert_eq!(config.default_walltime, "2-00:00:00");
        assert_eq!(config.accounting_project.as_deref(), Some("lsens2018-3-3"));
        assert_eq!(config.job_manager, JobManager::Slurm);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.cores_per_job, 1);
        Ok(())
    }

    #[test]
    fn test_module_setup_lines() -> Result<()> {
        let config: ModuleConfig = serde_json::from_str(
            r#"{
                "modules_path": "/shared/modules",
                "tools": {
                    "STAR": ["GCC/10.2.0", "STAR/2.7.8a"],
                    "samtools": ["GCC/10.2.0", "SAMtools/1.12"]
                },
                "env": [{"key": "TMPDIR", "value": "/scratch tmp", "type": "set"}]
            }"#,
        )?;
        assert_eq!(
            config.setup_lines(&[Tool::Samtools, Tool::Star, Tool::TeCount]),
            vec![
                "module purge",
                "module use /shared/modules",
                "module load GCC/10.2.0",
                "module load SAMtools/1.12",
                "module load STAR/2.7.8a",
                "export TMPDIR='/scratch tmp'",
            ]
        );
        assert!(ModuleConfig::default().setup_lines(&[Tool::Star]).is_empty());
        Ok(())
    }

    #[test]
    fn test_env_mod_lines() {
        let m = |mod_type, value: &str| EnvironmentMod {
            key: "PATH".to_string(),
            value: value.to_string(),
            mod_type,
        };
        assert_eq!(
            m(EnvModType::Prepend, "/opt/bin").shell_line(),
            "export PATH=/opt/bin${PATH:+:$PATH}"
        );
        assert_eq!(
            m(EnvModType::Append, "/opt/bin").shell_line(),
            "export PATH=${PATH:+$PATH:}/opt/bin"
        );
        assert_eq!(m(EnvModType::Unset, "").shell_line(), "unset PATH");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
