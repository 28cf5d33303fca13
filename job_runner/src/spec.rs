use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use te_types::config::Tool;

/// One unit of cluster work: a shell command, its resource request, the
/// directory it runs in and the files it reads and writes.
///
/// A job's identity is its working directory plus its command. Submitting a
/// job is a no-op only when its expected outputs all exist and were written by
/// a job of the same identity, as recorded in its command stamp.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct JobSpec {
    /// Scheduler job name, also used for the script and log file names.
    pub name: String,
    /// Tools whose modules are loaded before the command runs.
    pub tools: Vec<Tool>,
    /// Shell command, possibly several lines.
    pub command: String,
    /// Memory to request from the scheduler. Zero means the queue default.
    pub required_memory_bytes: u64,
    /// Concurrency cap of the stage call that created this job.
    pub max_concurrent_jobs: usize,
    /// Cores to request.
    pub cores: usize,
    /// Directory the command runs in.
    pub working_dir: PathBuf,
    /// Files that must exist before the job is submitted.
    pub inputs: Vec<PathBuf>,
    /// Files the job must produce to count as succeeded.
    pub expected_outputs: Vec<PathBuf>,
}

impl JobSpec {
    /// A single-core job with no resource request and no declared files.
    pub fn new(name: impl ToString, command: impl ToString, working_dir: impl Into<PathBuf>) -> Self {
        JobSpec {
            name: name.to_string(),
            tools: Vec::new(),
            command: command.to_string(),
            required_memory_bytes: 0,
            max_concurrent_jobs: 1,
            cores: 1,
            working_dir: working_dir.into(),
            inputs: Vec::new(),
            expected_outputs: Vec::new(),
        }
    }

    /// Set the tools needed by the command.
    pub fn with_tools(mut self, tools: impl IntoIterator<Item = Tool>) -> Self {
        self.tools = tools.into_iter().collect();
        self
    }

    /// Set the memory and core request.
    pub fn with_resources(mut self, required_memory_bytes: u64, cores: usize) -> Self {
        self.required_memory_bytes = required_memory_bytes;
        self.cores = cores.max(1);
        self
    }

    /// Record the concurrency cap of the submitting stage call.
    pub fn with_max_concurrent_jobs(mut self, max_concurrent_jobs: usize) -> Self {
        self.max_concurrent_jobs = max_concurrent_jobs;
        self
    }

    /// Set the files that must exist before submission.
    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.inputs = inputs.into_iter().collect();
        self
    }

    /// Set the files the job must produce.
    pub fn with_expected_outputs(mut self, outputs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.expected_outputs = outputs.into_iter().collect();
        self
    }

    /// The identity of this job: working directory and command.
    pub fn identity(&self) -> (&Path, &str) {
        (&self.working_dir, &self.command)
    }

    /// The identity as written to the command stamp.
    pub fn identity_stamp(&self) -> String {
        let (dir, command) = self.identity();
        format!("{}\n{command}\n", dir.display())
    }

    /// Where the identity of the last successful run is recorded.
    pub fn stamp_path(&self) -> PathBuf {
        self.working_dir.join(format!("_{}.cmd", self.name))
    }

    /// True when the command stamp exists and matches this job.
    pub fn stamp_matches(&self) -> bool {
        std::fs::read_to_string(self.stamp_path()).is_ok_and(|s| s == self.identity_stamp())
    }

    /// True when the outputs exist and were produced by this same job, so
    /// it can be skipped.
    pub fn is_complete(&self) -> bool {
        self.outputs_present() && self.stamp_matches()
    }

    /// True when the job declares outputs and every one of them exists.
    pub fn outputs_present(&self) -> bool {
        !self.expected_outputs.is_empty() && self.expected_outputs.iter().all(|p| p.exists())
    }

    /// Expected outputs that do not exist.
    pub fn missing_outputs(&self) -> Vec<&Path> {
        self.expected_outputs
            .iter()
            .filter(|p| !p.exists())
            .map(PathBuf::as_path)
            .collect()
    }

    /// Inputs that do not exist.
    pub fn missing_inputs(&self) -> Vec<&Path> {
        self.inputs
            .iter()
            .filter(|p| !p.exists())
            .map(PathBuf::as_path)
            .collect()
    }

    /// Where the rendered job script is written.
    pub fn script_path(&self) -> PathBuf {
        self.working_dir.join(format!("_{}.sh", self.name))
    }

    /// Where the job's combined stdout and stderr go.
    pub fn log_path(&self) -> PathBuf {
        self.working_dir.join(format!("_{}.log", self.name))
    }
}

/// Builder for one shell command line with escaped arguments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandLine {
    parts: Vec<String>,
}

fn escape(s: &str) -> String {
    shell_escape::escape(Cow::Borrowed(s)).into_owned()
}

impl CommandLine {
    /// Start a command with the given program.
    pub fn new(program: &str) -> Self {
        CommandLine {
            parts: vec![escape(program)],
        }
    }

    /// Append one escaped argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.parts.push(escape(arg.as_ref()));
        self
    }

    /// Append a path argument.
    pub fn path(self, path: &Path) -> Self {
        self.arg(path.display().to_string())
    }

    /// Append several escaped arguments.
    pub fn args<S: AsRef<str>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.parts.extend(args.into_iter().map(|a| escape(a.as_ref())));
        self
    }

    /// Append `--flag=value`.
    pub fn kv(self, flag: &str, value: impl Display) -> Self {
        self.arg(format!("{flag}={value}"))
    }

    /// Append `flag value` as two arguments.
    pub fn opt(self, flag: &str, value: impl Display) -> Self {
        self.arg(flag).arg(value.to_string())
    }

    /// Append a flag without a value when `cond` holds.
    pub fn flag_if(self, cond: bool, flag: &str) -> Self {
        if cond {
            self.arg(flag)
        } else {
            self
        }
    }

    /// Append raw shell text, for redirections and pipes.
    pub fn raw(mut self, text: &str) -> Self {
        self.parts.push(text.to_string());
        self
    }
}

impl Display for CommandLine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.parts.join(" "))
    }
}
