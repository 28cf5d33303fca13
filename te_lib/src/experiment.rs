use crate::registry::SampleRegistry;
use crate::stages::cluster::{self, ClusterParams, ClusterResults};
use crate::stages::merge::{MergeManifest, MergeStage};
use crate::stages::quantify::{self, QuantifyParams};
use crate::stages::StageContext;
use anyhow::Result;
use job_runner::{CancelToken, JobResult, JobRunner};
use log::warn;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use te_types::config::{ClusterConfig, ModuleConfig};
use te_types::{ProcessingMode, SampleRecord};

/// One brain region's worth of samples and the stages run over them.
///
/// The experiment owns its registry. Stages borrow it for the duration of a
/// call, so every stage call sees the output directories recorded by the
/// previous one.
pub struct Experiment {
    region: String,
    registry: SampleRegistry,
    merge: MergeStage,
    cluster_config: ClusterConfig,
    module_config: ModuleConfig,
    runner: JobRunner,
    worker_exe: PathBuf,
    cancel: CancelToken,
}

impl Experiment {
    /// Jobs go to the scheduler named by `cluster_config.job_manager`.
    pub fn new(region: impl ToString, cluster_config: ClusterConfig, module_config: ModuleConfig) -> Self {
        let runner = JobRunner::from_config(&cluster_config, &module_config);
        Experiment {
            region: region.to_string(),
            registry: SampleRegistry::new(),
            merge: MergeStage::default(),
            cluster_config,
            module_config,
            runner,
            worker_exe: PathBuf::from("tepipe"),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_runner(mut self, runner: JobRunner) -> Self {
        self.runner = runner;
        self
    }

    /// The `tepipe` binary that jobs call back into.
    pub fn with_worker_exe(mut self, worker_exe: impl Into<PathBuf>) -> Self {
        self.worker_exe = worker_exe.into();
        self
    }

    /// A handle that stops submission of further jobs in the running stage.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn reset_cancellation(&mut self) {
        self.cancel = CancelToken::new();
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn registry(&self) -> &SampleRegistry {
        &self.registry
    }

    pub fn cluster_config(&self) -> &ClusterConfig {
        &self.cluster_config
    }

    pub fn module_config(&self) -> &ModuleConfig {
        &self.module_config
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    pub fn register_samples_from(
        &mut self,
        records: impl IntoIterator<Item = SampleRecord>,
    ) -> Result<Vec<String>> {
        let region = &self.region;
        let records: Vec<SampleRecord> = records
            .into_iter()
            .inspect(|r| {
                if &r.region != region {
                    warn!(
                        "{}: registered in region {region} but the sample sheet says {}",
                        r.sample_id, r.region
                    );
                }
            })
            .collect();
        self.registry.register(records)
    }

    pub fn set_quantification_outdir(&mut self, sample_id: &str, path: impl Into<PathBuf>) -> Result<()> {
        self.registry.set_quantification_outdir(sample_id, path.into())
    }

    pub fn set_merge_samples_outdir(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.merge.set_outdir(path)
    }

    pub fn merge_outdir(&self) -> Option<&Path> {
        self.merge.outdir()
    }

    fn context(&self) -> StageContext<'_> {
        StageContext {
            cluster: &self.cluster_config,
            runner: &self.runner,
            worker_exe: &self.worker_exe,
            cancel: &self.cancel,
        }
    }

    /// Quantify `sample_ids` (every sample when empty) and record each
    /// sample's output directory.
    pub fn quantify(
        &mut self,
        sample_ids: &[String],
        params: &QuantifyParams,
    ) -> Result<BTreeMap<String, JobResult>> {
        // Not `self.context()`: the registry is borrowed mutably alongside.
        let ctx = StageContext {
            cluster: &self.cluster_config,
            runner: &self.runner,
            worker_exe: &self.worker_exe,
            cancel: &self.cancel,
        };
        quantify::quantify(&mut self.registry, sample_ids, params, ctx)
    }

    /// Merge `sample_ids` (every sample when empty) into the merge directory.
    pub fn merge_samples(&self, sample_ids: &[String]) -> Result<MergeManifest> {
        self.merge.merge(&self.registry, &self.region, sample_ids)
    }

    /// In merged mode the groups are read from the merge directory, which
    /// must have been set.
    pub fn process_clusters(&self, params: &ClusterParams) -> Result<ClusterResults> {
        let merge_outdir = match params.mode {
            ProcessingMode::Merged => self.merge.outdir(),
            ProcessingMode::PerSample => None,
        };
        cluster::process(&self.registry, merge_outdir, params, self.context())
    }
}
