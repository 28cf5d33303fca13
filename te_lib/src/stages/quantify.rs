//! Per-sample quantification with `cellranger count`.

use crate::layout;
use crate::registry::SampleRegistry;
use crate::stages::{tools, StageContext};
use anyhow::Result;
use itertools::Itertools;
use job_runner::{JobResult, JobSpec, StageSummary};
use log::info;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use te_types::config::Tool;
use te_types::PipelineError;

#[derive(Debug, Clone)]
pub struct QuantifyParams {
    /// cellranger reference transcriptome.
    pub index_path: PathBuf,
    /// Each sample's output lands in `<outdir_root>/<sample_id>`.
    pub outdir_root: PathBuf,
    pub memory_bytes: u64,
    pub max_concurrent_jobs: usize,
    /// Overrides of each sample's registered `is_nuclei`.
    pub nuclei_flags: BTreeMap<String, bool>,
}

impl QuantifyParams {
    pub fn new(index_path: impl Into<PathBuf>, outdir_root: impl Into<PathBuf>) -> Self {
        QuantifyParams {
            index_path: index_path.into(),
            outdir_root: outdir_root.into(),
            memory_bytes: 64 << 30,
            max_concurrent_jobs: 1,
            nuclei_flags: BTreeMap::new(),
        }
    }
}

/// Quantify `sample_ids`, or every registered sample when empty.
///
/// Samples that already have a quantification output are reported as skipped
/// and not resubmitted. Every sample whose job succeeds or is skipped gets its
/// output directory recorded in the registry.
pub fn quantify(
    registry: &mut SampleRegistry,
    sample_ids: &[String],
    params: &QuantifyParams,
    ctx: StageContext<'_>,
) -> Result<BTreeMap<String, JobResult>> {
    PipelineError::require_path(&params.index_path, "reference index")?;

    let ids: Vec<String> = if sample_ids.is_empty() {
        registry.ids().map(String::from).collect()
    } else {
        sample_ids.iter().unique().cloned().collect()
    };

    let mut jobs = Vec::new();
    let mut results = BTreeMap::new();
    let mut no_fastqs = Vec::new();
    for id in &ids {
        let sample = registry.require(id)?;
        let outdir = params.outdir_root.join(id);
        if let Some(existing) = &sample.quantification_outdir {
            info!("{id}: already quantified in {}", existing.display());
            let job = JobSpec::new(format!("quant_{id}"), "", existing);
            results.insert(id.clone(), JobResult::skipped(job));
            continue;
        }
        let Some(fastqs) = &sample.fastq_dir else {
            no_fastqs.push(id.clone());
            continue;
        };
        let is_nuclei = params
            .nuclei_flags
            .get(id)
            .copied()
            .unwrap_or(sample.is_nuclei);
        let cores = ctx.cluster.cores_per_job;
        let command = tools::cellranger_count(
            id,
            &params.index_path,
            fastqs,
            is_nuclei,
            cores,
            params.memory_bytes,
        );
        let job = JobSpec::new(format!("quant_{id}"), command, &params.outdir_root)
            .with_tools([Tool::CellRanger])
            .with_resources(params.memory_bytes, cores)
            .with_max_concurrent_jobs(params.max_concurrent_jobs)
            .with_inputs([fastqs.clone()])
            .with_expected_outputs([
                layout::quant_bam(&outdir),
                outdir.join(layout::FILTERED_BARCODES[0]),
            ]);
        jobs.push((id.clone(), job));
    }
    if !no_fastqs.is_empty() {
        return Err(PipelineError::configuration(format!(
            "no fastq_dir registered for: {}",
            no_fastqs.join(", ")
        ))
        .into());
    }
    if params.max_concurrent_jobs == 0 {
        return Err(PipelineError::configuration("max_concurrent_jobs must be at least 1").into());
    }
    if !jobs.is_empty() {
        fs::create_dir_all(&params.outdir_root)
            .map_err(|e| {
                PipelineError::configuration(format!(
                    "cannot create {}: {e}",
                    params.outdir_root.display()
                ))
            })?;
    }

    info!("quantifying {} samples, {} at a time", jobs.len(), params.max_concurrent_jobs);
    let submitted = ctx.runner.run_all(jobs, params.max_concurrent_jobs, ctx.cancel)?;
    for (id, result) in &submitted {
        if result.is_success() {
            registry.set_quantification_outdir(id, params.outdir_root.join(id))?;
        }
    }
    results.extend(submitted);
    info!("quantification: {}", StageSummary::from_results(&results));
    Ok(results)
}
