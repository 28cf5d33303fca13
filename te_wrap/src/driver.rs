//! Runs one region end to end: filter the sample sheet, register, quantify or
//! locate existing quantifications, merge and count per group.

use crate::job_args::JobArgs;
use crate::run_config::{read_groups, RunConfig};
use anyhow::{bail, Context, Result};
use job_runner::StageSummary;
use log::{info, warn};
use std::fs;
use te_lib::{ClusterParams, Experiment, QuantifyParams};
use te_types::config::{ClusterConfig, ModuleConfig};
use te_types::sample_sheet::{read_id_list, read_sample_sheet, write_sample_sheet, SampleFilter};
use te_types::Group;

/// Per-stage outcome of a run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub registered: Vec<String>,
    pub quantification: Option<StageSummary>,
    pub merged: Vec<String>,
    pub cluster: Option<StageSummary>,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        [&self.quantification, &self.cluster]
            .into_iter()
            .flatten()
            .any(StageSummary::has_failures)
    }

    pub fn print(&self) {
        println!("Registered {} samples", self.registered.len());
        if let Some(s) = &self.quantification {
            println!("Quantification: {s}");
        }
        println!("Merged {} samples", self.merged.len());
        if let Some(s) = &self.cluster {
            println!("Cluster processing: {s}");
        }
    }
}

/// Load the site configuration named by the run file and set up the
/// experiment.
pub fn build_experiment(config: &RunConfig, job_args: &JobArgs) -> Result<Experiment> {
    let mut cluster = ClusterConfig::from_json(&config.cluster_config)?;
    job_args.apply(&mut cluster);
    let mut modules = match &config.module_config {
        Some(path) => ModuleConfig::from_json(path)?,
        None => ModuleConfig::default(),
    };
    if let Some(path) = &config.modules_path {
        modules = modules.with_modules_path(path);
    }
    Ok(Experiment::new(&config.region, cluster, modules))
}

pub fn run_experiment(
    config: &RunConfig,
    job_args: &JobArgs,
    exp: &mut Experiment,
) -> Result<RunReport> {
    let mut report = RunReport::default();

    let records = read_sample_sheet(&config.sample_sheet)?;
    let passed_qc = config.post_qc.as_deref().map(read_id_list).transpose()?;
    if let Some(ids) = &passed_qc {
        info!("{} post-QC samples", ids.len());
    }
    let filter = SampleFilter {
        region: Some(config.region.as_str()),
        passed_qc: passed_qc.as_deref(),
        exclude_prefixes: &config.exclude_prefixes,
    };
    let records = filter.apply(records);
    if records.is_empty() {
        bail!(
            "no sample in {} is left for region {} after filtering",
            config.sample_sheet.display(),
            config.region
        );
    }
    fs::create_dir_all(&config.paths.pipeline_root)
        .with_context(|| config.paths.pipeline_root.display().to_string())?;
    write_sample_sheet(&config.registered_sheet(), &records)?;
    report.registered = exp.register_samples_from(records)?;
    let ids = report.registered.clone();

    if let Some(section) = &config.quantify {
        let mut params = QuantifyParams::new(&section.index, &config.paths.quant_root);
        params.memory_bytes = section.memory_gb << 30;
        params.max_concurrent_jobs = job_args.max_jobs(section.max_jobs);
        params.nuclei_flags = section.nuclei.iter().map(|id| (id.clone(), true)).collect();
        let results = exp.quantify(&ids, &params)?;
        report.quantification = Some(StageSummary::from_results(&results));
    } else {
        for id in &ids {
            exp.set_quantification_outdir(id, config.paths.quant_root.join(id))?;
        }
    }

    let quantified: Vec<String> = ids
        .iter()
        .filter(|id| exp.registry().get(id).is_some_and(|s| s.is_quantified()))
        .cloned()
        .collect();
    if quantified.len() < ids.len() {
        warn!(
            "{} of {} samples have no quantification and are left out",
            ids.len() - quantified.len(),
            ids.len()
        );
    }
    if quantified.is_empty() {
        return Ok(report);
    }

    exp.set_merge_samples_outdir(config.paths.merge_root.join(&config.region))?;
    if config.merge {
        let manifest = exp.merge_samples(&quantified)?;
        report.merged = manifest.samples.into_iter().map(|s| s.sample_id).collect();
    } else {
        report.merged = quantified.clone();
    }

    let section = &config.cluster;
    let groups = match &section.groups {
        Some(path) => read_groups(path)?,
        None => Group::singletons(&report.merged),
    };
    let mut params = ClusterParams::new(
        section.mode,
        config.paths.pipeline_root.join(&config.region),
        groups,
        section.feature_models(),
        &section.star_index,
    );
    params.memory_budget_bytes = section.memory_bytes;
    params.max_concurrent_jobs = job_args.max_jobs(section.max_jobs);
    params.include_genes = section.include_genes;
    params.multi_subset = section.multi_subset;
    params.unique_mapping_only = section.unique;
    let results = exp.process_clusters(&params)?;
    report.cluster = Some(results.summary());
    info!("done with {}", config.region);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use job_runner::testing::MockScheduler;
    use job_runner::{JobRunner, JobSpec};
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    fn fake_tools(job: &JobSpec) -> Result<()> {
        for out in &job.expected_outputs {
            fs::create_dir_all(out.parent().unwrap())?;
            let name = out.file_name().unwrap().to_string_lossy();
            if name == "raw.cntTable" {
                fs::write(out, "gene/TE\tstar.bam\nHERV-K\t3\n")?;
            } else {
                fs::write(out, "")?;
            }
        }
        Ok(())
    }

    /// A site with three PUT samples, two of which passed QC, already
    /// quantified under `1_counts`.
    fn site(root: &Path) -> Result<std::path::PathBuf> {
        fs::write(
            root.join("samples.tab"),
            "sample_id\tregion\tis_nuclei\n\
             AA_101_PUT\tPUT\ttrue\n\
             AA_102_PUT\tPUT\ttrue\n\
             AA_103_PUT\tPUT\ttrue\n\
             AA_101_PFC\tPFC\ttrue\n",
        )?;
        fs::write(root.join("postqc.txt"), "AA_101_PUT\nAA_103_PUT\nAA_101_PFC\n\n")?;
        fs::write(root.join("cluster.json"), r#"{"queue_name": "lu48", "job_manager": "local"}"#)?;
        fs::create_dir_all(root.join("star"))?;
        fs::write(root.join("herv.gtf"), "")?;
        for id in ["AA_101_PUT", "AA_103_PUT"] {
            let outs = root.join("1_counts").join(id).join("outs");
            fs::create_dir_all(outs.join("filtered_feature_bc_matrix"))?;
            fs::write(outs.join("possorted_genome_bam.bam"), "")?;
            fs::write(
                outs.join("filtered_feature_bc_matrix").join("barcodes.tsv"),
                "AAAC-1\nGGGT-1\n",
            )?;
        }
        let run = root.join("run.toml");
        fs::write(
            &run,
            r#"
region = "PUT"
sample_sheet = "samples.tab"
post_qc = "postqc.txt"
cluster_config = "cluster.json"

[paths]
quant_root = "1_counts"
merge_root = "barcodes"
pipeline_root = "output"

[cluster]
te_gtf = "herv.gtf"
star_index = "star"
unique = true
"#,
        )?;
        Ok(run)
    }

    #[test]
    fn test_run_region() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = RunConfig::load(&site(dir.path())?)?;
        let job_args = JobArgs::default();
        let mock = Arc::new(MockScheduler::new().with_executor(fake_tools));
        let mut exp = build_experiment(&config, &job_args)?
            .with_runner(JobRunner::new(mock.clone()).with_poll_interval(Duration::from_millis(1)));

        let report = run_experiment(&config, &job_args, &mut exp)?;
        assert_eq!(report.registered, vec!["AA_101_PUT", "AA_103_PUT"]);
        assert_eq!(report.merged, vec!["AA_101_PUT", "AA_103_PUT"]);
        assert!(report.quantification.is_none());
        let cluster = report.cluster.as_ref().unwrap();
        assert_eq!(cluster.succeeded, vec!["AA_101_PUT", "AA_103_PUT"]);
        assert!(!report.has_failures());

        let sheet = read_sample_sheet(&config.registered_sheet())?;
        assert_eq!(sheet.len(), 2);
        assert!(dir
            .path()
            .join("output/PUT/AA_103_PUT/te_counts/counts.tsv")
            .exists());
        assert!(dir.path().join("barcodes/PUT/manifest.json").exists());
        // one subset job per source sample, then one job per group
        assert_eq!(mock.submissions().len(), 4);
        Ok(())
    }

    #[test]
    fn test_empty_selection() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = RunConfig::load(&site(dir.path())?)?;
        config.region = "SN".to_string();
        let job_args = JobArgs::default();
        let mut exp = build_experiment(&config, &job_args)?;
        let err = run_experiment(&config, &job_args, &mut exp).unwrap_err();
        assert!(err.to_string().contains("region SN"), "{err}");
        Ok(())
    }
}
