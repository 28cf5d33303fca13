//! Cluster-level counting: partition barcodes by group, subset reads, realign
//! and count against the feature models, then collect per-unit count matrices.

use crate::barcodes::{partition_by_group, read_barcodes, write_cell_barcodes, CellBarcode};
use crate::layout::{self, UnitLayout};
use crate::registry::SampleRegistry;
use crate::stages::merge::MergeManifest;
use crate::stages::{tools, StageContext};
use crate::subset::Routes;
use anyhow::{Context, Result};
use itertools::Itertools;
use job_runner::{JobResult, JobSpec, JobState, StageSummary};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use te_types::config::Tool;
use te_types::count_matrix::CountMatrix;
use te_types::group::validate_groups;
use te_types::{FeatureKind, FeatureModels, Group, PipelineError, ProcessingMode};

const SUBSET_DIR: &str = "_subset";

#[derive(Debug, Clone)]
pub struct ClusterParams {
    pub mode: ProcessingMode,
    pub outdir: PathBuf,
    pub groups: Vec<Group>,
    pub feature_models: FeatureModels,
    pub star_index: PathBuf,
    /// Memory requested for every job.
    pub memory_budget_bytes: u64,
    pub max_concurrent_jobs: usize,
    /// Add the gene rows to each TE count table.
    pub include_genes: bool,
    /// Subset each source BAM once for all groups.
    pub multi_subset: bool,
    pub unique_mapping_only: bool,
}

impl ClusterParams {
    pub fn new(
        mode: ProcessingMode,
        outdir: impl Into<PathBuf>,
        groups: Vec<Group>,
        feature_models: FeatureModels,
        star_index: impl Into<PathBuf>,
    ) -> Self {
        ClusterParams {
            mode,
            outdir: outdir.into(),
            groups,
            feature_models,
            star_index: star_index.into(),
            memory_budget_bytes: 32 << 30,
            max_concurrent_jobs: 1,
            include_genes: false,
            multi_subset: false,
            unique_mapping_only: false,
        }
    }
}

/// Identifies one processing unit: a group, or a group within one sample in
/// per-sample mode.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitKey {
    pub sample: Option<String>,
    pub group: String,
}

impl UnitKey {
    pub fn group(group: impl ToString) -> Self {
        UnitKey {
            sample: None,
            group: group.to_string(),
        }
    }

    pub fn sample_group(sample: impl ToString, group: impl ToString) -> Self {
        UnitKey {
            sample: Some(sample.to_string()),
            group: group.to_string(),
        }
    }

    fn job_name(&self) -> String {
        match &self.sample {
            Some(sample) => format!("unit_{sample}_{}", self.group),
            None => format!("unit_{}", self.group),
        }
    }

    fn column(&self) -> String {
        match &self.sample {
            Some(sample) => format!("{sample}_{}", self.group),
            None => self.group.clone(),
        }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sample {
            Some(sample) => write!(f, "{sample}/{}", self.group),
            None => write!(f, "{}", self.group),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub dir: PathBuf,
    pub result: JobResult,
    pub gene_count_matrix: Option<CountMatrix>,
    pub te_count_matrix: Option<CountMatrix>,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterResults {
    pub units: BTreeMap<UnitKey, UnitOutcome>,
    /// Shared subsetting jobs keyed by source sample, when subsetting once
    /// for all groups.
    pub subset_results: BTreeMap<String, JobResult>,
}

impl ClusterResults {
    /// The merged-mode outcome for `group`.
    pub fn group(&self, group: &str) -> Option<&UnitOutcome> {
        self.units.get(&UnitKey::group(group))
    }

    pub fn summary(&self) -> StageSummary {
        StageSummary::from_results(self.units.iter().map(|(k, u)| (k, &u.result)))
    }
}

/// Reads of one source sample feeding the processing units.
struct Source {
    bam: PathBuf,
    barcodes: Vec<String>,
}

struct Unit {
    key: UnitKey,
    layout: UnitLayout,
    cells: Vec<CellBarcode>,
}

impl Unit {
    /// Source samples contributing at least one barcode, in order.
    fn samples(&self) -> Vec<&str> {
        self.cells
            .iter()
            .map(|c| c.sample_id.as_str())
            .unique()
            .collect()
    }
}

fn check_preconditions(registry: &SampleRegistry, params: &ClusterParams) -> Result<()> {
    validate_groups(&params.groups)?;
    let missing: Vec<String> = registry
        .missing(params.groups.iter().flat_map(|g| g.members.iter()))
        .into_iter()
        .sorted()
        .dedup()
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::MissingGroupMembers { missing }.into());
    }
    PipelineError::require_path(&params.star_index, "STAR index")?;
    params.feature_models.validate()?;
    if params.include_genes
        && !(params.feature_models.has(FeatureKind::Gene)
            && params.feature_models.has(FeatureKind::TransposableElement))
    {
        return Err(PipelineError::configuration(
            "include_genes needs both a gene model and a TE model",
        )
        .into());
    }
    if params.max_concurrent_jobs == 0 {
        return Err(PipelineError::configuration("max_concurrent_jobs must be at least 1").into());
    }
    Ok(())
}

/// Find the BAM and barcodes of every group member.
fn load_sources(
    registry: &SampleRegistry,
    merge_outdir: Option<&Path>,
    params: &ClusterParams,
) -> Result<BTreeMap<String, Source>> {
    let members = params.groups.iter().flat_map(|g| g.members.iter());
    let mut sources = BTreeMap::new();
    match params.mode {
        ProcessingMode::Merged => {
            let Some(merge_dir) = merge_outdir else {
                return Err(PipelineError::StageNotConfigured {
                    stage: "cluster processing",
                    hint: "merged mode reads the merge output; set the merge output directory and merge first",
                }
                .into());
            };
            let manifest = MergeManifest::read(merge_dir)?;
            let mut by_sample: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for row in MergeManifest::read_barcodes(merge_dir)? {
                by_sample.entry(row.sample_id).or_default().push(row.barcode);
            }
            let absent: Vec<&String> = members
                .clone()
                .filter(|m| manifest.sample(m).is_none())
                .collect();
            if !absent.is_empty() {
                return Err(PipelineError::configuration(format!(
                    "not part of the merge in {}: {}",
                    merge_dir.display(),
                    absent.iter().join(", ")
                ))
                .into());
            }
            for member in members {
                if let Some(merged) = manifest.sample(member) {
                    sources.insert(
                        member.clone(),
                        Source {
                            bam: merged.bam.clone(),
                            barcodes: by_sample.remove(member).unwrap_or_default(),
                        },
                    );
                }
            }
        }
        ProcessingMode::PerSample => {
            let incomplete: Vec<String> = members
                .clone()
                .filter(|m| registry.get(m).is_some_and(|s| !s.is_quantified()))
                .cloned()
                .sorted()
                .collect();
            if !incomplete.is_empty() {
                return Err(PipelineError::IncompleteQuantification {
                    sample_ids: incomplete,
                }
                .into());
            }
            for member in members {
                let sample = registry.require(member)?;
                let Some(quant) = &sample.quantification_outdir else {
                    continue;
                };
                let barcodes_path = layout::filtered_barcodes(quant);
                PipelineError::require_path(&barcodes_path, "filtered barcodes")?;
                sources.insert(
                    member.clone(),
                    Source {
                        bam: layout::quant_bam(quant),
                        barcodes: read_barcodes(&barcodes_path)?,
                    },
                );
            }
        }
    }
    Ok(sources)
}

fn build_units(sources: &BTreeMap<String, Source>, params: &ClusterParams) -> Vec<Unit> {
    let rows: Vec<CellBarcode> = sources
        .iter()
        .flat_map(|(sample_id, source)| {
            source.barcodes.iter().map(move |bc| CellBarcode {
                sample_id: sample_id.clone(),
                barcode: bc.clone(),
            })
        })
        .collect();

    match params.mode {
        ProcessingMode::Merged => partition_by_group(&rows, &params.groups)
            .into_iter()
            .map(|(group, cells)| Unit {
                layout: UnitLayout::new(params.outdir.join(&group)),
                key: UnitKey::group(group),
                cells: cells.into_iter().cloned().collect(),
            })
            .collect(),
        ProcessingMode::PerSample => params
            .groups
            .iter()
            .flat_map(|g| g.members.iter().map(move |m| (m, g)))
            .map(|(member, group)| Unit {
                key: UnitKey::sample_group(member, &group.name),
                layout: UnitLayout::new(params.outdir.join(member).join(&group.name)),
                cells: rows.iter().filter(|r| &r.sample_id == member).cloned().collect(),
            })
            .collect(),
    }
}

/// Routes for the reads of `sample_id` within `unit`.
fn unit_routes(unit: &Unit, sample_id: &str) -> Routes {
    let mut routes = Routes::new();
    let out = unit.layout.subset_bam(sample_id);
    for cell in unit.cells.iter().filter(|c| c.sample_id == sample_id) {
        routes.add(&cell.barcode, &out);
    }
    routes
}

/// One subsetting job per source sample, routing its barcodes to every unit.
fn subset_jobs(
    units: &[Unit],
    sources: &BTreeMap<String, Source>,
    params: &ClusterParams,
    ctx: StageContext<'_>,
) -> Result<Vec<(String, JobSpec)>> {
    let subset_dir = params.outdir.join(SUBSET_DIR);
    let mut routes: BTreeMap<&str, Routes> = BTreeMap::new();
    for unit in units {
        for cell in &unit.cells {
            let out = unit.layout.subset_bam(&cell.sample_id);
            if !routes
                .entry(cell.sample_id.as_str())
                .or_default()
                .add(&cell.barcode, &out)
            {
                warn!("{}: barcode {} listed twice", cell.sample_id, cell.barcode);
            }
        }
    }

    let mut jobs = Vec::new();
    for (sample_id, routes) in routes {
        let Some(source) = sources.get(sample_id) else {
            continue;
        };
        let routes_path = subset_dir.join(format!("{sample_id}.routes.tsv"));
        routes.write(&routes_path)?;
        let command = tools::subset_bam(
            ctx.worker_exe,
            &source.bam,
            &routes_path,
            params.unique_mapping_only,
        );
        let job = JobSpec::new(format!("subset_{sample_id}"), command, &subset_dir)
            .with_tools([Tool::TePipe])
            .with_resources(params.memory_budget_bytes, 1)
            .with_max_concurrent_jobs(params.max_concurrent_jobs)
            .with_inputs([source.bam.clone(), routes_path])
            .with_expected_outputs(routes.outputs().iter().cloned());
        jobs.push((sample_id.to_string(), job));
    }
    Ok(jobs)
}

/// The subset, realign and count job of one unit.
fn unit_job(
    unit: &Unit,
    sources: &BTreeMap<String, Source>,
    params: &ClusterParams,
    ctx: StageContext<'_>,
) -> Result<JobSpec> {
    let layout = &unit.layout;
    let cores = ctx.cluster.cores_per_job;
    let models = &params.feature_models;
    let samples = unit.samples();

    let mut lines = Vec::new();
    let mut inputs = Vec::new();
    let mut tools_used = Vec::new();
    if params.multi_subset {
        inputs.extend(samples.iter().map(|s| layout.subset_bam(s)));
    } else {
        tools_used.push(Tool::TePipe);
        for sample_id in &samples {
            let Some(source) = sources.get(*sample_id) else {
                continue;
            };
            let routes_path = layout.routes(sample_id);
            unit_routes(unit, sample_id).write(&routes_path)?;
            lines.push(tools::subset_bam(
                ctx.worker_exe,
                &source.bam,
                &routes_path,
                params.unique_mapping_only,
            ));
            inputs.push(source.bam.clone());
            inputs.push(routes_path);
        }
    }
    tools_used.extend([Tool::Samtools, Tool::Star]);

    let subset_bams: Vec<PathBuf> = samples.iter().map(|s| layout.subset_bam(s)).collect();
    lines.push(tools::samtools_merge(
        &layout.merged_bam(),
        subset_bams.iter().map(PathBuf::as_path),
        cores,
    ));
    lines.push(tools::samtools_fastq(&layout.merged_bam(), &layout.fastq(), cores));
    lines.push(tools::mkdir(&layout.dir.join("star")));
    lines.push(tools::star_align(
        &params.star_index,
        &layout.fastq(),
        &layout.star_prefix(),
        cores,
        params.unique_mapping_only,
    ));

    if let Some(te_gtf) = models.get(FeatureKind::TransposableElement) {
        let kind = FeatureKind::TransposableElement;
        let gene_gtf = models.get(FeatureKind::Gene).unwrap_or(te_gtf);
        tools_used.push(Tool::TeCount);
        lines.push(tools::mkdir(&layout.counts_dir(kind)));
        lines.push(tools::tecount(
            &layout.star_bam(),
            gene_gtf,
            te_gtf,
            &layout.counts_dir(kind),
            "raw",
            params.unique_mapping_only,
        ));
    }
    if let Some(gene_gtf) = models.get(FeatureKind::Gene) {
        let kind = FeatureKind::Gene;
        tools_used.push(Tool::FeatureCounts);
        lines.push(tools::mkdir(&layout.counts_dir(kind)));
        lines.push(tools::featurecounts(
            &layout.star_bam(),
            gene_gtf,
            &layout.raw_counts(kind),
            cores,
            params.unique_mapping_only,
        ));
    }

    Ok(
        JobSpec::new(unit.key.job_name(), lines.iter().join("\n"), &layout.dir)
            .with_tools(tools_used)
            .with_resources(params.memory_budget_bytes, cores)
            .with_max_concurrent_jobs(params.max_concurrent_jobs)
            .with_inputs(inputs)
            .with_expected_outputs(models.kinds().map(|k| layout.raw_counts(k))),
    )
}

/// Read the raw tables of a finished unit and write its final count tables.
fn aggregate(
    unit: &Unit,
    params: &ClusterParams,
) -> Result<(Option<CountMatrix>, Option<CountMatrix>)> {
    let layout = &unit.layout;
    let column = unit.key.column();
    let read = |kind| -> Result<Option<CountMatrix>> {
        if !params.feature_models.has(kind) {
            return Ok(None);
        }
        let raw = layout.raw_counts(kind);
        Ok(Some(CountMatrix::read_raw(&raw, &column)?))
    };
    let gene = read(FeatureKind::Gene)?;
    let mut te = read(FeatureKind::TransposableElement)?;

    // TEcount also counts the genes of its --GTF model.
    if let (Some(gene), Some(te_table)) = (&gene, &mut te) {
        if params.include_genes {
            let mut combined = gene.clone();
            combined.merge_rows_from(te_table);
            *te_table = combined;
        } else {
            let removed = te_table.remove_features_of(gene);
            debug!("{}: dropped {removed} gene rows from the TE table", unit.key);
        }
    }
    if let Some(m) = &gene {
        m.write_tsv(&layout.counts(FeatureKind::Gene))?;
    }
    if let Some(m) = &te {
        m.write_tsv(&layout.counts(FeatureKind::TransposableElement))?;
    }
    Ok((gene, te))
}

/// Run cluster processing for `params.groups`.
///
/// Precondition failures (invalid or unknown group members, missing inputs)
/// are returned as errors before anything is submitted. Failures of
/// individual units are reported on their `UnitOutcome` and do not affect the
/// other units.
pub fn process(
    registry: &SampleRegistry,
    merge_outdir: Option<&Path>,
    params: &ClusterParams,
    ctx: StageContext<'_>,
) -> Result<ClusterResults> {
    check_preconditions(registry, params)?;
    let sources = load_sources(registry, merge_outdir, params)?;
    let units = build_units(&sources, params);

    for unit in &units {
        fs::create_dir_all(&unit.layout.dir)
            .with_context(|| unit.layout.dir.display().to_string())?;
        write_cell_barcodes(&unit.layout.barcodes(), &unit.cells)?;
    }
    info!(
        "cluster processing ({} mode): {} units over {} source samples",
        params.mode,
        units.len(),
        sources.len()
    );

    let mut results = ClusterResults::default();
    if params.multi_subset {
        let jobs = subset_jobs(&units, &sources, params, ctx)?;
        results.subset_results = ctx.runner.run_all(jobs, params.max_concurrent_jobs, ctx.cancel)?;
        info!(
            "subsetting: {}",
            StageSummary::from_results(&results.subset_results)
        );
    }

    let mut jobs = Vec::new();
    let mut held = BTreeMap::new();
    for unit in &units {
        let job = unit_job(unit, &sources, params, ctx)?;
        if unit.cells.is_empty() {
            held.insert(unit.key.clone(), JobResult::failed(job, "no cell barcodes assigned"));
            continue;
        }
        let unfinished: Vec<(&str, &JobResult)> = unit
            .samples()
            .into_iter()
            .filter_map(|s| Some((s, results.subset_results.get(s)?)))
            .filter(|(_, r)| !r.is_success())
            .collect();
        if unfinished.iter().any(|(_, r)| r.state == JobState::Cancelled) {
            held.insert(unit.key.clone(), JobResult::cancelled(job));
            continue;
        }
        let failed_sources = unfinished.iter().map(|(s, _)| s).join(", ");
        if !failed_sources.is_empty() {
            let detail = format!("subsetting failed for {failed_sources}");
            held.insert(unit.key.clone(), JobResult::failed(job, detail));
            continue;
        }
        jobs.push((unit.key.clone(), job));
    }
    let mut unit_results = ctx.runner.run_all(jobs, params.max_concurrent_jobs, ctx.cancel)?;
    unit_results.append(&mut held);

    for unit in units {
        let Some(mut result) = unit_results.remove(&unit.key) else {
            continue;
        };
        let mut outcome = (None, None);
        if result.is_success() {
            match aggregate(&unit, params) {
                Ok(matrices) => outcome = matrices,
                Err(e) => {
                    warn!("{}: {e:#}", unit.key);
                    result = JobResult::failed(result.job, format!("aggregation failed: {e:#}"));
                }
            }
        }
        results.units.insert(
            unit.key,
            UnitOutcome {
                dir: unit.layout.dir,
                result,
                gene_count_matrix: outcome.0,
                te_count_matrix: outcome.1,
            },
        );
    }
    info!("cluster processing: {}", results.summary());
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key_order() -> Vec<UnitKey> {
        vec![
            UnitKey::sample_group("B", "g1"),
            UnitKey::group("g2"),
            UnitKey::sample_group("A", "g2"),
            UnitKey::group("g1"),
        ]
    }

    #[test]
    fn test_unit_key() {
        let mut keys = key_order();
        keys.sort();
        assert_eq!(
            keys.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["g1", "g2", "A/g2", "B/g1"]
        );
        assert_eq!(UnitKey::sample_group("A", "g2").job_name(), "unit_A_g2");
        assert_eq!(UnitKey::group("g2").column(), "g2");
    }

    #[test]
    fn test_aggregate_te_rows_win() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let unit = Unit {
            key: UnitKey::group("g1"),
            layout: UnitLayout::new(dir.path()),
            cells: Vec::new(),
        };
        let gene = unit.layout.raw_counts(FeatureKind::Gene);
        let te = unit.layout.raw_counts(FeatureKind::TransposableElement);
        fs::create_dir_all(gene.parent().unwrap())?;
        fs::create_dir_all(te.parent().unwrap())?;
        fs::write(
            &gene,
            "Geneid\tChr\tStart\tEnd\tStrand\tLength\tx.bam\nENSG01\tchr1\t1\t9\t+\t9\t5\nL1HS\tchr1\t1\t9\t+\t9\t1\n",
        )?;
        fs::write(&te, "gene/TE\tx.bam\nL1HS\t7\nAluY\t2\n")?;

        let mut params = ClusterParams::new(
            ProcessingMode::Merged,
            dir.path(),
            Vec::new(),
            FeatureModels::new().with_gene("g.gtf").with_te("te.gtf"),
            "star",
        );
        params.include_genes = true;
        let (gene, te) = aggregate(&unit, &params)?;
        assert_eq!(gene.unwrap().total(), 6);
        let te = te.unwrap();
        assert_eq!(
            te.counts,
            BTreeMap::from([
                ("AluY".to_string(), 2),
                ("ENSG01".to_string(), 5),
                ("L1HS".to_string(), 7)
            ])
        );
        assert_eq!(
            CountMatrix::read_raw(&unit.layout.counts(FeatureKind::TransposableElement), "g1")?,
            te
        );
        Ok(())
    }

    #[test]
    fn test_aggregate_keeps_gene_rows_out_of_te_table() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let unit = Unit {
            key: UnitKey::group("g1"),
            layout: UnitLayout::new(dir.path()),
            cells: Vec::new(),
        };
        let gene = unit.layout.raw_counts(FeatureKind::Gene);
        let te = unit.layout.raw_counts(FeatureKind::TransposableElement);
        fs::create_dir_all(gene.parent().unwrap())?;
        fs::create_dir_all(te.parent().unwrap())?;
        fs::write(
            &gene,
            "Geneid\tChr\tStart\tEnd\tStrand\tLength\tx.bam\nENSG01\tchr1\t1\t9\t+\t9\t9\n",
        )?;
        fs::write(&te, "gene/TE\tx.bam\nENSG01\t9\nL1HS\t3\n")?;

        let params = ClusterParams::new(
            ProcessingMode::Merged,
            dir.path(),
            Vec::new(),
            FeatureModels::new().with_gene("g.gtf").with_te("te.gtf"),
            "star",
        );
        assert!(!params.include_genes);
        let (gene, te) = aggregate(&unit, &params)?;
        assert_eq!(gene.unwrap().counts, BTreeMap::from([("ENSG01".to_string(), 9)]));
        let te = te.unwrap();
        assert_eq!(te.counts, BTreeMap::from([("L1HS".to_string(), 3)]));
        assert_eq!(
            CountMatrix::read_raw(&unit.layout.counts(FeatureKind::TransposableElement), "g1")?,
            te
        );
        Ok(())
    }
}
