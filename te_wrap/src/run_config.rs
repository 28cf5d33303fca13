//! The TOML run file describing one region's run.
//!
//! ```toml
//! region = "PUT"
//! sample_sheet = "register_ASAP_samples.tab"
//! post_qc = "input_postQC.txt"
//! cluster_config = "config_files/lunarc_config.json"
//! module_config = "config_files/software_modules.json"
//!
//! [paths]
//! quant_root = "../1_counts"
//! merge_root = "../barcodes_microglia"
//! pipeline_root = "../trusTEr_output_microglia"
//!
//! [cluster]
//! te_gtf = "hg38_HERVs_prediction.gtf"
//! star_index = "GRCh38.p13_gencode.v38_STAR"
//! memory_bytes = 132312156009
//! max_jobs = 10
//! unique = true
//! ```
//!
//! Relative paths are resolved against the directory holding the run file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use te_types::{FeatureModels, Group, ProcessingMode};

const fn default_true() -> bool {
    true
}

const fn default_quant_memory_gb() -> u64 {
    64
}

const fn default_quant_jobs() -> usize {
    1
}

const fn default_cluster_memory_bytes() -> u64 {
    32 << 30
}

const fn default_cluster_jobs() -> usize {
    10
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub region: String,
    pub sample_sheet: PathBuf,
    /// Ids of the samples that passed QC. Every sample is kept when absent.
    #[serde(default)]
    pub post_qc: Option<PathBuf>,
    #[serde(default)]
    pub exclude_prefixes: Vec<String>,
    pub cluster_config: PathBuf,
    #[serde(default)]
    pub module_config: Option<PathBuf>,
    /// Overrides `modules_path` of the module configuration.
    #[serde(default)]
    pub modules_path: Option<PathBuf>,
    pub paths: Paths,
    /// Run cellranger first. Without it every sample must already have
    /// its output under `paths.quant_root`.
    #[serde(default)]
    pub quantify: Option<QuantifySection>,
    #[serde(default = "default_true")]
    pub merge: bool,
    pub cluster: ClusterSection,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Paths {
    pub quant_root: PathBuf,
    pub merge_root: PathBuf,
    pub pipeline_root: PathBuf,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct QuantifySection {
    pub index: PathBuf,
    #[serde(default = "default_quant_memory_gb")]
    pub memory_gb: u64,
    #[serde(default = "default_quant_jobs")]
    pub max_jobs: usize,
    /// Samples to quantify as nuclei regardless of the sample sheet.
    #[serde(default)]
    pub nuclei: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ClusterSection {
    #[serde(default)]
    pub mode: ProcessingMode,
    #[serde(default)]
    pub gene_gtf: Option<PathBuf>,
    #[serde(default)]
    pub te_gtf: Option<PathBuf>,
    pub star_index: PathBuf,
    #[serde(default = "default_cluster_memory_bytes")]
    pub memory_bytes: u64,
    #[serde(default = "default_cluster_jobs")]
    pub max_jobs: usize,
    #[serde(default)]
    pub include_genes: bool,
    #[serde(default = "default_true")]
    pub multi_subset: bool,
    #[serde(default)]
    pub unique: bool,
    /// `group\tsample_id` lines. One group per sample when absent.
    #[serde(default)]
    pub groups: Option<PathBuf>,
}

impl ClusterSection {
    pub fn feature_models(&self) -> FeatureModels {
        let mut models = FeatureModels::new();
        if let Some(gtf) = &self.gene_gtf {
            models = models.with_gene(gtf);
        }
        if let Some(gtf) = &self.te_gtf {
            models = models.with_te(gtf);
        }
        models
    }
}

fn resolve(base: &Path, path: &mut PathBuf) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn resolve_opt(base: &Path, path: &mut Option<PathBuf>) {
    if let Some(p) = path {
        resolve(base, p);
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| path.display().to_string())?;
        let mut config: RunConfig =
            toml::from_str(&text).with_context(|| format!("Error parsing {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        resolve(base, &mut self.sample_sheet);
        resolve_opt(base, &mut self.post_qc);
        resolve(base, &mut self.cluster_config);
        resolve_opt(base, &mut self.module_config);
        resolve(base, &mut self.paths.quant_root);
        resolve(base, &mut self.paths.merge_root);
        resolve(base, &mut self.paths.pipeline_root);
        if let Some(quantify) = &mut self.quantify {
            resolve(base, &mut quantify.index);
        }
        let cluster = &mut self.cluster;
        resolve_opt(base, &mut cluster.gene_gtf);
        resolve_opt(base, &mut cluster.te_gtf);
        resolve(base, &mut cluster.star_index);
        resolve_opt(base, &mut cluster.groups);
    }

    /// Where the filtered sample sheet is written.
    pub fn registered_sheet(&self) -> PathBuf {
        self.paths
            .pipeline_root
            .join(format!("samplesheet_registered_{}.tab", self.region))
    }
}

/// Read `group\tsample_id` rows into groups, in order of first appearance.
/// Lines starting with `#` are ignored.
pub fn read_groups(path: &Path) -> Result<Vec<Group>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .from_path(path)
        .with_context(|| path.display().to_string())?;

    let mut order = Vec::new();
    let mut members: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (i, row) in reader.records().enumerate() {
        let row = row.with_context(|| path.display().to_string())?;
        if row.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        let (Some(group), Some(sample_id), None) = (row.get(0), row.get(1), row.get(2)) else {
            bail!(
                "{}: row {}: expected 'group<TAB>sample_id'",
                path.display(),
                i + 1
            );
        };
        let group = group.trim().to_string();
        if !members.contains_key(&group) {
            order.push(group.clone());
        }
        members
            .entry(group)
            .or_default()
            .push(sample_id.trim().to_string());
    }
    Ok(order
        .into_iter()
        .map(|g| {
            let m = members.remove(&g).unwrap_or_default();
            Group::new(g, m)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use te_types::FeatureKind;

    const RUN: &str = r#"
region = "PUT"
sample_sheet = "register_ASAP_samples.tab"
post_qc = "input_postQC.txt"
cluster_config = "/site/lunarc_config.json"

[paths]
quant_root = "../1_counts"
merge_root = "../barcodes_microglia"
pipeline_root = "../trusTEr_output_microglia"

[quantify]
index = "/ref/refdata-gex-GRCh38-2020-A"
nuclei = ["AA_ASAP101_PUT"]

[cluster]
te_gtf = "hg38_HERVs_prediction.gtf"
star_index = "GRCh38_STAR"
memory_bytes = 132312156009
unique = true
"#;

    #[test]
    fn test_load_run_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run.toml");
        std::fs::write(&path, RUN)?;
        let config = RunConfig::load(&path)?;

        assert_eq!(config.region, "PUT");
        assert_eq!(config.sample_sheet, dir.path().join("register_ASAP_samples.tab"));
        assert_eq!(config.cluster_config, Path::new("/site/lunarc_config.json"));
        assert_eq!(config.paths.quant_root, dir.path().join("../1_counts"));
        assert!(config.merge);

        let quantify = config.quantify.as_ref().unwrap();
        assert_eq!(quantify.memory_gb, 64);
        assert_eq!(quantify.nuclei, vec!["AA_ASAP101_PUT"]);

        let cluster = &config.cluster;
        assert_eq!(cluster.mode, ProcessingMode::Merged);
        assert_eq!(cluster.max_jobs, 10);
        assert!(cluster.multi_subset && cluster.unique && !cluster.include_genes);
        let models = cluster.feature_models();
        assert_eq!(models.kinds().collect::<Vec<_>>(), vec![FeatureKind::TransposableElement]);
        assert_eq!(
            config.registered_sheet(),
            dir.path()
                .join("../trusTEr_output_microglia")
                .join("samplesheet_registered_PUT.tab")
        );
        Ok(())
    }

    #[test]
    fn test_unknown_keys_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run.toml");
        std::fs::write(&path, RUN.replace("unique = true", "uniq = true"))?;
        assert!(RunConfig::load(&path).is_err());
        Ok(())
    }

    #[test]
    fn test_read_groups() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("groups.tsv");
        std::fs::write(&path, "# group\tsample\nearly\tB\nlate\tC\nearly\tA\n\n")?;
        let groups = read_groups(&path)?;
        assert_eq!(
            groups,
            vec![Group::new("early", ["A", "B"]), Group::new("late", ["C"])]
        );

        std::fs::write(&path, "early\tA\tx\n")?;
        assert!(read_groups(&path).is_err());
        Ok(())
    }
}
