//! Combining quantified samples into one merged dataset directory.

use crate::barcodes::{read_barcodes, read_cell_barcodes, write_cell_barcodes, CellBarcode};
use crate::layout;
use crate::registry::SampleRegistry;
use anyhow::{Context, Result};
use itertools::Itertools;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use te_types::PipelineError;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MergedSample {
    pub sample_id: String,
    pub quantification_outdir: PathBuf,
    pub bam: PathBuf,
    pub barcodes: usize,
}

/// Describes what went into a merged dataset. Written as `manifest.json`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MergeManifest {
    pub region: String,
    pub samples: Vec<MergedSample>,
}

impl MergeManifest {
    pub fn read(merge_dir: &Path) -> Result<Self> {
        let path = merge_dir.join(layout::MERGE_MANIFEST);
        let file = File::open(&path).with_context(|| path.display().to_string())?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Error parsing {}", path.display()))
    }

    fn write(&self, merge_dir: &Path) -> Result<()> {
        let path = merge_dir.join(layout::MERGE_MANIFEST);
        let file = File::create(&path).with_context(|| path.display().to_string())?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn sample(&self, sample_id: &str) -> Option<&MergedSample> {
        self.samples.iter().find(|s| s.sample_id == sample_id)
    }

    /// The merged `sample_id\tbarcode` table next to this manifest.
    pub fn read_barcodes(merge_dir: &Path) -> Result<Vec<CellBarcode>> {
        read_cell_barcodes(&merge_dir.join(layout::MERGED_BARCODES))
    }
}

/// Holds the merge output directory of an experiment.
#[derive(Debug, Default)]
pub struct MergeStage {
    outdir: Option<PathBuf>,
}

impl MergeStage {
    pub fn outdir(&self) -> Option<&Path> {
        self.outdir.as_deref()
    }

    /// Set the merge output directory. Its parent is created if needed and
    /// must be writable.
    pub fn set_outdir(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let writable = fs::create_dir_all(&parent)
            .and_then(|()| tempfile::tempfile_in(&parent).map(drop));
        if let Err(e) = writable {
            return Err(PipelineError::configuration(format!(
                "merge output parent {} is not writable: {e}",
                parent.display()
            ))
            .into());
        }
        if let Some(previous) = &self.outdir {
            if *previous != path {
                warn!(
                    "merge output moves from {} to {}",
                    previous.display(),
                    path.display()
                );
            }
        }
        self.outdir = Some(path);
        Ok(())
    }

    /// Merge `sample_ids`, or every registered sample when empty, replacing
    /// any earlier merge in the output directory.
    pub fn merge(
        &self,
        registry: &SampleRegistry,
        region: &str,
        sample_ids: &[String],
    ) -> Result<MergeManifest> {
        let Some(outdir) = &self.outdir else {
            return Err(PipelineError::StageNotConfigured {
                stage: "merge",
                hint: "set the merge output directory first",
            }
            .into());
        };

        let ids: Vec<String> = if sample_ids.is_empty() {
            registry.ids().map(String::from).collect()
        } else {
            sample_ids.iter().unique().cloned().collect()
        };
        if let Some(unknown) = registry.missing(&ids).into_iter().next() {
            return Err(PipelineError::UnknownSample { sample_id: unknown }.into());
        }
        let incomplete: Vec<String> = ids
            .iter()
            .filter(|id| registry.get(id).is_some_and(|s| !s.is_quantified()))
            .cloned()
            .collect();
        if !incomplete.is_empty() {
            return Err(PipelineError::IncompleteQuantification {
                sample_ids: incomplete,
            }
            .into());
        }

        let mut rows = Vec::new();
        let mut manifest = MergeManifest {
            region: region.to_string(),
            samples: Vec::with_capacity(ids.len()),
        };
        for id in &ids {
            let sample = registry.require(id)?;
            let Some(quant) = &sample.quantification_outdir else {
                continue;
            };
            let barcodes_path = layout::filtered_barcodes(quant);
            PipelineError::require_path(&barcodes_path, "filtered barcodes")?;
            let barcodes = read_barcodes(&barcodes_path)?;
            manifest.samples.push(MergedSample {
                sample_id: id.clone(),
                quantification_outdir: quant.clone(),
                bam: layout::quant_bam(quant),
                barcodes: barcodes.len(),
            });
            rows.extend(barcodes.into_iter().map(|barcode| CellBarcode {
                sample_id: id.clone(),
                barcode,
            }));
        }

        replace_dir(outdir, |dir| {
            write_cell_barcodes(&dir.join(layout::MERGED_BARCODES), &rows)?;
            manifest.write(dir)
        })?;
        info!(
            "merged {} samples ({} barcodes) into {}",
            manifest.samples.len(),
            rows.len(),
            outdir.display()
        );
        Ok(manifest)
    }
}

/// Build a directory next to `target` with `fill`, then swap it into place.
fn replace_dir(target: &Path, fill: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "merge".to_string());
    let staging = target.with_file_name(format!(".{name}.partial"));
    if staging.exists() {
        fs::remove_dir_all(&staging).with_context(|| staging.display().to_string())?;
    }
    fs::create_dir_all(&staging).with_context(|| staging.display().to_string())?;
    if let Err(e) = fill(&staging) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }
    if target.exists() {
        fs::remove_dir_all(target).with_context(|| target.display().to_string())?;
    }
    fs::rename(&staging, target)
        .with_context(|| format!("moving {} to {}", staging.display(), target.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use te_types::SampleRecord;

    fn quantified(root: &Path, id: &str, barcodes: &[&str]) -> PathBuf {
        let dir = root.join(id);
        let bc = dir.join(layout::FILTERED_BARCODES[1]);
        fs::create_dir_all(bc.parent().unwrap()).unwrap();
        fs::write(&bc, barcodes.join("\n")).unwrap();
        dir
    }

    #[test]
    fn test_merge_replaces_previous_output() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut registry = SampleRegistry::new();
        registry.register([SampleRecord::new("A", "PUT"), SampleRecord::new("B", "PUT")])?;
        registry.set_quantification_outdir("A", quantified(dir.path(), "A", &["AAAC-1", "GGGT-1"]))?;
        registry.set_quantification_outdir("B", quantified(dir.path(), "B", &["AAAC-1"]))?;

        let mut stage = MergeStage::default();
        let outdir = dir.path().join("merged").join("PUT");
        stage.set_outdir(&outdir)?;
        fs::create_dir_all(&outdir)?;
        fs::write(outdir.join("stale.txt"), "")?;

        let manifest = stage.merge(&registry, "PUT", &[])?;
        assert_eq!(manifest.samples.len(), 2);
        assert_eq!(manifest.sample("A").unwrap().barcodes, 2);
        assert!(!outdir.join("stale.txt").exists());
        assert_eq!(MergeManifest::read(&outdir)?, manifest);
        assert_eq!(MergeManifest::read_barcodes(&outdir)?.len(), 3);

        let manifest = stage.merge(&registry, "PUT", &["B".to_string()])?;
        assert_eq!(manifest.samples.len(), 1);
        assert_eq!(MergeManifest::read_barcodes(&outdir)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_merge_repeated_ids() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut registry = SampleRegistry::new();
        registry.register([SampleRecord::new("A", "PUT"), SampleRecord::new("B", "PUT")])?;
        registry.set_quantification_outdir("A", quantified(dir.path(), "A", &["AAAC-1", "GGGT-1"]))?;
        registry.set_quantification_outdir("B", quantified(dir.path(), "B", &["AAAC-1"]))?;

        let mut stage = MergeStage::default();
        let outdir = dir.path().join("merged");
        stage.set_outdir(&outdir)?;
        let ids = ["A", "B", "A"].map(String::from);
        let manifest = stage.merge(&registry, "PUT", &ids)?;
        assert_eq!(
            manifest.samples.iter().map(|s| s.sample_id.as_str()).collect::<Vec<_>>(),
            vec!["A", "B"]
        );
        assert_eq!(MergeManifest::read_barcodes(&outdir)?.len(), 3);
        Ok(())
    }

    #[test]
    fn test_merge_preconditions() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut registry = SampleRegistry::new();
        registry.register(["A", "B", "C"].map(|id| SampleRecord::new(id, "PUT")))?;

        let mut stage = MergeStage::default();
        let err = stage.merge(&registry, "PUT", &[]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::StageNotConfigured { .. })
        ));

        stage.set_outdir(dir.path().join("merged"))?;
        let err = stage.merge(&registry, "PUT", &[]).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PipelineError>(),
            Some(&PipelineError::IncompleteQuantification {
                sample_ids: vec!["A".to_string(), "B".to_string(), "C".to_string()]
            })
        );

        let err = stage
            .merge(&registry, "PUT", &["A".to_string(), "Z".to_string()])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::UnknownSample { sample_id }) if sample_id == "Z"
        ));
        assert!(!dir.path().join("merged").exists());
        Ok(())
    }

    #[test]
    fn test_unwritable_parent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not_a_dir");
        fs::write(&file, "").unwrap();
        let mut stage = MergeStage::default();
        let err = stage.set_outdir(file.join("merged")).unwrap_err();
        assert!(err.downcast_ref::<PipelineError>().unwrap().is_configuration());
        assert!(stage.outdir().is_none());
    }
}
