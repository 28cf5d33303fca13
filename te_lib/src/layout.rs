//! Where each stage reads and writes on disk.

use std::path::{Path, PathBuf};
use te_types::FeatureKind;

/// Position-sorted BAM written by `cellranger count`.
pub const QUANT_BAM: &str = "outs/possorted_genome_bam.bam";

/// Filtered barcodes written by `cellranger count`, gzipped or plain.
pub const FILTERED_BARCODES: [&str; 2] = [
    "outs/filtered_feature_bc_matrix/barcodes.tsv.gz",
    "outs/filtered_feature_bc_matrix/barcodes.tsv",
];

pub const MERGED_BARCODES: &str = "barcodes.tsv";
pub const MERGE_MANIFEST: &str = "manifest.json";

/// Final count table name inside each counts directory.
pub const COUNTS_FILE: &str = "counts.tsv";

pub fn quant_bam(quant_outdir: &Path) -> PathBuf {
    quant_outdir.join(QUANT_BAM)
}

/// The filtered barcodes file that exists, preferring the gzipped one.
/// Falls back to the gzipped path when neither exists.
pub fn filtered_barcodes(quant_outdir: &Path) -> PathBuf {
    FILTERED_BARCODES
        .iter()
        .map(|f| quant_outdir.join(f))
        .find(|p| p.exists())
        .unwrap_or_else(|| quant_outdir.join(FILTERED_BARCODES[0]))
}

/// Directory and file layout of one cluster processing unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitLayout {
    pub dir: PathBuf,
}

impl UnitLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        UnitLayout { dir: dir.into() }
    }

    /// `sample_id\tbarcode` rows assigned to this unit.
    pub fn barcodes(&self) -> PathBuf {
        self.dir.join("barcodes.tsv")
    }

    pub fn subset_dir(&self) -> PathBuf {
        self.dir.join("subset")
    }

    /// Subset BAM holding this unit's reads from one source sample.
    pub fn subset_bam(&self, sample_id: &str) -> PathBuf {
        self.subset_dir().join(format!("{sample_id}.bam"))
    }

    /// Routes file for subsetting one source sample within this unit's job.
    pub fn routes(&self, sample_id: &str) -> PathBuf {
        self.subset_dir().join(format!("{sample_id}.routes.tsv"))
    }

    pub fn merged_bam(&self) -> PathBuf {
        self.dir.join("merged.bam")
    }

    pub fn fastq(&self) -> PathBuf {
        self.dir.join("reads.fastq")
    }

    pub fn star_prefix(&self) -> PathBuf {
        self.dir.join("star").join("")
    }

    pub fn star_bam(&self) -> PathBuf {
        self.dir.join("star").join("Aligned.sortedByCoord.out.bam")
    }

    pub fn counts_dir(&self, kind: FeatureKind) -> PathBuf {
        self.dir.join(kind.counts_dir())
    }

    /// Raw table written by the counting tool for `kind`.
    pub fn raw_counts(&self, kind: FeatureKind) -> PathBuf {
        match kind {
            FeatureKind::Gene => self.counts_dir(kind).join("raw_counts.tsv"),
            FeatureKind::TransposableElement => self.counts_dir(kind).join("raw.cntTable"),
        }
    }

    pub fn counts(&self, kind: FeatureKind) -> PathBuf {
        self.counts_dir(kind).join(COUNTS_FILE)
    }
}
