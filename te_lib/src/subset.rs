//! Split a BAM file into per-group BAM files by cell barcode.
//!
//! A routes file maps each barcode to the output BAM its reads belong in, so a
//! single scan of the input serves any number of groups.

use anyhow::{bail, Context, Result};
use fxhash::FxHashMap;
use log::info;
use rust_htslib::bam::record::Aux;
use rust_htslib::bam::{self, Read, Record};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const BARCODE_TAG: &[u8] = b"CB";
const HITS_TAG: &[u8] = b"NH";
/// STAR's MAPQ for uniquely mapped reads.
const UNIQUE_MAPQ: u8 = 255;

/// Barcode to output BAM assignments for one input BAM.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Routes {
    by_barcode: FxHashMap<Vec<u8>, usize>,
    outputs: Vec<PathBuf>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `barcode` to `output`. A barcode routed twice keeps its first output.
    pub fn add(&mut self, barcode: &str, output: &Path) -> bool {
        let idx = match self.outputs.iter().position(|o| o == output) {
            Some(i) => i,
            None => {
                self.outputs.push(output.to_path_buf());
                self.outputs.len() - 1
            }
        };
        if self.by_barcode.contains_key(barcode.as_bytes()) {
            return false;
        }
        self.by_barcode.insert(barcode.as_bytes().to_vec(), idx);
        true
    }

    pub fn outputs(&self) -> &[PathBuf] {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.by_barcode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_barcode.is_empty()
    }

    fn output_for(&self, barcode: &[u8]) -> Option<usize> {
        self.by_barcode.get(barcode).copied()
    }

    /// Read `barcode\toutput` lines.
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| path.display().to_string())?;
        let mut routes = Routes::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| path.display().to_string())?;
            if line.trim().is_empty() {
                continue;
            }
            let Some((barcode, output)) = line.split_once('\t') else {
                bail!(
                    "{}:{}: expected 'barcode<TAB>output', found '{line}'",
                    path.display(),
                    i + 1
                );
            };
            if !routes.add(barcode, Path::new(output)) {
                bail!("{}:{}: barcode {barcode} is routed twice", path.display(), i + 1);
            }
        }
        Ok(routes)
    }

    /// Write routes sorted by output, then barcode.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| parent.display().to_string())?;
        }
        let mut rows: Vec<_> = self.by_barcode.iter().map(|(bc, &i)| (i, bc)).collect();
        rows.sort();
        let file = File::create(path).with_context(|| path.display().to_string())?;
        let mut w = BufWriter::new(file);
        for (i, bc) in rows {
            writeln!(
                w,
                "{}\t{}",
                String::from_utf8_lossy(bc),
                self.outputs[i].display()
            )?;
        }
        w.flush()?;
        Ok(())
    }
}

/// Per-run read counts.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubsetStats {
    pub total: u64,
    pub no_barcode: u64,
    pub unrouted: u64,
    pub not_unique: u64,
    pub written: BTreeMap<PathBuf, u64>,
}

fn aux_int(aux: Aux<'_>) -> Option<i64> {
    match aux {
        Aux::I8(v) => Some(v.into()),
        Aux::U8(v) => Some(v.into()),
        Aux::I16(v) => Some(v.into()),
        Aux::U16(v) => Some(v.into()),
        Aux::I32(v) => Some(v.into()),
        Aux::U32(v) => Some(v.into()),
        _ => None,
    }
}

/// True for a primary alignment whose read maps to a single locus.
fn is_unique(rec: &Record) -> bool {
    if rec.is_secondary() {
        return false;
    }
    match rec.aux(HITS_TAG).ok().and_then(aux_int) {
        Some(hits) => hits <= 1,
        None => rec.mapq() == UNIQUE_MAPQ,
    }
}

fn barcode(rec: &Record) -> Option<&[u8]> {
    match rec.aux(BARCODE_TAG) {
        Ok(Aux::String(bc)) => Some(bc.as_bytes()),
        _ => None,
    }
}

/// Write every read of `input` whose barcode is routed to that route's output.
/// With `unique_only`, multi-mapped and secondary alignments are dropped.
/// Every output is created, even if no read goes to it.
pub fn subset_bam(input: &Path, routes: &Routes, unique_only: bool) -> Result<SubsetStats> {
    let mut reader =
        bam::Reader::from_path(input).with_context(|| input.display().to_string())?;
    let header = bam::Header::from_template(reader.header());

    let mut writers = Vec::with_capacity(routes.outputs().len());
    for out in routes.outputs() {
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent).with_context(|| parent.display().to_string())?;
        }
        writers.push(
            bam::Writer::from_path(out, &header, bam::Format::Bam)
                .with_context(|| out.display().to_string())?,
        );
    }

    let mut stats = SubsetStats::default();
    let mut written = vec![0u64; writers.len()];
    for r in reader.records() {
        let rec = r.with_context(|| input.display().to_string())?;
        stats.total += 1;
        let Some(bc) = barcode(&rec) else {
            stats.no_barcode += 1;
            continue;
        };
        let Some(idx) = routes.output_for(bc) else {
            stats.unrouted += 1;
            continue;
        };
        if unique_only && !is_unique(&rec) {
            stats.not_unique += 1;
            continue;
        }
        writers[idx].write(&rec)?;
        written[idx] += 1;
    }
    // close every BAM before reporting
    drop(writers);

    stats.written = routes.outputs().iter().cloned().zip(written).collect();
    info!(
        "{}: {} reads, {} without barcode, {} unrouted, {} not unique, {} written to {} files",
        input.display(),
        stats.total,
        stats.no_barcode,
        stats.unrouted,
        stats.not_unique,
        stats.written.values().sum::<u64>(),
        stats.written.len()
    );
    Ok(stats)
}
