//! Tab-separated sample sheets and post-QC sample lists.

use crate::csv_parser::CsvParser;
use crate::sample::SampleRecord;
use anyhow::{bail, Context, Result};
use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

const SAMPLE_ID: &str = "sample_id";
const REGION: &str = "region";
const IS_NUCLEI: &str = "is_nuclei";
/// Either of these columns points at the sample's FASTQ directory.
const FASTQ_COLUMNS: [&str; 2] = ["fastq_dir", "rawdata_path"];

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "t" | "y" => Some(true),
        "false" | "no" | "0" | "f" | "n" => Some(false),
        _ => None,
    }
}

/// Read a tab-separated sample sheet. `sample_id` and `region` are required, duplicated sample
/// ids are rejected, every other named column is kept as metadata.
pub fn read_sample_sheet(path: &Path) -> Result<Vec<SampleRecord>> {
    let mut parser = CsvParser::new(path, b'\t', [SAMPLE_ID, REGION], "sample sheet")
        .with_context(|| format!("Error opening sample sheet: {}", path.display()))?;

    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(parser.len());
    for i in 0..parser.len() {
        parser.set_line(i);
        let sample_id = parser.require_string(SAMPLE_ID)?;
        if !seen.insert(sample_id.clone()) {
            bail!(
                "Duplicate sample_id '{sample_id}' on line {} of sample sheet {}",
                i + 1,
                path.display()
            );
        }
        let is_nuclei = match parser.try_get_string(IS_NUCLEI) {
            None => false,
            Some(v) => match parse_bool(&v) {
                Some(b) => b,
                None => bail!(
                    "Error in sample sheet '{}'. On line {} in '{IS_NUCLEI}' column: \
                     Expected true or false but received '{v}'",
                    path.display(),
                    i + 1
                ),
            },
        };
        let fastq_dir = FASTQ_COLUMNS
            .iter()
            .find_map(|col| parser.try_get_string(col))
            .map(PathBuf::from);

        let mut ignore = vec![SAMPLE_ID, REGION, IS_NUCLEI];
        ignore.extend(FASTQ_COLUMNS);
        records.push(SampleRecord {
            sample_id,
            region: parser.require_string(REGION)?,
            is_nuclei,
            fastq_dir,
            metadata: parser.get_extra_data(&ignore),
        });
    }
    Ok(records)
}

/// Write records back out in the same tab-separated layout.
pub fn write_sample_sheet(path: &Path, records: &[SampleRecord]) -> Result<()> {
    let metadata_cols: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.metadata.keys().map(String::as_str))
        .collect();

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .with_context(|| path.display().to_string())?;

    let mut header = vec![SAMPLE_ID, REGION, IS_NUCLEI, FASTQ_COLUMNS[0]];
    header.extend(metadata_cols.iter().copied());
    writer.write_record(&header)?;

    for r in records {
        let mut row = vec![
            r.sample_id.clone(),
            r.region.clone(),
            r.is_nuclei.to_string(),
            r.fastq_dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        ];
        row.extend(
            metadata_cols
                .iter()
                .map(|c| r.metadata.get(*c).cloned().unwrap_or_default()),
        );
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a plain list of sample ids, one per line. Blank lines are ignored.
pub fn read_id_list(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| path.display().to_string())?;
    let mut ids = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| path.display().to_string())?;
        let id = line.trim();
        if !id.is_empty() {
            ids.push(id.to_string());
        }
    }
    Ok(ids)
}

/// Filters applied to a sample sheet before registration.
#[derive(Debug, Clone, Default)]
pub struct SampleFilter<'a> {
    /// Keep only this region.
    pub region: Option<&'a str>,
    /// Keep only samples that passed QC. `None` keeps everything.
    pub passed_qc: Option<&'a [String]>,
    /// Drop samples whose id starts with any of these prefixes.
    pub exclude_prefixes: &'a [String],
}

impl SampleFilter<'_> {
    pub fn keep(&self, record: &SampleRecord) -> bool {
        self.region.map_or(true, |r| record.region == r)
            && self
                .passed_qc
                .map_or(true, |ids| ids.iter().any(|id| *id == record.sample_id))
            && !self
                .exclude_prefixes
                .iter()
                .any(|p| record.sample_id.starts_with(p.as_str()))
    }

    /// Apply the filter, preserving sample sheet order.
    pub fn apply(&self, records: Vec<SampleRecord>) -> Vec<SampleRecord> {
        records.into_iter().filter(|r| self.keep(r)).collect()
    }
}
