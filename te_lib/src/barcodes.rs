//! Reading filtered barcode lists and the merged barcode table.

use anyhow::{bail, Context, Result};
use flate2::read::MultiGzDecoder;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use te_types::Group;

const GZ_BUF_SIZE: usize = 1 << 20;

/// Open a (possibly gzipped) file into a BufReader.
fn open_with_gz(path: &Path) -> Result<Box<dyn BufRead>> {
    let f = File::open(path).with_context(|| path.display().to_string())?;
    if path.extension().is_some_and(|e| e == "gz") {
        Ok(Box::new(BufReader::with_capacity(
            GZ_BUF_SIZE,
            MultiGzDecoder::new(f),
        )))
    } else {
        Ok(Box::new(BufReader::with_capacity(32 * 1024, f)))
    }
}

/// One barcode per line, blank lines skipped.
pub fn read_barcodes(path: &Path) -> Result<Vec<String>> {
    let mut barcodes = Vec::new();
    for line in open_with_gz(path)?.lines() {
        let line = line.with_context(|| path.display().to_string())?;
        let bc = line.trim();
        if !bc.is_empty() {
            barcodes.push(bc.to_string());
        }
    }
    Ok(barcodes)
}

/// A `sample_id\tbarcode` row of the merged barcode table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CellBarcode {
    pub sample_id: String,
    pub barcode: String,
}

pub fn write_cell_barcodes<'a>(
    path: &Path,
    rows: impl IntoIterator<Item = &'a CellBarcode>,
) -> Result<()> {
    let file = File::create(path).with_context(|| path.display().to_string())?;
    let mut w = BufWriter::new(file);
    for row in rows {
        writeln!(w, "{}\t{}", row.sample_id, row.barcode)?;
    }
    w.flush()?;
    Ok(())
}

pub fn read_cell_barcodes(path: &Path) -> Result<Vec<CellBarcode>> {
    let mut rows = Vec::new();
    for (i, line) in open_with_gz(path)?.lines().enumerate() {
        let line = line.with_context(|| path.display().to_string())?;
        if line.trim().is_empty() {
            continue;
        }
        let Some((sample_id, barcode)) = line.split_once('\t') else {
            bail!(
                "{}:{}: expected 'sample_id<TAB>barcode', found '{line}'",
                path.display(),
                i + 1
            );
        };
        rows.push(CellBarcode {
            sample_id: sample_id.to_string(),
            barcode: barcode.trim().to_string(),
        });
    }
    Ok(rows)
}

/// Assign each row to the group containing its sample, in one pass.
/// Rows of samples outside every group are dropped. Every group gets an entry,
/// empty if none of its samples have barcodes.
pub fn partition_by_group<'a>(
    rows: &'a [CellBarcode],
    groups: &[Group],
) -> BTreeMap<String, Vec<&'a CellBarcode>> {
    let owner: BTreeMap<&str, &str> = groups
        .iter()
        .flat_map(|g| g.members.iter().map(move |m| (m.as_str(), g.name.as_str())))
        .collect();
    let mut parts: BTreeMap<String, Vec<&CellBarcode>> =
        groups.iter().map(|g| (g.name.clone(), Vec::new())).collect();
    for row in rows {
        if let Some(group) = owner.get(row.sample_id.as_str()) {
            if let Some(part) = parts.get_mut(*group) {
                part.push(row);
            }
        }
    }
    parts
}
