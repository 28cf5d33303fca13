//! Per-group feature count tables.

use anyhow::{bail, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Feature counts for one column (a group, or a sample within a group).
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct CountMatrix {
    pub column: String,
    pub counts: BTreeMap<String, u64>,
}

impl CountMatrix {
    pub fn new(column: impl ToString) -> Self {
        CountMatrix {
            column: column.to_string(),
            counts: BTreeMap::new(),
        }
    }

    /// Parse the raw output of a counting tool. Lines starting with `#` and the
    /// header line are skipped. The first field is the feature id and the last
    /// field is its count, which covers both TEcount `.cntTable` files and
    /// featureCounts tables.
    pub fn read_raw(path: &Path, column: impl ToString) -> Result<Self> {
        let file = File::open(path).with_context(|| path.display().to_string())?;
        let mut matrix = CountMatrix::new(column);
        let mut seen_header = false;
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| path.display().to_string())?;
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }
            if !seen_header {
                seen_header = true;
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 2 {
                bail!(
                    "{}:{}: expected at least 2 tab-separated fields, found {}",
                    path.display(),
                    i + 1,
                    fields.len()
                );
            }
            let feature = fields[0].trim_matches('"');
            let last = fields[fields.len() - 1].trim();
            let count: u64 = last
                .parse()
                .with_context(|| format!("{}:{}: bad count '{last}'", path.display(), i + 1))?;
            *matrix.counts.entry(feature.to_string()).or_default() += count;
        }
        Ok(matrix)
    }

    /// Write a two-column `feature\t<column>` table.
    pub fn write_tsv(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| path.display().to_string())?;
        let mut w = BufWriter::new(file);
        writeln!(w, "feature\t{}", self.column)?;
        for (feature, count) in &self.counts {
            writeln!(w, "{feature}\t{count}")?;
        }
        w.flush()?;
        Ok(())
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Remove every feature that `other` also counts and return how many
    /// rows were removed.
    pub fn remove_features_of(&mut self, other: &CountMatrix) -> usize {
        let before = self.counts.len();
        self.counts.retain(|feature, _| !other.counts.contains_key(feature));
        before - self.counts.len()
    }

    /// Copy every row of `other` into this matrix. Where both define a feature
    /// the row from `other` replaces this one.
    pub fn merge_rows_from(&mut self, other: &CountMatrix) {
        for (feature, &count) in &other.counts {
            if let Some(previous) = self.counts.insert(feature.clone(), count) {
                warn!(
                    "feature '{feature}' in column '{}' counted twice ({previous} and {count}), keeping {count}",
                    self.column
                );
            }
        }
    }
}
