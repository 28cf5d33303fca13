//! Samples registered in an experiment.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

/// One row of a filtered sample sheet, as handed to registration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct SampleRecord {
    pub sample_id: String,
    pub region: String,
    /// Single-nucleus preparation. Changes the quantification flags only.
    #[serde(default)]
    pub is_nuclei: bool,
    /// Directory holding the raw FASTQs, required for quantification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fastq_dir: Option<PathBuf>,
    /// Any other sample sheet columns.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl SampleRecord {
    pub fn new(sample_id: impl ToString, region: impl ToString) -> Self {
        SampleRecord {
            sample_id: sample_id.to_string(),
            region: region.to_string(),
            ..Default::default()
        }
    }

    pub fn nuclei(mut self, is_nuclei: bool) -> Self {
        self.is_nuclei = is_nuclei;
        self
    }

    pub fn with_fastq_dir(mut self, fastq_dir: impl Into<PathBuf>) -> Self {
        self.fastq_dir = Some(fastq_dir.into());
        self
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Sample {
    pub id: String,
    pub region: String,
    pub is_nuclei: bool,
    pub fastq_dir: Option<PathBuf>,
    pub metadata: BTreeMap<String, String>,
    pub registered_at: SystemTime,
    pub quantification_outdir: Option<PathBuf>,
}

impl Sample {
    pub fn from_record(record: SampleRecord) -> Self {
        Sample {
            id: record.sample_id,
            region: record.region,
            is_nuclei: record.is_nuclei,
            fastq_dir: record.fastq_dir,
            metadata: record.metadata,
            registered_at: SystemTime::now(),
            quantification_outdir: None,
        }
    }

    /// Overwrite the registration attributes, keeping the registration time and
    /// any recorded quantification output.
    pub fn update_from(&mut self, record: SampleRecord) {
        self.region = record.region;
        self.is_nuclei = record.is_nuclei;
        if record.fastq_dir.is_some() {
            self.fastq_dir = record.fastq_dir;
        }
        self.metadata.extend(record.metadata);
    }

    pub fn is_quantified(&self) -> bool {
        self.quantification_outdir.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_keeps_outdir_and_merges_metadata() {
        let mut record = SampleRecord::new("A", "PUT");
        record.metadata.insert("batch".into(), "1".into());
        let mut sample = Sample::from_record(record);
        sample.quantification_outdir = Some(PathBuf::from("/counts/A"));
        let registered_at = sample.registered_at;

        let mut update = SampleRecord::new("A", "PUT").nuclei(true);
        update.metadata.insert("donor".into(), "d1".into());
        sample.update_from(update);

        assert!(sample.is_nuclei);
        assert_eq!(sample.registered_at, registered_at);
        assert_eq!(sample.quantification_outdir, Some(PathBuf::from("/counts/A")));
        assert_eq!(sample.metadata.len(), 2);
    }
}
