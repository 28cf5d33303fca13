use anyhow::Result;
use log::{info, warn};
use std::collections::BTreeMap;
use std::path::PathBuf;
use te_types::{PipelineError, Sample, SampleRecord};

/// The samples of one experiment, keyed by sample id.
///
/// Registration is an upsert: registering an id again overwrites its
/// attributes but keeps its recorded quantification output.
#[derive(Debug, Default)]
pub struct SampleRegistry {
    samples: BTreeMap<String, Sample>,
}

impl SampleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update every record. Returns the ids in input order.
    pub fn register(&mut self, records: impl IntoIterator<Item = SampleRecord>) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for record in records {
            te_types::validate_identifier(&record.sample_id)
                .map_err(|e| PipelineError::configuration(format!("sample id: {e}")))?;
            let id = record.sample_id.clone();
            match self.samples.get_mut(&id) {
                Some(existing) => existing.update_from(record),
                None => {
                    self.samples.insert(id.clone(), Sample::from_record(record));
                }
            }
            ids.push(id);
        }
        info!("registered {} samples ({} total)", ids.len(), self.samples.len());
        Ok(ids)
    }

    /// Record where a sample's quantification output lives.
    pub fn set_quantification_outdir(&mut self, sample_id: &str, path: PathBuf) -> Result<()> {
        let sample = self
            .samples
            .get_mut(sample_id)
            .ok_or_else(|| PipelineError::UnknownSample {
                sample_id: sample_id.to_string(),
            })?;
        if let Some(previous) = &sample.quantification_outdir {
            if *previous != path {
                warn!(
                    "{sample_id}: quantification output moves from {} to {}",
                    previous.display(),
                    path.display()
                );
            }
        }
        sample.quantification_outdir = Some(path);
        Ok(())
    }

    pub fn get(&self, sample_id: &str) -> Option<&Sample> {
        self.samples.get(sample_id)
    }

    /// Look up a sample, failing with `UnknownSample`.
    pub fn require(&self, sample_id: &str) -> Result<&Sample, PipelineError> {
        self.samples
            .get(sample_id)
            .ok_or_else(|| PipelineError::UnknownSample {
                sample_id: sample_id.to_string(),
            })
    }

    pub fn contains(&self, sample_id: &str) -> bool {
        self.samples.contains_key(sample_id)
    }

    /// Samples matching `pred`, in id order.
    pub fn list_samples<'a, F>(&'a self, pred: F) -> impl Iterator<Item = &'a Sample> + 'a
    where
        F: Fn(&Sample) -> bool + 'a,
    {
        self.samples.values().filter(move |s| pred(s))
    }

    /// The ids in `ids` that are not registered, in input order.
    pub fn missing<'a, S: AsRef<str>>(&self, ids: impl IntoIterator<Item = &'a S>) -> Vec<String>
    where
        S: 'a,
    {
        ids.into_iter()
            .map(|id| id.as_ref())
            .filter(|id| !self.contains(id))
            .map(String::from)
            .collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.samples.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_register_is_an_upsert() -> Result<()> {
        let mut registry = SampleRegistry::new();
        registry.register([SampleRecord::new("A", "PUT"), SampleRecord::new("B", "PUT")])?;
        registry.set_quantification_outdir("A", PathBuf::from("/counts/A"))?;
        registry.register([SampleRecord::new("A", "PUT").nuclei(true)])?;

        assert_eq!(registry.len(), 2);
        let a = registry.require("A")?;
        assert!(a.is_nuclei);
        assert_eq!(a.quantification_outdir, Some(PathBuf::from("/counts/A")));
        Ok(())
    }

    #[test]
    fn test_unknown_sample() {
        let mut registry = SampleRegistry::new();
        let err = registry
            .set_quantification_outdir("Z", PathBuf::from("/counts/Z"))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<PipelineError>(),
            Some(&PipelineError::UnknownSample {
                sample_id: "Z".to_string()
            })
        );
        assert!(registry.register([SampleRecord::new("bad/id", "PUT")]).is_err());
    }

    #[test]
    fn test_list_and_missing() -> Result<()> {
        let mut registry = SampleRegistry::new();
        registry.register([
            SampleRecord::new("A", "PUT"),
            SampleRecord::new("B", "PUT").nuclei(true),
            SampleRecord::new("C", "PUT"),
        ])?;
        let nuclei: Vec<_> = registry.list_samples(|s| s.is_nuclei).map(|s| &s.id).collect();
        assert_eq!(nuclei, vec!["B"]);
        let wanted = ["A".to_string(), "D".to_string(), "E".to_string()];
        assert_eq!(registry.missing(&wanted), vec!["D", "E"]);
        Ok(())
    }
}
