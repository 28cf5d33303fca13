//! Feature annotations and processing modes for cluster-level counting.

use crate::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// The kind of countable feature an annotation defines.
#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FeatureKind {
    /// Gene model, e.g. a GENCODE GTF.
    Gene,
    /// Transposable-element model, e.g. a RepeatMasker derived GTF.
    #[strum(to_string = "te", serialize = "transposable_element")]
    #[serde(rename = "te", alias = "transposable_element")]
    TransposableElement,
}

impl FeatureKind {
    /// Name of the per-group output directory holding this kind's counts.
    pub fn counts_dir(self) -> &'static str {
        match self {
            FeatureKind::Gene => "gene_counts",
            FeatureKind::TransposableElement => "te_counts",
        }
    }
}

/// Named feature annotations. Each kind is an independent named input; there is
/// no positional "primary" annotation.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct FeatureModels(BTreeMap<FeatureKind, PathBuf>);

impl FeatureModels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: FeatureKind, path: impl Into<PathBuf>) -> Self {
        self.0.insert(kind, path.into());
        self
    }

    pub fn with_gene(self, path: impl Into<PathBuf>) -> Self {
        self.with(FeatureKind::Gene, path)
    }

    pub fn with_te(self, path: impl Into<PathBuf>) -> Self {
        self.with(FeatureKind::TransposableElement, path)
    }

    pub fn get(&self, kind: FeatureKind) -> Option<&Path> {
        self.0.get(&kind).map(PathBuf::as_path)
    }

    pub fn has(&self, kind: FeatureKind) -> bool {
        self.0.contains_key(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FeatureKind, &Path)> + '_ {
        self.0.iter().map(|(k, p)| (*k, p.as_path()))
    }

    pub fn kinds(&self) -> impl Iterator<Item = FeatureKind> + '_ {
        self.0.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// At least one model must be given and every model must exist on disk.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.is_empty() {
            return Err(PipelineError::configuration(
                "at least one feature model (gene or te) is required",
            ));
        }
        for (kind, path) in self.iter() {
            let what = match kind {
                FeatureKind::Gene => "gene model",
                FeatureKind::TransposableElement => "TE model",
            };
            PipelineError::require_path(path, what)?;
        }
        Ok(())
    }
}

/// Whether cluster processing runs against the merged dataset or against each
/// sample's own quantification output.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProcessingMode {
    #[default]
    Merged,
    PerSample,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_feature_kind_names() {
        assert_eq!(FeatureKind::Gene.to_string(), "gene");
        assert_eq!(FeatureKind::from_str("te").unwrap(), FeatureKind::TransposableElement);
        assert_eq!(
            FeatureKind::from_str("transposable_element").unwrap(),
            FeatureKind::TransposableElement
        );
        assert_eq!(FeatureKind::TransposableElement.counts_dir(), "te_counts");
        assert_eq!(ProcessingMode::from_str("per_sample").unwrap(), ProcessingMode::PerSample);
        assert_eq!(ProcessingMode::Merged.to_string(), "merged");
    }

    #[test]
    fn test_models_serde() {
        let models: FeatureModels =
            serde_json::from_str(r#"{"gene": "/a/genes.gtf", "te": "/a/rmsk.gtf"}"#).unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models.get(FeatureKind::Gene), Some(Path::new("/a/genes.gtf")));
        assert_eq!(
            models.kinds().collect::<Vec<_>>(),
            vec![FeatureKind::Gene, FeatureKind::TransposableElement]
        );
    }

    #[test]
    fn test_validate() {
        assert!(FeatureModels::new().validate().is_err());
        let dir = tempfile::tempdir().unwrap();
        let gtf = dir.path().join("genes.gtf");
        std::fs::write(&gtf, "").unwrap();
        assert!(FeatureModels::new().with_gene(&gtf).validate().is_ok());
        let err = FeatureModels::new()
            .with_gene(&gtf)
            .with_te(dir.path().join("missing.gtf"))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("TE model"));
    }
}
