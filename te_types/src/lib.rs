// Warning groups (as of rust 1.55)
#![deny(
    future_incompatible,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2021_compatibility,
    rust_2018_idioms
)]
// Other warnings (as of rust 1.55)
#![deny(
    bindings_with_variant_name,
    confusable_idents,
    const_item_mutation,
    deprecated,
    drop_bounds,
    dyn_drop,
    elided_lifetimes_in_paths,
    irrefutable_let_patterns,
    non_shorthand_field_patterns,
    overlapping_range_endpoints,
    renamed_and_removed_lints,
    stable_features,
    trivial_bounds,
    type_alias_bounds,
    unconditional_recursion,
    unknown_lints,
    unused_comparisons,
    while_true
)]

pub mod config;
pub mod count_matrix;
pub mod csv_parser;
pub mod errors;
pub mod feature;
pub mod group;
pub mod sample;
pub mod sample_sheet;

pub use errors::PipelineError;
pub use feature::{FeatureKind, FeatureModels, ProcessingMode};
pub use group::Group;
pub use sample::{Sample, SampleRecord};

use anyhow::{ensure, Result};

/// Max allowed length of a sample or group identifier.
const MAX_ID_LEN: usize = 128;

/// Validate an identifier that will be used as a directory name.
/// A valid identifier contains only letters, digits, underscores, dashes and dots,
/// and does not start with a dot.
pub fn validate_identifier(id: &str) -> Result<()> {
    ensure!(!id.is_empty(), "identifier must not be empty");
    ensure!(
        id.len() <= MAX_ID_LEN,
        "identifier '{id}' must be {MAX_ID_LEN} characters or less"
    );
    ensure!(
        !id.starts_with('.'),
        "identifier '{id}' must not start with a dot"
    );
    ensure!(
        id.chars()
            .all(|c| matches!(c, '0'..='9' | 'A'..='Z' | 'a'..='z' | '_' | '-' | '.')),
        "identifier '{id}' must contain only letters, digits, underscores, dashes and dots"
    );
    Ok(())
}
