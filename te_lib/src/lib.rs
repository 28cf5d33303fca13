//! Sample registration and the quantification, merge and cluster processing
//! stages of the TE counting pipeline.

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

pub mod barcodes;
mod experiment;
pub mod layout;
mod registry;
pub mod stages;
pub mod subset;

pub use experiment::Experiment;
pub use registry::SampleRegistry;
pub use stages::cluster::{ClusterParams, ClusterResults, UnitKey, UnitOutcome};
pub use stages::merge::{MergeManifest, MergeStage};
pub use stages::quantify::QuantifyParams;
