//! taxaline-transform: Raw records to normalized taxa
//!
//! A [`Pipeline`] of named steps turns each raw record into a
//! [`NormalizedTaxon`], enriched from reference collections through an
//! [`EnrichmentIndex`]. [`Transformer`] runs it over the raw collection in
//! batches, skipping records already current for the configured version.

pub mod enrich;
pub mod pipeline;
pub mod runner;
pub mod steps;
pub mod taxon;

pub use enrich::{normalize_name, EnrichmentIndex, EnrichmentSource};
pub use pipeline::{Pipeline, PipelineOutcome, StepError, StepResult};
pub use runner::{TransformConfig, TransformSummary, Transformer, PIPELINE, RAW_STATUS_TOO_LARGE};
pub use steps::{taxon_pipeline, StepContext, RELATED_NAME_MISSING};
pub use taxon::{
    ConservationFact, DistributionEntry, NormalizedTaxon, SourceRef, TransformDoc, VernacularName,
};
