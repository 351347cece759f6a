//! Pipeline entry points.
//!
//! - `run_harvest`: Search packages and write the dated snapshot
//! - `run_aggregate`: Fold snapshots into count rows and load them
//! - `run_pipeline`: Harvest then aggregate the new snapshot
//! - `run_validate`: Check configuration before a run

pub mod aggregate;
pub mod harvest;
#[allow(clippy::module_inception)]
pub mod pipeline;
pub mod validate;

pub use aggregate::{AggregateOutcome, Aggregator, run_aggregate};
pub use harvest::{
    HarvestCoordinator, HarvestOptions, HarvestOutcome, HarvestReport, harvest_with, run_harvest,
};
pub use pipeline::{PipelineReport, pipeline_with, run_pipeline};
pub use validate::run_validate;
