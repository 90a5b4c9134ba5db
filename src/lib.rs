//! Signal intelligence for property portfolios.
//!
//! Events are classified into signals and folded into one materialized
//! summary per entity in O(1). Scheduled batch cycles add statistical
//! context (baselines, trends, control charts, seasonal and cohort
//! positions, absence scans). On any trigger the router picks a capability
//! tier, the context assembler packs a budgeted packet and the cost guard
//! admits or defers the call.

pub mod analysis;
pub mod capability;
pub mod context;
pub mod cost;
pub mod db;
pub mod entity;
pub mod error;
mod migrations;
pub mod pipeline;
pub mod presets;
pub mod routing;
pub mod signals;
pub mod store;
pub mod types;

pub use error::{PipelineError, ValidationError};
pub use pipeline::SignalPipeline;
