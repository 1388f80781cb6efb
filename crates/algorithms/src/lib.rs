//! # Hydrotile Algorithms
//!
//! Hydrological analysis of Digital Elevation Models, tiled so that
//! rasters larger than RAM are processed in a fixed number of passes.
//!
//! Stages (each with an in-memory core and a tiled variant where the
//! dependency structure is global):
//! - **fill**: Priority-Flood depression filling (Barnes 2014/2016)
//! - **breach**: least-cost breaching of single and multi-cell pits
//! - **flow_direction**: D8 steepest descent
//! - **flats**: drainage over flat surfaces (Barnes 2014, Zhou 2021 tiled)
//! - **accumulation**: topological flow accumulation
//! - **streams**: stream network extraction and cross-tile stitching
//! - **basins**: basin labeling from drainage points
//! - **flow_length**: upstream flow length and longest flow paths
//!
//! The tiled variants share one pattern: a per-tile local phase produces
//! an intermediate result plus a boundary summary, a single-threaded
//! global phase solves a graph over boundary summaries, and a parallel
//! finalize phase rewrites each tile with the resolved values.

pub mod accumulation;
pub mod accumulation_tiled;
pub mod basins;
pub mod breach;
pub mod fill;
pub mod fill_tiled;
pub mod flats;
pub mod flats_tiled;
pub mod flow_direction;
pub mod flow_length;
pub mod pipeline;
pub mod streams;

pub use pipeline::{PipelineOptions, Workspace};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::accumulation::flow_accumulation;
    pub use crate::basins::{label_basins, BasinParams, DrainagePoint};
    pub use crate::breach::{breach_depressions, BreachParams};
    pub use crate::fill::{fill_depressions, FillParams};
    pub use crate::flats::resolve_flats;
    pub use crate::flow_direction::flow_direction;
    pub use crate::flow_length::{flow_length, FlowLengthResult, LongestPath};
    pub use crate::pipeline::{PipelineOptions, Workspace};
    pub use crate::streams::{extract_streams, StreamParams};
    pub use hydrotile_core::prelude::*;
}
