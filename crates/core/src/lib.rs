//! # Hydrotile Core
//!
//! Core types, traits and I/O abstraction for the hydrotile terrain
//! analysis engine.
//!
//! This crate provides:
//! - `Raster<T>`: Generic raster grid type
//! - `GeoTransform`: Affine transformation for georeferencing
//! - `Crs`: Coordinate Reference System handling
//! - D8 flow-direction codes and neighbor tables
//! - `RasterSource`/`RasterSink`: the raster abstraction the engine
//!   consumes instead of depending on a raster library
//! - Vector feature types and sinks for stream/basin outputs

pub mod crs;
pub mod error;
pub mod flow;
pub mod io;
pub mod progress;
pub mod raster;
pub mod vector;

pub use crs::Crs;
pub use error::{Error, Result};
pub use flow::{FlowDir, FLOW_NODATA, FLOW_UNDEFINED, NEIGHBOR_DISTANCES, NEIGHBOR_OFFSETS};
pub use progress::{ProgressSink, SilentProgress};
pub use raster::{GeoTransform, Raster, RasterElement};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::crs::Crs;
    pub use crate::error::{Error, Result};
    pub use crate::flow::{FLOW_NODATA, FLOW_UNDEFINED, NEIGHBOR_DISTANCES, NEIGHBOR_OFFSETS};
    pub use crate::io::{RasterSink, RasterSource};
    pub use crate::progress::{ProgressSink, SilentProgress};
    pub use crate::raster::{GeoTransform, Raster, RasterElement};
    pub use crate::Algorithm;
}

/// Core trait for the in-memory algorithm entry points.
///
/// Algorithms are pure functions that transform input data according to
/// parameters.
pub trait Algorithm {
    /// Input type for the algorithm
    type Input;
    /// Output type for the algorithm
    type Output;
    /// Parameters controlling algorithm behavior
    type Params: Default;

    /// Returns the algorithm name
    fn name(&self) -> &'static str;

    /// Execute the algorithm
    fn execute(&self, input: Self::Input, params: Self::Params) -> Result<Self::Output>;

    /// Execute with default parameters
    fn execute_default(&self, input: Self::Input) -> Result<Self::Output> {
        self.execute(input, Self::Params::default())
    }
}
