//! # Hydrotile Parallel
//!
//! Tiled processing for rasters larger than RAM.
//!
//! This crate provides:
//! - `TileGrid`/`TileInfo`: square tiles with halos in deterministic
//!   row-major order
//! - `TileScheduler`: a bounded worker pool over tiles with cooperative
//!   cancellation and per-tile error capture
//! - `Perimeter`: the flattened clockwise tile perimeter used by the
//!   global phases

pub mod perimeter;
pub mod scheduler;
pub mod tiled;

pub use perimeter::{Perimeter, Side};
pub use scheduler::{CancelToken, TileScheduler};
pub use tiled::{read_buffered, write_interior, Sides, TileGrid, TileInfo};
