//! D8 flow direction.
//!
//! Steepest-descent assignment on a hydrologically conditioned DEM.
//! Direction codes count counter-clockwise from East (see
//! [`hydrotile_core::flow`]); cells with no downslope neighbor get
//! [`FLOW_UNDEFINED`] and are handled by flat resolution; nodata cells
//! get [`FLOW_NODATA`].

use ndarray::Array2;
use rayon::prelude::*;

use hydrotile_core::io::{RasterSink, RasterSource};
use hydrotile_core::raster::Raster;
use hydrotile_core::{
    Algorithm, ProgressSink, RasterElement, Result, FLOW_NODATA, FLOW_UNDEFINED,
    NEIGHBOR_DISTANCES, NEIGHBOR_OFFSETS,
};
use hydrotile_parallel::{read_buffered, write_interior, TileGrid, TileScheduler};

/// Compute D8 directions for a buffered tile.
///
/// The buffer must carry a halo of one cell; only cells with a complete
/// in-buffer neighborhood are assigned (which is every interior cell).
/// Rows run in parallel.
pub fn flow_direction_tile(dem: &Array2<f32>, nodata: Option<f32>) -> Array2<u8> {
    let (rows, cols) = dem.dim();
    let mut fdr = Array2::<u8>::from_elem((rows, cols), FLOW_NODATA);
    if rows <= 2 || cols <= 2 {
        return fdr;
    }

    let body: Vec<Vec<u8>> = (1..rows - 1)
        .into_par_iter()
        .map(|row| {
            let mut out = vec![FLOW_NODATA; cols];
            for col in 1..cols - 1 {
                let z = dem[(row, col)];
                if z.is_nodata(nodata) {
                    continue;
                }

                let mut max_slope = 0.0f64;
                let mut best = FLOW_UNDEFINED;
                for (code, &(dr, dc)) in NEIGHBOR_OFFSETS.iter().enumerate() {
                    let zn = dem[(
                        (row as isize + dr) as usize,
                        (col as isize + dc) as usize,
                    )];
                    if zn.is_nodata(nodata) {
                        continue;
                    }
                    let slope = (z as f64 - zn as f64) / NEIGHBOR_DISTANCES[code];
                    if slope > max_slope {
                        max_slope = slope;
                        best = code as u8;
                    }
                }
                out[col] = best;
            }
            out
        })
        .collect();

    for (i, row_data) in body.into_iter().enumerate() {
        for (col, code) in row_data.into_iter().enumerate() {
            fdr[(i + 1, col)] = code;
        }
    }

    fdr
}

/// D8 flow direction of an in-memory DEM.
///
/// Cells on the raster edge see off-raster neighbors as nodata, so edge
/// cells with no lower in-raster neighbor come out undefined and are
/// directed by flat resolution.
pub fn flow_direction(dem: &Raster<f32>) -> Result<Raster<u8>> {
    let (rows, cols) = dem.shape();
    let pad = dem.nodata().unwrap_or(f32::NAN);

    let mut buffer = Array2::from_elem((rows + 2, cols + 2), pad);
    buffer
        .slice_mut(ndarray::s![1..rows + 1, 1..cols + 1])
        .assign(dem.data());

    let fdr = flow_direction_tile(&buffer, dem.nodata());
    let mut output = dem.with_same_meta::<u8>(rows, cols);
    output.set_nodata(Some(FLOW_NODATA));
    *output.data_mut() = fdr
        .slice(ndarray::s![1..rows + 1, 1..cols + 1])
        .to_owned();
    Ok(output)
}

/// Tiled D8: halo of one cell, embarrassingly parallel.
pub fn flow_direction_tiled(
    source: &dyn RasterSource<f32>,
    output: &dyn RasterSink<u8>,
    chunk_size: usize,
    scheduler: &TileScheduler,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let grid = TileGrid::new(source.width(), source.height(), chunk_size, 1);
    let nodata = source.nodata();

    scheduler.run(&grid, "flow_direction", progress, |tile| {
        let buffer = read_buffered(source, tile)?;
        let fdr = flow_direction_tile(&buffer, nodata);
        write_interior(output, tile, &fdr)
    })
}

/// D8 flow direction algorithm
#[derive(Debug, Clone, Default)]
pub struct FlowDirection;

impl Algorithm for FlowDirection {
    type Input = Raster<f32>;
    type Output = Raster<u8>;
    type Params = ();

    fn name(&self) -> &'static str {
        "Flow Direction (D8)"
    }

    fn execute(&self, input: Self::Input, _params: Self::Params) -> Result<Self::Output> {
        flow_direction(&input)
    }
}
