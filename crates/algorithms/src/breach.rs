//! Least-cost breaching of depressions.
//!
//! Two phases per tile:
//! - **Phase A** sweeps the tile in row-major order and solves strict
//!   single-cell pits by rewriting the intermediate neighbor toward any
//!   cell at Chebyshev radius 2 that is lower or nodata.
//! - **Phase B** runs a windowed Dijkstra from each remaining pit. Edge
//!   costs are `w · (zn − zPit)` (w = 1 cardinal, √2 diagonal, 0 into
//!   nodata); the search stops at the first popped cell below the pit or
//!   at nodata, and the path is carved with a linear gradient from the
//!   breach point back to the pit. Cells are only ever lowered.
//!
//! Pits that cannot be breached within `max_cost` stay unsolved; the
//! subsequent fill stage resolves them.
//!
//! Reference:
//! Lindsay, J.B. (2016). Efficient hybrid breaching-filling sink removal
//! methods for flow path enforcement in digital elevation models.
//! *Hydrological Processes*, 30(6), 846–857.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use ndarray::Array2;

use hydrotile_core::io::{RasterSink, RasterSource};
use hydrotile_core::raster::Raster;
use hydrotile_core::{ProgressSink, RasterElement, Result};
use hydrotile_parallel::{read_buffered, write_interior, CancelToken, TileGrid, TileScheduler};

use std::f64::consts::SQRT_2;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Neighbor offsets in the sweep order of the single-cell phase.
const DX: [isize; 8] = [1, 1, 1, 0, -1, -1, -1, 0];
const DY: [isize; 8] = [-1, 0, 1, 1, 1, 0, -1, -1];

/// The 16 cells at Chebyshev radius 2, and for each the index (into
/// `DX`/`DY`) of the intermediate neighbor between pit and target.
const DX2: [isize; 16] = [2, 2, 2, 2, 2, 1, 0, -1, -2, -2, -2, -2, -2, -1, 0, 1];
const DY2: [isize; 16] = [-2, -1, 0, 1, 2, 2, 2, 2, 2, 1, 0, -1, -2, -2, -2, -2];
const BREACH_CELL: [usize; 16] = [0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 0];

/// Parameters for least-cost breaching.
#[derive(Debug, Clone)]
pub struct BreachParams {
    /// Dijkstra window radius in cells; also the stage's halo.
    pub search_radius: usize,
    /// Maximum accepted total path cost; pits beyond it stay unsolved.
    pub max_cost: f64,
    /// Gradient applied when breaching toward nodata. Tunable; the
    /// conventional value is `1e-5`.
    pub epsilon: f32,
}

impl Default for BreachParams {
    fn default() -> Self {
        Self {
            search_radius: 50,
            max_cost: f64::INFINITY,
            epsilon: 1e-5,
        }
    }
}

/// Cell in the Dijkstra frontier (min-heap on cost, insertion order ties).
#[derive(Debug, Clone)]
struct SearchCell {
    cost: f64,
    seq: u64,
    row: usize,
    col: usize,
}

impl PartialEq for SearchCell {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost && self.seq == other.seq
    }
}

impl Eq for SearchCell {}

impl PartialOrd for SearchCell {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SearchCell {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .partial_cmp(&self.cost)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Counts from one breach run.
#[derive(Debug, Clone, Copy, Default)]
pub struct BreachOutcome {
    pub solved: u64,
    pub unsolved: u64,
}

#[inline]
fn is_nd(value: f32, nodata: Option<f32>) -> bool {
    value.is_nodata(nodata)
}

/// Breach all pits found in a buffered tile, in place.
///
/// The sweep covers every cell whose radius-2 ring lies inside the
/// buffer; Dijkstra windows clip to the buffer, so pits near the buffer
/// edge search a reduced window (their owning tile sees the full one).
pub fn breach_tile(
    dem: &mut Array2<f32>,
    nodata: Option<f32>,
    params: &BreachParams,
    cancel: &CancelToken,
) -> Result<BreachOutcome> {
    let (rows, cols) = dem.dim();
    let mut outcome = BreachOutcome::default();
    if rows < 5 || cols < 5 {
        return Ok(outcome);
    }

    // Phase A: deterministic row-major single-cell sweep
    let mut unsolved: Vec<(usize, usize)> = Vec::new();
    for row in 2..rows - 2 {
        for col in 2..cols - 2 {
            let z = dem[(row, col)];
            if is_nd(z, nodata) {
                continue;
            }
            let mut is_flat = true;
            let mut is_sink = true;
            for k in 0..8 {
                let zn = dem[(
                    (row as isize + DY[k]) as usize,
                    (col as isize + DX[k]) as usize,
                )];
                if zn != z {
                    is_flat = false;
                }
                if is_nd(zn, nodata) || zn < z {
                    is_sink = false;
                    break;
                }
            }
            if !is_flat && is_sink {
                unsolved.push((row, col));
            }
        }
    }

    let mut pits_for_dijkstra: Vec<(usize, usize)> = Vec::new();
    for &(row, col) in &unsolved {
        let z = dem[(row, col)];
        let mut solved = false;
        for k in 0..16 {
            let tr = (row as isize + DY2[k]) as usize;
            let tc = (col as isize + DX2[k]) as usize;
            let mut zt = dem[(tr, tc)];
            if zt <= z || is_nd(zt, nodata) {
                solved = true;
                if is_nd(zt, nodata) {
                    // breaching into nodata: apply a small gradient
                    zt = z - 2.0 * params.epsilon;
                }
                let b = BREACH_CELL[k];
                let ir = (row as isize + DY[b]) as usize;
                let ic = (col as isize + DX[b]) as usize;
                dem[(ir, ic)] = (z + zt) / 2.0;
            }
        }
        if solved {
            outcome.solved += 1;
        } else {
            pits_for_dijkstra.push((row, col));
        }
    }

    // Phase B: windowed Dijkstra per remaining pit
    for (pit_row, pit_col) in pits_for_dijkstra {
        cancel.check()?;
        if breach_pit_least_cost(dem, nodata, params, pit_row, pit_col) {
            outcome.solved += 1;
        } else {
            outcome.unsolved += 1;
        }
    }

    Ok(outcome)
}

/// Dijkstra-breach a single pit; returns whether a path was accepted.
fn breach_pit_least_cost(
    dem: &mut Array2<f32>,
    nodata: Option<f32>,
    params: &BreachParams,
    pit_row: usize,
    pit_col: usize,
) -> bool {
    let (rows, cols) = dem.dim();
    let radius = params.search_radius.max(1);
    let z_pit = dem[(pit_row, pit_col)] as f64;

    // window clipped to the buffer
    let row_lo = pit_row.saturating_sub(radius);
    let col_lo = pit_col.saturating_sub(radius);
    let row_hi = (pit_row + radius + 1).min(rows);
    let col_hi = (pit_col + radius + 1).min(cols);
    let wrows = row_hi - row_lo;
    let wcols = col_hi - col_lo;

    let idx = |r: usize, c: usize| (r - row_lo) * wcols + (c - col_lo);

    let mut cost = vec![f64::INFINITY; wrows * wcols];
    let mut prev = vec![usize::MAX; wrows * wcols];
    let mut visited = vec![false; wrows * wcols];
    let mut heap = BinaryHeap::new();
    let mut seq: u64 = 0;

    cost[idx(pit_row, pit_col)] = 0.0;
    heap.push(SearchCell {
        cost: 0.0,
        seq,
        row: pit_row,
        col: pit_col,
    });

    let mut terminal: Option<(usize, usize, f64)> = None;

    while let Some(cell) = heap.pop() {
        let i = idx(cell.row, cell.col);
        if visited[i] {
            continue;
        }
        visited[i] = true;

        let z = dem[(cell.row, cell.col)];
        if (cell.row, cell.col) != (pit_row, pit_col) && ((z as f64) < z_pit || is_nd(z, nodata)) {
            terminal = Some((cell.row, cell.col, cell.cost));
            break;
        }

        for k in 0..8 {
            let nr = cell.row as isize + DY[k];
            let nc = cell.col as isize + DX[k];
            if nr < row_lo as isize
                || nc < col_lo as isize
                || nr >= row_hi as isize
                || nc >= col_hi as isize
            {
                continue;
            }
            let nr = nr as usize;
            let nc = nc as usize;
            let ni = idx(nr, nc);
            if visited[ni] {
                continue;
            }
            let zn = dem[(nr, nc)];
            let weight = if DX[k] != 0 && DY[k] != 0 { SQRT_2 } else { 1.0 };
            let edge = if is_nd(zn, nodata) {
                0.0
            } else {
                weight * (zn as f64 - z_pit)
            };
            let next = cell.cost + edge;
            if next < cost[ni] {
                cost[ni] = next;
                prev[ni] = i;
                seq += 1;
                heap.push(SearchCell {
                    cost: next,
                    seq,
                    row: nr,
                    col: nc,
                });
            }
        }
    }

    let Some((term_row, term_col, term_cost)) = terminal else {
        return false;
    };
    if term_cost > params.max_cost {
        return false;
    }

    // reconstruct pit → terminal
    let mut path = Vec::new();
    let mut i = idx(term_row, term_col);
    let pit_idx = idx(pit_row, pit_col);
    while i != pit_idx && i != usize::MAX {
        path.push(i);
        i = prev[i];
    }
    path.push(pit_idx);
    path.reverse();

    let k = path.len() - 1;
    if k == 0 {
        return true;
    }
    let z_term = dem[(term_row, term_col)];
    let term_is_nd = is_nd(z_term, nodata);
    let eps = params.epsilon as f64;

    // carve intermediates; never the pit or the breach point, never uphill
    for (step, &pi) in path.iter().enumerate().take(k).skip(1) {
        let r = row_lo + pi / wcols;
        let c = col_lo + pi % wcols;
        let current = dem[(r, c)] as f64;
        if current == z_pit {
            continue;
        }
        let target = if term_is_nd {
            z_pit - step as f64 * eps
        } else {
            z_pit + (step as f64 / k as f64) * (z_term as f64 - z_pit)
        };
        if target < current {
            dem[(r, c)] = target as f32;
        }
    }
    true
}

/// Breach depressions of an in-memory DEM.
///
/// Returns the conditioned raster and the solved/unsolved pit counts.
pub fn breach_depressions(
    dem: &Raster<f32>,
    params: BreachParams,
) -> Result<(Raster<f32>, BreachOutcome)> {
    let (rows, cols) = dem.shape();
    let pad = 2usize;
    let nodata = dem.nodata().unwrap_or(f32::NAN);

    // pad with nodata so the sweep covers cells up to the raster edge
    let mut buffer = Array2::from_elem((rows + 2 * pad, cols + 2 * pad), nodata);
    buffer
        .slice_mut(ndarray::s![pad..pad + rows, pad..pad + cols])
        .assign(dem.data());

    let outcome = breach_tile(&mut buffer, Some(nodata), &params, &CancelToken::new())?;

    let mut output = dem.with_same_meta::<f32>(rows, cols);
    output.set_nodata(dem.nodata());
    *output.data_mut() = buffer
        .slice(ndarray::s![pad..pad + rows, pad..pad + cols])
        .to_owned();
    Ok((output, outcome))
}

/// Tiled breach: every tile reads a halo of `search_radius` cells,
/// breaches all pits it can see and writes back only its interior.
///
/// Returns the total number of pits left unsolved (also reported through
/// `progress.metric("breach_unsolved_pits", …)`).
pub fn breach_depressions_tiled(
    source: &dyn RasterSource<f32>,
    output: &dyn RasterSink<f32>,
    chunk_size: usize,
    params: &BreachParams,
    scheduler: &TileScheduler,
    progress: &dyn ProgressSink,
) -> Result<u64> {
    let halo = params.search_radius.max(2);
    let grid = TileGrid::new(source.width(), source.height(), chunk_size, halo);
    let nodata = source.nodata();
    let unsolved = AtomicU64::new(0);

    scheduler.run(&grid, "breach", progress, |tile| {
        let mut buffer = read_buffered(source, tile)?;
        let outcome = breach_tile(&mut buffer, nodata, params, scheduler.cancel_token())?;
        unsolved.fetch_add(outcome.unsolved, AtomicOrdering::Relaxed);
        write_interior(output, tile, &buffer)
    })?;

    let unsolved = unsolved.into_inner();
    progress.metric("breach_unsolved_pits", unsolved);
    Ok(unsolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrotile_core::io::MemoryRaster;
    use hydrotile_core::SilentProgress;

    fn raster_from(values: &[f32], rows: usize, cols: usize) -> Raster<f32> {
        let mut raster = Raster::from_vec(values.to_vec(), rows, cols).unwrap();
        raster.set_nodata(Some(-9999.0));
        raster
    }

    #[test]
    fn test_single_cell_pit_breached_toward_low_ground() {
        // pit at (2,2); ground falls away beyond the ring at (2,4)
        let values = [
            9.0, 9.0, 9.0, 9.0, 9.0, //
            9.0, 9.0, 9.0, 9.0, 9.0, //
            9.0, 9.0, 5.0, 9.0, 4.0, //
            9.0, 9.0, 9.0, 9.0, 9.0, //
            9.0, 9.0, 9.0, 9.0, 9.0,
        ];
        let dem = raster_from(&values, 5, 5);
        let (breached, outcome) = breach_depressions(&dem, BreachParams::default()).unwrap();

        assert_eq!(outcome.unsolved, 0);
        // the intermediate toward (2,4) was cut to the mean of pit and target
        assert_eq!(breached.get(2, 3).unwrap(), 4.5);
        // the pit itself is untouched
        assert_eq!(breached.get(2, 2).unwrap(), 5.0);
    }

    #[test]
    fn test_single_cell_pit_breached_toward_offgrid_nodata() {
        // 3x3 with a pit: everything at radius 2 is off-raster (nodata
        // padding), so intermediates get the ε gradient
        let values = [
            9.0, 9.0, 9.0, //
            9.0, 5.0, 10.0, //
            9.0, 9.0, 9.0,
        ];
        let dem = raster_from(&values, 3, 3);
        let params = BreachParams::default();
        let eps = params.epsilon;
        let (breached, outcome) = breach_depressions(&dem, params).unwrap();

        assert_eq!(outcome.unsolved, 0);
        assert_eq!(breached.get(1, 1).unwrap(), 5.0);
        // cardinal intermediate toward the padded east ring cell
        let expected = (5.0 + (5.0 - 2.0 * eps)) / 2.0;
        assert_eq!(breached.get(1, 2).unwrap(), expected);
        // nothing was raised
        for row in 0..3 {
            for col in 0..3 {
                assert!(breached.get(row, col).unwrap() <= dem.get(row, col).unwrap());
            }
        }
    }

    #[test]
    fn test_dijkstra_breach_carves_descending_path() {
        // pit at (3,3) behind a wide barrier; the only low ground is at
        // (3,7), farther than the single-cell ring
        let mut dem = Raster::filled(7, 9, 9.0f32);
        dem.set_nodata(Some(-9999.0));
        dem.set(3, 3, 5.0).unwrap();
        dem.set(3, 7, 4.0).unwrap();

        let (breached, outcome) = breach_depressions(&dem, BreachParams::default()).unwrap();
        assert_eq!(outcome.unsolved, 0);

        // the carved path descends from the pit to the breach point
        let mut prev = breached.get(3, 3).unwrap();
        for col in 4..8 {
            let z = breached.get(3, col).unwrap();
            assert!(z < prev, "path not descending at col {}: {} >= {}", col, z, prev);
            prev = z;
        }
        // no cell was raised
        for row in 0..7 {
            for col in 0..9 {
                assert!(breached.get(row, col).unwrap() <= dem.get(row, col).unwrap());
            }
        }
    }

    #[test]
    fn test_max_cost_leaves_pit_unsolved() {
        let mut dem = Raster::filled(9, 9, 100.0f32);
        dem.set_nodata(Some(-9999.0));
        dem.set(4, 4, 5.0).unwrap();

        let params = BreachParams {
            max_cost: 1.0,
            ..Default::default()
        };
        let (breached, outcome) = breach_depressions(&dem, params).unwrap();
        // breaching through the 100.0 plateau exceeds the budget
        assert_eq!(outcome.unsolved, 1);
        assert_eq!(breached.get(4, 4).unwrap(), 5.0);
    }

    #[test]
    fn test_clean_dem_untouched() {
        let mut dem = Raster::new(8, 8);
        for row in 0..8 {
            for col in 0..8 {
                dem.set(row, col, (row + col) as f32).unwrap();
            }
        }
        let (breached, outcome) = breach_depressions(&dem, BreachParams::default()).unwrap();
        assert_eq!(outcome.solved + outcome.unsolved, 0);
        assert_eq!(breached.data(), dem.data());
    }

    #[test]
    fn test_tiled_breach_never_raises() {
        let mut dem = Raster::filled(12, 12, 9.0f32);
        dem.set_nodata(Some(-9999.0));
        dem.set(5, 5, 5.0).unwrap();
        dem.set(5, 9, 4.0).unwrap();

        let source = MemoryRaster::from_raster(dem.clone());
        let output = MemoryRaster::<f32>::zeroed(12, 12, Default::default(), None, Some(-9999.0));
        let scheduler = TileScheduler::new(true, CancelToken::new());
        let unsolved = breach_depressions_tiled(
            &source,
            &output,
            4,
            &BreachParams {
                search_radius: 6,
                ..Default::default()
            },
            &scheduler,
            &SilentProgress,
        )
        .unwrap();
        assert_eq!(unsolved, 0);

        let result = output.into_raster();
        for row in 0..12 {
            for col in 0..12 {
                assert!(result.get(row, col).unwrap() <= dem.get(row, col).unwrap());
            }
        }
        // the pit can now drain: some neighbor toward (5,9) was lowered
        assert!(result.get(5, 6).unwrap() < 9.0);
    }
}
