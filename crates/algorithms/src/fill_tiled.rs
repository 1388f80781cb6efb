//! Tiled Priority-Flood depression filling.
//!
//! Three passes over the raster (Barnes 2016 parallel priority-flood):
//! 1. **Local**: every tile floods independently, producing locally
//!    filled elevations, a watershed-label tile and a spill graph.
//! 2. **Global**: the per-tile graphs are merged; adjacent tiles are
//!    joined along shared edges and corners with
//!    `spill = max(zA, zB)`; a minimax solve over the label graph yields
//!    each label's final fill elevation.
//! 3. **Finalize**: every tile is raised to `max(z, fill[label])`.
//!
//! Labels are tile-local (starting at 2) and made globally unique by
//! mixing in the tile index; label 1 stays the shared edge label.

use std::sync::Mutex;

use ndarray::Array2;
use tracing::debug;

use hydrotile_core::io::{RasterSource, RasterStore};
use hydrotile_core::{Error, ProgressSink, RasterElement, Result};
use hydrotile_parallel::{Perimeter, Side, TileGrid, TileScheduler};

use crate::fill::{
    add_spill, apply_fill, priority_flood_tile, solve_spill_graph, SpillGraph, EDGE_LABEL,
};

/// Boundary summary one tile leaves behind for the global phase.
struct TileBoundary {
    /// Flood elevations along the perimeter (−∞ for nodata)
    zwork: Perimeter<f64>,
    /// Globalized labels along the perimeter
    labels: Perimeter<i64>,
}

fn globalize(tile_index: usize, stride: i64, local: i64) -> i64 {
    if local == EDGE_LABEL {
        EDGE_LABEL
    } else {
        tile_index as i64 * stride + local
    }
}

/// Fill depressions through a tiled three-pass run.
///
/// `output` receives the conditioned elevations; `labels_scratch` holds
/// the per-tile watershed labels between the local and finalize passes.
pub fn fill_depressions_tiled(
    source: &dyn RasterSource<f32>,
    output: &dyn RasterStore<f32>,
    labels_scratch: &dyn RasterStore<i64>,
    chunk_size: usize,
    fill_holes: bool,
    scheduler: &TileScheduler,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let grid = TileGrid::new(source.width(), source.height(), chunk_size, 0);
    let stride = (grid.tile_size as i64) * (grid.tile_size as i64) + 2;
    let nodata = source.nodata();

    // --- local phase ---
    let boundaries: Mutex<Vec<Option<TileBoundary>>> =
        Mutex::new((0..grid.tile_count()).map(|_| None).collect());
    let graphs: Mutex<Vec<SpillGraph>> = Mutex::new(vec![SpillGraph::new(); grid.tile_count()]);

    scheduler.run(&grid, "fill/local", progress, |tile| {
        let mut dem = source.read_window(tile.col0, tile.row0, tile.cols, tile.rows)?;
        let sides = grid.sides(tile);
        let result = priority_flood_tile(&mut dem, nodata, sides, fill_holes);

        let labels = result.labels.mapv(|l| globalize(tile.index, stride, l));
        let mut graph = SpillGraph::new();
        for (&(a, b), &spill) in &result.graph {
            add_spill(
                &mut graph,
                globalize(tile.index, stride, a),
                globalize(tile.index, stride, b),
                spill,
            );
        }

        let zwork = dem.mapv(|v| {
            if v.is_nodata(nodata) {
                f64::NEG_INFINITY
            } else {
                v as f64
            }
        });
        let boundary = TileBoundary {
            zwork: Perimeter::from_array(&zwork),
            labels: Perimeter::from_array(&labels),
        };

        output.write_window(tile.col0, tile.row0, dem.view())?;
        labels_scratch.write_window(tile.col0, tile.row0, labels.view())?;

        boundaries.lock().unwrap_or_else(|e| e.into_inner())[tile.index] = Some(boundary);
        graphs.lock().unwrap_or_else(|e| e.into_inner())[tile.index] = graph;
        Ok(())
    })?;

    // --- global phase ---
    scheduler.cancel_token().check()?;
    let boundaries = boundaries.into_inner().unwrap_or_else(|e| e.into_inner());
    let boundaries: Vec<TileBoundary> = boundaries
        .into_iter()
        .map(|b| b.ok_or_else(|| Error::Internal("missing tile boundary".into())))
        .collect::<Result<_>>()?;

    let mut graph = SpillGraph::new();
    for tile_graph in graphs.into_inner().unwrap_or_else(|e| e.into_inner()) {
        for ((a, b), spill) in tile_graph {
            add_spill(&mut graph, a, b, spill);
        }
    }
    join_tiles(&grid, &boundaries, &mut graph);
    debug!(labels = graph.len(), "solving spill graph");
    let fill = solve_spill_graph(&graph);

    // --- finalize phase ---
    scheduler.run(&grid, "fill/finalize", progress, |tile| {
        let mut dem = output.read_window(tile.col0, tile.row0, tile.cols, tile.rows)?;
        let labels = labels_scratch.read_window(tile.col0, tile.row0, tile.cols, tile.rows)?;
        apply_fill(&mut dem, &labels, &fill, nodata, fill_holes);
        output.write_window(tile.col0, tile.row0, dem.view())
    })
}

/// Add spill edges between adjacent boundary cells of neighboring tiles.
fn join_tiles(grid: &TileGrid, boundaries: &[TileBoundary], graph: &mut SpillGraph) {
    let across = grid.tiles_across();
    let down = grid.tiles_down();
    let at = |tr: usize, tc: usize| &boundaries[tr * across + tc];

    for tr in 0..down {
        for tc in 0..across {
            let a = at(tr, tc);
            if tc + 1 < across {
                join_sides(a, Side::Right, at(tr, tc + 1), Side::Left, graph);
            }
            if tr + 1 < down {
                join_sides(a, Side::Bottom, at(tr + 1, tc), Side::Top, graph);
            }
            // diagonal corners of diagonal tile neighbors
            if tr + 1 < down && tc + 1 < across {
                // bottom-right cell of `a` touches top-left cell of the
                // diagonal neighbor
                join_corner(a, CornerCell::BottomRight, at(tr + 1, tc + 1), CornerCell::TopLeft, graph);
            }
            if tr + 1 < down && tc > 0 {
                // bottom-left cell of `a` touches top-right cell of the
                // anti-diagonal neighbor
                join_corner(a, CornerCell::BottomLeft, at(tr + 1, tc - 1), CornerCell::TopRight, graph);
            }
        }
    }
}

fn join_sides(
    a: &TileBoundary,
    side_a: Side,
    b: &TileBoundary,
    side_b: Side,
    graph: &mut SpillGraph,
) {
    let za = a.zwork.side_values(side_a);
    let la = a.labels.side_values(side_a);
    let zb = b.zwork.side_values(side_b);
    let lb = b.labels.side_values(side_b);
    let n = za.len().min(zb.len());
    for i in 0..n {
        let lo = i.saturating_sub(1);
        let hi = (i + 1).min(n - 1);
        for j in lo..=hi {
            add_spill(graph, la[i], lb[j], za[i].max(zb[j]));
        }
    }
}

#[derive(Clone, Copy)]
enum CornerCell {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

fn corner_index(boundary: &TileBoundary, corner: CornerCell) -> usize {
    let side = match corner {
        CornerCell::TopLeft | CornerCell::TopRight => Side::Top,
        CornerCell::BottomLeft | CornerCell::BottomRight => Side::Bottom,
    };
    let indices = boundary.zwork.side_indices(side);
    match corner {
        CornerCell::TopLeft | CornerCell::BottomLeft => indices[0],
        CornerCell::TopRight | CornerCell::BottomRight => *indices.last().unwrap(),
    }
}

fn join_corner(
    a: &TileBoundary,
    corner_a: CornerCell,
    b: &TileBoundary,
    corner_b: CornerCell,
    graph: &mut SpillGraph,
) {
    let ia = corner_index(a, corner_a);
    let ib = corner_index(b, corner_b);
    add_spill(
        graph,
        a.labels.get(ia),
        b.labels.get(ib),
        a.zwork.get(ia).max(b.zwork.get(ib)),
    );
}
