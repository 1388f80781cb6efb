//! Tiled flat resolution.
//!
//! The flat gradients of [`crate::flats`] are global: a flat spanning
//! tiles must see high edges and drains in other tiles. Per tile, the
//! local phase measures BFS distances for the tile's perimeter flat cells
//! (to local high edges and drains, and pairwise within the tile); the
//! global phase runs Dijkstra over the perimeter-cell graph — within-tile
//! distance edges plus unit edges between adjacent flat cells of
//! neighboring tiles — and the finalize phase re-runs the in-tile
//! distance computation seeded by the solved perimeter values before
//! assigning directions.
//!
//! Large tiles with huge flats are pathological for the perimeter
//! distance computation, so this stage caps its tile side separately
//! (`flat_chunk_max`).
//!
//! Reference:
//! Zhou, G., Song, L., Liu, Y. (2021). Parallel assignment of flow
//! directions over flat surfaces in massive digital elevation models.
//! *Computers & Geosciences*, 159, 105015.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;

use tracing::debug;

use hydrotile_core::io::{RasterSink, RasterSource};
use hydrotile_core::{ProgressSink, Result};
use hydrotile_parallel::{read_buffered, write_interior, TileGrid, TileScheduler};

use crate::flats::{
    apply_flat_directions, assign_nodata_drains, flat_distances, perimeter_flat_distances,
    UNREACHED,
};

/// Halo of this stage: drain detection for the first halo ring needs that
/// ring's own full neighborhood.
const HALO: usize = 2;

/// A perimeter flat cell's local summary.
struct PerimCell {
    row: i64,
    col: i64,
    z: f32,
    local_high: u32,
    local_low: u32,
}

/// Resolve flats across tiles.
///
/// `output` must not alias `fdr`: the finalize pass reads pristine
/// directions from `fdr` (including halos) while writing interiors to
/// `output`.
pub fn resolve_flats_tiled(
    dem: &dyn RasterSource<f32>,
    fdr: &dyn RasterSource<u8>,
    output: &dyn RasterSink<u8>,
    chunk_size: usize,
    flat_chunk_max: usize,
    scheduler: &TileScheduler,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let effective = if chunk_size <= 1 {
        chunk_size
    } else {
        chunk_size.min(flat_chunk_max.max(2))
    };
    let grid = TileGrid::new(dem.width(), dem.height(), effective, HALO);
    let nodata = dem.nodata();

    // --- local phase ---
    type TileRecords = (Vec<PerimCell>, Vec<((i64, i64), (i64, i64), u32)>);
    let records: Mutex<Vec<Option<TileRecords>>> =
        Mutex::new((0..grid.tile_count()).map(|_| None).collect());

    scheduler.run(&grid, "resolve_flats/local", progress, |tile| {
        let dem_buf = read_buffered(dem, tile)?;
        let mut fdr_buf = read_buffered(fdr, tile)?;
        assign_nodata_drains(&dem_buf, &mut fdr_buf, nodata, 1);

        let (high, low) = flat_distances(&dem_buf, &fdr_buf, nodata, HALO, &[], &[]);
        let pairs = perimeter_flat_distances(&dem_buf, &fdr_buf, HALO);

        let mut cells = Vec::with_capacity(pairs.len());
        let mut edges = Vec::new();
        for (cell, reached) in pairs {
            let (grow, gcol) = tile.global_of(cell.0, cell.1);
            cells.push(PerimCell {
                row: grow as i64,
                col: gcol as i64,
                z: dem_buf[cell],
                local_high: high[cell],
                local_low: low[cell],
            });
            for (other, dist) in reached {
                let (orow, ocol) = tile.global_of(other.0, other.1);
                edges.push((
                    (grow as i64, gcol as i64),
                    (orow as i64, ocol as i64),
                    dist,
                ));
            }
        }

        records.lock().unwrap_or_else(|e| e.into_inner())[tile.index] = Some((cells, edges));
        Ok(())
    })?;

    // --- global phase ---
    scheduler.cancel_token().check()?;
    let records = records.into_inner().unwrap_or_else(|e| e.into_inner());

    let mut coords: Vec<(i64, i64)> = Vec::new();
    let mut index: HashMap<(i64, i64), usize> = HashMap::new();
    let mut elevation: Vec<f32> = Vec::new();
    let mut init_high: Vec<u32> = Vec::new();
    let mut init_low: Vec<u32> = Vec::new();

    for record in records.iter().flatten() {
        for cell in &record.0 {
            let key = (cell.row, cell.col);
            index.entry(key).or_insert_with(|| {
                coords.push(key);
                elevation.push(cell.z);
                init_high.push(cell.local_high);
                init_low.push(cell.local_low);
                coords.len() - 1
            });
        }
    }

    let mut adjacency: Vec<Vec<(usize, u32)>> = vec![Vec::new(); coords.len()];
    for record in records.iter().flatten() {
        for &(a, b, dist) in &record.1 {
            if let (Some(&ia), Some(&ib)) = (index.get(&a), index.get(&b)) {
                adjacency[ia].push((ib, dist));
                adjacency[ib].push((ia, dist));
            }
        }
    }
    // unit edges between adjacent flat cells of equal elevation
    for (i, &(row, col)) in coords.iter().enumerate() {
        for &(dr, dc) in &hydrotile_core::NEIGHBOR_OFFSETS {
            if let Some(&j) = index.get(&(row + dr as i64, col + dc as i64)) {
                if elevation[j] == elevation[i] {
                    adjacency[i].push((j, 1));
                }
            }
        }
    }

    debug!(nodes = coords.len(), "solving flat perimeter graph");
    let solved_high = dijkstra(&adjacency, &init_high);
    let solved_low = dijkstra(&adjacency, &init_low);

    let mut solved: HashMap<(i64, i64), (u32, u32)> = HashMap::with_capacity(coords.len());
    for (i, &key) in coords.iter().enumerate() {
        solved.insert(key, (solved_high[i], solved_low[i]));
    }
    drop(records);

    // --- finalize phase ---
    scheduler.run(&grid, "resolve_flats/finalize", progress, |tile| {
        let dem_buf = read_buffered(dem, tile)?;
        let mut fdr_buf = read_buffered(fdr, tile)?;
        assign_nodata_drains(&dem_buf, &mut fdr_buf, nodata, 1);

        let (rows, cols) = fdr_buf.dim();
        let mut extra_high = Vec::new();
        let mut extra_low = Vec::new();
        for row in 1..rows - 1 {
            for col in 1..cols - 1 {
                let (grow, gcol) = tile.global_of(row, col);
                if let Some(&(gh, gl)) = solved.get(&(grow as i64, gcol as i64)) {
                    if gh != UNREACHED {
                        extra_high.push(((row, col), gh));
                    }
                    if gl != UNREACHED {
                        extra_low.push(((row, col), gl));
                    }
                }
            }
        }

        let (high, low) = flat_distances(&dem_buf, &fdr_buf, nodata, 1, &extra_high, &extra_low);
        apply_flat_directions(&dem_buf, &mut fdr_buf, &high, &low, HALO);
        write_interior(output, tile, &fdr_buf)
    })
}

/// Multi-source Dijkstra over the perimeter graph; sources are every node
/// with a finite initial distance.
fn dijkstra(adjacency: &[Vec<(usize, u32)>], init: &[u32]) -> Vec<u32> {
    let mut dist: Vec<u64> = init
        .iter()
        .map(|&d| if d == UNREACHED { u64::MAX } else { d as u64 })
        .collect();
    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = dist
        .iter()
        .enumerate()
        .filter(|(_, &d)| d != u64::MAX)
        .map(|(i, &d)| Reverse((d, i)))
        .collect();

    while let Some(Reverse((d, i))) = heap.pop() {
        if d > dist[i] {
            continue;
        }
        for &(j, w) in &adjacency[i] {
            let nd = d + w as u64;
            if nd < dist[j] {
                dist[j] = nd;
                heap.push(Reverse((nd, j)));
            }
        }
    }

    dist.iter()
        .map(|&d| if d == u64::MAX { UNREACHED } else { d.min(UNREACHED as u64 - 1) as u32 })
        .collect()
}
