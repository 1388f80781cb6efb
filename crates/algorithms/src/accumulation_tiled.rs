//! Tiled flow accumulation.
//!
//! The local phase accumulates each tile in isolation and records, for
//! every perimeter cell, where its within-tile walk first arrives (the
//! next perimeter cell, off the tile, or an interior terminal). The
//! global phase topologically propagates *offsets* — the accumulation
//! entering each perimeter cell from outside its tile — over a graph of
//! all perimeter cells: internal links forward offsets to the next
//! perimeter cell, external links deliver `local + offset` to the
//! adjacent cell of the neighboring tile. The finalize phase walks each
//! offset down into its tile, stopping where the next perimeter cell
//! takes over.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tracing::debug;

use hydrotile_core::flow::{is_direction, step};
use hydrotile_core::io::{RasterSource, RasterStore};
use hydrotile_core::{Error, ProgressSink, Result};
use hydrotile_parallel::{TileGrid, TileScheduler};

use crate::accumulation::{accumulate_tile, tile_links, LinkKind, ACC_NODATA};
use hydrotile_core::FLOW_NODATA;

/// One perimeter cell in the global link graph.
struct PerimVertex {
    /// Global cell
    row: usize,
    col: usize,
    /// Owning tile
    tile: usize,
    /// Direction at the cell
    dir: u8,
    /// Local accumulation
    local: i64,
    /// Within-tile link
    link: Option<(usize, usize)>,
}

/// Tiled flow accumulation; `output` receives the final counts.
pub fn flow_accumulation_tiled(
    fdr: &dyn RasterSource<u8>,
    output: &dyn RasterStore<i64>,
    chunk_size: usize,
    scheduler: &TileScheduler,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let grid = TileGrid::new(fdr.width(), fdr.height(), chunk_size, 0);

    // --- local phase ---
    type TileRecord = Vec<PerimVertex>;
    let records: Mutex<Vec<Option<TileRecord>>> =
        Mutex::new((0..grid.tile_count()).map(|_| None).collect());

    scheduler.run(&grid, "accumulation/local", progress, |tile| {
        let directions = fdr.read_window(tile.col0, tile.row0, tile.cols, tile.rows)?;
        let acc = accumulate_tile(&directions, (tile.row0, tile.col0))?;
        output.write_window(tile.col0, tile.row0, acc.view())?;

        let mut vertices = Vec::new();
        for ((row, col), kind) in tile_links(&directions)? {
            let link = match kind {
                LinkKind::NextPerimeter(r, c) => Some((tile.row0 + r, tile.col0 + c)),
                LinkKind::LeavesTile | LinkKind::Terminal => None,
            };
            vertices.push(PerimVertex {
                row: tile.row0 + row,
                col: tile.col0 + col,
                tile: tile.index,
                dir: directions[(row, col)],
                local: acc[(row, col)],
                link,
            });
        }
        records.lock().unwrap_or_else(|e| e.into_inner())[tile.index] = Some(vertices);
        Ok(())
    })?;

    // --- global phase ---
    scheduler.cancel_token().check()?;
    let records = records.into_inner().unwrap_or_else(|e| e.into_inner());
    let vertices: Vec<PerimVertex> = records
        .into_iter()
        .map(|r| r.ok_or_else(|| Error::Internal("missing tile record".into())))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect();

    let index: HashMap<(usize, usize), usize> = vertices
        .iter()
        .enumerate()
        .map(|(i, v)| ((v.row, v.col), i))
        .collect();

    // edges: internal (forward offset) and external (deliver local+offset)
    enum Edge {
        Internal(usize),
        External(usize),
    }
    let mut out_edges: Vec<Option<Edge>> = Vec::with_capacity(vertices.len());
    let mut indegree = vec![0u32; vertices.len()];

    for vertex in &vertices {
        let edge = if let Some(target) = vertex.link {
            let t = index[&target];
            indegree[t] += 1;
            Some(Edge::Internal(t))
        } else if is_direction(vertex.dir) {
            let (nr, nc) = step(vertex.row as isize, vertex.col as isize, vertex.dir);
            if nr >= 0
                && nc >= 0
                && (nr as usize) < grid.height
                && (nc as usize) < grid.width
            {
                let target = (nr as usize, nc as usize);
                match index.get(&target) {
                    // crossing the boundary always lands on a perimeter
                    // cell of the neighboring tile
                    Some(&t) if vertices[t].dir != FLOW_NODATA => {
                        indegree[t] += 1;
                        Some(Edge::External(t))
                    }
                    _ => None,
                }
            } else {
                None
            }
        } else {
            None
        };
        out_edges.push(edge);
    }

    debug!(vertices = vertices.len(), "propagating perimeter offsets");
    let mut offsets = vec![0i64; vertices.len()];
    let mut queue: VecDeque<usize> = (0..vertices.len())
        .filter(|&i| indegree[i] == 0)
        .collect();
    let mut processed = 0usize;
    while let Some(i) = queue.pop_front() {
        processed += 1;
        match out_edges[i] {
            Some(Edge::Internal(t)) => {
                offsets[t] += offsets[i];
                indegree[t] -= 1;
                if indegree[t] == 0 {
                    queue.push_back(t);
                }
            }
            Some(Edge::External(t)) => {
                offsets[t] += vertices[i].local + offsets[i];
                indegree[t] -= 1;
                if indegree[t] == 0 {
                    queue.push_back(t);
                }
            }
            None => {}
        }
    }
    if processed < vertices.len() {
        let i = (0..vertices.len())
            .find(|&i| indegree[i] > 0)
            .expect("unprocessed vertex");
        return Err(Error::invalid_input(
            "flow direction cycle across tiles",
            vertices[i].row as i64,
            vertices[i].col as i64,
        ));
    }

    // group non-zero offsets by tile
    let mut tile_offsets: Vec<Vec<((usize, usize), i64)>> = vec![Vec::new(); grid.tile_count()];
    for (i, vertex) in vertices.iter().enumerate() {
        if offsets[i] > 0 {
            tile_offsets[vertex.tile].push(((vertex.row, vertex.col), offsets[i]));
        }
    }

    // --- finalize phase ---
    scheduler.run(&grid, "accumulation/finalize", progress, |tile| {
        let additions = &tile_offsets[tile.index];
        if additions.is_empty() {
            return Ok(());
        }
        let directions = fdr.read_window(tile.col0, tile.row0, tile.cols, tile.rows)?;
        let mut acc = output.read_window(tile.col0, tile.row0, tile.cols, tile.rows)?;
        let (rows, cols) = acc.dim();
        let on_perimeter =
            |r: usize, c: usize| r == 0 || c == 0 || r == rows - 1 || c == cols - 1;

        for &((grow, gcol), offset) in additions {
            let mut cur = (grow - tile.row0, gcol - tile.col0);
            loop {
                if acc[cur] == ACC_NODATA {
                    break;
                }
                acc[cur] += offset;
                let dir = directions[cur];
                if !is_direction(dir) {
                    break;
                }
                let (nr, nc) = step(cur.0 as isize, cur.1 as isize, dir);
                if nr < 0 || nc < 0 || nr as usize >= rows || nc as usize >= cols {
                    break;
                }
                let next = (nr as usize, nc as usize);
                if directions[next] == FLOW_NODATA || on_perimeter(next.0, next.1) {
                    // the next perimeter cell carries its own offset
                    break;
                }
                cur = next;
            }
        }
        output.write_window(tile.col0, tile.row0, acc.view())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulation::tests::{
        expected_fac_1, expected_fac_2, fdr_fixture_1, fdr_fixture_2,
    };
    use crate::accumulation::flow_accumulation;
    use hydrotile_core::io::MemoryRaster;
    use hydrotile_core::{Raster, SilentProgress};
    use hydrotile_parallel::CancelToken;

    fn run_tiled(fdr: &Raster<u8>, chunk: usize) -> Result<Raster<i64>> {
        let source = MemoryRaster::from_raster(fdr.clone());
        let output = MemoryRaster::<i64>::filled(
            fdr.rows(),
            fdr.cols(),
            ACC_NODATA,
            *fdr.transform(),
            None,
            Some(ACC_NODATA),
        );
        let scheduler = TileScheduler::new(true, CancelToken::new());
        flow_accumulation_tiled(&source, &output, chunk, &scheduler, &SilentProgress)?;
        Ok(output.into_raster())
    }

    #[test]
    fn test_tiled_matches_reference_for_all_tile_sizes() {
        for chunk in 2..=8 {
            let acc = run_tiled(&fdr_fixture_1(), chunk).unwrap();
            assert_eq!(
                acc.data().iter().copied().collect::<Vec<_>>(),
                expected_fac_1(),
                "fixture 1, chunk {}",
                chunk
            );
            let acc = run_tiled(&fdr_fixture_2(), chunk).unwrap();
            assert_eq!(
                acc.data().iter().copied().collect::<Vec<_>>(),
                expected_fac_2(),
                "fixture 2, chunk {}",
                chunk
            );
        }
    }

    #[test]
    fn test_tiled_with_nodata_matches_core() {
        let mut fdr = fdr_fixture_1();
        fdr.set(0, 1, FLOW_NODATA).unwrap();
        let expected = flow_accumulation(&fdr).unwrap();
        let acc = run_tiled(&fdr, 4).unwrap();
        assert_eq!(acc.data(), expected.data());
    }

    #[test]
    fn test_tiled_rejects_undefined_with_global_coords() {
        let mut fdr = fdr_fixture_1();
        fdr.set(5, 6, hydrotile_core::FLOW_UNDEFINED).unwrap();
        let err = run_tiled(&fdr, 4).unwrap_err();
        assert!(matches!(err, Error::InvalidInput { row: 5, col: 6, .. }));
    }
}
