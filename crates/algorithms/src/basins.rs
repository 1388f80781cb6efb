//! Basin labeling from drainage points.
//!
//! Every outlet cell (no downstream inside the raster, or draining into
//! nodata) seeds a basin labeled with its own flattened cell index + 1;
//! labels spread upstream through the flow graph. When the upstream
//! sweep crosses a drainage point the propagated ID switches to the
//! point's basin ID, and the basin graph records the point's downstream
//! basin. Cells therefore end up labeled with the *nearest downstream*
//! drainage point.
//!
//! In tiled mode the tiles label independently against their own local
//! outlets, a label graph is assembled from the directions crossing tile
//! edges, and a finalize pass rewrites every label to the basin it
//! resolves to downstream.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use geo_types::{Geometry, LineString, Polygon};
use ndarray::Array2;

use hydrotile_core::flow::{is_direction, opposite, step};
use hydrotile_core::io::{RasterSource, RasterStore};
use hydrotile_core::raster::Raster;
use hydrotile_core::vector::{AttributeValue, Feature, VectorSink};
use hydrotile_core::{Error, ProgressSink, Result, FLOW_NODATA, NEIGHBOR_OFFSETS};
use hydrotile_parallel::{TileGrid, TileScheduler};

/// Nodata value of basin rasters.
pub const BASIN_NODATA: i64 = -1;

/// A drainage point: a cell plus its basin ID (`0` requests an
/// auto-assigned ID, the cell's flattened index + 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainagePoint {
    pub row: i64,
    pub col: i64,
    pub basin_id: i64,
}

/// Parameters for basin labeling.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasinParams {
    /// Keep basins that do not drain through any user point (labeled by
    /// their terminal outlet) instead of writing nodata.
    pub all_basins: bool,
}

/// Drainage-point bookkeeping shared by the core and tiled runs.
#[derive(Debug)]
pub struct BasinSummary {
    /// Basin → downstream basin (absent for outlet basins).
    pub graph: BTreeMap<i64, i64>,
    /// The drainage points with assigned IDs, in input order.
    pub points: Vec<DrainagePoint>,
    /// Points outside the raster or on nodata, silently skipped.
    pub dropped: u64,
}

/// Result of an in-memory labeling run.
#[derive(Debug)]
pub struct BasinLabeling {
    /// Basin IDs per cell; −1 outside any kept basin.
    pub basins: Raster<i64>,
    pub graph: BTreeMap<i64, i64>,
    pub points: Vec<DrainagePoint>,
    pub dropped: u64,
}

fn auto_id(row: usize, col: usize, width: usize) -> i64 {
    (row * width + col) as i64 + 1
}

/// Validate points against the direction raster; assign missing IDs.
pub(crate) fn ingest_points(
    width: usize,
    height: usize,
    direction_at: impl Fn(usize, usize) -> Result<u8>,
    points: &[DrainagePoint],
) -> Result<(Vec<DrainagePoint>, HashMap<(usize, usize), i64>, u64)> {
    let mut kept = Vec::new();
    let mut by_cell = HashMap::new();
    let mut dropped = 0u64;

    for point in points {
        if point.row < 0 || point.col < 0 || point.row >= height as i64 || point.col >= width as i64
        {
            dropped += 1;
            continue;
        }
        let (row, col) = (point.row as usize, point.col as usize);
        let dir = direction_at(row, col)?;
        if dir == FLOW_NODATA {
            dropped += 1;
            continue;
        }
        let basin_id = if point.basin_id == 0 {
            auto_id(row, col, width)
        } else if point.basin_id > 0 {
            point.basin_id
        } else {
            return Err(Error::invalid_input(
                "drainage point basin_id must be positive",
                point.row,
                point.col,
            ));
        };
        by_cell.insert((row, col), basin_id);
        kept.push(DrainagePoint {
            row: point.row,
            col: point.col,
            basin_id,
        });
    }
    Ok((kept, by_cell, dropped))
}

/// Label one tile (or the whole raster) upstream from its outlets.
///
/// `origin` is the global cell of `fdr`'s (0,0); `width` the raster
/// width for flat-index labels. Returns the label grid and the edges
/// discovered at drainage points (`dp_id → downstream label`).
fn label_tile(
    fdr: &Array2<u8>,
    origin: (usize, usize),
    width: usize,
    dp_by_cell: &HashMap<(usize, usize), i64>,
) -> (Array2<i64>, BTreeMap<i64, i64>) {
    let (rows, cols) = fdr.dim();
    let mut labels = Array2::<i64>::zeros((rows, cols));
    let mut graph = BTreeMap::new();
    let mut queue: VecDeque<(usize, usize)> = VecDeque::new();

    for row in 0..rows {
        for col in 0..cols {
            let dir = fdr[(row, col)];
            if dir == FLOW_NODATA {
                continue;
            }
            let global = (origin.0 + row, origin.1 + col);
            let is_outlet = if !is_direction(dir) {
                true
            } else {
                let (nr, nc) = step(row as isize, col as isize, dir);
                if nr < 0 || nc < 0 || nr as usize >= rows || nc as usize >= cols {
                    true
                } else {
                    fdr[(nr as usize, nc as usize)] == FLOW_NODATA
                }
            };
            if is_outlet {
                let label = dp_by_cell
                    .get(&global)
                    .copied()
                    .unwrap_or_else(|| auto_id(global.0, global.1, width));
                labels[(row, col)] = label;
                queue.push_back((row, col));
            }
        }
    }

    while let Some((row, col)) = queue.pop_front() {
        let label = labels[(row, col)];
        for (code, &(dr, dc)) in NEIGHBOR_OFFSETS.iter().enumerate() {
            let nr = row as isize + dr;
            let nc = col as isize + dc;
            if nr < 0 || nc < 0 || nr as usize >= rows || nc as usize >= cols {
                continue;
            }
            let n = (nr as usize, nc as usize);
            if labels[n] != 0 {
                continue;
            }
            // the neighbor drains into (row, col) iff it points back
            if fdr[n] != opposite(code as u8) {
                continue;
            }
            let global_n = (origin.0 + n.0, origin.1 + n.1);
            let next_label = match dp_by_cell.get(&global_n) {
                Some(&dp_id) => {
                    graph.insert(dp_id, label);
                    dp_id
                }
                None => label,
            };
            labels[n] = next_label;
            queue.push_back(n);
        }
    }

    (labels, graph)
}

/// Label basins of an in-memory direction raster.
pub fn label_basins(
    fdr: &Raster<u8>,
    points: &[DrainagePoint],
    params: BasinParams,
) -> Result<BasinLabeling> {
    let (kept, by_cell, dropped) =
        ingest_points(fdr.cols(), fdr.rows(), |r, c| fdr.get(r, c), points)?;

    let (mut labels, graph) = label_tile(fdr.data(), (0, 0), fdr.cols(), &by_cell);

    let dp_ids: HashSet<i64> = kept.iter().map(|p| p.basin_id).collect();
    for value in labels.iter_mut() {
        if *value == 0 || (!params.all_basins && !dp_ids.contains(value)) {
            *value = BASIN_NODATA;
        }
    }

    let mut basins = fdr.with_same_meta::<i64>(fdr.rows(), fdr.cols());
    basins.set_nodata(Some(BASIN_NODATA));
    *basins.data_mut() = labels;

    Ok(BasinLabeling {
        basins,
        graph,
        points: kept,
        dropped,
    })
}

/// Tiled basin labeling.
///
/// `labels_scratch` holds the tile-local labels between passes; `output`
/// receives the resolved basins.
pub fn label_basins_tiled(
    fdr: &dyn RasterSource<u8>,
    output: &dyn RasterStore<i64>,
    labels_scratch: &dyn RasterStore<i64>,
    points: &[DrainagePoint],
    params: BasinParams,
    chunk_size: usize,
    scheduler: &TileScheduler,
    progress: &dyn ProgressSink,
) -> Result<BasinSummary> {
    let width = fdr.width();
    let grid = TileGrid::new(width, fdr.height(), chunk_size, 0);
    let (kept, by_cell, dropped) = ingest_points(
        width,
        fdr.height(),
        |r, c| Ok(fdr.read_window(c, r, 1, 1)?[(0, 0)]),
        points,
    )?;
    progress.metric("drainage_points_dropped", dropped);

    // --- local phase ---
    struct TileRecord {
        graph: BTreeMap<i64, i64>,
        /// (global cell, direction, label) per perimeter cell
        perimeter: Vec<((usize, usize), u8, i64)>,
    }
    let records: Mutex<Vec<Option<TileRecord>>> =
        Mutex::new((0..grid.tile_count()).map(|_| None).collect());

    scheduler.run(&grid, "basins/local", progress, |tile| {
        let directions = fdr.read_window(tile.col0, tile.row0, tile.cols, tile.rows)?;
        let (labels, graph) = label_tile(&directions, (tile.row0, tile.col0), width, &by_cell);
        labels_scratch.write_window(tile.col0, tile.row0, labels.view())?;

        let (rows, cols) = directions.dim();
        let mut perimeter = Vec::new();
        for row in 0..rows {
            for col in 0..cols {
                if row == 0 || col == 0 || row == rows - 1 || col == cols - 1 {
                    perimeter.push((
                        (tile.row0 + row, tile.col0 + col),
                        directions[(row, col)],
                        labels[(row, col)],
                    ));
                }
            }
        }
        records.lock().unwrap_or_else(|e| e.into_inner())[tile.index] =
            Some(TileRecord { graph, perimeter });
        Ok(())
    })?;

    // --- global phase ---
    scheduler.cancel_token().check()?;
    let records = records.into_inner().unwrap_or_else(|e| e.into_inner());

    let mut edges: BTreeMap<i64, i64> = BTreeMap::new();
    let mut label_of: HashMap<(usize, usize), i64> = HashMap::new();
    for record in records.iter().flatten() {
        for &(cell, _, label) in &record.perimeter {
            if label != 0 {
                label_of.insert(cell, label);
            }
        }
        for (&a, &b) in &record.graph {
            edges.insert(a, b);
        }
    }
    for record in records.iter().flatten() {
        for &((row, col), dir, label) in &record.perimeter {
            if label == 0 || !is_direction(dir) {
                continue;
            }
            let (nr, nc) = step(row as isize, col as isize, dir);
            if nr < 0 || nc < 0 || nr as usize >= grid.height || nc as usize >= grid.width {
                continue;
            }
            let target = (nr as usize, nc as usize);
            // only steps that cross into another tile matter here
            if target.0 / grid.tile_size == row / grid.tile_size
                && target.1 / grid.tile_size == col / grid.tile_size
            {
                continue;
            }
            if let Some(&target_label) = label_of.get(&target) {
                edges.insert(label, target_label);
            }
        }
    }

    let dp_ids: HashSet<i64> = kept.iter().map(|p| p.basin_id).collect();
    let resolved = resolve_labels(&edges, &dp_ids)?;

    // basin graph over drainage points (and terminal outlet basins)
    let mut graph = BTreeMap::new();
    for &dp_id in &dp_ids {
        if let Some(&downstream) = edges.get(&dp_id) {
            let target = if dp_ids.contains(&downstream) {
                downstream
            } else {
                *resolved.get(&downstream).unwrap_or(&downstream)
            };
            graph.insert(dp_id, target);
        }
    }

    // --- finalize phase ---
    let all_basins = params.all_basins;
    scheduler.run(&grid, "basins/finalize", progress, |tile| {
        let mut labels = labels_scratch.read_window(tile.col0, tile.row0, tile.cols, tile.rows)?;
        for value in labels.iter_mut() {
            if *value == 0 {
                *value = BASIN_NODATA;
                continue;
            }
            let class = *resolved.get(value).unwrap_or(value);
            *value = if dp_ids.contains(&class) || all_basins {
                class
            } else {
                BASIN_NODATA
            };
        }
        output.write_window(tile.col0, tile.row0, labels.view())
    })?;

    Ok(BasinSummary {
        graph,
        points: kept,
        dropped,
    })
}

/// Walk every label downstream to a drainage point or terminal outlet.
fn resolve_labels(
    edges: &BTreeMap<i64, i64>,
    dp_ids: &HashSet<i64>,
) -> Result<HashMap<i64, i64>> {
    let mut resolved: HashMap<i64, i64> = HashMap::new();
    for &start in edges.keys() {
        if resolved.contains_key(&start) {
            continue;
        }
        let mut path = vec![start];
        let mut cur = start;
        let terminal = loop {
            if let Some(&t) = resolved.get(&cur) {
                break t;
            }
            if dp_ids.contains(&cur) && cur != start {
                break cur;
            }
            match edges.get(&cur) {
                Some(&next) if dp_ids.contains(&next) => break next,
                Some(&next) => {
                    if path.len() > edges.len() + 1 {
                        return Err(Error::Internal("basin label cycle".into()));
                    }
                    path.push(next);
                    cur = next;
                }
                None => break cur,
            }
        };
        for label in path {
            // a drainage point always resolves to itself
            let value = if dp_ids.contains(&label) { label } else { terminal };
            resolved.insert(label, value);
        }
    }
    Ok(resolved)
}

/// Trace basin boundaries into closed rings and emit one polygon feature
/// per ring, tagged with its basin ID.
///
/// Boundaries run along cell edges between cells of different basin IDs
/// (and along the raster rim of labeled cells).
pub fn polygonize_basins(
    basins: &dyn RasterSource<i64>,
    sink: &dyn VectorSink,
    layer: &str,
) -> Result<usize> {
    let width = basins.width();
    let height = basins.height();
    let transform = basins.geotransform();

    // per-basin boundary segments between cell corners
    type Corner = (usize, usize); // (row, col) corner grid
    let mut segments: BTreeMap<i64, Vec<(Corner, Corner)>> = BTreeMap::new();
    let mut push = |label: i64, a: Corner, b: Corner| {
        if label != BASIN_NODATA {
            segments.entry(label).or_default().push((a, b));
        }
    };

    let mut previous: Option<Array2<i64>> = None;
    for row in 0..height {
        let current = basins.read_window(0, row, width, 1)?;
        for col in 0..width {
            let label = current[(0, col)];
            let above = previous
                .as_ref()
                .map(|p| p[(0, col)])
                .unwrap_or(BASIN_NODATA);
            if label != above {
                // horizontal edge between (row-1, col) and (row, col)
                push(label, (row, col), (row, col + 1));
                push(above, (row, col), (row, col + 1));
            }
            let left = if col == 0 {
                BASIN_NODATA
            } else {
                current[(0, col - 1)]
            };
            if label != left {
                push(label, (row, col), (row + 1, col));
                push(left, (row, col), (row + 1, col));
            }
            if col == width - 1 {
                push(label, (row, col + 1), (row + 1, col + 1));
            }
            if row == height - 1 {
                push(label, (row + 1, col), (row + 1, col + 1));
            }
        }
        previous = Some(current);
    }

    let mut count = 0usize;
    for (label, segs) in segments {
        for ring in chain_rings(&segs) {
            let points: Vec<(f64, f64)> = ring
                .iter()
                .map(|&(r, c)| transform.corner_to_geo(c, r))
                .collect();
            let polygon = Polygon::new(LineString::from(points), vec![]);
            let mut feature = Feature::new(Geometry::Polygon(polygon));
            feature.fid = Some(count as u64);
            feature.set_property("basin_id", AttributeValue::Int(label));
            sink.add_feature(layer, feature)?;
            count += 1;
        }
    }
    Ok(count)
}

/// Chain undirected corner segments into closed rings.
fn chain_rings(segments: &[((usize, usize), (usize, usize))]) -> Vec<Vec<(usize, usize)>> {
    let mut adjacency: BTreeMap<(usize, usize), Vec<usize>> = BTreeMap::new();
    for (i, &(a, b)) in segments.iter().enumerate() {
        adjacency.entry(a).or_default().push(i);
        adjacency.entry(b).or_default().push(i);
    }

    let mut used = vec![false; segments.len()];
    let mut rings = Vec::new();
    for start_index in 0..segments.len() {
        if used[start_index] {
            continue;
        }
        let (start, mut cur) = segments[start_index];
        used[start_index] = true;
        let mut ring = vec![start, cur];
        while cur != start {
            let next_index = adjacency[&cur]
                .iter()
                .copied()
                .find(|&i| !used[i]);
            let Some(i) = next_index else { break };
            used[i] = true;
            let (a, b) = segments[i];
            cur = if a == cur { b } else { a };
            ring.push(cur);
        }
        if ring.len() > 2 && ring.first() == ring.last() {
            rings.push(ring);
        }
    }
    rings
}
