//! Upstream flow length and longest flow paths.
//!
//! From every drainage point, an upstream breadth-first sweep claims the
//! cells draining through it and accumulates the along-path distance;
//! where two routes of a basin rejoin, the longer one wins (re-pushed
//! with relaxation). Distances are Euclidean in projected systems and
//! Haversine on cell centers in geographic ones.
//!
//! The longest flow path of a basin starts at the maximum-length cell
//! among the basin and its transitively upstream basins, and follows the
//! flow directions down to the drainage point.

use std::collections::{BTreeMap, HashMap, VecDeque};

use geo_types::{Geometry, LineString};

use hydrotile_core::flow::{is_direction, opposite, step};
use hydrotile_core::raster::Raster;
use hydrotile_core::vector::{AttributeValue, Feature, VectorSink};
use hydrotile_core::{Error, GeoTransform, Result, NEIGHBOR_OFFSETS};

use crate::basins::{DrainagePoint, BASIN_NODATA};

/// Nodata value of flow length rasters.
pub const FLOW_LENGTH_NODATA: f32 = -1.0;

/// Spherical earth radius used for Haversine distances, in meters.
/// Ellipsoidal flattening is ignored; fine at watershed scale.
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// The longest flow path of one basin.
#[derive(Debug, Clone)]
pub struct LongestPath {
    pub basin_id: i64,
    /// Along-path distance in map units (meters for geographic CRS).
    pub length: f64,
    /// Downstream-ordered cell-center polyline.
    pub line: Vec<(f64, f64)>,
}

/// Result of a flow length run.
#[derive(Debug)]
pub struct FlowLengthResult {
    /// Upstream flow length per cell; −1 outside claimed basins.
    pub lengths: Raster<f32>,
    /// Claiming basin per cell; −1 unclaimed.
    pub basins: Raster<i64>,
    /// Longest path per drainage point, in input order.
    pub longest_paths: Vec<LongestPath>,
    /// Basin → downstream basin.
    pub graph: BTreeMap<i64, i64>,
    /// The drainage points with assigned IDs.
    pub points: Vec<DrainagePoint>,
    /// Points outside the raster or on nodata, silently skipped.
    pub dropped: u64,
}

/// Distance metric over cell steps.
enum Metric {
    Projected { dx: f64, dy: f64 },
    Geographic { transform: GeoTransform },
}

impl Metric {
    fn for_raster(fdr: &Raster<u8>) -> Result<Self> {
        let transform = *fdr.transform();
        let projected = match fdr.crs() {
            Some(crs) => crs.is_projected().ok_or_else(|| {
                Error::Precondition(
                    "cannot classify CRS as projected or geographic".to_string(),
                )
            })?,
            // no CRS: distances fall back to map units
            None => true,
        };
        Ok(if projected {
            Metric::Projected {
                dx: transform.pixel_width.abs(),
                dy: transform.pixel_height.abs(),
            }
        } else {
            Metric::Geographic { transform }
        })
    }

    /// Distance between the centers of two adjacent cells.
    fn distance(&self, from: (usize, usize), to: (usize, usize)) -> f64 {
        match self {
            Metric::Projected { dx, dy } => {
                let dcol = (to.1 as f64 - from.1 as f64) * dx;
                let drow = (to.0 as f64 - from.0 as f64) * dy;
                (dcol * dcol + drow * drow).sqrt()
            }
            Metric::Geographic { transform } => {
                let (lon1, lat1) = transform.pixel_to_geo(from.1, from.0);
                let (lon2, lat2) = transform.pixel_to_geo(to.1, to.0);
                haversine(lat1, lon1, lat2, lon2)
            }
        }
    }
}

/// Great-circle distance between two lat/lon points, in meters.
fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1 = lat1.to_radians();
    let lat2 = lat2.to_radians();
    let dlat = lat2 - lat1;
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    EARTH_RADIUS_M * 2.0 * a.sqrt().asin()
}

/// Compute upstream flow lengths and longest flow paths from drainage
/// points over an in-memory direction raster.
pub fn flow_length(fdr: &Raster<u8>, points: &[DrainagePoint]) -> Result<FlowLengthResult> {
    let (rows, cols) = fdr.shape();
    let metric = Metric::for_raster(fdr)?;

    let (kept, _, dropped) =
        crate::basins::ingest_points(cols, rows, |r, c| fdr.get(r, c), points)?;

    let mut lengths = vec![f64::from(FLOW_LENGTH_NODATA); rows * cols];
    let mut basins = vec![BASIN_NODATA; rows * cols];
    let at = |r: usize, c: usize| r * cols + c;

    // claim all drainage points before any sweep so basins respect each
    // other regardless of processing order
    for point in &kept {
        let i = at(point.row as usize, point.col as usize);
        basins[i] = point.basin_id;
        lengths[i] = 0.0;
    }

    // per-basin maximum-length cell
    let mut max_cells: HashMap<i64, ((usize, usize), f64)> = HashMap::new();

    for point in &kept {
        let dp_id = point.basin_id;
        let start = (point.row as usize, point.col as usize);
        let mut queue: VecDeque<(usize, usize)> = VecDeque::new();
        queue.push_back(start);
        let mut best = (start, 0.0f64);

        while let Some(cell) = queue.pop_front() {
            let current = lengths[at(cell.0, cell.1)];
            for (code, &(dr, dc)) in NEIGHBOR_OFFSETS.iter().enumerate() {
                let nr = cell.0 as isize + dr;
                let nc = cell.1 as isize + dc;
                if nr < 0 || nc < 0 || nr as usize >= rows || nc as usize >= cols {
                    continue;
                }
                let n = (nr as usize, nc as usize);
                let dir = fdr.get(n.0, n.1)?;
                if dir != opposite(code as u8) {
                    continue;
                }
                let ni = at(n.0, n.1);
                if basins[ni] != BASIN_NODATA && basins[ni] != dp_id {
                    continue; // another basin's territory
                }
                let candidate = current + metric.distance(cell, n);
                if basins[ni] == BASIN_NODATA {
                    basins[ni] = dp_id;
                    lengths[ni] = candidate;
                    queue.push_back(n);
                } else if candidate > lengths[ni] {
                    // a longer rejoin route through a confluence
                    lengths[ni] = candidate;
                    queue.push_back(n);
                } else {
                    continue;
                }
                if candidate > best.1 {
                    best = (n, candidate);
                }
            }
        }
        max_cells.insert(dp_id, best);
    }

    // basin graph: where each drainage point's own flow continues
    let mut graph: BTreeMap<i64, i64> = BTreeMap::new();
    for point in &kept {
        let (row, col) = (point.row as usize, point.col as usize);
        let dir = fdr.get(row, col)?;
        if !is_direction(dir) {
            continue;
        }
        let (nr, nc) = step(row as isize, col as isize, dir);
        if nr < 0 || nc < 0 || nr as usize >= rows || nc as usize >= cols {
            continue;
        }
        let downstream = basins[at(nr as usize, nc as usize)];
        if downstream != BASIN_NODATA && downstream != point.basin_id {
            graph.insert(point.basin_id, downstream);
        }
    }
    // inverted: basin → basins draining into it
    let mut upstream: HashMap<i64, Vec<i64>> = HashMap::new();
    for (&from, &to) in &graph {
        upstream.entry(to).or_default().push(from);
    }

    let transform = *fdr.transform();
    let mut longest_paths = Vec::new();
    for point in &kept {
        let dp_id = point.basin_id;
        let outlet = (point.row as usize, point.col as usize);

        // transitively upstream basins, in deterministic order
        let mut candidates = vec![dp_id];
        let mut stack = vec![dp_id];
        while let Some(basin) = stack.pop() {
            if let Some(children) = upstream.get(&basin) {
                for &child in children {
                    if !candidates.contains(&child) {
                        candidates.push(child);
                        stack.push(child);
                    }
                }
            }
        }
        candidates.sort_unstable();

        // the greatest recorded max length supplies the start cell
        let mut start: Option<((usize, usize), f64)> = None;
        for basin in candidates {
            if let Some(&(cell, length)) = max_cells.get(&basin) {
                if length > 0.0 && start.map_or(true, |(_, best)| length > best) {
                    start = Some((cell, length));
                }
            }
        }
        let Some((start_cell, _)) = start else { continue };

        let cells = trace_downstream(fdr, start_cell, outlet, rows, cols)?;
        if cells.len() < 2 {
            continue;
        }
        let mut length = 0.0;
        for pair in cells.windows(2) {
            length += metric.distance(pair[0], pair[1]);
        }
        let line = cells
            .iter()
            .map(|&(r, c)| transform.pixel_to_geo(c, r))
            .collect();
        longest_paths.push(LongestPath {
            basin_id: dp_id,
            length,
            line,
        });
    }

    let mut lengths_raster = fdr.with_same_meta::<f32>(rows, cols);
    lengths_raster.set_nodata(Some(FLOW_LENGTH_NODATA));
    for row in 0..rows {
        for col in 0..cols {
            lengths_raster.set(row, col, lengths[at(row, col)] as f32)?;
        }
    }
    let mut basins_raster = fdr.with_same_meta::<i64>(rows, cols);
    basins_raster.set_nodata(Some(BASIN_NODATA));
    for row in 0..rows {
        for col in 0..cols {
            basins_raster.set(row, col, basins[at(row, col)])?;
        }
    }

    Ok(FlowLengthResult {
        lengths: lengths_raster,
        basins: basins_raster,
        longest_paths,
        graph,
        points: kept,
        dropped,
    })
}

/// Follow flow directions from `start` down to `outlet`.
fn trace_downstream(
    fdr: &Raster<u8>,
    start: (usize, usize),
    outlet: (usize, usize),
    rows: usize,
    cols: usize,
) -> Result<Vec<(usize, usize)>> {
    let mut path = vec![start];
    let mut cur = start;
    let limit = rows * cols;
    while cur != outlet {
        let dir = fdr.get(cur.0, cur.1)?;
        if !is_direction(dir) {
            break;
        }
        let (nr, nc) = step(cur.0 as isize, cur.1 as isize, dir);
        if nr < 0 || nc < 0 || nr as usize >= rows || nc as usize >= cols {
            break;
        }
        cur = (nr as usize, nc as usize);
        path.push(cur);
        if path.len() > limit {
            return Err(Error::Internal("flow path does not reach outlet".into()));
        }
    }
    Ok(path)
}

/// Write longest-path features (`basin_id`, `length`) to a sink layer.
pub fn write_longest_paths(
    paths: &[LongestPath],
    sink: &dyn VectorSink,
    layer: &str,
) -> Result<()> {
    for (fid, path) in paths.iter().enumerate() {
        let line: LineString<f64> = path.line.iter().map(|&(x, y)| (x, y)).collect();
        let mut feature = Feature::new(Geometry::LineString(line));
        feature.fid = Some(fid as u64);
        feature.set_property("basin_id", AttributeValue::Int(path.basin_id));
        feature.set_property("length", AttributeValue::Float(path.length));
        sink.add_feature(layer, feature)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrotile_core::{Crs, FlowDir, GeoTransform, FLOW_NODATA};

    /// 5x5 plane flowing due south; two drainage points on the bottom row.
    fn south_plane() -> (Raster<u8>, Vec<DrainagePoint>) {
        let mut fdr = Raster::filled(5, 5, FlowDir::South as u8);
        fdr.set_nodata(Some(FLOW_NODATA));
        fdr.set_transform(GeoTransform::new(0.0, 5.0, 1.0, -1.0));
        fdr.set_crs(Some(Crs::web_mercator()));
        let points = vec![
            DrainagePoint { row: 4, col: 1, basin_id: 0 },
            DrainagePoint { row: 4, col: 3, basin_id: 0 },
        ];
        (fdr, points)
    }

    #[test]
    fn test_two_basin_lengths() {
        let (fdr, points) = south_plane();
        let result = flow_length(&fdr, &points).unwrap();

        // each drainage point claims its own column
        for row in 0..5 {
            assert_eq!(result.basins.get(row, 1).unwrap(), result.points[0].basin_id);
            assert_eq!(result.basins.get(row, 3).unwrap(), result.points[1].basin_id);
            // other columns flow past the points, not through them
            assert_eq!(result.basins.get(row, 0).unwrap(), BASIN_NODATA);
        }

        // lengths count up going upstream, zero at the point
        for row in 0..5 {
            assert_eq!(result.lengths.get(row, 1).unwrap(), (4 - row) as f32);
        }
        assert_eq!(result.lengths.get(4, 1).unwrap(), 0.0);
        // unclaimed cells are nodata
        assert_eq!(result.lengths.get(2, 0).unwrap(), FLOW_LENGTH_NODATA);
    }

    #[test]
    fn test_length_recurrence() {
        // L(c) = L(downstream(c)) + d(c, downstream(c))
        let (fdr, points) = south_plane();
        let result = flow_length(&fdr, &points).unwrap();
        for row in 0..4 {
            let here = result.lengths.get(row, 1).unwrap();
            let down = result.lengths.get(row + 1, 1).unwrap();
            assert!((here - down - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_longest_path_polyline() {
        let (fdr, points) = south_plane();
        let result = flow_length(&fdr, &points).unwrap();

        assert_eq!(result.longest_paths.len(), 2);
        let path = &result.longest_paths[0];
        assert_eq!(path.basin_id, result.points[0].basin_id);
        assert!((path.length - 4.0).abs() < 1e-6);
        // starts at the farthest cell (0,1), ends at the outlet (4,1)
        assert_eq!(path.line.len(), 5);
        assert_eq!(path.line[0], (1.5, 4.5));
        assert_eq!(path.line[4], (1.5, 0.5));
    }

    #[test]
    fn test_chained_basins_graph() {
        // a single stream: west-to-east flow with two points on it
        let mut fdr = Raster::filled(1, 6, FlowDir::East as u8);
        fdr.set_nodata(Some(FLOW_NODATA));
        fdr.set_crs(Some(Crs::web_mercator()));
        let points = vec![
            DrainagePoint { row: 0, col: 2, basin_id: 0 },
            DrainagePoint { row: 0, col: 4, basin_id: 0 },
        ];
        let result = flow_length(&fdr, &points).unwrap();
        let (up, down) = (result.points[0].basin_id, result.points[1].basin_id);

        // the upstream point drains into the downstream point's basin
        assert_eq!(result.graph.get(&up), Some(&down));

        // the downstream basin's longest path starts in the upstream
        // basin's headwater and runs to its own outlet
        let path = result
            .longest_paths
            .iter()
            .find(|p| p.basin_id == down)
            .unwrap();
        assert_eq!(path.line.first(), Some(&(0.5, -0.5)));
        assert_eq!(path.line.last(), Some(&(4.5, -0.5)));
        assert!((path.length - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_haversine_distances() {
        // three cells along the equator, one degree apart
        let mut fdr = Raster::filled(1, 3, FlowDir::East as u8);
        fdr.set_nodata(Some(FLOW_NODATA));
        fdr.set_transform(GeoTransform::new(0.0, 0.5, 1.0, -1.0));
        fdr.set_crs(Some(Crs::wgs84()));
        let points = vec![DrainagePoint { row: 0, col: 2, basin_id: 0 }];
        let result = flow_length(&fdr, &points).unwrap();

        let one_degree = EARTH_RADIUS_M * 1.0f64.to_radians();
        let length = result.lengths.get(0, 0).unwrap() as f64;
        assert!((length - 2.0 * one_degree).abs() < 1.0, "got {}", length);
    }

    #[test]
    fn test_unknown_crs_classification_fails() {
        let mut fdr = Raster::filled(1, 3, FlowDir::East as u8);
        fdr.set_crs(Some(Crs::from_wkt("LOCAL_CS[\"unknown\"]")));
        let points = vec![DrainagePoint { row: 0, col: 2, basin_id: 0 }];
        let err = flow_length(&fdr, &points).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }
}
