//! Stream network extraction.
//!
//! Cells whose flow accumulation meets a threshold are stream cells.
//! Network nodes are stream cells with zero stream inflows (sources) or
//! two and more (confluences); outlets are stream cells draining to
//! nodata or off the raster. Reaches are traced downstream from node to
//! node and vectorized as cell-center polylines.
//!
//! In tiled mode each tile traces independently; partial reaches end one
//! cell past the tile interior, so the two halves of a cut reach share a
//! boundary cell. A hash over endpoint cells then stitches every pair of
//! matching ends back into one reach.

use std::collections::BTreeMap;
use std::sync::Mutex;

use geo_types::{Geometry, LineString, Point};
use ndarray::Array2;

use hydrotile_core::flow::{is_direction, step};
use hydrotile_core::io::{RasterSink, RasterSource};
use hydrotile_core::raster::Raster;
use hydrotile_core::vector::{AttributeValue, Feature, VectorSink};
use hydrotile_core::{Error, GeoTransform, ProgressSink, Result, FLOW_NODATA, NEIGHBOR_OFFSETS};
use hydrotile_parallel::{read_buffered, write_interior, TileGrid, TileScheduler};

use crate::accumulation::ACC_NODATA;

/// Parameters for stream extraction.
#[derive(Debug, Clone)]
pub struct StreamParams {
    /// Accumulation threshold (cell counts) for stream classification.
    pub threshold: i64,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self { threshold: 1000 }
    }
}

/// Junction classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JunctionKind {
    Source,
    Confluence,
    Outlet,
}

impl JunctionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JunctionKind::Source => "source",
            JunctionKind::Confluence => "confluence",
            JunctionKind::Outlet => "outlet",
        }
    }
}

/// A junction point in world coordinates.
#[derive(Debug, Clone)]
pub struct Junction {
    pub x: f64,
    pub y: f64,
    pub kind: JunctionKind,
}

/// The vectorized network.
#[derive(Debug, Clone, Default)]
pub struct StreamNetwork {
    /// Downstream-ordered cell-center polylines.
    pub reaches: Vec<Vec<(f64, f64)>>,
    pub junctions: Vec<Junction>,
}

/// Per-tile trace result in global cell coordinates.
#[derive(Debug, Default)]
struct TileTraces {
    segments: Vec<Vec<(i64, i64)>>,
    junctions: Vec<(i64, i64, JunctionKind)>,
}

#[inline]
fn is_stream(acc: i64, threshold: i64) -> bool {
    acc != ACC_NODATA && acc >= threshold
}

/// Trace one buffered tile.
///
/// The buffer carries a halo of one cell; `origin` is the global cell of
/// the buffer's (0,0). Node detection covers the interior only; walks may
/// step one cell into the halo to mark where a reach continues in the
/// neighboring tile.
fn trace_tile(
    acc: &Array2<i64>,
    fdr: &Array2<u8>,
    threshold: i64,
    origin: (i64, i64),
) -> TileTraces {
    let (rows, cols) = fdr.dim();
    let interior =
        |r: usize, c: usize| r >= 1 && c >= 1 && r < rows - 1 && c < cols - 1;
    let stream = |r: usize, c: usize| is_stream(acc[(r, c)], threshold);

    // inflow counts split into in-tile and halo contributions
    let inflows = |r: usize, c: usize| -> (usize, usize) {
        let mut from_interior = 0;
        let mut from_halo = 0;
        for &(dr, dc) in &NEIGHBOR_OFFSETS {
            let nr = r as isize + dr;
            let nc = c as isize + dc;
            if nr < 0 || nc < 0 || nr as usize >= rows || nc as usize >= cols {
                continue;
            }
            let n = (nr as usize, nc as usize);
            if !stream(n.0, n.1) || !is_direction(fdr[n]) {
                continue;
            }
            let (tr, tc) = step(nr, nc, fdr[n]);
            if (tr, tc) == (r as isize, c as isize) {
                if interior(n.0, n.1) {
                    from_interior += 1;
                } else {
                    from_halo += 1;
                }
            }
        }
        (from_interior, from_halo)
    };

    let mut result = TileTraces::default();
    let mut is_node = Array2::<bool>::from_elem((rows, cols), false);
    let mut starts: Vec<(usize, usize)> = Vec::new();

    for row in 1..rows - 1 {
        for col in 1..cols - 1 {
            if !stream(row, col) {
                continue;
            }
            let (from_interior, from_halo) = inflows(row, col);
            let total = from_interior + from_halo;

            let dir = fdr[(row, col)];
            let terminal = if is_direction(dir) {
                let (nr, nc) = step(row as isize, col as isize, dir);
                fdr[(nr as usize, nc as usize)] == FLOW_NODATA
            } else {
                true
            };

            let kind = if total >= 2 {
                Some(JunctionKind::Confluence)
            } else if total == 0 {
                Some(JunctionKind::Source)
            } else if terminal {
                Some(JunctionKind::Outlet)
            } else {
                None
            };
            if let Some(kind) = kind {
                let global = (origin.0 + row as i64, origin.1 + col as i64);
                result.junctions.push((global.0, global.1, kind));
            }

            if total >= 2 || total == 0 {
                is_node[(row, col)] = true;
                starts.push((row, col));
            } else if from_halo > 0 {
                // mid-reach entry from the neighboring tile
                starts.push((row, col));
            }
        }
    }

    for &(row, col) in &starts {
        let mut points = vec![(origin.0 + row as i64, origin.1 + col as i64)];
        let mut cur = (row, col);
        loop {
            let dir = fdr[cur];
            if !is_direction(dir) {
                break;
            }
            let (nr, nc) = step(cur.0 as isize, cur.1 as isize, dir);
            let next = (nr as usize, nc as usize);
            if fdr[next] == FLOW_NODATA || !stream(next.0, next.1) {
                break;
            }
            points.push((origin.0 + nr as i64, origin.1 + nc as i64));
            if !interior(next.0, next.1) || is_node[next] {
                break;
            }
            cur = next;
        }
        if points.len() >= 2 {
            result.segments.push(points);
        }
    }

    result
}

/// Stitch partial reaches: any endpoint cell shared by exactly two
/// segment ends joins them, oriented by which ends meet.
fn stitch_segments(segments: Vec<Vec<(i64, i64)>>) -> Vec<Vec<(i64, i64)>> {
    let mut segments: Vec<Option<Vec<(i64, i64)>>> = segments.into_iter().map(Some).collect();

    loop {
        // endpoint cell → (segment, is_upstream_end)
        let mut buckets: BTreeMap<(i64, i64), Vec<(usize, bool)>> = BTreeMap::new();
        for (i, segment) in segments.iter().enumerate() {
            let Some(segment) = segment else { continue };
            buckets.entry(segment[0]).or_default().push((i, true));
            buckets
                .entry(*segment.last().expect("non-empty segment"))
                .or_default()
                .push((i, false));
        }

        let Some((&_, pair)) = buckets
            .iter()
            .find(|(_, v)| v.len() == 2 && v[0].0 != v[1].0)
        else {
            break;
        };
        let ((ia, a_start), (ib, b_start)) = (pair[0], pair[1]);
        let b = segments[ib].take().expect("segment alive");
        let a = segments[ia].as_mut().expect("segment alive");

        match (a_start, b_start) {
            (false, true) => {
                // downstream end of A meets upstream end of B
                a.extend(b.into_iter().skip(1));
            }
            (true, false) => {
                // upstream end of A meets downstream end of B
                let mut joined = b;
                joined.extend(a.iter().copied().skip(1));
                *a = joined;
            }
            (true, true) => {
                // upstream ends meet: reverse A, append B
                a.reverse();
                a.extend(b.into_iter().skip(1));
            }
            (false, false) => {
                // downstream ends meet: append reversed B
                a.extend(b.into_iter().rev().skip(1));
            }
        }
    }

    segments.into_iter().flatten().collect()
}

fn to_world(transform: &GeoTransform, cells: &[(i64, i64)]) -> Vec<(f64, f64)> {
    cells
        .iter()
        .map(|&(row, col)| transform.pixel_to_geo(col as usize, row as usize))
        .collect()
}

fn build_network(
    transform: &GeoTransform,
    segments: Vec<Vec<(i64, i64)>>,
    junctions: Vec<(i64, i64, JunctionKind)>,
) -> StreamNetwork {
    let reaches = segments
        .iter()
        .map(|cells| to_world(transform, cells))
        .collect();
    let junctions = junctions
        .into_iter()
        .map(|(row, col, kind)| {
            let (x, y) = transform.pixel_to_geo(col as usize, row as usize);
            Junction { x, y, kind }
        })
        .collect();
    StreamNetwork { reaches, junctions }
}

/// Write a network to the `streams` and `junctions` layers of a sink.
pub fn write_network(network: &StreamNetwork, sink: &dyn VectorSink) -> Result<()> {
    for (fid, reach) in network.reaches.iter().enumerate() {
        let line: LineString<f64> = reach.iter().map(|&(x, y)| (x, y)).collect();
        let mut feature = Feature::new(Geometry::LineString(line));
        feature.fid = Some(fid as u64);
        sink.add_feature("streams", feature)?;
    }
    for (fid, junction) in network.junctions.iter().enumerate() {
        let mut feature = Feature::new(Geometry::Point(Point::new(junction.x, junction.y)));
        feature.fid = Some(fid as u64);
        feature.set_property(
            "type",
            AttributeValue::String(junction.kind.as_str().to_string()),
        );
        sink.add_feature("junctions", feature)?;
    }
    Ok(())
}

/// Extract the stream network of in-memory rasters.
///
/// Returns the network and the 1/0 stream classification raster.
pub fn extract_streams(
    fac: &Raster<i64>,
    fdr: &Raster<u8>,
    params: &StreamParams,
) -> Result<(StreamNetwork, Raster<u8>)> {
    let (rows, cols) = fac.shape();
    if fdr.shape() != (rows, cols) {
        return Err(Error::SizeMismatch {
            er: rows,
            ec: cols,
            ar: fdr.rows(),
            ac: fdr.cols(),
        });
    }

    let mut acc_buf = Array2::from_elem((rows + 2, cols + 2), ACC_NODATA);
    acc_buf
        .slice_mut(ndarray::s![1..rows + 1, 1..cols + 1])
        .assign(fac.data());
    let mut fdr_buf = Array2::from_elem((rows + 2, cols + 2), FLOW_NODATA);
    fdr_buf
        .slice_mut(ndarray::s![1..rows + 1, 1..cols + 1])
        .assign(fdr.data());

    let traces = trace_tile(&acc_buf, &fdr_buf, params.threshold, (-1, -1));
    let segments = stitch_segments(traces.segments);
    let network = build_network(fac.transform(), segments, traces.junctions);

    let mut mask = fac.with_same_meta::<u8>(rows, cols);
    mask.set_nodata(Some(0));
    for row in 0..rows {
        for col in 0..cols {
            if is_stream(fac.get(row, col)?, params.threshold) {
                mask.set(row, col, 1)?;
            }
        }
    }
    Ok((network, mask))
}

/// Tiled stream extraction.
///
/// Writes the stream classification raster and the stitched vector
/// layers; returns the network.
pub fn extract_streams_tiled(
    fac: &dyn RasterSource<i64>,
    fdr: &dyn RasterSource<u8>,
    stream_raster: &dyn RasterSink<u8>,
    vector_sink: &dyn VectorSink,
    params: &StreamParams,
    chunk_size: usize,
    scheduler: &TileScheduler,
    progress: &dyn ProgressSink,
) -> Result<StreamNetwork> {
    let grid = TileGrid::new(fac.width(), fac.height(), chunk_size, 1);
    let threshold = params.threshold;
    let transform = fac.geotransform();

    let collected: Mutex<(Vec<Vec<(i64, i64)>>, Vec<(i64, i64, JunctionKind)>)> =
        Mutex::new((Vec::new(), Vec::new()));

    scheduler.run(&grid, "streams", progress, |tile| {
        let acc_buf = read_buffered(fac, tile)?;
        let fdr_buf = read_buffered(fdr, tile)?;

        let origin = (
            tile.row0 as i64 - tile.halo as i64,
            tile.col0 as i64 - tile.halo as i64,
        );
        let traces = trace_tile(&acc_buf, &fdr_buf, threshold, origin);

        let mask = acc_buf.mapv(|v| u8::from(is_stream(v, threshold)));
        write_interior(stream_raster, tile, &mask)?;

        let mut collected = collected.lock().unwrap_or_else(|e| e.into_inner());
        collected.0.extend(traces.segments);
        collected.1.extend(traces.junctions);
        Ok(())
    })?;

    scheduler.cancel_token().check()?;
    let (segments, junctions) = collected.into_inner().unwrap_or_else(|e| e.into_inner());
    // deterministic stitch order regardless of tile completion order
    let mut segments = segments;
    segments.sort_unstable();
    let mut junctions = junctions;
    junctions.sort_unstable_by_key(|&(r, c, _)| (r, c));

    let stitched = stitch_segments(segments);
    let network = build_network(&transform, stitched, junctions);
    write_network(&network, vector_sink)?;
    Ok(network)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrotile_core::io::MemoryRaster;
    use hydrotile_core::vector::MemoryVectorStore;
    use hydrotile_core::{FlowDir, SilentProgress};
    use hydrotile_parallel::CancelToken;

    /// A Y-shaped network on a 6x8 raster: two branches meet at (2,3),
    /// the main stem exits the bottom edge at (5,3).
    fn y_network() -> (Raster<i64>, Raster<u8>) {
        let s = FlowDir::South as u8;
        let mut fdr = Raster::filled(6, 8, s);
        fdr.set_nodata(Some(FLOW_NODATA));
        let se = FlowDir::SouthEast as u8;
        let sw = FlowDir::SouthWest as u8;
        fdr.set(0, 1, se).unwrap();
        fdr.set(1, 2, se).unwrap();
        fdr.set(0, 5, sw).unwrap();
        fdr.set(1, 4, sw).unwrap();
        // (2,3) .. (5,3) already point south

        let mut fac = Raster::filled(6, 8, 1i64);
        fac.set_nodata(Some(ACC_NODATA));
        let stream_cells = [
            (0, 1),
            (1, 2),
            (0, 5),
            (1, 4),
            (2, 3),
            (3, 3),
            (4, 3),
            (5, 3),
        ];
        for &(r, c) in &stream_cells {
            fac.set(r, c, 5).unwrap();
        }
        (fac, fdr)
    }

    fn params() -> StreamParams {
        StreamParams { threshold: 5 }
    }

    #[test]
    fn test_core_y_network() {
        let (fac, fdr) = y_network();
        let (network, mask) = extract_streams(&fac, &fdr, &params()).unwrap();

        assert_eq!(network.reaches.len(), 3);
        let confluences: Vec<_> = network
            .junctions
            .iter()
            .filter(|j| j.kind == JunctionKind::Confluence)
            .collect();
        assert_eq!(confluences.len(), 1);
        let sources = network
            .junctions
            .iter()
            .filter(|j| j.kind == JunctionKind::Source)
            .count();
        assert_eq!(sources, 2);
        let outlets = network
            .junctions
            .iter()
            .filter(|j| j.kind == JunctionKind::Outlet)
            .count();
        assert_eq!(outlets, 1);

        // mask counts the 8 stream cells
        let total: u64 = mask.data().iter().map(|&v| v as u64).sum();
        assert_eq!(total, 8);
    }

    #[test]
    fn test_reaches_follow_flow() {
        let (fac, fdr) = y_network();
        let (network, _) = extract_streams(&fac, &fdr, &params()).unwrap();
        // every reach is downstream-ordered: consecutive cell centers are
        // one cell apart
        for reach in &network.reaches {
            assert!(reach.len() >= 2);
            for pair in reach.windows(2) {
                let dx = (pair[1].0 - pair[0].0).abs();
                let dy = (pair[1].1 - pair[0].1).abs();
                assert!(dx <= 1.0 + 1e-9 && dy <= 1.0 + 1e-9);
            }
        }
    }

    #[test]
    fn test_tiled_stitching_matches_core() {
        let (fac, fdr) = y_network();
        let (expected, _) = extract_streams(&fac, &fdr, &params()).unwrap();

        let fac_source = MemoryRaster::from_raster(fac.clone());
        let fdr_source = MemoryRaster::from_raster(fdr);
        let mask_sink = MemoryRaster::<u8>::zeroed(6, 8, Default::default(), None, Some(0));
        let store = MemoryVectorStore::new();
        let scheduler = TileScheduler::new(true, CancelToken::new());

        let network = extract_streams_tiled(
            &fac_source,
            &fdr_source,
            &mask_sink,
            &store,
            &params(),
            4,
            &scheduler,
            &SilentProgress,
        )
        .unwrap();

        // scenario: exactly three reaches and one confluence after stitching
        assert_eq!(network.reaches.len(), expected.reaches.len());
        assert_eq!(network.junctions.len(), expected.junctions.len());
        assert_eq!(
            network
                .junctions
                .iter()
                .filter(|j| j.kind == JunctionKind::Confluence)
                .count(),
            1
        );

        // the layers went to the sink
        assert_eq!(store.layer("streams").len(), 3);
        assert_eq!(store.layer("junctions").len(), 4);

        // reach point sets agree with the in-memory extraction
        let mut expected_sets: Vec<Vec<(i64, i64)>> = expected
            .reaches
            .iter()
            .map(|r| r.iter().map(|&(x, y)| (x as i64, y as i64)).collect())
            .collect();
        expected_sets.sort();
        let mut got_sets: Vec<Vec<(i64, i64)>> = network
            .reaches
            .iter()
            .map(|r| r.iter().map(|&(x, y)| (x as i64, y as i64)).collect())
            .collect();
        got_sets.sort();
        assert_eq!(got_sets, expected_sets);
    }

    #[test]
    fn test_stitch_orientation_cases() {
        // A ends where B starts
        let stitched = stitch_segments(vec![
            vec![(0, 0), (0, 1)],
            vec![(0, 1), (0, 2)],
        ]);
        assert_eq!(stitched, vec![vec![(0, 0), (0, 1), (0, 2)]]);

        // A starts where B ends (prepend)
        let stitched = stitch_segments(vec![
            vec![(0, 1), (0, 2)],
            vec![(0, 0), (0, 1)],
        ]);
        assert_eq!(stitched, vec![vec![(0, 0), (0, 1), (0, 2)]]);

        // three ends at one cell: left alone
        let stitched = stitch_segments(vec![
            vec![(0, 0), (1, 1)],
            vec![(0, 2), (1, 1)],
            vec![(1, 1), (2, 1)],
        ]);
        assert_eq!(stitched.len(), 3);
    }
}
