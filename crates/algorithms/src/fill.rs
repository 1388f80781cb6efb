//! Priority-Flood depression filling.
//!
//! The per-tile kernel follows Barnes, Lehman & Mulla (2014): a min-heap
//! keyed on elevation plus a FIFO "pit" queue that takes priority over the
//! heap. Cells flood inward from the tile border; each flood front carries
//! a watershed label, and where two fronts meet a spill edge
//! `(labelA, labelB, max(zA, zB))` is recorded. The tiled driver in
//! [`crate::fill_tiled`] merges the per-tile spill graphs and resolves the
//! final fill elevation of every label with a minimax solve.
//!
//! Reference:
//! Barnes, R., Lehman, C., & Mulla, D. (2014). Priority-Flood: An optimal
//! depression-filling and watershed-labeling algorithm for digital
//! elevation models. *Computers & Geosciences*, 62, 117–127.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use ndarray::Array2;

use hydrotile_core::raster::Raster;
use hydrotile_core::{Algorithm, RasterElement, Result, NEIGHBOR_OFFSETS};
use hydrotile_parallel::Sides;

/// Watershed label reserved for "edge"/off-raster.
pub const EDGE_LABEL: i64 = 1;

/// First label handed out by the flood.
pub const FIRST_LABEL: i64 = 2;

/// A cell in the flood queue, ordered by elevation with insertion-order
/// tie breaking (min-heap via reversed comparison).
#[derive(Debug, Clone)]
struct FloodCell {
    z: f64,
    seq: u64,
    row: usize,
    col: usize,
}

impl PartialEq for FloodCell {
    fn eq(&self, other: &Self) -> bool {
        self.z == other.z && self.seq == other.seq
    }
}

impl Eq for FloodCell {}

impl PartialOrd for FloodCell {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FloodCell {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse: lower elevation first, earlier insertion on ties
        other
            .z
            .partial_cmp(&self.z)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Spill graph of one tile: `(min(a,b), max(a,b)) → lowest spill`.
pub type SpillGraph = HashMap<(i64, i64), f64>;

/// Record a spill edge, keeping the minimum over duplicates.
pub fn add_spill(graph: &mut SpillGraph, a: i64, b: i64, spill: f64) {
    if a == b {
        return;
    }
    let key = (a.min(b), a.max(b));
    graph
        .entry(key)
        .and_modify(|s| {
            if spill < *s {
                *s = spill;
            }
        })
        .or_insert(spill);
}

/// Result of the per-tile flood.
#[derive(Debug)]
pub struct TileFillResult {
    /// Per-cell watershed labels; `EDGE_LABEL` marks drain-to-outside.
    pub labels: Array2<i64>,
    /// Spill edges between local labels (and `EDGE_LABEL`).
    pub graph: SpillGraph,
    /// First unused local label.
    pub next_label: i64,
}

/// Flood one tile in place.
///
/// `dem` is raised to the locally resolved elevations; `sides` marks which
/// tile sides lie on the raster border (those contribute
/// `(EDGE_LABEL, label)` spill entries). With `fill_holes`, nodata cells
/// in the tile interior join the flood (they end up at the lowest
/// elevation the flood reaches them with); nodata cells on the tile
/// border are seeded at −∞ and stay nodata locally.
pub fn priority_flood_tile(
    dem: &mut Array2<f32>,
    nodata: Option<f32>,
    sides: Sides,
    fill_holes: bool,
) -> TileFillResult {
    let (rows, cols) = dem.dim();
    let mut labels = Array2::<i64>::zeros((rows, cols));
    let mut queued = Array2::<bool>::from_elem((rows, cols), false);
    // flood elevations; nodata participates at −∞
    let mut zwork = Array2::<f64>::zeros((rows, cols));
    let mut heap = BinaryHeap::new();
    let mut pit_queue: VecDeque<(usize, usize)> = VecDeque::new();
    let mut graph = SpillGraph::new();
    let mut next_label = FIRST_LABEL;
    let mut seq: u64 = 0;

    for row in 0..rows {
        for col in 0..cols {
            let value = dem[(row, col)];
            let is_nd = value.is_nodata(nodata);
            let on_border = row == 0 || row == rows - 1 || col == 0 || col == cols - 1;
            zwork[(row, col)] = if is_nd { f64::NEG_INFINITY } else { value as f64 };

            if is_nd && !fill_holes {
                // open drain: seeded at −∞ under the edge label so the
                // flood climbs out of holes without raising their rims
                labels[(row, col)] = EDGE_LABEL;
                queued[(row, col)] = true;
                heap.push(FloodCell {
                    z: f64::NEG_INFINITY,
                    seq,
                    row,
                    col,
                });
                seq += 1;
            } else if on_border {
                heap.push(FloodCell {
                    z: zwork[(row, col)],
                    seq,
                    row,
                    col,
                });
                seq += 1;
                queued[(row, col)] = true;
            }
        }
    }

    while !pit_queue.is_empty() || !heap.is_empty() {
        let (row, col) = match pit_queue.pop_front() {
            Some(cell) => cell,
            None => {
                let cell = heap.pop().expect("heap non-empty");
                (cell.row, cell.col)
            }
        };

        if labels[(row, col)] == 0 {
            labels[(row, col)] = next_label;
            next_label += 1;
        }
        let label = labels[(row, col)];
        let z = zwork[(row, col)];

        for &(dr, dc) in &NEIGHBOR_OFFSETS {
            let nr = row as isize + dr;
            let nc = col as isize + dc;
            if nr < 0 || nc < 0 || nr as usize >= rows || nc as usize >= cols {
                continue;
            }
            let n = (nr as usize, nc as usize);

            if labels[n] != 0 {
                if labels[n] != label {
                    add_spill(&mut graph, label, labels[n], z.max(zwork[n]));
                }
                continue;
            }
            labels[n] = label;
            if queued[n] {
                // a border seed still awaiting its pop; never raised
                continue;
            }
            queued[n] = true;
            if zwork[n] <= z {
                zwork[n] = z;
                pit_queue.push_back(n);
            } else {
                heap.push(FloodCell {
                    z: zwork[n],
                    seq,
                    row: n.0,
                    col: n.1,
                });
                seq += 1;
            }
        }
    }

    // raster-border sides spill to the outside at their own elevation
    let mut edge_spill = |row: usize, col: usize| {
        let label = labels[(row, col)];
        if label != EDGE_LABEL {
            add_spill(&mut graph, EDGE_LABEL, label, zwork[(row, col)]);
        }
    };
    if sides.top {
        (0..cols).for_each(|c| edge_spill(0, c));
    }
    if sides.bottom {
        (0..cols).for_each(|c| edge_spill(rows - 1, c));
    }
    if sides.left {
        (0..rows).for_each(|r| edge_spill(r, 0));
    }
    if sides.right {
        (0..rows).for_each(|r| edge_spill(r, cols - 1));
    }

    // write resolved elevations back; cells still at −∞ stay nodata
    for row in 0..rows {
        for col in 0..cols {
            let z = zwork[(row, col)];
            if z.is_finite() {
                dem[(row, col)] = z as f32;
            }
        }
    }

    TileFillResult {
        labels,
        graph,
        next_label,
    }
}

/// Resolve the final fill elevation of every label.
///
/// A priority flood over the label graph itself, seeded at the edge label
/// with −∞: each label's fill elevation is the minimum over all paths to
/// the edge of the maximum spill elevation along the path.
pub fn solve_spill_graph(graph: &SpillGraph) -> HashMap<i64, f64> {
    #[derive(PartialEq)]
    struct LabelEntry {
        z: f64,
        seq: u64,
        label: i64,
    }
    impl Eq for LabelEntry {}
    impl PartialOrd for LabelEntry {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }
    impl Ord for LabelEntry {
        fn cmp(&self, other: &Self) -> Ordering {
            other
                .z
                .partial_cmp(&self.z)
                .unwrap_or(Ordering::Equal)
                .then_with(|| other.seq.cmp(&self.seq))
        }
    }

    let mut adjacency: HashMap<i64, Vec<(i64, f64)>> = HashMap::new();
    for (&(a, b), &spill) in graph {
        adjacency.entry(a).or_default().push((b, spill));
        adjacency.entry(b).or_default().push((a, spill));
    }

    let mut fill = HashMap::new();
    let mut heap = BinaryHeap::new();
    let mut seq: u64 = 0;
    heap.push(LabelEntry {
        z: f64::NEG_INFINITY,
        seq,
        label: EDGE_LABEL,
    });

    while let Some(entry) = heap.pop() {
        if fill.contains_key(&entry.label) {
            continue;
        }
        fill.insert(entry.label, entry.z);
        if let Some(neighbors) = adjacency.get(&entry.label) {
            for &(next, spill) in neighbors {
                if !fill.contains_key(&next) {
                    seq += 1;
                    heap.push(LabelEntry {
                        z: entry.z.max(spill),
                        seq,
                        label: next,
                    });
                }
            }
        }
    }
    fill
}

/// Raise a tile to the resolved fill elevations.
///
/// Valid cells are raised to `max(z, fill[label])`; with `fill_holes`,
/// nodata cells whose label resolved to a finite elevation are written
/// that elevation.
pub fn apply_fill(
    dem: &mut Array2<f32>,
    labels: &Array2<i64>,
    fill: &HashMap<i64, f64>,
    nodata: Option<f32>,
    fill_holes: bool,
) {
    let (rows, cols) = dem.dim();
    for row in 0..rows {
        for col in 0..cols {
            let label = labels[(row, col)];
            if label <= EDGE_LABEL {
                continue;
            }
            let Some(&fill_z) = fill.get(&label) else {
                continue;
            };
            if !fill_z.is_finite() {
                continue;
            }
            let z = dem[(row, col)];
            if z.is_nodata(nodata) {
                if fill_holes {
                    dem[(row, col)] = fill_z as f32;
                }
            } else if (z as f64) < fill_z {
                dem[(row, col)] = fill_z as f32;
            }
        }
    }
}

/// Parameters for depression filling.
#[derive(Debug, Clone, Copy, Default)]
pub struct FillParams {
    /// Treat nodata holes as fillable interior instead of open drains.
    pub fill_holes: bool,
}

/// Fill depressions of an in-memory DEM.
///
/// Every non-nodata cell of the result has a non-increasing 8-path to the
/// raster boundary (or to nodata when `fill_holes` is off); no cell is
/// ever lowered.
pub fn fill_depressions(dem: &Raster<f32>, params: FillParams) -> Result<Raster<f32>> {
    let mut data = dem.data().clone();
    let sides = Sides {
        top: true,
        right: true,
        bottom: true,
        left: true,
    };
    let result = priority_flood_tile(&mut data, dem.nodata(), sides, params.fill_holes);
    let fill = solve_spill_graph(&result.graph);
    apply_fill(&mut data, &result.labels, &fill, dem.nodata(), params.fill_holes);

    let mut output = dem.with_same_meta::<f32>(dem.rows(), dem.cols());
    output.set_nodata(dem.nodata());
    *output.data_mut() = data;
    Ok(output)
}

/// Depression filling algorithm
#[derive(Debug, Clone, Default)]
pub struct FillDepressions;

impl Algorithm for FillDepressions {
    type Input = Raster<f32>;
    type Output = Raster<f32>;
    type Params = FillParams;

    fn name(&self) -> &'static str {
        "Fill Depressions (Priority-Flood)"
    }

    fn execute(&self, input: Self::Input, params: Self::Params) -> Result<Self::Output> {
        fill_depressions(&input, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrotile_core::GeoTransform;

    fn create_dem_with_sink() -> Raster<f32> {
        // 7x7 DEM with a depression in the center
        let mut dem = Raster::new(7, 7);
        dem.set_transform(GeoTransform::new(0.0, 7.0, 1.0, -1.0));

        let values = [
            9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0, //
            9.0, 8.0, 8.0, 8.0, 8.0, 8.0, 9.0, //
            9.0, 8.0, 7.0, 7.0, 7.0, 8.0, 9.0, //
            9.0, 8.0, 7.0, 3.0, 7.0, 8.0, 9.0, //
            9.0, 8.0, 7.0, 7.0, 7.0, 8.0, 9.0, //
            9.0, 8.0, 8.0, 8.0, 8.0, 8.0, 9.0, //
            9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0,
        ];
        for (idx, &val) in values.iter().enumerate() {
            dem.set(idx / 7, idx % 7, val).unwrap();
        }
        dem
    }

    #[test]
    fn test_fill_raises_sink_to_pour_point() {
        let dem = create_dem_with_sink();
        let filled = fill_depressions(&dem, FillParams::default()).unwrap();
        // the whole bowl drains over the 9.0 raster border, so the
        // interior fills flat to the rim
        assert_eq!(filled.get(3, 3).unwrap(), 9.0);
        assert_eq!(filled.get(1, 1).unwrap(), 9.0);
    }

    #[test]
    fn test_fill_never_lowers() {
        let dem = create_dem_with_sink();
        let filled = fill_depressions(&dem, FillParams::default()).unwrap();
        for row in 0..7 {
            for col in 0..7 {
                assert!(filled.get(row, col).unwrap() >= dem.get(row, col).unwrap());
            }
        }
    }

    #[test]
    fn test_fill_idempotent() {
        let dem = create_dem_with_sink();
        let once = fill_depressions(&dem, FillParams::default()).unwrap();
        let twice = fill_depressions(&once, FillParams::default()).unwrap();
        assert_eq!(once.data(), twice.data());
    }

    #[test]
    fn test_fill_no_change_on_clean_dem() {
        let mut dem = Raster::new(10, 10);
        for row in 0..10 {
            for col in 0..10 {
                dem.set(row, col, (row + col) as f32).unwrap();
            }
        }
        let filled = fill_depressions(&dem, FillParams::default()).unwrap();
        assert_eq!(filled.data(), dem.data());
    }

    #[test]
    fn test_fill_drains_everywhere() {
        // every non-nodata cell must have a non-increasing path to the border
        let dem = create_dem_with_sink();
        let filled = fill_depressions(&dem, FillParams::default()).unwrap();
        let (rows, cols) = filled.shape();
        for row in 1..rows - 1 {
            for col in 1..cols - 1 {
                let z = filled.get(row, col).unwrap();
                let has_escape = NEIGHBOR_OFFSETS.iter().any(|&(dr, dc)| {
                    let nr = (row as isize + dr) as usize;
                    let nc = (col as isize + dc) as usize;
                    filled.get(nr, nc).unwrap() <= z
                });
                assert!(has_escape, "cell ({}, {}) cannot drain", row, col);
            }
        }
    }

    #[test]
    fn test_fill_respects_low_outlet() {
        // border 10, interior 5, sink 1, one low border outlet 2
        let mut dem = Raster::new(5, 5);
        for row in 0..5 {
            for col in 0..5 {
                let border = row == 0 || row == 4 || col == 0 || col == 4;
                dem.set(row, col, if border { 10.0 } else { 5.0 }).unwrap();
            }
        }
        dem.set(2, 2, 1.0).unwrap();
        dem.set(4, 2, 2.0).unwrap();

        let filled = fill_depressions(&dem, FillParams::default()).unwrap();
        // interior fills to 5.0 (spill over the ring toward the low outlet),
        // not to the 10.0 border
        let center = filled.get(2, 2).unwrap();
        assert!((2.0..=5.0).contains(&center), "got {}", center);
    }

    #[test]
    fn test_fill_nodata_is_a_drain() {
        // a pit beside a nodata hole needs no raising when fill_holes=false
        let mut dem = Raster::new(5, 5);
        dem.set_nodata(Some(-9999.0));
        for row in 0..5 {
            for col in 0..5 {
                dem.set(row, col, 9.0).unwrap();
            }
        }
        dem.set(2, 2, 4.0).unwrap();
        dem.set(2, 3, -9999.0).unwrap();

        let filled = fill_depressions(&dem, FillParams::default()).unwrap();
        assert_eq!(filled.get(2, 2).unwrap(), 4.0);
        assert_eq!(filled.get(2, 3).unwrap(), -9999.0);
    }

    #[test]
    fn test_fill_holes_fills_interior_hole() {
        let mut dem = Raster::new(5, 5);
        dem.set_nodata(Some(-9999.0));
        let values = [
            -9999.0, 20.0, 30.0, 40.0, 50.0, //
            10.0, 20.0, 30.0, 40.0, 50.0, //
            10.0, 20.0, -9999.0, 40.0, 50.0, //
            10.0, 20.0, 30.0, 40.0, 50.0, //
            10.0, 20.0, 30.0, 40.0, 50.0,
        ];
        for (idx, &val) in values.iter().enumerate() {
            dem.set(idx / 5, idx % 5, val).unwrap();
        }

        let filled = fill_depressions(&dem, FillParams { fill_holes: true }).unwrap();
        // the interior hole takes the lowest elevation the flood reaches
        // it with: the minimum of its valid neighbors
        assert_eq!(filled.get(2, 2).unwrap(), 20.0);
        // the border hole stays nodata (it drains the raster edge)
        assert_eq!(filled.get(0, 0).unwrap(), -9999.0);
    }

    #[test]
    fn test_tile_kernel_labels_and_edge_spill() {
        // two depressions separated by a ridge; no raster border on any
        // side: the only graph entries are between flood labels
        let mut data = Array2::from_elem((5, 5), 9.0f32);
        data[(1, 1)] = 2.0;
        data[(3, 3)] = 3.0;
        let result = priority_flood_tile(&mut data, None, Sides::default(), false);
        assert!(result.next_label >= FIRST_LABEL);
        // every cell is labeled
        assert!(result.labels.iter().all(|&l| l >= EDGE_LABEL));
    }

    #[test]
    fn test_solve_spill_graph_minimax() {
        // edge -5- A -3- B  and  edge -9- B: B fills over A at 5
        let mut graph = SpillGraph::new();
        add_spill(&mut graph, EDGE_LABEL, 2, 5.0);
        add_spill(&mut graph, 2, 3, 3.0);
        add_spill(&mut graph, EDGE_LABEL, 3, 9.0);
        let fill = solve_spill_graph(&graph);
        assert_eq!(fill[&2], 5.0);
        assert_eq!(fill[&3], 5.0);
        assert_eq!(fill[&EDGE_LABEL], f64::NEG_INFINITY);
    }

    #[test]
    fn test_add_spill_keeps_minimum() {
        let mut graph = SpillGraph::new();
        add_spill(&mut graph, 2, 5, 5.0);
        add_spill(&mut graph, 5, 2, 4.0);
        add_spill(&mut graph, 2, 5, 6.0);
        assert_eq!(graph[&(2, 5)], 4.0);
        assert_eq!(graph.len(), 1);
    }
}
