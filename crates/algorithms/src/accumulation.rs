//! Flow accumulation.
//!
//! Counts, for every cell, the number of cells whose flow paths pass
//! through it (itself included): `acc = 1 + Σ acc(upstream)`. The sweep is
//! a FIFO topological sort over the in-tile flow graph; a raster with
//! undefined directions or cycles is invalid input.

use std::collections::VecDeque;

use ndarray::Array2;

use hydrotile_core::flow::{is_direction, step};
use hydrotile_core::raster::Raster;
use hydrotile_core::{Algorithm, Error, Result, FLOW_NODATA, FLOW_UNDEFINED};

/// Nodata value of accumulation rasters.
pub const ACC_NODATA: i64 = -1;

/// Where the within-tile walk from a perimeter cell first arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkKind {
    /// The cell's own direction leaves the tile.
    LeavesTile,
    /// The walk reaches another perimeter cell (local coordinates).
    NextPerimeter(usize, usize),
    /// The walk ends inside the tile (nodata).
    Terminal,
}

/// Local accumulation of one tile.
///
/// Only in-tile neighbors contribute; cross-tile inflow is added later by
/// the global offset pass. `origin` anchors error coordinates.
pub(crate) fn accumulate_tile(
    fdr: &Array2<u8>,
    origin: (usize, usize),
) -> Result<Array2<i64>> {
    let (rows, cols) = fdr.dim();
    let mut indegree = Array2::<u32>::zeros((rows, cols));
    let mut valid = 0usize;

    for row in 0..rows {
        for col in 0..cols {
            let dir = fdr[(row, col)];
            if dir == FLOW_NODATA {
                continue;
            }
            if dir == FLOW_UNDEFINED {
                return Err(Error::invalid_input(
                    "undefined flow direction; resolve flats first",
                    (origin.0 + row) as i64,
                    (origin.1 + col) as i64,
                ));
            }
            valid += 1;
            let (nr, nc) = step(row as isize, col as isize, dir);
            if nr >= 0 && nc >= 0 && (nr as usize) < rows && (nc as usize) < cols {
                let n = (nr as usize, nc as usize);
                if fdr[n] != FLOW_NODATA {
                    indegree[n] += 1;
                }
            }
        }
    }

    let mut acc = Array2::<i64>::from_elem((rows, cols), ACC_NODATA);
    let mut queue: VecDeque<(usize, usize)> = VecDeque::new();
    for row in 0..rows {
        for col in 0..cols {
            if fdr[(row, col)] != FLOW_NODATA {
                acc[(row, col)] = 1;
                if indegree[(row, col)] == 0 {
                    queue.push_back((row, col));
                }
            }
        }
    }

    let mut processed = 0usize;
    while let Some((row, col)) = queue.pop_front() {
        processed += 1;
        let dir = fdr[(row, col)];
        let (nr, nc) = step(row as isize, col as isize, dir);
        if nr < 0 || nc < 0 || nr as usize >= rows || nc as usize >= cols {
            continue;
        }
        let n = (nr as usize, nc as usize);
        if fdr[n] == FLOW_NODATA {
            continue;
        }
        acc[n] += acc[(row, col)];
        indegree[n] -= 1;
        if indegree[n] == 0 {
            queue.push_back(n);
        }
    }

    if processed < valid {
        // some cell sits on a cycle; report the first one
        for row in 0..rows {
            for col in 0..cols {
                if fdr[(row, col)] != FLOW_NODATA && indegree[(row, col)] > 0 {
                    return Err(Error::invalid_input(
                        "flow direction cycle",
                        (origin.0 + row) as i64,
                        (origin.1 + col) as i64,
                    ));
                }
            }
        }
    }

    Ok(acc)
}

/// Classify every perimeter cell's within-tile flow walk.
pub(crate) fn tile_links(fdr: &Array2<u8>) -> Result<Vec<((usize, usize), LinkKind)>> {
    let (rows, cols) = fdr.dim();
    let on_perimeter =
        |r: usize, c: usize| r == 0 || c == 0 || r == rows - 1 || c == cols - 1;

    let mut links = Vec::new();
    for row in 0..rows {
        for col in 0..cols {
            if !on_perimeter(row, col) {
                continue;
            }
            let dir = fdr[(row, col)];
            if !is_direction(dir) {
                links.push(((row, col), LinkKind::Terminal));
                continue;
            }
            let mut cur = (row as isize, col as isize);
            let mut kind = LinkKind::Terminal;
            let mut steps = 0usize;
            loop {
                let dir = fdr[(cur.0 as usize, cur.1 as usize)];
                if !is_direction(dir) {
                    kind = LinkKind::Terminal;
                    break;
                }
                let next = step(cur.0, cur.1, dir);
                if next.0 < 0
                    || next.1 < 0
                    || next.0 as usize >= rows
                    || next.1 as usize >= cols
                {
                    // only the starting perimeter cell can step off-tile;
                    // interior cells always have in-tile neighbors
                    kind = LinkKind::LeavesTile;
                    break;
                }
                let n = (next.0 as usize, next.1 as usize);
                if fdr[n] == FLOW_NODATA {
                    kind = LinkKind::Terminal;
                    break;
                }
                if on_perimeter(n.0, n.1) {
                    kind = LinkKind::NextPerimeter(n.0, n.1);
                    break;
                }
                cur = next;
                steps += 1;
                if steps > rows * cols {
                    return Err(Error::Internal("flow walk did not terminate".into()));
                }
            }
            links.push(((row, col), kind));
        }
    }
    Ok(links)
}

/// Flow accumulation of an in-memory direction raster.
pub fn flow_accumulation(fdr: &Raster<u8>) -> Result<Raster<i64>> {
    let acc = accumulate_tile(fdr.data(), (0, 0))?;
    let mut output = fdr.with_same_meta::<i64>(fdr.rows(), fdr.cols());
    output.set_nodata(Some(ACC_NODATA));
    *output.data_mut() = acc;
    Ok(output)
}

/// Flow accumulation algorithm
#[derive(Debug, Clone, Default)]
pub struct FlowAccumulation;

impl Algorithm for FlowAccumulation {
    type Input = Raster<u8>;
    type Output = Raster<i64>;
    type Params = ();

    fn name(&self) -> &'static str {
        "Flow Accumulation"
    }

    fn execute(&self, input: Self::Input, _params: Self::Params) -> Result<Self::Output> {
        flow_accumulation(&input)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 7x7 direction fixture with two off-raster outlets and a pit.
    pub(crate) fn fdr_fixture_1() -> Raster<u8> {
        let values: Vec<u8> = vec![
            2, 2, 2, 2, 2, 2, 2, //
            1, 2, 3, 1, 1, 2, 3, //
            2, 2, 2, 1, 2, 2, 3, //
            2, 2, 3, 4, 2, 3, 3, //
            4, 2, 2, 3, 3, 4, 4, //
            3, 3, 7, 0, 2, 3, 4, //
            3, 7, 0, 1, 2, 2, 4,
        ];
        let mut raster = Raster::from_vec(values, 7, 7).unwrap();
        raster.set_nodata(Some(FLOW_NODATA));
        raster
    }

    pub(crate) fn expected_fac_1() -> Vec<i64> {
        vec![
            1, 27, 1, 1, 2, 11, 1, //
            3, 21, 2, 1, 5, 4, 1, //
            2, 20, 1, 1, 3, 2, 1, //
            1, 2, 17, 14, 1, 1, 1, //
            2, 1, 1, 1, 13, 2, 1, //
            1, 1, 1, 1, 6, 4, 1, //
            1, 1, 1, 3, 1, 2, 1,
        ]
    }

    pub(crate) fn fdr_fixture_2() -> Raster<u8> {
        let values: Vec<u8> = vec![
            4, 6, 4, 4, 5, 5, //
            5, 4, 4, 4, 5, 5, //
            6, 5, 4, 4, 4, 5, //
            5, 6, 5, 4, 4, 4, //
            6, 5, 6, 5, 4, 6, //
            5, 6, 5, 6, 5, 4,
        ];
        let mut raster = Raster::from_vec(values, 6, 6).unwrap();
        raster.set_nodata(Some(FLOW_NODATA));
        raster
    }

    pub(crate) fn expected_fac_2() -> Vec<i64> {
        vec![
            1, 3, 2, 1, 1, 1, //
            8, 7, 3, 2, 2, 1, //
            1, 7, 6, 5, 2, 1, //
            9, 1, 5, 4, 3, 1, //
            1, 7, 1, 2, 1, 1, //
            9, 1, 4, 1, 3, 2,
        ]
    }

    #[test]
    fn test_accumulation_reference_fixtures() {
        let acc = flow_accumulation(&fdr_fixture_1()).unwrap();
        assert_eq!(acc.data().iter().copied().collect::<Vec<_>>(), expected_fac_1());

        let acc = flow_accumulation(&fdr_fixture_2()).unwrap();
        assert_eq!(acc.data().iter().copied().collect::<Vec<_>>(), expected_fac_2());
    }

    #[test]
    fn test_accumulation_with_nodata() {
        let mut fdr = fdr_fixture_1();
        fdr.set(0, 1, FLOW_NODATA).unwrap();
        let acc = flow_accumulation(&fdr).unwrap();
        let mut expected = expected_fac_1();
        expected[1] = ACC_NODATA;
        assert_eq!(acc.data().iter().copied().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_accumulation_rejects_undefined() {
        let mut fdr = fdr_fixture_1();
        fdr.set(3, 4, FLOW_UNDEFINED).unwrap();
        let err = flow_accumulation(&fdr).unwrap_err();
        assert!(matches!(err, Error::InvalidInput { row: 3, col: 4, .. }));
    }

    #[test]
    fn test_accumulation_rejects_cycle() {
        // two cells pointing at each other
        let mut fdr = Raster::filled(2, 2, 2u8); // all North (flow off the top)
        fdr.set_nodata(Some(FLOW_NODATA));
        fdr.set(0, 0, 0).unwrap(); // E
        fdr.set(0, 1, 4).unwrap(); // W
        let err = flow_accumulation(&fdr).unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }

    #[test]
    fn test_links_convention() {
        let fdr = fdr_fixture_1();
        let links = tile_links(fdr.data()).unwrap();
        let get = |r: usize, c: usize| {
            links
                .iter()
                .find(|((lr, lc), _)| (*lr, *lc) == (r, c))
                .map(|(_, k)| *k)
                .unwrap()
        };
        // the top row flows north, straight off the tile
        for col in 0..7 {
            assert_eq!(get(0, col), LinkKind::LeavesTile);
        }
        // (1,0) flows NE onto the perimeter cell (0,1)
        assert_eq!(get(1, 0), LinkKind::NextPerimeter(0, 1));
        // (6,2) flows E onto the perimeter cell (6,3)
        assert_eq!(get(6, 2), LinkKind::NextPerimeter(6, 3));
        // (4,0) flows W off the tile
        assert_eq!(get(4, 0), LinkKind::LeavesTile);
    }

    #[test]
    fn test_single_outlet_sum() {
        // everything funnels through (1,1) and leaves east through (1,2):
        // the single outlet accumulates every valid cell
        let values: Vec<u8> = vec![
            7, 6, 5, //
            0, 0, 0, //
            1, 2, 3,
        ];
        let fdr = Raster::from_vec(values, 3, 3).unwrap();
        let acc = flow_accumulation(&fdr).unwrap();
        // (1,2) drains the whole raster
        assert_eq!(acc.get(1, 2).unwrap(), 9);
    }
}
