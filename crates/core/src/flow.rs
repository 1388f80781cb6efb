//! D8 flow-direction codes and neighbor tables.
//!
//! Direction codes count counter-clockwise from East:
//!
//! ```text
//!   3 | 2 | 1
//!  ---+---+---
//!   4 | 8 | 0
//!  ---+---+---
//!   5 | 6 | 7
//! ```
//!
//! The center value 8 marks an undefined direction (no downslope
//! neighbor); 9 marks nodata.

use std::f64::consts::SQRT_2;

/// Flow direction of a cell with no downslope neighbor.
pub const FLOW_UNDEFINED: u8 = 8;

/// Flow direction of a nodata cell.
pub const FLOW_NODATA: u8 = 9;

/// (row, col) offsets of the eight neighbors, indexed by direction code.
pub const NEIGHBOR_OFFSETS: [(isize, isize); 8] = [
    (0, 1),   // 0: E
    (-1, 1),  // 1: NE
    (-1, 0),  // 2: N
    (-1, -1), // 3: NW
    (0, -1),  // 4: W
    (1, -1),  // 5: SW
    (1, 0),   // 6: S
    (1, 1),   // 7: SE
];

/// Center-to-center distance factors for each direction, in cell units.
pub const NEIGHBOR_DISTANCES: [f64; 8] = [1.0, SQRT_2, 1.0, SQRT_2, 1.0, SQRT_2, 1.0, SQRT_2];

/// D8 flow direction codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlowDir {
    East = 0,
    NorthEast = 1,
    North = 2,
    NorthWest = 3,
    West = 4,
    SouthWest = 5,
    South = 6,
    SouthEast = 7,
    Undefined = 8,
    Nodata = 9,
}

impl From<FlowDir> for u8 {
    fn from(d: FlowDir) -> u8 {
        d as u8
    }
}

/// Whether `code` is one of the eight real directions.
#[inline]
pub fn is_direction(code: u8) -> bool {
    code < 8
}

/// The direction pointing back at the sender.
#[inline]
pub fn opposite(dir: u8) -> u8 {
    debug_assert!(dir < 8);
    (dir + 4) % 8
}

/// Cell reached by stepping one cell along `dir` from (row, col).
///
/// Coordinates are signed so callers can detect off-raster steps.
#[inline]
pub fn step(row: isize, col: isize, dir: u8) -> (isize, isize) {
    debug_assert!(dir < 8);
    let (dr, dc) = NEIGHBOR_OFFSETS[dir as usize];
    (row + dr, col + dc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opposite_directions() {
        assert_eq!(opposite(FlowDir::East as u8), FlowDir::West as u8);
        assert_eq!(opposite(FlowDir::North as u8), FlowDir::South as u8);
        assert_eq!(opposite(FlowDir::NorthEast as u8), FlowDir::SouthWest as u8);
        assert_eq!(opposite(FlowDir::SouthEast as u8), FlowDir::NorthWest as u8);
    }

    #[test]
    fn test_offsets_match_codes() {
        // E moves along +col, N along -row
        assert_eq!(NEIGHBOR_OFFSETS[FlowDir::East as usize], (0, 1));
        assert_eq!(NEIGHBOR_OFFSETS[FlowDir::North as usize], (-1, 0));
        assert_eq!(NEIGHBOR_OFFSETS[FlowDir::SouthWest as usize], (1, -1));
    }

    #[test]
    fn test_step_round_trip() {
        for dir in 0..8u8 {
            let (r, c) = step(10, 10, dir);
            let (r2, c2) = step(r, c, opposite(dir));
            assert_eq!((r2, c2), (10, 10));
        }
    }
}
