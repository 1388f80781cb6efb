//! Tile grid and halo model.
//!
//! A raster of `width`×`height` cells is split into square tiles of side
//! `tile_size`. Each tile carries a read-only halo of `halo` cells on
//! every side; where the halo falls outside the raster it is padded with
//! nodata. Only tile interiors are ever written back.

use hydrotile_core::io::{RasterSink, RasterSource};
use hydrotile_core::{RasterElement, Result};
use ndarray::{s, Array2};

/// Which sides of a tile lie on the raster border.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sides {
    pub top: bool,
    pub right: bool,
    pub bottom: bool,
    pub left: bool,
}

/// One tile of a [`TileGrid`].
///
/// `row0`/`col0` are the global origin of the tile interior; the buffered
/// array handed to kernels is `(rows + 2·halo) × (cols + 2·halo)` with the
/// interior at offset `halo`.
#[derive(Debug, Clone, Copy)]
pub struct TileInfo {
    /// Row-major tile index
    pub index: usize,
    /// Tile position in the tile grid
    pub tile_row: usize,
    pub tile_col: usize,
    /// Global origin of the interior
    pub row0: usize,
    pub col0: usize,
    /// Interior extent
    pub rows: usize,
    pub cols: usize,
    /// Halo width on each side
    pub halo: usize,
}

impl TileInfo {
    /// Shape of the buffered array (interior plus halo ring).
    pub fn buffered_shape(&self) -> (usize, usize) {
        (self.rows + 2 * self.halo, self.cols + 2 * self.halo)
    }

    /// Global (row, col) of a buffered-array cell; may fall off-raster.
    #[inline]
    pub fn global_of(&self, buf_row: usize, buf_col: usize) -> (isize, isize) {
        (
            self.row0 as isize + buf_row as isize - self.halo as isize,
            self.col0 as isize + buf_col as isize - self.halo as isize,
        )
    }

    /// Buffered-array cell of a global coordinate, if it lies in the buffer.
    #[inline]
    pub fn buffered_of(&self, row: isize, col: isize) -> Option<(usize, usize)> {
        let br = row - self.row0 as isize + self.halo as isize;
        let bc = col - self.col0 as isize + self.halo as isize;
        let (h, w) = self.buffered_shape();
        if br >= 0 && bc >= 0 && (br as usize) < h && (bc as usize) < w {
            Some((br as usize, bc as usize))
        } else {
            None
        }
    }

    /// Whether a buffered-array cell belongs to the interior.
    #[inline]
    pub fn is_interior(&self, buf_row: usize, buf_col: usize) -> bool {
        buf_row >= self.halo
            && buf_row < self.halo + self.rows
            && buf_col >= self.halo
            && buf_col < self.halo + self.cols
    }

    /// Whether a global coordinate lies in the tile interior.
    #[inline]
    pub fn contains_global(&self, row: isize, col: isize) -> bool {
        row >= self.row0 as isize
            && col >= self.col0 as isize
            && row < (self.row0 + self.rows) as isize
            && col < (self.col0 + self.cols) as isize
    }
}

/// Splits a raster into square tiles in row-major order.
#[derive(Debug, Clone, Copy)]
pub struct TileGrid {
    pub width: usize,
    pub height: usize,
    pub tile_size: usize,
    pub halo: usize,
}

impl TileGrid {
    /// A grid of `tile_size`-sided tiles; `tile_size <= 1` selects a
    /// single tile covering the raster (in-memory mode).
    pub fn new(width: usize, height: usize, tile_size: usize, halo: usize) -> Self {
        let tile_size = if tile_size <= 1 {
            width.max(height).max(1)
        } else {
            tile_size
        };
        Self {
            width,
            height,
            tile_size,
            halo,
        }
    }

    /// Number of tile columns
    pub fn tiles_across(&self) -> usize {
        self.width.div_ceil(self.tile_size)
    }

    /// Number of tile rows
    pub fn tiles_down(&self) -> usize {
        self.height.div_ceil(self.tile_size)
    }

    /// Total number of tiles
    pub fn tile_count(&self) -> usize {
        self.tiles_across() * self.tiles_down()
    }

    /// The tile at grid position (tile_row, tile_col)
    pub fn tile(&self, tile_row: usize, tile_col: usize) -> TileInfo {
        let row0 = tile_row * self.tile_size;
        let col0 = tile_col * self.tile_size;
        TileInfo {
            index: tile_row * self.tiles_across() + tile_col,
            tile_row,
            tile_col,
            row0,
            col0,
            rows: self.tile_size.min(self.height - row0),
            cols: self.tile_size.min(self.width - col0),
            halo: self.halo,
        }
    }

    /// All tiles in row-major order by origin.
    pub fn tiles(&self) -> Vec<TileInfo> {
        let mut tiles = Vec::with_capacity(self.tile_count());
        for tr in 0..self.tiles_down() {
            for tc in 0..self.tiles_across() {
                tiles.push(self.tile(tr, tc));
            }
        }
        tiles
    }

    /// Which sides of `tile` lie on the raster border.
    pub fn sides(&self, tile: &TileInfo) -> Sides {
        Sides {
            top: tile.row0 == 0,
            left: tile.col0 == 0,
            bottom: tile.row0 + tile.rows == self.height,
            right: tile.col0 + tile.cols == self.width,
        }
    }
}

/// Read a tile's buffered array, padding off-raster halo cells with nodata.
pub fn read_buffered<T: RasterElement>(
    source: &dyn RasterSource<T>,
    tile: &TileInfo,
) -> Result<Array2<T>> {
    let (h, w) = tile.buffered_shape();
    let pad = source.nodata().unwrap_or_else(T::default_nodata);
    let mut buffer = Array2::from_elem((h, w), pad);

    // clip the buffered rect to the raster
    let top = tile.row0 as isize - tile.halo as isize;
    let left = tile.col0 as isize - tile.halo as isize;
    let read_row0 = top.max(0) as usize;
    let read_col0 = left.max(0) as usize;
    let read_row1 = ((top + h as isize) as usize).min(source.height());
    let read_col1 = ((left + w as isize) as usize).min(source.width());
    if read_row1 <= read_row0 || read_col1 <= read_col0 {
        return Ok(buffer);
    }

    let window = source.read_window(
        read_col0,
        read_row0,
        read_col1 - read_col0,
        read_row1 - read_row0,
    )?;
    let br = (read_row0 as isize - top) as usize;
    let bc = (read_col0 as isize - left) as usize;
    buffer
        .slice_mut(s![br..br + window.nrows(), bc..bc + window.ncols()])
        .assign(&window);
    Ok(buffer)
}

/// Write the interior of a buffered tile array to a sink.
pub fn write_interior<T: RasterElement>(
    sink: &dyn RasterSink<T>,
    tile: &TileInfo,
    buffer: &Array2<T>,
) -> Result<()> {
    let interior = buffer.slice(s![
        tile.halo..tile.halo + tile.rows,
        tile.halo..tile.halo + tile.cols
    ]);
    sink.write_window(tile.col0, tile.row0, interior)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrotile_core::io::MemoryRaster;
    use hydrotile_core::GeoTransform;

    #[test]
    fn test_tile_coverage() {
        let grid = TileGrid::new(100, 70, 32, 0);
        let mut covered = vec![vec![false; 100]; 70];
        for tile in grid.tiles() {
            for r in tile.row0..tile.row0 + tile.rows {
                for c in tile.col0..tile.col0 + tile.cols {
                    assert!(!covered[r][c], "cell ({}, {}) covered twice", r, c);
                    covered[r][c] = true;
                }
            }
        }
        assert!(covered.iter().flatten().all(|&v| v));
    }

    #[test]
    fn test_row_major_order() {
        let grid = TileGrid::new(10, 10, 4, 0);
        let tiles = grid.tiles();
        assert_eq!(tiles.len(), 9);
        for (i, tile) in tiles.iter().enumerate() {
            assert_eq!(tile.index, i);
        }
        assert_eq!((tiles[1].row0, tiles[1].col0), (0, 4));
        assert_eq!((tiles[3].row0, tiles[3].col0), (4, 0));
        // ragged edge tiles shrink
        assert_eq!((tiles[8].rows, tiles[8].cols), (2, 2));
    }

    #[test]
    fn test_single_tile_mode() {
        let grid = TileGrid::new(10, 6, 0, 0);
        assert_eq!(grid.tile_count(), 1);
        let tile = grid.tile(0, 0);
        assert_eq!((tile.rows, tile.cols), (6, 10));
    }

    #[test]
    fn test_sides() {
        let grid = TileGrid::new(10, 10, 4, 0);
        let sides = grid.sides(&grid.tile(0, 0));
        assert!(sides.top && sides.left && !sides.bottom && !sides.right);
        let sides = grid.sides(&grid.tile(2, 2));
        assert!(sides.bottom && sides.right && !sides.top && !sides.left);
    }

    #[test]
    fn test_read_buffered_pads_nodata() {
        let mut raster = hydrotile_core::Raster::<f32>::filled(4, 4, 5.0);
        raster.set_nodata(Some(-9999.0));
        raster.set_transform(GeoTransform::default());
        let source = MemoryRaster::from_raster(raster);

        let grid = TileGrid::new(4, 4, 4, 1);
        let tile = grid.tile(0, 0);
        let buffer = read_buffered(&source, &tile).unwrap();
        assert_eq!(buffer.dim(), (6, 6));
        // halo ring outside the raster is nodata
        assert_eq!(buffer[(0, 0)], -9999.0);
        assert_eq!(buffer[(5, 5)], -9999.0);
        // interior preserved
        assert_eq!(buffer[(1, 1)], 5.0);
        assert_eq!(buffer[(4, 4)], 5.0);
    }

    #[test]
    fn test_global_buffered_round_trip() {
        let grid = TileGrid::new(100, 100, 32, 2);
        let tile = grid.tile(1, 1);
        let (r, c) = tile.global_of(0, 0);
        assert_eq!((r, c), (30, 30));
        assert_eq!(tile.buffered_of(30, 30), Some((0, 0)));
        assert_eq!(tile.buffered_of(29, 30), None);
        assert!(tile.contains_global(32, 32));
        assert!(!tile.contains_global(30, 32));
    }
}
