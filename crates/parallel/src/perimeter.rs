//! Flattened tile perimeters.
//!
//! The global phases reason about tiles through their perimeter cells
//! only. A perimeter is stored flattened in clockwise order starting at
//! the top-left corner: top row left→right, right column downward, bottom
//! row right→left, left column upward.

use ndarray::Array2;

/// One side of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Top,
    Right,
    Bottom,
    Left,
}

/// The perimeter values of a `rows`×`cols` tile, flattened clockwise.
#[derive(Debug, Clone)]
pub struct Perimeter<T: Copy> {
    data: Vec<T>,
    rows: usize,
    cols: usize,
}

impl<T: Copy> Perimeter<T> {
    /// Extract the perimeter of a 2D array.
    ///
    /// Tiles smaller than 2×2 degenerate to all cells in row-major order.
    pub fn from_array(array: &Array2<T>) -> Self {
        let (rows, cols) = array.dim();
        let mut data = Vec::with_capacity(Self::len_for(rows, cols));
        if rows == 1 {
            data.extend((0..cols).map(|c| array[(0, c)]));
        } else if cols == 1 {
            data.extend((0..rows).map(|r| array[(r, 0)]));
        } else {
            data.extend((0..cols).map(|c| array[(0, c)]));
            data.extend((1..rows).map(|r| array[(r, cols - 1)]));
            data.extend((0..cols - 1).rev().map(|c| array[(rows - 1, c)]));
            data.extend((1..rows - 1).rev().map(|r| array[(r, 0)]));
        }
        Self { data, rows, cols }
    }

    fn len_for(rows: usize, cols: usize) -> usize {
        if rows <= 1 || cols <= 1 {
            rows * cols
        } else {
            2 * rows + 2 * cols - 4
        }
    }

    /// Number of perimeter cells.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Value at a flattened index.
    pub fn get(&self, index: usize) -> T {
        self.data[index]
    }

    /// The flattened values.
    pub fn values(&self) -> &[T] {
        &self.data
    }

    /// Flattened index of the perimeter cell at (row, col).
    ///
    /// The cell must lie on the perimeter.
    pub fn index_of(&self, row: usize, col: usize) -> usize {
        let (rows, cols) = (self.rows, self.cols);
        if rows == 1 {
            return col;
        }
        if cols == 1 {
            return row;
        }
        if row == 0 {
            col
        } else if col == cols - 1 {
            cols - 1 + row
        } else if row == rows - 1 {
            rows + 2 * cols - 3 - col
        } else {
            debug_assert_eq!(col, 0);
            2 * rows + 2 * cols - 4 - row
        }
    }

    /// (row, col) of a flattened index.
    pub fn row_col(&self, index: usize) -> (usize, usize) {
        let (rows, cols) = (self.rows, self.cols);
        if rows == 1 {
            return (0, index);
        }
        if cols == 1 {
            return (index, 0);
        }
        if index < cols {
            (0, index)
        } else if index < cols + rows - 1 {
            (index - (cols - 1), cols - 1)
        } else if index < 2 * cols + rows - 2 {
            (rows - 1, rows + 2 * cols - 3 - index)
        } else {
            (2 * rows + 2 * cols - 4 - index, 0)
        }
    }

    /// Flattened indices of one side, ordered left→right (top/bottom) or
    /// top→bottom (left/right). Corner cells appear on both their sides.
    pub fn side_indices(&self, side: Side) -> Vec<usize> {
        let (rows, cols) = (self.rows, self.cols);
        match side {
            Side::Top => (0..cols).map(|c| self.index_of(0, c)).collect(),
            Side::Bottom => (0..cols).map(|c| self.index_of(rows - 1, c)).collect(),
            Side::Left => (0..rows).map(|r| self.index_of(r, 0)).collect(),
            Side::Right => (0..rows).map(|r| self.index_of(r, cols - 1)).collect(),
        }
    }

    /// Values along one side in natural order.
    pub fn side_values(&self, side: Side) -> Vec<T> {
        self.side_indices(side)
            .into_iter()
            .map(|i| self.data[i])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    // 4x6 tile whose values equal their clockwise flattened index
    fn fixture() -> Array2<i64> {
        array![
            [0, 1, 2, 3, 4, 5],
            [15, -1, -1, -1, -1, 6],
            [14, -1, -1, -1, -1, 7],
            [13, 12, 11, 10, 9, 8],
        ]
    }

    #[test]
    fn test_from_array_order() {
        let p = Perimeter::from_array(&fixture());
        assert_eq!(p.size(), 16);
        assert_eq!(p.values(), (0..16).collect::<Vec<i64>>().as_slice());
    }

    #[test]
    fn test_index_of() {
        let p = Perimeter::from_array(&fixture());
        let expected = [
            (0, 0),
            (0, 1),
            (0, 2),
            (0, 3),
            (0, 4),
            (0, 5),
            (1, 5),
            (2, 5),
            (3, 5),
            (3, 4),
            (3, 3),
            (3, 2),
            (3, 1),
            (3, 0),
            (2, 0),
            (1, 0),
        ];
        for (i, &(r, c)) in expected.iter().enumerate() {
            assert_eq!(p.index_of(r, c), i, "index_of({}, {})", r, c);
            assert_eq!(p.row_col(i), (r, c), "row_col({})", i);
        }
    }

    #[test]
    fn test_side_indices() {
        let p = Perimeter::from_array(&fixture());
        assert_eq!(p.side_indices(Side::Top), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(p.side_indices(Side::Right), vec![5, 6, 7, 8]);
        assert_eq!(p.side_indices(Side::Bottom), vec![13, 12, 11, 10, 9, 8]);
        assert_eq!(p.side_indices(Side::Left), vec![0, 15, 14, 13]);
    }

    #[test]
    fn test_degenerate_strip() {
        let strip = array![[1, 2, 3, 4]];
        let p = Perimeter::from_array(&strip);
        assert_eq!(p.size(), 4);
        assert_eq!(p.row_col(2), (0, 2));
        assert_eq!(p.index_of(0, 3), 3);
    }
}
