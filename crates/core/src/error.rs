//! Error types for hydrotile

use thiserror::Error;

/// Main error type for hydrotile operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("format error: {0}")]
    Format(String),

    #[error("invalid raster dimensions: {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },

    #[error("index out of bounds: ({row}, {col}) in raster of size ({rows}, {cols})")]
    IndexOutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    #[error("raster size mismatch: expected ({er}, {ec}), got ({ar}, {ac})")]
    SizeMismatch {
        er: usize,
        ec: usize,
        ar: usize,
        ac: usize,
    },

    #[error("invalid input at ({row}, {col}): {message}")]
    InvalidInput { message: String, row: i64, col: i64 },

    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for an `InvalidInput` anchored at a cell.
    pub fn invalid_input(message: impl Into<String>, row: i64, col: i64) -> Self {
        Error::InvalidInput {
            message: message.into(),
            row,
            col,
        }
    }
}

/// Result type alias for hydrotile operations
pub type Result<T> = std::result::Result<T, Error>;
