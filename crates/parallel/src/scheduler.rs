//! Tile scheduler: a bounded worker pool over tile descriptors.
//!
//! All tiles of a stage run their local (or finalize) phase concurrently;
//! the first error in tile order is surfaced, annotated with the origin of
//! the offending tile. Cancellation is cooperative and checked between
//! tiles; kernels with long inner loops poll the token themselves.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::debug;

use hydrotile_core::{Error, ProgressSink, Result};

use crate::tiled::{TileGrid, TileInfo};

/// Shared cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Fail with `Error::Cancelled` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Runs per-tile closures over a [`TileGrid`].
#[derive(Debug, Clone)]
pub struct TileScheduler {
    single_threaded: bool,
    cancel: CancelToken,
}

impl TileScheduler {
    pub fn new(single_threaded: bool, cancel: CancelToken) -> Self {
        Self {
            single_threaded,
            cancel,
        }
    }

    /// The scheduler's cancellation token.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Execute `f` for every tile of `grid`.
    ///
    /// Tiles run concurrently on the rayon pool (or sequentially in
    /// single-threaded mode, preserving row-major order exactly). The
    /// first error in tile order wins; remaining tiles short-circuit.
    pub fn run<F>(
        &self,
        grid: &TileGrid,
        stage: &str,
        progress: &dyn ProgressSink,
        f: F,
    ) -> Result<()>
    where
        F: Fn(&TileInfo) -> Result<()> + Send + Sync,
    {
        let tiles = grid.tiles();
        let total = tiles.len();
        debug!(stage, tiles = total, "running tile pass");

        if self.single_threaded {
            for (done, tile) in tiles.iter().enumerate() {
                self.cancel.check()?;
                f(tile).map_err(|e| annotate(e, tile))?;
                progress.update(stage, done + 1, total);
            }
            return Ok(());
        }

        let done = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let results: Vec<Result<()>> = tiles
            .par_iter()
            .map(|tile| {
                if abort.load(Ordering::Relaxed) {
                    return Ok(());
                }
                self.cancel.check()?;
                let result = f(tile).map_err(|e| annotate(e, tile));
                if result.is_err() {
                    abort.store(true, Ordering::Relaxed);
                } else {
                    let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                    progress.update(stage, n, total);
                }
                result
            })
            .collect();

        // first error in tile order
        for result in results {
            result?;
        }
        Ok(())
    }
}

fn annotate(error: Error, tile: &TileInfo) -> Error {
    match error {
        Error::Internal(msg) => Error::Internal(format!(
            "tile origin ({}, {}): {}",
            tile.row0, tile.col0, msg
        )),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrotile_core::SilentProgress;
    use std::sync::Mutex;

    #[test]
    fn test_all_tiles_visited() {
        let grid = TileGrid::new(10, 10, 4, 0);
        let seen = Mutex::new(Vec::new());
        let scheduler = TileScheduler::new(false, CancelToken::new());
        scheduler
            .run(&grid, "test", &SilentProgress, |tile| {
                seen.lock().unwrap().push(tile.index);
                Ok(())
            })
            .unwrap();
        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn test_sequential_preserves_order() {
        let grid = TileGrid::new(10, 10, 4, 0);
        let seen = Mutex::new(Vec::new());
        let scheduler = TileScheduler::new(true, CancelToken::new());
        scheduler
            .run(&grid, "test", &SilentProgress, |tile| {
                seen.lock().unwrap().push(tile.index);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen.into_inner().unwrap(), (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn test_first_error_in_tile_order() {
        let grid = TileGrid::new(10, 10, 4, 0);
        let scheduler = TileScheduler::new(false, CancelToken::new());
        let err = scheduler
            .run(&grid, "test", &SilentProgress, |tile| {
                if tile.index >= 3 {
                    Err(Error::Internal(format!("boom {}", tile.index)))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        // tile 3 has origin (4, 0)
        assert!(matches!(err, Error::Internal(ref m) if m.contains("(4, 0)")));
    }

    #[test]
    fn test_cancellation() {
        let grid = TileGrid::new(10, 10, 4, 0);
        let cancel = CancelToken::new();
        cancel.cancel();
        let scheduler = TileScheduler::new(true, cancel);
        let err = scheduler
            .run(&grid, "test", &SilentProgress, |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
