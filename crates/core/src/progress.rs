//! Progress reporting for long-running stages.
//!
//! Stages report `(stage, done, total)` updates and named counters through
//! an interface-typed sink; the engine never prints or logs on the caller's
//! behalf.

/// Receives progress updates from pipeline stages.
///
/// Implementations must be cheap: updates are delivered from worker
/// threads between tiles.
pub trait ProgressSink: Send + Sync {
    /// `done` out of `total` tiles (or items) finished for `stage`.
    fn update(&self, _stage: &str, _done: usize, _total: usize) {}

    /// A named counter, e.g. dropped drainage points or unsolved pits.
    fn metric(&self, _name: &str, _value: u64) {}
}

/// A sink that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentProgress;

impl ProgressSink for SilentProgress {}
