//! Progress reporting for reconstruction runs
//!
//! A run reports once per pipeline stage. Percentages follow a fixed
//! schedule per stage so a progress bar advances the same way for every
//! input, whatever the per-stage cost turns out to be.

use std::fmt;
use std::time::Duration;

/// Pipeline stage a progress report refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    SpatialIndex,
    NormalEstimation,
    Orientation,
    Reconstruction,
    PostProcessing,
    Done,
}

impl Stage {
    /// Percentage reported when the stage starts
    pub fn percent(self) -> u32 {
        match self {
            Stage::SpatialIndex => 10,
            Stage::NormalEstimation => 20,
            Stage::Orientation => 30,
            Stage::Reconstruction => 50,
            Stage::PostProcessing => 80,
            Stage::Done => 100,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::SpatialIndex => "building spatial index",
            Stage::NormalEstimation => "estimating normals",
            Stage::Orientation => "orienting normals",
            Stage::Reconstruction => "reconstructing surface",
            Stage::PostProcessing => "post-processing mesh",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Progress information passed to callbacks.
#[derive(Debug, Clone)]
pub struct Progress {
    pub stage: Stage,

    /// Human-readable message describing the current operation.
    pub message: String,

    /// Elapsed time since the run started.
    pub elapsed: Duration,
}

impl Progress {
    pub fn new(stage: Stage, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            stage,
            message: message.into(),
            elapsed,
        }
    }

    /// Get progress as a percentage (0 to 100).
    #[inline]
    pub fn percent(&self) -> u32 {
        self.stage.percent()
    }

    /// Get progress as a fraction (0.0 to 1.0).
    #[inline]
    pub fn fraction(&self) -> f64 {
        self.percent() as f64 / 100.0
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.stage == Stage::Done
    }
}

/// Callback for progress reporting.
///
/// Returns `true` to continue, `false` to request cancellation.
pub type ProgressCallback<'a> = &'a (dyn Fn(&Progress) -> bool + Send + Sync);
