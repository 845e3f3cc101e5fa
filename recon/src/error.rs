use thiserror::Error;

/// Errors from illumination-pattern estimation.
#[derive(Error, Debug)]
pub enum PatternError {
    /// No usable spectral peak, or the peak refinement fit diverged.
    #[error("illumination pattern not found: {0}")]
    NotFound(String),

    /// A manually supplied pattern violates the period invariant.
    #[error("pattern periods must be positive, got ({row_period}, {col_period})")]
    InvalidPeriod { row_period: f64, col_period: f64 },
}

/// Errors from coefficient extraction.
#[derive(Error, Debug)]
pub enum ExtractionError {
    /// Device string did not name a known backend.
    #[error("unknown extraction device {0:?} (expected \"CPU\" or \"GPU\")")]
    InvalidDevice(String),

    /// The basis sigma vector is malformed.
    #[error("invalid basis sigmas: {0}")]
    InvalidSigmas(String),

    /// The compute kernel reported a failure.
    #[error("compute kernel failure: {0}")]
    KernelFailure(String),

    /// The extraction was cancelled before completing.
    #[error("extraction cancelled")]
    Cancelled,
}

/// Errors from volume assembly and session bookkeeping.
#[derive(Error, Debug)]
pub enum AssemblyError {
    /// The coefficient stack's frame count does not match the scan raster.
    #[error("frame count mismatch: coefficient stack has {frames} frames but scan steps imply {expected}")]
    FrameCountMismatch { frames: usize, expected: usize },

    /// Bad axis permutation, zero step count, or similar.
    #[error("invalid scan parameters: {0}")]
    InvalidScanParameters(String),

    /// The coefficient grid has a zero-sized dimension.
    #[error("coefficient grid is empty")]
    EmptyGrid,

    /// A dataset appended to a session has a different shape than the first.
    #[error("dataset shape mismatch: expected {expected:?}, got {got:?}")]
    DatasetShapeMismatch {
        expected: [usize; 4],
        got: [usize; 4],
    },
}
