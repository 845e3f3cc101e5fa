//! Gaussian spot-fitting compute kernel for scanned-illumination microscopy.
//!
//! The reconstruction pipeline needs, for every frame of a raw stack and every
//! grid point of the illumination lattice, the best-fit amplitudes of a set of
//! Gaussian basis functions (one per fluorescence channel) plus an optional
//! background term. That inner loop dominates the runtime of a reconstruction,
//! so it lives behind a narrow flat-buffer contract with swappable backends:
//!
//! - [`cpu::CpuKernel`] — reference implementation, parallelized over frames
//! - `gpu::GpuKernel` — wgpu compute backend (enable the `gpu` cargo feature)
//!
//! Callers hand over a contiguous row-major frame buffer with explicit
//! dimension sizes and receive a flat coefficient buffer back; the kernel
//! computes all indexing itself and never mutates the input.

pub mod cpu;
#[cfg(feature = "gpu")]
pub mod gpu;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Background model fitted alongside the signal bases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Background {
    /// No background column; the trailing coefficient plane stays zero.
    None,
    /// Flat additive background.
    Constant,
    /// Wide Gaussian background with the given sigma in pixels.
    Gaussian(f64),
}

/// Cooperative cancellation flag checked by kernels at frame granularity.
///
/// Cloning is cheap; all clones observe the same flag. A cancelled dispatch
/// returns [`KernelError::Cancelled`] and never a partial result.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of every dispatch holding a clone of this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Errors reported across the kernel boundary.
#[derive(Error, Debug)]
pub enum KernelError {
    /// The request itself is malformed (inconsistent sizes, bad sigmas).
    #[error("invalid kernel request: {0}")]
    BadRequest(String),

    /// The backend failed to produce coefficients (driver loss, singular
    /// normal equations, missing adapter, ...).
    #[error("kernel backend failure: {0}")]
    Backend(String),

    /// The dispatch observed a cancelled [`CancelToken`].
    #[error("kernel dispatch cancelled")]
    Cancelled,
}

/// Flat-buffer fit request handed across the kernel boundary.
///
/// `frames` is a row-major contiguous buffer of `n_frames * rows * cols`
/// samples; grid point `(gr, gc)` of every frame sits at image position
/// `(row_offset + gr * row_period, col_offset + gc * col_period)`.
#[derive(Debug, Clone, Copy)]
pub struct FitRequest<'a> {
    pub frames: &'a [f32],
    pub n_frames: usize,
    pub rows: usize,
    pub cols: usize,
    pub grid_rows: usize,
    pub grid_cols: usize,
    pub row_offset: f64,
    pub col_offset: f64,
    pub row_period: f64,
    pub col_period: f64,
    /// One sigma per signal basis, in pixels. All strictly positive.
    pub signal_sigmas: &'a [f64],
    pub background: Background,
}

impl FitRequest<'_> {
    /// Number of coefficient planes produced: one per signal basis plus the
    /// trailing background plane (allocated even for [`Background::None`]).
    pub fn n_basis(&self) -> usize {
        self.signal_sigmas.len() + 1
    }

    /// Length of the output buffer, laid out `[basis][frame][grid_row][grid_col]`.
    pub fn output_len(&self) -> usize {
        self.n_basis() * self.n_frames * self.grid_rows * self.grid_cols
    }

    /// Half-size of the square fit window around each grid point.
    ///
    /// Three sigma of the widest signal basis, clamped so neighboring lattice
    /// spots stay outside the window.
    pub fn window_half(&self) -> usize {
        let sigma_max = self
            .signal_sigmas
            .iter()
            .cloned()
            .fold(f64::MIN, f64::max)
            .max(0.5);
        let by_sigma = (3.0 * sigma_max).ceil() as usize;
        let by_period = ((self.row_period.min(self.col_period) - 1.0) / 2.0).floor() as usize;
        by_sigma.min(by_period).max(1)
    }

    pub fn validate(&self) -> Result<(), KernelError> {
        if self.frames.len() != self.n_frames * self.rows * self.cols {
            return Err(KernelError::BadRequest(format!(
                "frame buffer has {} samples, expected {} ({} frames of {}x{})",
                self.frames.len(),
                self.n_frames * self.rows * self.cols,
                self.n_frames,
                self.rows,
                self.cols
            )));
        }
        if self.row_period <= 0.0 || self.col_period <= 0.0 {
            return Err(KernelError::BadRequest(format!(
                "pattern periods must be positive, got ({}, {})",
                self.row_period, self.col_period
            )));
        }
        if self.signal_sigmas.is_empty() {
            return Err(KernelError::BadRequest(
                "at least one signal sigma required".into(),
            ));
        }
        if let Some(&s) = self.signal_sigmas.iter().find(|s| !(**s > 0.0)) {
            return Err(KernelError::BadRequest(format!(
                "signal sigmas must be positive, got {s}"
            )));
        }
        if let Background::Gaussian(s) = self.background {
            if !(s > 0.0) {
                return Err(KernelError::BadRequest(format!(
                    "background sigma must be positive, got {s}"
                )));
            }
        }
        Ok(())
    }
}

/// A spot-fit backend.
///
/// Implementations must be pure with respect to the input buffer and must
/// translate every internal failure into a [`KernelError`]; nothing panics
/// across this boundary.
pub trait SpotFitKernel {
    /// Fit all grid points of all frames, returning a flat coefficient buffer
    /// laid out `[basis][frame][grid_row][grid_col]` in row-major order.
    fn fit(&self, request: &FitRequest<'_>, cancel: &CancelToken) -> Result<Vec<f32>, KernelError>;
}
