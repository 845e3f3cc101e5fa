//! Coefficient extraction.
//!
//! Bridges the raw frame stack to the spot-fit kernel: derives the lattice
//! grid from the pattern, flattens the stack into the kernel's buffer
//! contract, dispatches on the selected device, and shapes the result into
//! the `[basis][frame][grid_row][grid_col]` coefficient stack. The kernel
//! call is the only long-running operation in the pipeline, so it is also
//! exposed as an awaitable task with cooperative cancellation.

use std::str::FromStr;

use ndarray::{Array3, Array4, ArrayView3};
use tracing::warn;

use spotfit::{Background, CancelToken, FitRequest, KernelError, SpotFitKernel};

use crate::assemble::CoeffStack;
use crate::error::ExtractionError;
use crate::pattern::Pattern;

/// Compute backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Gpu,
}

impl FromStr for Device {
    type Err = ExtractionError;

    /// Case-insensitive parse of the boundary strings `"CPU"` / `"GPU"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("cpu") {
            Ok(Device::Cpu)
        } else if s.eq_ignore_ascii_case("gpu") {
            Ok(Device::Gpu)
        } else {
            Err(ExtractionError::InvalidDevice(s.to_string()))
        }
    }
}

/// What to do when the GPU backend fails.
///
/// There is no implicit fallback; callers opt in and the switch is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuFailurePolicy {
    /// Surface the failure to the caller.
    #[default]
    Fail,
    /// Log the failure and re-dispatch on the CPU backend.
    FallbackToCpu,
}

/// Trailing-slot code for "no background model".
pub const NO_BACKGROUND_CODE: f64 = 0.0;
/// Trailing-slot code for "constant background".
pub const CONSTANT_BACKGROUND_CODE: f64 = 9999.0;

/// Per-basis Gaussian sigmas plus the encoded background model.
///
/// The wire format is a flat float sequence: N signal sigmas followed by one
/// background code (`0` none, `9999` constant, anything else the sigma of a
/// Gaussian background). One coefficient plane is extracted per slot,
/// including the trailing background plane.
#[derive(Debug, Clone, PartialEq)]
pub struct BasisSigmas(Vec<f64>);

impl BasisSigmas {
    /// Validate an encoded sigma sequence.
    pub fn new(encoded: Vec<f64>) -> Result<Self, ExtractionError> {
        if encoded.is_empty() {
            return Err(ExtractionError::InvalidSigmas(
                "sigma sequence is empty".into(),
            ));
        }
        let (signal, code) = encoded.split_at(encoded.len() - 1);
        if let Some(&s) = signal.iter().find(|s| !(**s > 0.0)) {
            return Err(ExtractionError::InvalidSigmas(format!(
                "signal sigmas must be positive, got {s}"
            )));
        }
        if !(code[0] >= 0.0) {
            return Err(ExtractionError::InvalidSigmas(format!(
                "background code must be non-negative, got {}",
                code[0]
            )));
        }
        Ok(Self(encoded))
    }

    /// Build the encoded sequence from signal sigmas and a background model.
    pub fn from_parts(signal: Vec<f64>, background: Background) -> Result<Self, ExtractionError> {
        let mut encoded = signal;
        encoded.push(match background {
            Background::None => NO_BACKGROUND_CODE,
            Background::Constant => CONSTANT_BACKGROUND_CODE,
            Background::Gaussian(s) => s,
        });
        Self::new(encoded)
    }

    /// Number of coefficient planes, trailing background slot included.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn encoded(&self) -> &[f64] {
        &self.0
    }

    /// The signal sigmas (everything but the trailing code).
    pub fn signal(&self) -> &[f64] {
        &self.0[..self.0.len() - 1]
    }

    /// Decode the trailing background code.
    pub fn background(&self) -> Background {
        let code = self.0[self.0.len() - 1];
        if code == NO_BACKGROUND_CODE {
            Background::None
        } else if code == CONSTANT_BACKGROUND_CODE {
            Background::Constant
        } else {
            Background::Gaussian(code)
        }
    }
}

/// Lattice grid dimensions for a frame of the given size.
///
/// `grid_cols = 1 + floor(((cols - 1) - col_offset) / col_period)`, clamped
/// to zero when the first grid point already falls outside the frame; rows
/// are symmetric.
pub fn grid_shape(pattern: &Pattern, rows: usize, cols: usize) -> (usize, usize) {
    (
        grid_len(rows, pattern.row_offset, pattern.row_period),
        grid_len(cols, pattern.col_offset, pattern.col_period),
    )
}

fn grid_len(extent: usize, offset: f64, period: f64) -> usize {
    if extent == 0 {
        return 0;
    }
    let span = (extent - 1) as f64 - offset;
    if span < 0.0 {
        0
    } else {
        1 + (span / period).floor() as usize
    }
}

/// Extracts coefficient stacks from raw frame stacks on a selected device.
#[derive(Debug, Clone, Copy)]
pub struct CoefficientExtractor {
    device: Device,
    gpu_policy: GpuFailurePolicy,
}

impl CoefficientExtractor {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            gpu_policy: GpuFailurePolicy::default(),
        }
    }

    pub fn with_gpu_policy(mut self, policy: GpuFailurePolicy) -> Self {
        self.gpu_policy = policy;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Extract without external cancellation.
    pub fn extract(
        &self,
        stack: ArrayView3<'_, f32>,
        sigmas: &BasisSigmas,
        pattern: &Pattern,
    ) -> Result<CoeffStack, ExtractionError> {
        self.extract_cancellable(stack, sigmas, pattern, &CancelToken::new())
    }

    /// Extract with a cancellation token threaded through the kernel.
    ///
    /// A cancelled dispatch yields [`ExtractionError::Cancelled`] and never a
    /// partial coefficient stack. The stack is only read; it must stay alive
    /// for the duration of the call, which the borrow enforces.
    pub fn extract_cancellable(
        &self,
        stack: ArrayView3<'_, f32>,
        sigmas: &BasisSigmas,
        pattern: &Pattern,
        cancel: &CancelToken,
    ) -> Result<CoeffStack, ExtractionError> {
        let (slices, rows, cols) = stack.dim();
        if sigmas.signal().is_empty() {
            return Err(ExtractionError::InvalidSigmas(
                "at least one signal sigma required".into(),
            ));
        }

        let n_basis = sigmas.len();
        let (grid_rows, grid_cols) = grid_shape(pattern, rows, cols);
        if grid_rows == 0 || grid_cols == 0 {
            return Ok(Array4::zeros((n_basis, slices, grid_rows, grid_cols)));
        }

        let contiguous = stack.as_standard_layout();
        let frames = contiguous.as_slice().ok_or_else(|| {
            ExtractionError::KernelFailure("frame stack is not contiguous".into())
        })?;

        let request = FitRequest {
            frames,
            n_frames: slices,
            rows,
            cols,
            grid_rows,
            grid_cols,
            row_offset: pattern.row_offset,
            col_offset: pattern.col_offset,
            row_period: pattern.row_period,
            col_period: pattern.col_period,
            signal_sigmas: sigmas.signal(),
            background: sigmas.background(),
        };

        let buffer = self.dispatch(&request, cancel)?;
        Array4::from_shape_vec((n_basis, slices, grid_rows, grid_cols), buffer).map_err(|e| {
            ExtractionError::KernelFailure(format!("kernel returned a wrong-size buffer: {e}"))
        })
    }

    /// Run one extraction as an awaitable task.
    ///
    /// Extractions over distinct stacks share no mutable state and may run
    /// concurrently; the blocking kernel call is parked on the tokio blocking
    /// pool. Takes owned inputs so the task is `'static`.
    pub async fn extract_async(
        self,
        stack: Array3<f32>,
        sigmas: BasisSigmas,
        pattern: Pattern,
        cancel: CancelToken,
    ) -> Result<CoeffStack, ExtractionError> {
        tokio::task::spawn_blocking(move || {
            self.extract_cancellable(stack.view(), &sigmas, &pattern, &cancel)
        })
        .await
        .map_err(|e| ExtractionError::KernelFailure(format!("extraction task failed: {e}")))?
    }

    fn dispatch(
        &self,
        request: &FitRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<Vec<f32>, ExtractionError> {
        match self.device {
            Device::Cpu => run_cpu(request, cancel),
            Device::Gpu => match run_gpu(request, cancel) {
                Err(ExtractionError::KernelFailure(msg))
                    if self.gpu_policy == GpuFailurePolicy::FallbackToCpu =>
                {
                    warn!("GPU extraction failed ({msg}); falling back to CPU");
                    run_cpu(request, cancel)
                }
                other => other,
            },
        }
    }
}

fn run_cpu(request: &FitRequest<'_>, cancel: &CancelToken) -> Result<Vec<f32>, ExtractionError> {
    spotfit::cpu::CpuKernel::new()
        .fit(request, cancel)
        .map_err(map_kernel_error)
}

#[cfg(feature = "gpu")]
fn run_gpu(request: &FitRequest<'_>, cancel: &CancelToken) -> Result<Vec<f32>, ExtractionError> {
    let kernel = spotfit::gpu::GpuKernel::new().map_err(map_kernel_error)?;
    kernel.fit(request, cancel).map_err(map_kernel_error)
}

#[cfg(not(feature = "gpu"))]
fn run_gpu(_request: &FitRequest<'_>, _cancel: &CancelToken) -> Result<Vec<f32>, ExtractionError> {
    Err(ExtractionError::KernelFailure(
        "GPU backend not compiled in (enable the `gpu` feature)".into(),
    ))
}

fn map_kernel_error(err: KernelError) -> ExtractionError {
    match err {
        KernelError::Cancelled => ExtractionError::Cancelled,
        other => ExtractionError::KernelFailure(other.to_string()),
    }
}
