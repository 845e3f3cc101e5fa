//! CPU reference backend.
//!
//! Each grid point is an independent linear least-squares problem: the local
//! window is projected onto the signal Gaussians plus the background column
//! and the normal equations are solved with a Cholesky factorization (SVD as
//! the fallback for ill-conditioned windows). Frames fan out across the rayon
//! thread pool; the cancellation token is checked once per frame.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::{Background, CancelToken, FitRequest, KernelError, SpotFitKernel};

/// The reference spot-fit backend. Stateless; construct freely.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuKernel;

impl CpuKernel {
    pub fn new() -> Self {
        Self
    }
}

impl SpotFitKernel for CpuKernel {
    fn fit(&self, request: &FitRequest<'_>, cancel: &CancelToken) -> Result<Vec<f32>, KernelError> {
        request.validate()?;

        let grid = request.grid_rows * request.grid_cols;
        let n_basis = request.n_basis();
        tracing::debug!(
            frames = request.n_frames,
            grid_points = grid,
            bases = n_basis,
            "dispatching CPU spot fit"
        );

        let per_frame: Vec<Vec<f32>> = (0..request.n_frames)
            .into_par_iter()
            .map(|frame| {
                if cancel.is_cancelled() {
                    return Err(KernelError::Cancelled);
                }
                fit_frame(request, frame)
            })
            .collect::<Result<_, _>>()?;

        // Interleave the per-frame blocks into the [basis][frame][grid] layout.
        let mut out = vec![0.0f32; request.output_len()];
        for (frame, block) in per_frame.iter().enumerate() {
            for basis in 0..n_basis {
                let src = &block[basis * grid..(basis + 1) * grid];
                let dst_start = (basis * request.n_frames + frame) * grid;
                out[dst_start..dst_start + grid].copy_from_slice(src);
            }
        }
        Ok(out)
    }
}

/// Fit every grid point of one frame, returning `[basis][grid_row][grid_col]`.
fn fit_frame(request: &FitRequest<'_>, frame: usize) -> Result<Vec<f32>, KernelError> {
    let FitRequest {
        rows,
        cols,
        grid_rows,
        grid_cols,
        signal_sigmas,
        background,
        ..
    } = *request;

    let pixels = &request.frames[frame * rows * cols..(frame + 1) * rows * cols];
    let grid = grid_rows * grid_cols;
    let n_signal = signal_sigmas.len();
    let has_background = !matches!(background, Background::None);
    let p = n_signal + has_background as usize;
    let half = request.window_half() as f64;

    let mut out = vec![0.0f32; (n_signal + 1) * grid];
    let mut phi = vec![0.0f64; p];

    for gr in 0..grid_rows {
        let cy = request.row_offset + gr as f64 * request.row_period;
        let y0 = (cy - half).ceil().max(0.0) as usize;
        let y1 = (cy + half).floor().min(rows as f64 - 1.0) as usize;

        for gc in 0..grid_cols {
            let cx = request.col_offset + gc as f64 * request.col_period;
            let x0 = (cx - half).ceil().max(0.0) as usize;
            let x1 = (cx + half).floor().min(cols as f64 - 1.0) as usize;

            // Accumulate the normal equations without materializing the
            // design matrix: ata = A'A, atb = A'y over the window pixels.
            let mut ata = DMatrix::<f64>::zeros(p, p);
            let mut atb = DVector::<f64>::zeros(p);
            let mut n_pixels = 0usize;

            for py in y0..=y1 {
                let dy = py as f64 - cy;
                for px in x0..=x1 {
                    let dx = px as f64 - cx;
                    let r2 = dy * dy + dx * dx;
                    for (k, &s) in signal_sigmas.iter().enumerate() {
                        phi[k] = (-r2 / (2.0 * s * s)).exp();
                    }
                    if has_background {
                        phi[n_signal] = match background {
                            Background::Constant => 1.0,
                            Background::Gaussian(s) => (-r2 / (2.0 * s * s)).exp(),
                            Background::None => unreachable!(),
                        };
                    }
                    let y = pixels[py * cols + px] as f64;
                    for i in 0..p {
                        for j in i..p {
                            ata[(i, j)] += phi[i] * phi[j];
                        }
                        atb[i] += phi[i] * y;
                    }
                    n_pixels += 1;
                }
            }

            // Degenerate window (grid point clipped off the image edge):
            // leave the coefficients at zero.
            if n_pixels < p {
                continue;
            }
            for i in 0..p {
                for j in 0..i {
                    ata[(i, j)] = ata[(j, i)];
                }
            }

            let amplitudes = solve_normal_equations(ata, atb, gr, gc)?;
            let idx = gr * grid_cols + gc;
            for k in 0..n_signal {
                out[k * grid + idx] = amplitudes[k] as f32;
            }
            if has_background {
                out[n_signal * grid + idx] = amplitudes[n_signal] as f32;
            }
        }
    }

    Ok(out)
}

fn solve_normal_equations(
    ata: DMatrix<f64>,
    atb: DVector<f64>,
    gr: usize,
    gc: usize,
) -> Result<DVector<f64>, KernelError> {
    if let Some(chol) = ata.clone().cholesky() {
        return Ok(chol.solve(&atb));
    }
    // Near-duplicate sigmas make the columns collinear; fall back to a
    // minimum-norm SVD solution before giving up.
    ata.svd(true, true)
        .solve(&atb, 1e-12)
        .map_err(|e| KernelError::Backend(format!("normal equations at grid ({gr}, {gc}): {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// One frame with a single Gaussian spot of known amplitude on a flat
    /// pedestal; the kernel has to read both back.
    fn spot_frame(rows: usize, cols: usize, cy: f64, cx: f64, sigma: f64) -> Vec<f32> {
        let amplitude = 80.0;
        let pedestal = 12.0;
        let mut frame = vec![0.0f32; rows * cols];
        for y in 0..rows {
            for x in 0..cols {
                let r2 = (y as f64 - cy).powi(2) + (x as f64 - cx).powi(2);
                frame[y * cols + x] =
                    (pedestal + amplitude * (-r2 / (2.0 * sigma * sigma)).exp()) as f32;
            }
        }
        frame
    }

    #[test]
    fn recovers_amplitude_and_background() {
        let (rows, cols) = (16, 16);
        let frame = spot_frame(rows, cols, 7.25, 6.75, 1.4);
        let request = FitRequest {
            frames: &frame,
            n_frames: 1,
            rows,
            cols,
            grid_rows: 1,
            grid_cols: 1,
            row_offset: 7.25,
            col_offset: 6.75,
            row_period: 14.0,
            col_period: 14.0,
            signal_sigmas: &[1.4],
            background: Background::Constant,
        };

        let out = CpuKernel::new()
            .fit(&request, &CancelToken::new())
            .expect("fit succeeds");
        assert_eq!(out.len(), 2);
        assert_relative_eq!(out[0] as f64, 80.0, max_relative = 0.05);
        assert_relative_eq!(out[1] as f64, 12.0, max_relative = 0.10);
    }

    #[test]
    fn no_background_leaves_trailing_plane_zero() {
        let (rows, cols) = (12, 12);
        let frame = spot_frame(rows, cols, 5.0, 5.0, 1.2);
        let request = FitRequest {
            frames: &frame,
            n_frames: 1,
            rows,
            cols,
            grid_rows: 1,
            grid_cols: 1,
            row_offset: 5.0,
            col_offset: 5.0,
            row_period: 10.0,
            col_period: 10.0,
            signal_sigmas: &[1.2],
            background: Background::None,
        };

        let out = CpuKernel::new()
            .fit(&request, &CancelToken::new())
            .expect("fit succeeds");
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn output_layout_is_basis_major() {
        let (rows, cols) = (8, 16);
        // Two frames: the second is twice the first, so every coefficient
        // should double frame-to-frame within each basis plane.
        let one = spot_frame(rows, cols, 3.5, 3.5, 1.0);
        let mut frames = one.clone();
        frames.extend(one.iter().map(|v| v * 2.0));

        let request = FitRequest {
            frames: &frames,
            n_frames: 2,
            rows,
            cols,
            grid_rows: 1,
            grid_cols: 2,
            row_offset: 3.5,
            col_offset: 3.5,
            row_period: 7.0,
            col_period: 8.0,
            signal_sigmas: &[1.0],
            background: Background::Constant,
        };

        let grid = 2;
        let out = CpuKernel::new()
            .fit(&request, &CancelToken::new())
            .expect("fit succeeds");
        assert_eq!(out.len(), 2 * 2 * grid);
        for basis in 0..2 {
            for g in 0..grid {
                let f0 = out[(basis * 2) * grid + g] as f64;
                let f1 = out[(basis * 2 + 1) * grid + g] as f64;
                assert_relative_eq!(f1, 2.0 * f0, max_relative = 1e-4, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn cancelled_token_aborts_dispatch() {
        let frame = vec![0.0f32; 64];
        let request = FitRequest {
            frames: &frame,
            n_frames: 1,
            rows: 8,
            cols: 8,
            grid_rows: 1,
            grid_cols: 1,
            row_offset: 3.0,
            col_offset: 3.0,
            row_period: 6.0,
            col_period: 6.0,
            signal_sigmas: &[1.0],
            background: Background::Constant,
        };
        let token = CancelToken::new();
        token.cancel();
        let err = CpuKernel::new().fit(&request, &token).unwrap_err();
        assert!(matches!(err, KernelError::Cancelled));
    }
}
