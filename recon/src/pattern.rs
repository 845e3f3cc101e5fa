//! Illumination-pattern estimation.
//!
//! The scanned illumination lattice shows up as a periodic dot grid in the
//! time-averaged image. Its period and sub-pixel phase are recovered per image
//! axis from the 1D mean profiles: a coarse foreground mask suppresses the
//! background floor, the dominant line of the magnitude spectrum is picked by
//! peak prominence, refined to sub-bin precision with a Gaussian fit, and the
//! phase is read out of the unmasked profile's Fourier coefficient at exactly
//! the refined frequency.

use ndarray::ArrayView2;
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::PatternError;
use crate::gaussfit::{fit_gaussian_peak, GaussianPeak};
use crate::peaks::{find_peaks, Peak};

/// Spatial period and sub-pixel phase of the illumination lattice, per image
/// axis. Grid point `(i, j)` of the lattice sits at image position
/// `(row_offset + i * row_period, col_offset + j * col_period)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub row_offset: f64,
    pub col_offset: f64,
    pub row_period: f64,
    pub col_period: f64,
}

impl Pattern {
    /// Build a pattern from manually supplied values (the GUI lets users
    /// override the estimate), enforcing the positive-period invariant.
    pub fn new(
        row_offset: f64,
        col_offset: f64,
        row_period: f64,
        col_period: f64,
    ) -> Result<Self, PatternError> {
        if !(row_period > 0.0) || !(col_period > 0.0) {
            return Err(PatternError::InvalidPeriod {
                row_period,
                col_period,
            });
        }
        Ok(Self {
            row_offset,
            col_offset,
            row_period,
            col_period,
        })
    }
}

/// Pixels below `max / FOREGROUND_DIVISOR` (after floor subtraction) are
/// treated as background when building the projection profiles.
const FOREGROUND_DIVISOR: f64 = 3.0;

/// Relative prominence difference below which two peaks count as comparable.
const PROMINENCE_TIE: f64 = 0.2;

/// Relative height difference below which two peaks count as comparable.
const HEIGHT_TIE: f64 = 0.2;

/// Estimate the illumination pattern from a 2D mean image.
///
/// Returns [`PatternError::NotFound`] when either axis profile has no usable
/// spectral peak or the peak refinement diverges; callers surface this rather
/// than guessing a pattern.
pub fn estimate_pattern(mean_image: ArrayView2<'_, f32>) -> Result<Pattern, PatternError> {
    let (rows, cols) = mean_image.dim();
    if rows < 8 || cols < 8 {
        return Err(PatternError::NotFound(format!(
            "mean image too small for spectral estimation ({rows}x{cols})"
        )));
    }

    // Background floor: shift to zero and blank everything below a third of
    // the shifted maximum.
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &v in mean_image.iter() {
        let v = v as f64;
        min = min.min(v);
        max = max.max(v);
    }
    let threshold = (max - min) / FOREGROUND_DIVISOR;

    let mut masked_col = vec![0.0f64; cols];
    let mut masked_row = vec![0.0f64; rows];
    let mut raw_col = vec![0.0f64; cols];
    let mut raw_row = vec![0.0f64; rows];
    for ((r, c), &v) in mean_image.indexed_iter() {
        let raw = v as f64;
        let shifted = raw - min;
        let masked = if shifted < threshold { 0.0 } else { shifted };
        masked_col[c] += masked;
        masked_row[r] += masked;
        raw_col[c] += raw;
        raw_row[r] += raw;
    }
    for v in &mut masked_col {
        *v /= rows as f64;
    }
    for v in &mut raw_col {
        *v /= rows as f64;
    }
    for v in &mut masked_row {
        *v /= cols as f64;
    }
    for v in &mut raw_row {
        *v /= cols as f64;
    }

    let (col_period, col_offset) = estimate_axis(&masked_col, &raw_col)
        .map_err(|e| PatternError::NotFound(format!("column profile: {e}")))?;
    let (row_period, row_offset) = estimate_axis(&masked_row, &raw_row)
        .map_err(|e| PatternError::NotFound(format!("row profile: {e}")))?;

    Pattern::new(row_offset, col_offset, row_period, col_period)
}

/// Period and phase along one axis from its masked and raw 1D profiles.
fn estimate_axis(masked: &[f64], raw: &[f64]) -> Result<(f64, f64), String> {
    let n = masked.len();

    // One-sided magnitude spectrum of the masked profile.
    let mut buffer: Vec<Complex<f64>> = masked
        .iter()
        .map(|&v| Complex { re: v, im: 0.0 })
        .collect();
    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n);
    fft.process(&mut buffer);
    let log_spectrum: Vec<f64> = buffer[..n / 2 + 1]
        .iter()
        .map(|c| c.norm().max(f64::MIN_POSITIVE).ln())
        .collect();

    let peaks = find_peaks(&log_spectrum);
    let best = find_best_peak(&peaks).ok_or("no spectral peak above the noise floor")?;

    // Crop +-3 widths around the winner and refine the line center.
    let span = (3.0 * best.width).ceil() as usize;
    let lo = best.index.saturating_sub(span);
    let hi = (best.index + span).min(log_spectrum.len() - 1);
    if hi - lo + 1 < 4 {
        return Err(format!("spectral peak window too narrow ({lo}..{hi})"));
    }
    let xs: Vec<f64> = (lo..=hi).map(|i| i as f64).collect();
    let ys = &log_spectrum[lo..=hi];
    let y_min = ys.iter().cloned().fold(f64::INFINITY, f64::min);
    let y_max = ys.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let initial = GaussianPeak {
        baseline: y_min,
        amplitude: y_max - y_min,
        center: best.index as f64,
        sigma: best.width / 2.355,
    };
    let fit =
        fit_gaussian_peak(&xs, ys, initial).map_err(|e| format!("peak refinement failed: {e}"))?;

    let x0 = fit.center;
    if !x0.is_finite() || x0 <= 0.0 || x0 > (n / 2) as f64 {
        return Err(format!("refined frequency {x0} outside the spectrum"));
    }
    let period = n as f64 / x0;

    // Single Fourier coefficient of the *unmasked* profile at exactly x0;
    // its phase carries the sub-pixel lattice offset.
    let mut coef = Complex { re: 0.0, im: 0.0 };
    for (k, &v) in raw.iter().enumerate() {
        let angle = -2.0 * PI * k as f64 * x0 / n as f64;
        coef += Complex {
            re: v * angle.cos(),
            im: v * angle.sin(),
        };
    }
    let offset = (-coef.arg() / PI * 0.5 * period).rem_euclid(period);

    Ok((period, offset))
}

/// Pick the winning spectral peak.
///
/// The two most prominent peaks are compared: comparable prominence defers to
/// height, comparable height defers to the lower frequency. A clear
/// prominence winner is taken outright.
fn find_best_peak(peaks: &[Peak]) -> Option<Peak> {
    let mut ranked: Vec<Peak> = peaks.to_vec();
    ranked.sort_by(|a, b| b.prominence.total_cmp(&a.prominence));

    let first = *ranked.first()?;
    let second = match ranked.get(1) {
        Some(p) => *p,
        None => return Some(first),
    };

    let prominence_gap =
        (first.prominence - second.prominence).abs() / (first.prominence + second.prominence);
    if prominence_gap >= PROMINENCE_TIE {
        return Some(first);
    }

    let height_scale = (first.height.abs() + second.height.abs()).max(f64::EPSILON);
    let height_gap = (first.height - second.height).abs() / height_scale;
    if height_gap >= HEIGHT_TIE {
        return Some(if first.height >= second.height {
            first
        } else {
            second
        });
    }

    // Comparable in both measures: take the lower-frequency line.
    Some(if first.index <= second.index {
        first
    } else {
        second
    })
}
