//! Shared synthetic-data builders for the reconstruction tests.

use ndarray::{Array2, Array3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use recon::Pattern;

/// Geometry and noise of a synthetic lattice acquisition.
#[derive(Debug, Clone)]
pub struct LatticeConfig {
    pub rows: usize,
    pub cols: usize,
    /// Gaussian spot sigma in pixels.
    pub spot_sigma: f64,
    /// Additive read-noise standard deviation (0 disables noise).
    pub noise_std: f64,
    pub seed: u64,
}

impl Default for LatticeConfig {
    fn default() -> Self {
        Self {
            rows: 64,
            cols: 80,
            spot_sigma: 1.3,
            noise_std: 0.0,
            seed: 42,
        }
    }
}

/// Render one frame: Gaussian spots of `amplitude` at every lattice site on
/// a flat `pedestal`, with optional seeded read noise.
pub fn lattice_frame(
    config: &LatticeConfig,
    pattern: &Pattern,
    amplitude: f64,
    pedestal: f64,
    rng: Option<&mut ChaCha8Rng>,
) -> Array2<f32> {
    let mut frame = Array2::from_elem((config.rows, config.cols), pedestal as f32);

    // Spots only contribute within a few sigma; render local windows instead
    // of evaluating every site at every pixel.
    let reach = (4.0 * config.spot_sigma).ceil() as i64;
    let n_r = (config.rows as f64 / pattern.row_period).ceil() as i64 + 1;
    let n_c = (config.cols as f64 / pattern.col_period).ceil() as i64 + 1;
    for i in -1..n_r {
        for j in -1..n_c {
            let cy = pattern.row_offset + i as f64 * pattern.row_period;
            let cx = pattern.col_offset + j as f64 * pattern.col_period;
            let y_lo = ((cy as i64) - reach).max(0);
            let y_hi = ((cy as i64) + reach).min(config.rows as i64 - 1);
            let x_lo = ((cx as i64) - reach).max(0);
            let x_hi = ((cx as i64) + reach).min(config.cols as i64 - 1);
            for y in y_lo..=y_hi {
                for x in x_lo..=x_hi {
                    let r2 = (y as f64 - cy).powi(2) + (x as f64 - cx).powi(2);
                    let v = amplitude * (-r2 / (2.0 * config.spot_sigma.powi(2))).exp();
                    frame[[y as usize, x as usize]] += v as f32;
                }
            }
        }
    }

    if let Some(rng) = rng {
        if config.noise_std > 0.0 {
            for v in frame.iter_mut() {
                // Box-Muller keeps the dev-dependencies to the rand crates
                // the rest of the tests already use.
                let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
                let u2: f64 = rng.gen_range(0.0..1.0);
                let gauss =
                    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
                *v += (config.noise_std * gauss) as f32;
            }
        }
    }

    frame
}

/// Time-averaged image of a lattice acquisition.
pub fn lattice_mean_image(config: &LatticeConfig, pattern: &Pattern) -> Array2<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    lattice_frame(config, pattern, 100.0, 10.0, Some(&mut rng))
}

/// One frame per entry of `amplitudes`, all sharing the lattice geometry.
pub fn lattice_stack(
    config: &LatticeConfig,
    pattern: &Pattern,
    amplitudes: &[f64],
    pedestal: f64,
) -> Array3<f32> {
    let mut stack = Array3::zeros((amplitudes.len(), config.rows, config.cols));
    for (k, &amplitude) in amplitudes.iter().enumerate() {
        let frame = lattice_frame(config, pattern, amplitude, pedestal, None);
        stack.index_axis_mut(ndarray::Axis(0), k).assign(&frame);
    }
    stack
}
