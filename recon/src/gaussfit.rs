//! Nonlinear least-squares refinement of a 1D Gaussian peak.
//!
//! Fits `f(x) = a + b * exp(-(x - x0)^2 / (2 * sigma^2))` to a handful of
//! samples with a Levenberg-Marquardt loop over the four parameters. The
//! problem sizes here are tiny (a cropped spectrum window), so the normal
//! equations are solved directly with a fixed-size nalgebra factorization.

use nalgebra::{Matrix4, Vector4};
use thiserror::Error;

/// Parameters of a Gaussian peak on a constant baseline.
#[derive(Debug, Clone, Copy)]
pub struct GaussianPeak {
    pub baseline: f64,
    pub amplitude: f64,
    pub center: f64,
    pub sigma: f64,
}

impl GaussianPeak {
    /// Evaluate the model at `x`.
    pub fn value(&self, x: f64) -> f64 {
        let d = x - self.center;
        self.baseline + self.amplitude * (-d * d / (2.0 * self.sigma * self.sigma)).exp()
    }
}

#[derive(Error, Debug)]
pub enum FitError {
    #[error("gaussian fit needs at least 4 samples, got {0}")]
    InsufficientData(usize),

    #[error("gaussian fit did not converge")]
    DidNotConverge,
}

const MAX_ITERATIONS: usize = 100;
const LAMBDA_MAX: f64 = 1e12;
const STEP_TOLERANCE: f64 = 1e-10;

/// Fit the Gaussian peak model to `(xs, ys)` starting from `initial`.
///
/// Returns [`FitError::DidNotConverge`] when the damping factor saturates or
/// the iteration budget runs out before the step size settles.
pub fn fit_gaussian_peak(
    xs: &[f64],
    ys: &[f64],
    initial: GaussianPeak,
) -> Result<GaussianPeak, FitError> {
    let n = xs.len().min(ys.len());
    if n < 4 {
        return Err(FitError::InsufficientData(n));
    }

    let mut fit = initial;
    if !(fit.sigma > 0.0) {
        fit.sigma = 1.0;
    }
    let mut cost = residual_cost(xs, ys, &fit);
    let mut lambda = 1e-3;

    for _ in 0..MAX_ITERATIONS {
        let (jtj, jtr) = normal_equations(xs, ys, &fit);

        loop {
            let mut damped = jtj;
            for i in 0..4 {
                damped[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
            }

            let step = match damped.lu().solve(&jtr) {
                Some(step) => step,
                None => {
                    lambda *= 10.0;
                    if lambda > LAMBDA_MAX {
                        return Err(FitError::DidNotConverge);
                    }
                    continue;
                }
            };

            let candidate = GaussianPeak {
                baseline: fit.baseline + step[0],
                amplitude: fit.amplitude + step[1],
                center: fit.center + step[2],
                sigma: fit.sigma + step[3],
            };

            let candidate_cost = if candidate.sigma > 0.0 {
                residual_cost(xs, ys, &candidate)
            } else {
                f64::INFINITY
            };

            if candidate_cost < cost {
                let converged = step.norm() < STEP_TOLERANCE * (1.0 + parameter_norm(&fit));
                fit = candidate;
                cost = candidate_cost;
                lambda = (lambda * 0.5).max(1e-12);
                if converged {
                    return Ok(fit);
                }
                break;
            }

            lambda *= 10.0;
            if lambda > LAMBDA_MAX {
                return Err(FitError::DidNotConverge);
            }
        }
    }

    Err(FitError::DidNotConverge)
}

fn parameter_norm(fit: &GaussianPeak) -> f64 {
    Vector4::new(fit.baseline, fit.amplitude, fit.center, fit.sigma).norm()
}

fn residual_cost(xs: &[f64], ys: &[f64], fit: &GaussianPeak) -> f64 {
    xs.iter()
        .zip(ys)
        .map(|(&x, &y)| {
            let r = y - fit.value(x);
            r * r
        })
        .sum()
}

/// Accumulate `J'J` and `J'r` for the current parameters.
fn normal_equations(xs: &[f64], ys: &[f64], fit: &GaussianPeak) -> (Matrix4<f64>, Vector4<f64>) {
    let mut jtj = Matrix4::<f64>::zeros();
    let mut jtr = Vector4::<f64>::zeros();

    for (&x, &y) in xs.iter().zip(ys) {
        let d = x - fit.center;
        let s2 = fit.sigma * fit.sigma;
        let e = (-d * d / (2.0 * s2)).exp();

        let jac = Vector4::new(
            1.0,
            e,
            fit.amplitude * e * d / s2,
            fit.amplitude * e * d * d / (s2 * fit.sigma),
        );
        let r = y - fit.value(x);

        jtj += jac * jac.transpose();
        jtr += jac * r;
    }

    (jtj, jtr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample(peak: &GaussianPeak, n: usize) -> (Vec<f64>, Vec<f64>) {
        let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|&x| peak.value(x)).collect();
        (xs, ys)
    }

    #[test]
    fn recovers_exact_parameters() {
        let truth = GaussianPeak {
            baseline: 2.0,
            amplitude: 11.0,
            center: 9.3,
            sigma: 1.7,
        };
        let (xs, ys) = sample(&truth, 20);

        let initial = GaussianPeak {
            baseline: 0.0,
            amplitude: 8.0,
            center: 9.0,
            sigma: 1.0,
        };
        let fit = fit_gaussian_peak(&xs, &ys, initial).expect("fit converges");

        assert_relative_eq!(fit.baseline, truth.baseline, epsilon = 1e-6);
        assert_relative_eq!(fit.amplitude, truth.amplitude, epsilon = 1e-6);
        assert_relative_eq!(fit.center, truth.center, epsilon = 1e-6);
        assert_relative_eq!(fit.sigma.abs(), truth.sigma, epsilon = 1e-6);
    }

    #[test]
    fn sub_sample_center_is_resolved() {
        let truth = GaussianPeak {
            baseline: 0.5,
            amplitude: 6.0,
            center: 7.42,
            sigma: 2.1,
        };
        let (xs, ys) = sample(&truth, 16);

        let initial = GaussianPeak {
            baseline: 0.0,
            amplitude: 5.0,
            center: 7.0,
            sigma: 1.5,
        };
        let fit = fit_gaussian_peak(&xs, &ys, initial).expect("fit converges");
        assert_relative_eq!(fit.center, 7.42, epsilon = 1e-4);
    }

    #[test]
    fn too_few_samples_is_an_error() {
        let initial = GaussianPeak {
            baseline: 0.0,
            amplitude: 1.0,
            center: 1.0,
            sigma: 1.0,
        };
        let err = fit_gaussian_peak(&[0.0, 1.0, 2.0], &[0.0, 1.0, 0.0], initial).unwrap_err();
        assert!(matches!(err, FitError::InsufficientData(3)));
    }
}
