//! Proper scoring rules for distributional forecasts.
//!
//! The aggregation engine fits Vincentization weights by minimizing mean
//! pinball loss, and the member trainer minimizes CRPS (parametric head) or
//! pinball loss (quantile head). External evaluation consumes these same
//! functions as black-box scores.

use crate::error::{EnsembleError, Result};
use crate::utils::stats::{std_normal_cdf, std_normal_pdf};

/// Inverse square root of pi, the constant term of the normal CRPS.
pub(crate) const INV_SQRT_PI: f64 = 0.5641895835477563;

/// Pinball (quantile) loss of a single predicted quantile `q` at level `tau`
/// against observation `y`.
///
/// `L_tau(q, y) = max[ tau (y - q), (tau - 1)(y - q) ]`
pub fn pinball_loss(q: f64, tau: f64, y: f64) -> f64 {
    let err = y - q;
    (tau * err).max((tau - 1.0) * err)
}

/// Mean pinball loss of a quantile forecast over its level grid.
///
/// # Errors
/// Returns [`EnsembleError::DimensionMismatch`] if `values` and `levels`
/// differ in length, [`EnsembleError::EmptyData`] if both are empty.
pub fn mean_pinball_loss(values: &[f64], levels: &[f64], y: f64) -> Result<f64> {
    if values.is_empty() {
        return Err(EnsembleError::EmptyData);
    }
    if values.len() != levels.len() {
        return Err(EnsembleError::DimensionMismatch {
            expected: levels.len(),
            got: values.len(),
        });
    }
    let sum: f64 = values
        .iter()
        .zip(levels.iter())
        .map(|(&q, &tau)| pinball_loss(q, tau, y))
        .sum();
    Ok(sum / values.len() as f64)
}

/// CRPS approximation from a quantile forecast: twice the mean pinball loss.
///
/// Exact in the limit of a dense equidistant level grid.
pub fn crps_from_quantiles(values: &[f64], levels: &[f64], y: f64) -> Result<f64> {
    Ok(2.0 * mean_pinball_loss(values, levels, y)?)
}

/// Closed-form CRPS of a normal distribution.
///
/// `CRPS(N(mu, sigma), y) = sigma [ z (2 Phi(z) - 1) + 2 phi(z) - 1/sqrt(pi) ]`
/// with `z = (y - mu) / sigma`.
///
/// # Example
/// ```
/// use ensemble_forecast::utils::crps_normal;
///
/// // Standard normal scored at its median.
/// let c = crps_normal(0.0, 1.0, 0.0).unwrap();
/// assert!((c - 0.23369497).abs() < 1e-6);
/// ```
pub fn crps_normal(location: f64, scale: f64, y: f64) -> Result<f64> {
    if !(scale > 0.0) {
        return Err(EnsembleError::ConfigurationError(format!(
            "scale must be positive, got {scale}"
        )));
    }
    let z = (y - location) / scale;
    Ok(scale * (z * (2.0 * std_normal_cdf(z) - 1.0) + 2.0 * std_normal_pdf(z) - INV_SQRT_PI))
}

/// Gradient of [`crps_normal`] with respect to `(location, scale)`.
///
/// `d/dmu = 1 - 2 Phi(z)`, `d/dsigma = 2 phi(z) - 1/sqrt(pi)`.
pub fn crps_normal_grad(location: f64, scale: f64, y: f64) -> (f64, f64) {
    let z = (y - location) / scale;
    let d_mu = 1.0 - 2.0 * std_normal_cdf(z);
    let d_sigma = 2.0 * std_normal_pdf(z) - INV_SQRT_PI;
    (d_mu, d_sigma)
}

/// CRPS of an arbitrary CDF via the Brier-score integral
/// `int (F(x) - 1{x >= y})^2 dx`, evaluated by Simpson quadrature with one
/// panel of `n_grid` nodes on either side of the observation (where the
/// integrand kinks).
///
/// Used for the truncated DRN variants, where no compact closed form is
/// carried; the untruncated case should go through [`crps_normal`].
pub fn crps_numeric<F>(cdf: F, support: (f64, f64), y: f64, n_grid: usize) -> f64
where
    F: Fn(f64) -> f64,
{
    let (mut lo, mut hi) = support;
    lo = lo.min(y);
    hi = hi.max(y);
    if !(hi > lo) {
        return 0.0;
    }
    let n = {
        let n = n_grid.max(16);
        n + n % 2
    };
    let panel = |a: f64, b: f64, step: f64| -> f64 {
        if !(b > a) {
            return 0.0;
        }
        let h = (b - a) / n as f64;
        let g = |x: f64| {
            let d = cdf(x) - step;
            d * d
        };
        let mut acc = g(a) + g(b);
        for i in 1..n {
            acc += if i % 2 == 1 { 4.0 } else { 2.0 } * g(a + i as f64 * h);
        }
        acc * h / 3.0
    };
    let split = y.clamp(lo, hi);
    panel(lo, split, 0.0) + panel(split, hi, 1.0)
}
