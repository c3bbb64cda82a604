//! Bernstein quantile head (BQN).
//!
//! The network emits one free coefficient `alpha_0` and `degree` raw
//! increments. Increments map through a softplus onto the non-negative
//! reals and are accumulated, giving non-decreasing Bernstein coefficients;
//! the quantile function is the Bernstein polynomial of those coefficients
//! evaluated on the shared level grid. Monotone coefficients make the
//! emitted quantile sequence non-decreasing structurally, so the data-model
//! invariant never needs post-hoc sorting.

use crate::core::{DistributionForecast, QuantileLevels};
use crate::error::{EnsembleError, Result};
use crate::utils::softplus;

/// Bernstein polynomial basis evaluated on a fixed level grid.
///
/// Row `l`, column `j` holds `C(d, j) p_l^j (1 - p_l)^(d - j)`.
#[derive(Debug, Clone)]
pub struct BernsteinBasis {
    degree: usize,
    n_levels: usize,
    matrix: Vec<f64>,
}

impl BernsteinBasis {
    /// Evaluate the degree-`d` basis at the given levels.
    pub fn new(degree: usize, levels: &[f64]) -> Result<Self> {
        if degree == 0 || levels.is_empty() {
            return Err(EnsembleError::ConfigurationError(
                "Bernstein basis requires degree >= 1 and a non-empty level grid".to_string(),
            ));
        }
        let cols = degree + 1;
        let mut matrix = vec![0.0; levels.len() * cols];
        let binom = binomial_row(degree);
        for (l, &p) in levels.iter().enumerate() {
            let q = 1.0 - p;
            // p^j and (1-p)^(d-j) by running products.
            let mut p_pow = 1.0;
            for j in 0..=degree {
                matrix[l * cols + j] = binom[j] * p_pow * q.powi((degree - j) as i32);
                p_pow *= p;
            }
        }
        Ok(Self {
            degree,
            n_levels: levels.len(),
            matrix,
        })
    }

    /// Polynomial degree.
    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Number of grid levels.
    pub fn n_levels(&self) -> usize {
        self.n_levels
    }

    /// One basis row (all coefficients at a single level).
    pub fn row(&self, level_idx: usize) -> &[f64] {
        let cols = self.degree + 1;
        &self.matrix[level_idx * cols..(level_idx + 1) * cols]
    }

    /// Evaluate the polynomial for coefficient vector `alpha` at every grid
    /// level.
    pub fn evaluate(&self, alpha: &[f64]) -> Result<Vec<f64>> {
        if alpha.len() != self.degree + 1 {
            return Err(EnsembleError::DimensionMismatch {
                expected: self.degree + 1,
                got: alpha.len(),
            });
        }
        Ok((0..self.n_levels)
            .map(|l| {
                self.row(l)
                    .iter()
                    .zip(alpha.iter())
                    .map(|(&b, &a)| b * a)
                    .sum()
            })
            .collect())
    }
}

/// Binomial coefficients `C(d, 0..=d)` by the multiplicative recurrence.
fn binomial_row(d: usize) -> Vec<f64> {
    let mut row = Vec::with_capacity(d + 1);
    let mut c = 1.0;
    row.push(c);
    for j in 0..d {
        c *= (d - j) as f64 / (j + 1) as f64;
        row.push(c);
    }
    row
}

/// Quantile head producing a monotone Bernstein quantile forecast.
#[derive(Debug, Clone)]
pub struct QuantileHead {
    levels: QuantileLevels,
    basis: BernsteinBasis,
}

impl QuantileHead {
    /// Create a head of the given Bernstein degree over the shared output
    /// level grid.
    pub fn new(degree: usize, levels: QuantileLevels) -> Result<Self> {
        let basis = BernsteinBasis::new(degree, levels.as_slice())?;
        Ok(Self { levels, basis })
    }

    /// The shared output level grid.
    pub fn levels(&self) -> &QuantileLevels {
        &self.levels
    }

    /// Bernstein degree.
    pub fn degree(&self) -> usize {
        self.basis.degree()
    }

    /// Number of raw outputs this head consumes: `alpha_0` plus `degree`
    /// increments.
    pub fn raw_dim(&self) -> usize {
        self.basis.degree() + 1
    }

    /// Accumulated Bernstein coefficients from raw network output: the
    /// first entry passes through, the rest are softplus-mapped increments
    /// cumulatively summed.
    ///
    /// # Errors
    /// [`EnsembleError::HeadContractViolation`] on any non-finite raw entry
    /// (member index attached by the caller).
    pub fn coefficients(&self, raw: &[f64]) -> Result<Vec<f64>> {
        if raw.len() != self.raw_dim() {
            return Err(EnsembleError::DimensionMismatch {
                expected: self.raw_dim(),
                got: raw.len(),
            });
        }
        if let Some(idx) = raw.iter().position(|v| !v.is_finite()) {
            return Err(EnsembleError::HeadContractViolation {
                member: 0,
                detail: format!("non-finite raw increment at index {idx}"),
            });
        }
        let mut alpha = Vec::with_capacity(raw.len());
        let mut acc = raw[0];
        alpha.push(acc);
        for &r in &raw[1..] {
            acc += softplus(r);
            alpha.push(acc);
        }
        Ok(alpha)
    }

    /// Mean of the Bernstein quantile function, `sum(alpha) / (d + 1)`.
    pub fn mean(alpha: &[f64]) -> f64 {
        alpha.iter().sum::<f64>() / alpha.len() as f64
    }

    /// Produce the member's distributional forecast from raw network output.
    pub fn forecast(&self, raw: &[f64]) -> Result<DistributionForecast> {
        let alpha = self.coefficients(raw)?;
        let mut values = self.basis.evaluate(&alpha)?;
        // The coefficients are non-decreasing, so any inversion in the
        // evaluated polynomial is round-off; clamp to the running maximum.
        let mut prev = f64::NEG_INFINITY;
        for v in &mut values {
            if *v < prev {
                *v = prev;
            } else {
                prev = *v;
            }
        }
        DistributionForecast::from_quantiles(self.levels.clone(), values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn head(degree: usize) -> QuantileHead {
        QuantileHead::new(degree, QuantileLevels::equidistant(9).unwrap()).unwrap()
    }

    #[test]
    fn basis_rows_sum_to_one() {
        let basis = BernsteinBasis::new(12, &[0.1, 0.25, 0.5, 0.75, 0.9]).unwrap();
        for l in 0..basis.n_levels() {
            let sum: f64 = basis.row(l).iter().sum();
            assert_relative_eq!(sum, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn constant_coefficients_give_constant_quantiles() {
        let basis = BernsteinBasis::new(4, &[0.2, 0.5, 0.8]).unwrap();
        let values = basis.evaluate(&[3.0; 5]).unwrap();
        for v in values {
            assert_relative_eq!(v, 3.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn linear_coefficients_reproduce_identity() {
        // alpha_j = j/d makes the Bernstein polynomial the identity in p.
        let levels = [0.1, 0.3, 0.5, 0.7, 0.9];
        let d = 6;
        let alpha: Vec<f64> = (0..=d).map(|j| j as f64 / d as f64).collect();
        let basis = BernsteinBasis::new(d, &levels).unwrap();
        let values = basis.evaluate(&alpha).unwrap();
        for (v, p) in values.iter().zip(levels.iter()) {
            assert_relative_eq!(*v, *p, epsilon = 1e-12);
        }
    }

    #[test]
    fn forecast_is_monotone_for_any_raw_output() {
        let h = head(8);
        let raw: Vec<f64> = vec![-2.0, -30.0, 5.0, 0.0, -1.0, 2.0, -50.0, 1.0, 0.3];
        let f = h.forecast(&raw).unwrap();
        let values = f.values().unwrap();
        for pair in values.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }

    #[test]
    fn all_negative_increments_still_give_nondecreasing_output() {
        // Softplus of very negative raw increments is ~0: a near-constant,
        // still valid, quantile function.
        let h = head(4);
        let f = h.forecast(&[1.0, -100.0, -100.0, -100.0, -100.0]).unwrap();
        let values = f.values().unwrap();
        for v in values {
            assert_relative_eq!(*v, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn round_off_wiggles_at_large_magnitudes_are_clamped() {
        // Underflowed increments leave near-equal coefficients; at large
        // magnitudes the basis evaluation can then dip by one ulp between
        // adjacent levels.
        let h = QuantileHead::new(12, QuantileLevels::equidistant(9).unwrap()).unwrap();
        let mut raw = vec![1e5];
        raw.extend(std::iter::repeat(-700.0).take(12));
        let f = h.forecast(&raw).unwrap();
        let values = f.values().unwrap();
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert_relative_eq!(values[0], 1e5, epsilon = 1e-6);
        assert_relative_eq!(values[8], 1e5, epsilon = 1e-6);
    }

    #[test]
    fn non_finite_increment_is_a_contract_violation() {
        let h = head(4);
        let err = h
            .forecast(&[0.0, 1.0, f64::NEG_INFINITY, 1.0, 1.0])
            .unwrap_err();
        assert!(matches!(err, EnsembleError::HeadContractViolation { .. }));
        assert!(h.forecast(&[0.0, 1.0]).is_err());
    }

    #[test]
    fn mean_is_coefficient_average() {
        let alpha = [1.0, 2.0, 3.0];
        assert_relative_eq!(QuantileHead::mean(&alpha), 2.0, epsilon = 1e-12);
    }
}
