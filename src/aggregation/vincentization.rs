//! Vincentization: quantile-level combination of member forecasts, with
//! optional fitted per-member weights and an additive correction.

use log::debug;

use crate::error::{EnsembleError, Result};
use crate::utils::metrics::mean_pinball_loss;
use crate::utils::optimization::{nelder_mead, NelderMeadConfig};

/// Which Vincentization weighting scheme combines the member quantiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VincentizationVariant {
    /// Equal weights (`vi`).
    Vi,
    /// Fitted non-negative weights summing to one (`vi-w`).
    ViW,
    /// Equal weights plus a fitted additive correction (`vi-a`).
    ViA,
    /// Fitted weights plus a fitted additive correction (`vi-aw`).
    ViAw,
}

impl VincentizationVariant {
    pub(crate) fn fits_weights(&self) -> bool {
        matches!(self, VincentizationVariant::ViW | VincentizationVariant::ViAw)
    }

    pub(crate) fn fits_intercept(&self) -> bool {
        matches!(self, VincentizationVariant::ViA | VincentizationVariant::ViAw)
    }

    /// Whether [`fit_params`] must run before aggregating held-out data.
    pub(crate) fn requires_fit(&self) -> bool {
        self.fits_weights() || self.fits_intercept()
    }
}

/// Fitted Vincentization parameters. Weights are keyed by member index so
/// aggregation stays permutation-invariant over member order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct VincentParams {
    /// One weight per member index; `None` for equal-weight variants.
    pub weights: Option<Vec<f64>>,
    /// Additive correction; zero for variants without one.
    pub intercept: f64,
}

/// Combine member quantile values (each tagged with its member index) into
/// the aggregate quantile vector.
pub(crate) fn combine(
    members: &[(usize, Vec<f64>)],
    variant: VincentizationVariant,
    params: Option<&VincentParams>,
    n_levels: usize,
) -> Result<Vec<f64>> {
    if members.is_empty() {
        return Err(EnsembleError::AggregationInputError(
            "no valid members to combine".to_string(),
        ));
    }
    let params = match (variant.requires_fit(), params) {
        (true, None) => return Err(EnsembleError::FitRequired),
        (_, p) => p,
    };

    let weights: Vec<f64> = if variant.fits_weights() {
        let fitted = params
            .and_then(|p| p.weights.as_deref())
            .ok_or(EnsembleError::FitRequired)?;
        let mut picked = Vec::with_capacity(members.len());
        for (index, _) in members {
            let w = fitted.get(*index).copied().ok_or_else(|| {
                EnsembleError::AggregationInputError(format!(
                    "member index {index} outside fitted weight range {}",
                    fitted.len()
                ))
            })?;
            picked.push(w);
        }
        // Renormalize over the members actually present, so best-effort
        // aggregation of a partial ensemble still uses a convex combination.
        let total: f64 = picked.iter().sum();
        if !(total > 0.0) {
            return Err(EnsembleError::ComputationError(
                "fitted weights of the present members sum to zero".to_string(),
            ));
        }
        picked.iter().map(|w| w / total).collect()
    } else {
        vec![1.0 / members.len() as f64; members.len()]
    };
    let intercept = if variant.fits_intercept() {
        params.map_or(0.0, |p| p.intercept)
    } else {
        0.0
    };

    let mut aggregate = vec![intercept; n_levels];
    for ((_, values), &w) in members.iter().zip(weights.iter()) {
        if values.len() != n_levels {
            return Err(EnsembleError::DimensionMismatch {
                expected: n_levels,
                got: values.len(),
            });
        }
        for (a, &v) in aggregate.iter_mut().zip(values.iter()) {
            *a += w * v;
        }
    }
    Ok(aggregate)
}

/// Numerically stable softmax.
fn softmax(theta: &[f64]) -> Vec<f64> {
    let max = theta.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exp: Vec<f64> = theta.iter().map(|t| (t - max).exp()).collect();
    let total: f64 = exp.iter().sum();
    exp.iter().map(|e| e / total).collect()
}

/// Fit weights and/or intercept by minimizing the mean pinball loss of the
/// aggregate over a validation split.
///
/// The weight simplex is reached through a softmax reparameterization so the
/// downhill simplex runs unconstrained.
pub(crate) fn fit_params(
    matrices: &[Vec<(usize, Vec<f64>)>],
    observations: &[f64],
    variant: VincentizationVariant,
    levels: &[f64],
    n_members: usize,
) -> Result<VincentParams> {
    if !variant.requires_fit() {
        return Err(EnsembleError::ConfigurationError(
            "variant has no parameters to fit".to_string(),
        ));
    }
    if matrices.len() != observations.len() {
        return Err(EnsembleError::DimensionMismatch {
            expected: matrices.len(),
            got: observations.len(),
        });
    }
    if matrices.is_empty() {
        return Err(EnsembleError::EmptyData);
    }

    let n_theta = if variant.fits_weights() { n_members } else { 0 };
    let dim = n_theta + usize::from(variant.fits_intercept());

    let unpack = |point: &[f64]| -> VincentParams {
        let weights = variant.fits_weights().then(|| softmax(&point[..n_theta]));
        let intercept = if variant.fits_intercept() {
            point[dim - 1]
        } else {
            0.0
        };
        VincentParams { weights, intercept }
    };

    let objective = |point: &[f64]| -> f64 {
        let params = unpack(point);
        let mut total = 0.0;
        for (members, &y) in matrices.iter().zip(observations.iter()) {
            match combine(members, variant, Some(&params), levels.len()) {
                Ok(aggregate) => match mean_pinball_loss(&aggregate, levels, y) {
                    Ok(loss) => total += loss,
                    Err(_) => return f64::INFINITY,
                },
                Err(_) => return f64::INFINITY,
            }
        }
        total / matrices.len() as f64
    };

    // The pinball objective is piecewise linear, and the downhill simplex
    // can settle on a kink with its vertices straddling the optimum.
    // Restarting from the best point with a halved step resolves the
    // optimum to the final step scale.
    let mut point = vec![0.0; dim];
    let mut best = f64::INFINITY;
    let mut step = 0.5;
    let mut iterations = 0;
    for _ in 0..6 {
        let result = nelder_mead(
            &objective,
            &point,
            NelderMeadConfig {
                max_iter: 400 * dim.max(1),
                tolerance: 1e-9,
                initial_step: step,
            },
        );
        iterations += result.iterations;
        if result.optimal_value < best {
            best = result.optimal_value;
            point = result.optimal_point;
        }
        step *= 0.5;
    }
    if !best.is_finite() {
        return Err(EnsembleError::ComputationError(
            "weight fitting did not reach a finite objective".to_string(),
        ));
    }
    let params = unpack(&point);
    debug!("fitted vincentization parameters in {iterations} iterations: {params:?}");
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn equal_levels(k: usize) -> Vec<f64> {
        (1..=k).map(|i| i as f64 / (k as f64 + 1.0)).collect()
    }

    #[test]
    fn equal_weight_combination_is_the_mean() {
        let members = vec![(0, vec![1.0, 2.0]), (1, vec![3.0, 4.0])];
        let agg = combine(&members, VincentizationVariant::Vi, None, 2).unwrap();
        assert_relative_eq!(agg[0], 2.0);
        assert_relative_eq!(agg[1], 3.0);
    }

    #[test]
    fn fitted_variants_refuse_to_run_unfitted() {
        let members = vec![(0, vec![1.0]), (1, vec![2.0])];
        for variant in [
            VincentizationVariant::ViW,
            VincentizationVariant::ViA,
            VincentizationVariant::ViAw,
        ] {
            let err = combine(&members, variant, None, 1).unwrap_err();
            assert_eq!(err, EnsembleError::FitRequired);
        }
    }

    #[test]
    fn weights_are_looked_up_by_member_index_not_position() {
        let params = VincentParams {
            weights: Some(vec![0.75, 0.25]),
            intercept: 0.0,
        };
        let forward = vec![(0, vec![0.0]), (1, vec![4.0])];
        let reversed = vec![(1, vec![4.0]), (0, vec![0.0])];
        let a = combine(&forward, VincentizationVariant::ViW, Some(&params), 1).unwrap();
        let b = combine(&reversed, VincentizationVariant::ViW, Some(&params), 1).unwrap();
        assert_relative_eq!(a[0], 1.0);
        assert_relative_eq!(a[0], b[0]);
    }

    #[test]
    fn partial_ensembles_renormalize_the_remaining_weights() {
        let params = VincentParams {
            weights: Some(vec![0.5, 0.25, 0.25]),
            intercept: 0.0,
        };
        // Member 0 missing; remaining weights 0.25/0.25 renormalize to half
        // each.
        let members = vec![(1, vec![2.0]), (2, vec![6.0])];
        let agg = combine(&members, VincentizationVariant::ViW, Some(&params), 1).unwrap();
        assert_relative_eq!(agg[0], 4.0);
    }

    #[test]
    fn weight_fitting_favors_the_accurate_member() {
        let levels = equal_levels(9);
        // Member 0 is centered on the truth, member 1 is biased by +5.
        let mut matrices = Vec::new();
        let mut observations = Vec::new();
        for i in 0..30 {
            let y = i as f64 * 0.1;
            let good: Vec<f64> = levels.iter().map(|&p| y + (p - 0.5)).collect();
            let biased: Vec<f64> = levels.iter().map(|&p| y + 5.0 + (p - 0.5)).collect();
            matrices.push(vec![(0, good), (1, biased)]);
            observations.push(y);
        }
        let params = fit_params(
            &matrices,
            &observations,
            VincentizationVariant::ViW,
            &levels,
            2,
        )
        .unwrap();
        let weights = params.weights.unwrap();
        assert!(
            weights[0] > 0.9,
            "accurate member should dominate, got {weights:?}"
        );
    }

    #[test]
    fn intercept_fitting_absorbs_a_shared_bias() {
        let levels = equal_levels(9);
        // Every member under-forecasts by 3.
        let mut matrices = Vec::new();
        let mut observations = Vec::new();
        for i in 0..25 {
            let y = 1.0 + i as f64 * 0.2;
            let values: Vec<f64> = levels.iter().map(|&p| y - 3.0 + (p - 0.5)).collect();
            matrices.push(vec![(0, values.clone()), (1, values)]);
            observations.push(y);
        }
        let params = fit_params(
            &matrices,
            &observations,
            VincentizationVariant::ViA,
            &levels,
            2,
        )
        .unwrap();
        assert_relative_eq!(params.intercept, 3.0, epsilon = 0.05);
    }

    #[test]
    fn fitting_an_unfittable_variant_is_a_configuration_error() {
        let err = fit_params(&[], &[], VincentizationVariant::Vi, &[0.5], 2).unwrap_err();
        assert!(matches!(err, EnsembleError::ConfigurationError(_)));
    }
}
