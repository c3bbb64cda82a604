//! Linear pool: equal-weight mixture of member CDFs, inverted onto the
//! shared quantile grid by bisection.

use crate::core::DistributionForecast;
use crate::error::{EnsembleError, Result};

const MAX_BISECTIONS: usize = 200;

/// Mean of the member CDFs at `x`.
///
/// The terms are summed in value order, so the mixture (and everything the
/// bisection derives from it) is identical under any member permutation.
fn mixture_cdf(forecasts: &[&DistributionForecast], x: f64) -> f64 {
    let mut terms: Vec<f64> = forecasts.iter().map(|f| f.cdf(x)).collect();
    terms.sort_unstable_by(f64::total_cmp);
    terms.iter().sum::<f64>() / forecasts.len() as f64
}

/// Invert the mixture CDF at each shared level.
///
/// Every member's quantile function satisfies `cdf(quantile(p)) = p` at grid
/// levels, so `[min_i q_i(p), max_i q_i(p)]` brackets the mixture quantile:
/// the mixture CDF is below `p` at the left end and above at the right.
pub(crate) fn pool_on_grid(
    forecasts: &[&DistributionForecast],
    levels: &[f64],
) -> Result<Vec<f64>> {
    if forecasts.is_empty() {
        return Err(EnsembleError::AggregationInputError(
            "no valid members to pool".to_string(),
        ));
    }
    let mut aggregate = Vec::with_capacity(levels.len());
    for &p in levels {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for f in forecasts {
            let q = f.quantile(p);
            lo = lo.min(q);
            hi = hi.max(q);
        }
        if !lo.is_finite() || !hi.is_finite() {
            return Err(EnsembleError::ComputationError(format!(
                "non-finite member quantile at level {p}"
            )));
        }
        let tol = 1e-12 * (1.0 + hi.abs().max(lo.abs()));
        let mut iter = 0;
        while hi - lo > tol && iter < MAX_BISECTIONS {
            let mid = 0.5 * (lo + hi);
            if mixture_cdf(forecasts, mid) < p {
                lo = mid;
            } else {
                hi = mid;
            }
            iter += 1;
        }
        let q = 0.5 * (lo + hi);
        // The inversion is monotone up to bisection tolerance.
        let q = match aggregate.last() {
            Some(&prev) if q < prev => prev,
            _ => q,
        };
        aggregate.push(q);
    }
    Ok(aggregate)
}
