//! Aggregation engine: merges an ensemble of distributional forecasts into
//! one aggregate via linear pooling or Vincentization.
//!
//! Aggregation is permutation-invariant in member order and deterministic
//! given the ensemble, the method and any fitted parameters. Fitted
//! Vincentization variants require one [`AggregationEngine::fit_weights`]
//! call on a validation split before aggregating held-out data.

mod linear_pool;
mod vincentization;

pub use vincentization::VincentizationVariant;

use vincentization::VincentParams;

use crate::core::{DistributionForecast, Ensemble, EnsembleMember, QuantileLevels};
use crate::error::{EnsembleError, Result};

/// How member forecasts are combined.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationMethod {
    /// Equal-weight mixture of member CDFs.
    LinearPool,
    /// Combination of member quantile functions at shared levels.
    Vincentization(VincentizationVariant),
}

/// What to do with an ensemble that carries fewer valid members than were
/// requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialEnsemblePolicy {
    /// Reject any incomplete ensemble.
    FailFast,
    /// Aggregate over the valid members; reject only when none remain.
    BestEffort,
}

/// The combined forecast, tagged with the method that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedForecast {
    method: AggregationMethod,
    forecast: DistributionForecast,
}

impl AggregatedForecast {
    /// The method that produced this aggregate.
    pub fn method(&self) -> &AggregationMethod {
        &self.method
    }

    /// The aggregate distribution.
    pub fn forecast(&self) -> &DistributionForecast {
        &self.forecast
    }

    /// Consume the wrapper, keeping the distribution.
    pub fn into_forecast(self) -> DistributionForecast {
        self.forecast
    }
}

/// Combines ensembles of member forecasts on a shared quantile grid.
pub struct AggregationEngine {
    method: AggregationMethod,
    policy: PartialEnsemblePolicy,
    levels: QuantileLevels,
    params: Option<VincentParams>,
}

impl AggregationEngine {
    /// Create an engine aggregating on the given shared level grid.
    ///
    /// Quantile members must carry exactly this grid; parametric members are
    /// expressed on it through their exact quantile function.
    pub fn new(
        method: AggregationMethod,
        policy: PartialEnsemblePolicy,
        levels: QuantileLevels,
    ) -> Self {
        Self {
            method,
            policy,
            levels,
            params: None,
        }
    }

    /// The shared level grid aggregates are materialized on.
    pub fn levels(&self) -> &QuantileLevels {
        &self.levels
    }

    /// Whether the configured method can aggregate without fitting.
    pub fn requires_fit(&self) -> bool {
        match &self.method {
            AggregationMethod::LinearPool => false,
            AggregationMethod::Vincentization(variant) => variant.requires_fit(),
        }
    }

    /// Apply the partial-ensemble policy, returning the members to
    /// aggregate in member-index order.
    ///
    /// Floating-point sums depend on term order, so aggregating in a
    /// canonical order keeps the result identical under any permutation of
    /// the ensemble.
    fn admitted<'a>(&self, ensemble: &'a Ensemble) -> Result<Vec<&'a EnsembleMember>> {
        if ensemble.valid_count() == 0 {
            return Err(EnsembleError::AggregationInputError(format!(
                "no valid members ({} requested, {} failed)",
                ensemble.requested_size(),
                ensemble.failures().len()
            )));
        }
        if self.policy == PartialEnsemblePolicy::FailFast && !ensemble.is_complete() {
            return Err(EnsembleError::AggregationInputError(format!(
                "fail-fast: {} of {} members valid",
                ensemble.valid_count(),
                ensemble.requested_size()
            )));
        }
        let mut members: Vec<&EnsembleMember> = ensemble.members().iter().collect();
        members.sort_by_key(|m| m.index());
        Ok(members)
    }

    /// Express one member on the shared grid.
    fn values_on_grid(&self, member: &EnsembleMember) -> Result<Vec<f64>> {
        let forecast = member.forecast();
        match forecast {
            DistributionForecast::Quantile { levels, values } => {
                if levels != &self.levels {
                    return Err(EnsembleError::AggregationInputError(format!(
                        "member {} carries a different quantile grid",
                        member.index()
                    )));
                }
                Ok(values.clone())
            }
            DistributionForecast::Parametric { .. } => Ok(self
                .levels
                .as_slice()
                .iter()
                .map(|&p| forecast.quantile(p))
                .collect()),
        }
    }

    /// Reject quantile members whose grid differs from the shared one.
    fn check_grid(&self, member: &EnsembleMember) -> Result<()> {
        if let Some(levels) = member.forecast().levels() {
            if levels != &self.levels {
                return Err(EnsembleError::AggregationInputError(format!(
                    "member {} carries a different quantile grid",
                    member.index()
                )));
            }
        }
        Ok(())
    }

    /// Fit Vincentization weights/intercept on a validation split of
    /// ensembles with observed outcomes.
    pub fn fit_weights(&mut self, ensembles: &[Ensemble], observations: &[f64]) -> Result<()> {
        let variant = match &self.method {
            AggregationMethod::Vincentization(v) if v.requires_fit() => *v,
            _ => {
                return Err(EnsembleError::ConfigurationError(
                    "aggregation method has no parameters to fit".to_string(),
                ))
            }
        };
        if ensembles.len() != observations.len() {
            return Err(EnsembleError::DimensionMismatch {
                expected: ensembles.len(),
                got: observations.len(),
            });
        }
        if ensembles.is_empty() {
            return Err(EnsembleError::EmptyData);
        }
        let n_members = ensembles[0].requested_size();
        let mut matrices = Vec::with_capacity(ensembles.len());
        for ensemble in ensembles {
            if ensemble.requested_size() != n_members {
                return Err(EnsembleError::ConfigurationError(format!(
                    "inconsistent ensemble sizes in fitting data: {} vs {n_members}",
                    ensemble.requested_size()
                )));
            }
            let members = self.admitted(ensemble)?;
            let mut matrix = Vec::with_capacity(members.len());
            for member in members {
                matrix.push((member.index(), self.values_on_grid(member)?));
            }
            matrices.push(matrix);
        }
        self.params = Some(vincentization::fit_params(
            &matrices,
            observations,
            variant,
            self.levels.as_slice(),
            n_members,
        )?);
        Ok(())
    }

    /// Aggregate one ensemble. Pure and deterministic given the engine's
    /// fitted state.
    pub fn aggregate(&self, ensemble: &Ensemble) -> Result<AggregatedForecast> {
        let members = self.admitted(ensemble)?;
        let forecast = match &self.method {
            AggregationMethod::LinearPool => {
                for &member in &members {
                    self.check_grid(member)?;
                }
                // A one-member pool is that member's distribution, exactly.
                if members.len() == 1 {
                    members[0].forecast().clone()
                } else {
                    let forecasts: Vec<&DistributionForecast> =
                        members.iter().map(|m| m.forecast()).collect();
                    let values =
                        linear_pool::pool_on_grid(&forecasts, self.levels.as_slice())?;
                    DistributionForecast::from_quantiles(self.levels.clone(), values)?
                }
            }
            AggregationMethod::Vincentization(variant) => {
                let mut matrix = Vec::with_capacity(members.len());
                for member in members {
                    matrix.push((member.index(), self.values_on_grid(member)?));
                }
                let values = vincentization::combine(
                    &matrix,
                    *variant,
                    self.params.as_ref(),
                    self.levels.len(),
                )?;
                DistributionForecast::from_quantiles(self.levels.clone(), values)?
            }
        };
        Ok(AggregatedForecast {
            method: self.method.clone(),
            forecast,
        })
    }
}
