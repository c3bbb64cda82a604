//! Parametric distribution head (DRN).
//!
//! Interprets the network's final two outputs as `(location, pre_scale)`
//! and maps `pre_scale` through a softplus so the scale is strictly
//! positive everywhere, including at initialization. Truncation bounds are
//! a fixed property of the configured loss, injected here, not learned.

use crate::core::{DistributionForecast, Truncation};
use crate::error::{EnsembleError, Result};
use crate::utils::softplus;

/// Additive floor keeping the scale positive when the softplus underflows.
pub const SCALE_FLOOR: f64 = 1e-6;

/// Distributional regression head producing a (truncated) normal forecast.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParametricHead {
    truncation: Truncation,
}

impl ParametricHead {
    /// Create a head with the run's truncation bounds.
    pub fn new(truncation: Truncation) -> Result<Self> {
        // Reject inverted intervals once, up front.
        if let Truncation::Interval(l, u) = truncation {
            if !(l < u) {
                return Err(EnsembleError::ConfigurationError(format!(
                    "truncation interval requires lower < upper, got [{l}, {u}]"
                )));
            }
        }
        Ok(Self { truncation })
    }

    /// The configured truncation bounds.
    pub fn truncation(&self) -> Truncation {
        self.truncation
    }

    /// Number of raw outputs this head consumes.
    pub fn raw_dim(&self) -> usize {
        2
    }

    /// Map a raw output vector to `(location, scale)`.
    ///
    /// # Errors
    /// [`EnsembleError::HeadContractViolation`] on non-finite raw output
    /// (member index attached by the caller).
    pub fn params(&self, raw: &[f64]) -> Result<(f64, f64)> {
        if raw.len() != 2 {
            return Err(EnsembleError::DimensionMismatch {
                expected: 2,
                got: raw.len(),
            });
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(EnsembleError::HeadContractViolation {
                member: 0,
                detail: format!("non-finite raw parametric output {raw:?}"),
            });
        }
        Ok((raw[0], softplus(raw[1]) + SCALE_FLOOR))
    }

    /// Produce the member's distributional forecast from raw network output.
    pub fn forecast(&self, raw: &[f64]) -> Result<DistributionForecast> {
        let (location, scale) = self.params(raw)?;
        DistributionForecast::parametric(location, scale, self.truncation)
    }
}
