//! Distribution heads: raw network output to valid distribution objects.

pub mod parametric;
pub mod quantile;

pub use parametric::{ParametricHead, SCALE_FLOOR};
pub use quantile::{BernsteinBasis, QuantileHead};

use crate::core::{DistributionForecast, QuantileLevels, Truncation};
use crate::error::Result;

/// Which distribution head a network design uses.
#[derive(Debug, Clone, PartialEq)]
pub enum HeadSpec {
    /// Distributional regression network: (truncated-)normal output.
    Parametric { truncation: Truncation },
    /// Bernstein quantile network: monotone quantile output.
    Quantile {
        degree: usize,
        levels: QuantileLevels,
    },
}

impl HeadSpec {
    /// Number of raw network outputs the head consumes.
    pub fn raw_dim(&self) -> usize {
        match self {
            HeadSpec::Parametric { .. } => 2,
            HeadSpec::Quantile { degree, .. } => degree + 1,
        }
    }

    /// Build the concrete head.
    pub fn build(&self) -> Result<Head> {
        Ok(match self {
            HeadSpec::Parametric { truncation } => {
                Head::Parametric(ParametricHead::new(*truncation)?)
            }
            HeadSpec::Quantile { degree, levels } => {
                Head::Quantile(QuantileHead::new(*degree, levels.clone())?)
            }
        })
    }
}

/// A constructed head, dispatched as a tagged variant (no inheritance
/// hierarchy shared with aggregation logic).
#[derive(Debug, Clone)]
pub enum Head {
    Parametric(ParametricHead),
    Quantile(QuantileHead),
}

impl Head {
    /// Produce a member forecast from the network's raw output vector.
    pub fn forecast(&self, raw: &[f64]) -> Result<DistributionForecast> {
        match self {
            Head::Parametric(h) => h.forecast(raw),
            Head::Quantile(h) => h.forecast(raw),
        }
    }
}
