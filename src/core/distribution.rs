//! Distributional forecast representations.
//!
//! A forecast is either parametric (a possibly truncated normal, the DRN
//! output) or non-parametric (a monotone quantile function over a fixed
//! shared level grid, the BQN output). Both expose the same capabilities:
//! CDF and quantile-function evaluation.

use std::sync::Arc;

use statrs::distribution::{ContinuousCDF, Normal};

use crate::error::{EnsembleError, Result};

/// Truncation bounds of a parametric forecast.
///
/// Bounds are fixed run-level constants shared across a run, never learned
/// per sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Truncation {
    /// Untruncated support.
    None,
    /// Support bounded below (zero-truncated when the bound is 0).
    LowerOnly(f64),
    /// Support bounded on both sides, `lower < upper`.
    Interval(f64, f64),
}

impl Truncation {
    /// Support as `(lower, upper)`, infinite where unbounded.
    pub fn bounds(&self) -> (f64, f64) {
        match *self {
            Truncation::None => (f64::NEG_INFINITY, f64::INFINITY),
            Truncation::LowerOnly(l) => (l, f64::INFINITY),
            Truncation::Interval(l, u) => (l, u),
        }
    }

    fn validate(&self) -> Result<()> {
        if let Truncation::Interval(l, u) = *self {
            if !(l < u) {
                return Err(EnsembleError::ConfigurationError(format!(
                    "truncation interval requires lower < upper, got [{l}, {u}]"
                )));
            }
        }
        Ok(())
    }
}

/// A fixed, validated grid of quantile levels, shared by every member of a
/// run.
///
/// Cheap to clone; grid equality is what the aggregation engine checks when
/// rejecting mismatched members.
#[derive(Debug, Clone)]
pub struct QuantileLevels {
    levels: Arc<[f64]>,
}

impl PartialEq for QuantileLevels {
    fn eq(&self, other: &Self) -> bool {
        self.levels == other.levels
    }
}

impl QuantileLevels {
    /// Create a level grid. Levels must be strictly increasing and lie in
    /// the open unit interval.
    pub fn new(levels: Vec<f64>) -> Result<Self> {
        if levels.is_empty() {
            return Err(EnsembleError::EmptyData);
        }
        for pair in levels.windows(2) {
            if !(pair[0] < pair[1]) {
                return Err(EnsembleError::ConfigurationError(format!(
                    "quantile levels must be strictly increasing, got {} before {}",
                    pair[0], pair[1]
                )));
            }
        }
        if !(levels[0] > 0.0 && *levels.last().unwrap() < 1.0) {
            return Err(EnsembleError::ConfigurationError(
                "quantile levels must lie strictly inside (0, 1)".to_string(),
            ));
        }
        Ok(Self {
            levels: levels.into(),
        })
    }

    /// Equidistant grid `{ i/(k+1) : i = 1..k }`.
    pub fn equidistant(k: usize) -> Result<Self> {
        if k == 0 {
            return Err(EnsembleError::EmptyData);
        }
        let step = 1.0 / (k as f64 + 1.0);
        Self::new((1..=k).map(|i| i as f64 * step).collect())
    }

    /// The levels as a slice.
    pub fn as_slice(&self) -> &[f64] {
        &self.levels
    }

    /// Number of levels.
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Whether the grid is empty (never true for a constructed grid).
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// A single distributional forecast.
#[derive(Debug, Clone, PartialEq)]
pub enum DistributionForecast {
    /// Normal with optional fixed truncation: the DRN representation.
    Parametric {
        location: f64,
        scale: f64,
        truncation: Truncation,
    },
    /// Monotone quantile function over a shared level grid: the BQN
    /// representation.
    Quantile {
        levels: QuantileLevels,
        values: Vec<f64>,
    },
}

impl DistributionForecast {
    /// Create a parametric forecast. `scale` must be strictly positive and
    /// both parameters finite; a truncation whose support carries no mass is
    /// rejected.
    pub fn parametric(location: f64, scale: f64, truncation: Truncation) -> Result<Self> {
        truncation.validate()?;
        if !location.is_finite() || !scale.is_finite() || !(scale > 0.0) {
            return Err(EnsembleError::ConfigurationError(format!(
                "parametric forecast requires finite location and positive scale, \
                 got ({location}, {scale})"
            )));
        }
        let (lower, upper) = truncation.bounds();
        if !matches!(truncation, Truncation::None) {
            let normal = std_normal();
            let mass = normal.cdf((upper - location) / scale) - normal.cdf((lower - location) / scale);
            if !(mass > 0.0) {
                return Err(EnsembleError::ComputationError(format!(
                    "truncated support [{lower}, {upper}] carries no probability mass \
                     at ({location}, {scale})"
                )));
            }
        }
        Ok(DistributionForecast::Parametric {
            location,
            scale,
            truncation,
        })
    }

    /// Create a quantile forecast. Values must be finite and non-decreasing
    /// over the grid; a violated monotonicity invariant is a contract
    /// failure of the producing head and is never silently re-sorted.
    pub fn from_quantiles(levels: QuantileLevels, values: Vec<f64>) -> Result<Self> {
        if values.len() != levels.len() {
            return Err(EnsembleError::DimensionMismatch {
                expected: levels.len(),
                got: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EnsembleError::ComputationError(
                "quantile forecast contains non-finite values".to_string(),
            ));
        }
        for pair in values.windows(2) {
            if pair[1] < pair[0] {
                return Err(EnsembleError::ComputationError(format!(
                    "quantile values must be non-decreasing, got {} after {}",
                    pair[1], pair[0]
                )));
            }
        }
        Ok(DistributionForecast::Quantile { levels, values })
    }

    /// Location parameter, if parametric.
    pub fn location(&self) -> Option<f64> {
        match self {
            DistributionForecast::Parametric { location, .. } => Some(*location),
            _ => None,
        }
    }

    /// Scale parameter, if parametric.
    pub fn scale(&self) -> Option<f64> {
        match self {
            DistributionForecast::Parametric { scale, .. } => Some(*scale),
            _ => None,
        }
    }

    /// Truncation bounds, if parametric.
    pub fn truncation(&self) -> Option<Truncation> {
        match self {
            DistributionForecast::Parametric { truncation, .. } => Some(*truncation),
            _ => None,
        }
    }

    /// Level grid, if quantile-based.
    pub fn levels(&self) -> Option<&QuantileLevels> {
        match self {
            DistributionForecast::Quantile { levels, .. } => Some(levels),
            _ => None,
        }
    }

    /// Quantile values over the grid, if quantile-based.
    pub fn values(&self) -> Option<&[f64]> {
        match self {
            DistributionForecast::Quantile { values, .. } => Some(values),
            _ => None,
        }
    }

    /// Evaluate the cumulative distribution function at `x`.
    ///
    /// For quantile forecasts the CDF is reconstructed by linear
    /// interpolation over the grid, extended linearly to 0 and 1 beyond the
    /// outermost grid points so the reconstruction stays invertible.
    pub fn cdf(&self, x: f64) -> f64 {
        match self {
            DistributionForecast::Parametric {
                location,
                scale,
                truncation,
            } => {
                let (lower, upper) = truncation.bounds();
                if x <= lower {
                    return 0.0;
                }
                if x >= upper {
                    return 1.0;
                }
                let normal = std_normal();
                let raw = normal.cdf((x - location) / scale);
                match truncation {
                    Truncation::None => raw,
                    _ => {
                        let f_lo = normal.cdf((lower - location) / scale);
                        let f_hi = normal.cdf((upper - location) / scale);
                        ((raw - f_lo) / (f_hi - f_lo)).clamp(0.0, 1.0)
                    }
                }
            }
            DistributionForecast::Quantile { levels, values } => {
                interpolated_cdf(levels.as_slice(), values, x)
            }
        }
    }

    /// Evaluate the quantile function at level `p` in `[0, 1]`.
    ///
    /// For quantile forecasts, levels between grid points interpolate
    /// linearly; levels beyond the grid clamp to the outermost values.
    pub fn quantile(&self, p: f64) -> f64 {
        match self {
            DistributionForecast::Parametric {
                location,
                scale,
                truncation,
            } => {
                let (lower, upper) = truncation.bounds();
                let normal = std_normal();
                let q = match truncation {
                    Truncation::None => location + scale * normal.inverse_cdf(p.clamp(0.0, 1.0)),
                    _ => {
                        let f_lo = normal.cdf((lower - location) / scale);
                        let f_hi = normal.cdf((upper - location) / scale);
                        let target = f_lo + p.clamp(0.0, 1.0) * (f_hi - f_lo);
                        location + scale * normal.inverse_cdf(target.clamp(0.0, 1.0))
                    }
                };
                q.clamp(lower, upper)
            }
            DistributionForecast::Quantile { levels, values } => {
                interpolated_quantile(levels.as_slice(), values, p)
            }
        }
    }
}

fn std_normal() -> Normal {
    // Cannot fail for unit parameters.
    Normal::new(0.0, 1.0).unwrap()
}

/// Width of the linear tail extension of a reconstructed quantile CDF.
fn tail_width(values: &[f64]) -> f64 {
    let span = values[values.len() - 1] - values[0];
    if span > 0.0 {
        span
    } else {
        1.0
    }
}

fn interpolated_quantile(levels: &[f64], values: &[f64], p: f64) -> f64 {
    let k = levels.len();
    if p <= levels[0] {
        return values[0];
    }
    if p >= levels[k - 1] {
        return values[k - 1];
    }
    // partition_point: first index with level > p; the segment is [i-1, i].
    let i = levels.partition_point(|&l| l <= p);
    let (p0, p1) = (levels[i - 1], levels[i]);
    let (v0, v1) = (values[i - 1], values[i]);
    v0 + (p - p0) / (p1 - p0) * (v1 - v0)
}

fn interpolated_cdf(levels: &[f64], values: &[f64], x: f64) -> f64 {
    let k = levels.len();
    let w = tail_width(values);
    if x < values[0] {
        // Linear descent from (values[0], levels[0]) to zero over one tail
        // width.
        let p = levels[0] * (1.0 - (values[0] - x) / w);
        return p.max(0.0);
    }
    if x > values[k - 1] {
        let p = levels[k - 1]
            + (1.0 - levels[k - 1]) * ((x - values[k - 1]) / w).min(1.0);
        return p.min(1.0);
    }
    // Rightmost grid value <= x; flat segments collapse to a jump read from
    // the right.
    let i = values.partition_point(|&v| v <= x);
    if i == 0 {
        return levels[0];
    }
    if i == k {
        return levels[k - 1];
    }
    let (v0, v1) = (values[i - 1], values[i]);
    let (p0, p1) = (levels[i - 1], levels[i]);
    if v1 > v0 {
        p0 + (x - v0) / (v1 - v0) * (p1 - p0)
    } else {
        p0
    }
}
