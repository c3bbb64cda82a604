//! Fixed-shape feature/target batches consumed from the data-ingestion
//! collaborator. No schema negotiation happens here; shapes are validated
//! once at construction.

use crate::error::{EnsembleError, Result};

/// A batch of numeric feature rows with associated scalar targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    features: Vec<Vec<f64>>,
    targets: Vec<f64>,
}

impl Dataset {
    /// Create a dataset. All rows must share one width, all entries must be
    /// finite, and the number of targets must match the number of rows.
    pub fn new(features: Vec<Vec<f64>>, targets: Vec<f64>) -> Result<Self> {
        if features.is_empty() {
            return Err(EnsembleError::EmptyData);
        }
        if features.len() != targets.len() {
            return Err(EnsembleError::DimensionMismatch {
                expected: features.len(),
                got: targets.len(),
            });
        }
        let width = features[0].len();
        if width == 0 {
            return Err(EnsembleError::EmptyData);
        }
        for row in &features {
            if row.len() != width {
                return Err(EnsembleError::DimensionMismatch {
                    expected: width,
                    got: row.len(),
                });
            }
            if row.iter().any(|v| !v.is_finite()) {
                return Err(EnsembleError::ComputationError(
                    "non-finite feature value".to_string(),
                ));
            }
        }
        if targets.iter().any(|y| !y.is_finite()) {
            return Err(EnsembleError::ComputationError(
                "non-finite target value".to_string(),
            ));
        }
        Ok(Self { features, targets })
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Whether the dataset is empty (never true once constructed).
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Feature dimensionality.
    pub fn n_features(&self) -> usize {
        self.features[0].len()
    }

    /// One feature row.
    pub fn row(&self, i: usize) -> &[f64] {
        &self.features[i]
    }

    /// One target value.
    pub fn target(&self, i: usize) -> f64 {
        self.targets[i]
    }

    /// All targets.
    pub fn targets(&self) -> &[f64] {
        &self.targets
    }

    /// All feature rows.
    pub fn rows(&self) -> &[Vec<f64>] {
        &self.features
    }

    /// Dataset addressed by a list of row indices (bootstrap resamples).
    pub fn subset(&self, indices: &[usize]) -> Result<Self> {
        if indices.is_empty() {
            return Err(EnsembleError::EmptyData);
        }
        let mut features = Vec::with_capacity(indices.len());
        let mut targets = Vec::with_capacity(indices.len());
        for &i in indices {
            if i >= self.len() {
                return Err(EnsembleError::DimensionMismatch {
                    expected: self.len(),
                    got: i,
                });
            }
            features.push(self.features[i].clone());
            targets.push(self.targets[i]);
        }
        Ok(Self { features, targets })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_ragged_and_non_finite_input() {
        assert!(Dataset::new(vec![], vec![]).is_err());
        assert!(Dataset::new(vec![vec![1.0], vec![1.0, 2.0]], vec![0.0, 0.0]).is_err());
        assert!(Dataset::new(vec![vec![1.0]], vec![0.0, 1.0]).is_err());
        assert!(Dataset::new(vec![vec![f64::NAN]], vec![0.0]).is_err());
        assert!(Dataset::new(vec![vec![1.0]], vec![f64::INFINITY]).is_err());
    }

    #[test]
    fn subset_follows_indices() {
        let ds = Dataset::new(
            vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]],
            vec![10.0, 20.0, 30.0],
        )
        .unwrap();
        let sub = ds.subset(&[2, 0, 2]).unwrap();
        assert_eq!(sub.len(), 3);
        assert_eq!(sub.row(0), &[5.0, 6.0]);
        assert_eq!(sub.target(1), 10.0);
        assert_eq!(sub.target(2), 30.0);
        assert!(ds.subset(&[5]).is_err());
        assert!(ds.subset(&[]).is_err());
    }
}
