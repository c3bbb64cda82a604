//! Ensemble containers: members, failures and per-instance collections.

use crate::core::DistributionForecast;
use crate::error::EnsembleError;

/// Strategy-specific identity of an ensemble member: which stochastic draw
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MemberProvenance {
    /// Independent random weight initialization.
    RandomInit { init_seed: u64 },
    /// Independent initialization plus a bootstrap resample of the training
    /// split.
    Bootstrap { init_seed: u64, resample_seed: u64 },
    /// Rank-1 factor slot of a shared-weight (BatchEnsemble) network.
    RankFactor { slot: usize },
    /// Stochastic dropout mask at prediction time.
    DropoutMask { mask_seed: u64 },
    /// Weight sample drawn from a learned posterior.
    PosteriorSample { sample_seed: u64 },
}

/// One member forecast of an ensemble. Immutable after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleMember {
    index: usize,
    provenance: MemberProvenance,
    forecast: DistributionForecast,
}

impl EnsembleMember {
    /// Create a member from a head forecast.
    pub fn new(index: usize, provenance: MemberProvenance, forecast: DistributionForecast) -> Self {
        Self {
            index,
            provenance,
            forecast,
        }
    }

    /// Strategy-assigned member index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// How this member's forecast was produced.
    pub fn provenance(&self) -> MemberProvenance {
        self.provenance
    }

    /// The member's distributional forecast.
    pub fn forecast(&self) -> &DistributionForecast {
        &self.forecast
    }
}

/// A member that failed to produce a forecast, with the cause.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberFailure {
    /// Strategy-assigned member index.
    pub index: usize,
    /// What went wrong (training divergence or head contract violation).
    pub error: EnsembleError,
}

/// The member forecasts for a single input instance.
///
/// Order is strategy-assigned and irrelevant to aggregation. A failed
/// member never appears in `members`; it is carried as a failure record so
/// callers can decide between fail-fast and best-effort aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct Ensemble {
    requested: usize,
    members: Vec<EnsembleMember>,
    failures: Vec<MemberFailure>,
}

impl Ensemble {
    /// Assemble an ensemble from valid members and failure records.
    pub fn new(requested: usize, members: Vec<EnsembleMember>, failures: Vec<MemberFailure>) -> Self {
        Self {
            requested,
            members,
            failures,
        }
    }

    /// The ensemble size that was requested (N_ENS).
    pub fn requested_size(&self) -> usize {
        self.requested
    }

    /// Valid member forecasts.
    pub fn members(&self) -> &[EnsembleMember] {
        &self.members
    }

    /// Failure records for members that produced no forecast.
    pub fn failures(&self) -> &[MemberFailure] {
        &self.failures
    }

    /// Whether every requested member produced a valid forecast.
    pub fn is_complete(&self) -> bool {
        self.members.len() == self.requested
    }

    /// Number of valid members.
    pub fn valid_count(&self) -> usize {
        self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DistributionForecast, Truncation};

    fn member(i: usize) -> EnsembleMember {
        EnsembleMember::new(
            i,
            MemberProvenance::RandomInit { init_seed: i as u64 },
            DistributionForecast::parametric(i as f64, 1.0, Truncation::None).unwrap(),
        )
    }

    #[test]
    fn complete_ensemble_reports_no_failures() {
        let ens = Ensemble::new(3, (0..3).map(member).collect(), vec![]);
        assert!(ens.is_complete());
        assert_eq!(ens.valid_count(), 3);
        assert_eq!(ens.requested_size(), 3);
    }

    #[test]
    fn failed_member_is_carried_as_record_not_forecast() {
        let failure = MemberFailure {
            index: 1,
            error: EnsembleError::TrainingDivergence { member: 1, epoch: 4 },
        };
        let ens = Ensemble::new(3, vec![member(0), member(2)], vec![failure.clone()]);
        assert!(!ens.is_complete());
        assert_eq!(ens.valid_count(), 2);
        assert_eq!(ens.failures(), &[failure]);
        assert!(ens.members().iter().all(|m| m.index() != 1));
    }
}
