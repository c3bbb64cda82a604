//! Core data model: forecasts, ensembles and input batches.

pub mod dataset;
pub mod distribution;
pub mod ensemble;

pub use dataset::Dataset;
pub use distribution::{DistributionForecast, QuantileLevels, Truncation};
pub use ensemble::{Ensemble, EnsembleMember, MemberFailure, MemberProvenance};
