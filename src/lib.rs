//! # ensemble-forecast
//!
//! Probabilistic forecasting with deep ensembles.
//!
//! Trains feed-forward networks under six diversity strategies (naive
//! re-initialization, bagging, BatchEnsemble rank-factor sharing,
//! Monte-Carlo dropout, concrete dropout, Bayesian weight posteriors),
//! produces full-distribution member forecasts through a parametric
//! truncated-normal head or a Bernstein quantile head, and combines them
//! via linear pooling or Vincentization (four weighting variants).

#![allow(clippy::needless_range_loop)]
#![allow(clippy::too_many_arguments)]

pub mod aggregation;
pub mod core;
pub mod error;
pub mod heads;
pub mod network;
pub mod strategy;
pub mod utils;

pub use error::{EnsembleError, Result};

pub mod prelude {
    pub use crate::aggregation::{
        AggregatedForecast, AggregationEngine, AggregationMethod, PartialEnsemblePolicy,
        VincentizationVariant,
    };
    pub use crate::core::{
        Dataset, DistributionForecast, Ensemble, EnsembleMember, QuantileLevels, Truncation,
    };
    pub use crate::error::{EnsembleError, Result};
    pub use crate::heads::HeadSpec;
    pub use crate::network::TrainConfig;
    pub use crate::strategy::{
        EnsembleStrategyEngine, NetworkConfig, StrategyConfig, StrategyKind,
    };
}
