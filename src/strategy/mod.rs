//! Ensembling strategies: six mechanisms for producing diverse member
//! forecasts from one network design.
//!
//! Every strategy exposes the same two-phase contract: [`EnsembleStrategyEngine::fit`]
//! trains whatever the mechanism needs (N independent networks, one shared
//! network, one stochastic network), then [`EnsembleStrategyEngine::generate`]
//! produces an [`Ensemble`](crate::core::Ensemble) per input instance.

mod engine;

pub use engine::{EnsembleStrategyEngine, NetworkConfig, StrategyConfig, StrategyKind};
