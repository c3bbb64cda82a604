//! Feed-forward member networks, manual backpropagation and the generic
//! minibatch training loop shared by every ensembling strategy.

pub(crate) mod layers;
pub(crate) mod trainer;

pub use trainer::TrainConfig;

pub(crate) use layers::{Gate, NetworkBuilder, PassKind};
pub(crate) use trainer::{train_member, LossSpec, TrainExtras, TrainedNetwork};
