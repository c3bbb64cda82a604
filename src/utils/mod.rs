//! Shared numeric utilities: scoring rules, optimization, resampling, stats.

pub mod metrics;
pub mod optimization;
pub mod resample;
pub mod stats;

pub use metrics::{
    crps_from_quantiles, crps_normal, crps_normal_grad, crps_numeric, mean_pinball_loss,
    pinball_loss,
};
pub use optimization::{nelder_mead, NelderMeadConfig, NelderMeadResult};
pub use resample::bootstrap_indices;
pub use stats::{mean, sigmoid, softplus, std_dev, std_normal_cdf, std_normal_pdf,
    std_normal_quantile, variance};
