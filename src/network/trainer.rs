//! Generic member trainer: one minibatch Adam loop parameterized by a
//! strategy descriptor, a loss and a network builder.
//!
//! Training minimizes a proper scoring rule directly: closed-form normal
//! CRPS for the parametric head, mean pinball loss over an equidistant
//! level grid for the Bernstein quantile head. Early stopping monitors the
//! validation loss and restores the best weights, mirroring the usual deep
//! ensemble recipe.

use log::debug;
use rand::prelude::*;

use crate::core::{Dataset, Truncation};
use crate::error::{EnsembleError, Result};
use crate::heads::quantile::BernsteinBasis;
use crate::heads::SCALE_FLOOR;
use crate::network::layers::{AdamState, Network, NetworkBuilder, NetworkGrads, PassKind};
use crate::utils::metrics::{crps_normal, crps_normal_grad};
use crate::utils::stats::{mean, sigmoid, softplus, std_dev, std_normal_cdf, std_normal_pdf};

/// Hyperparameters of a single member training run.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Maximum number of epochs.
    pub epochs: usize,
    /// Minibatch size.
    pub batch_size: usize,
    /// Adam learning rate.
    pub learning_rate: f64,
    /// Early-stopping patience in epochs.
    pub patience: usize,
    /// Number of equidistant levels of the quantile training loss.
    pub n_loss_levels: usize,
    /// Base seed; member-specific seeds derive from it.
    pub base_seed: u64,
    /// Worker-pool size for member-parallel work (0 = rayon default).
    pub n_workers: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 150,
            batch_size: 64,
            learning_rate: 5e-4,
            patience: 10,
            n_loss_levels: 99,
            base_seed: 0,
            n_workers: 0,
        }
    }
}

impl TrainConfig {
    /// Validate the configuration; invalid values fail immediately, never
    /// silently defaulted.
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 || self.batch_size == 0 || self.n_loss_levels == 0 {
            return Err(EnsembleError::ConfigurationError(
                "epochs, batch_size and n_loss_levels must be positive".to_string(),
            ));
        }
        if !(self.learning_rate > 0.0) {
            return Err(EnsembleError::ConfigurationError(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// Per-feature standardization fitted on the training split and applied to
/// every split with the training attributes.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Standardizer {
    center: Vec<f64>,
    scale: Vec<f64>,
}

impl Standardizer {
    pub(crate) fn fit(data: &Dataset) -> Self {
        let d = data.n_features();
        let mut center = Vec::with_capacity(d);
        let mut scale = Vec::with_capacity(d);
        for j in 0..d {
            let col: Vec<f64> = (0..data.len()).map(|i| data.row(i)[j]).collect();
            center.push(mean(&col));
            let s = std_dev(&col);
            scale.push(if s.is_finite() && s > 0.0 { s } else { 1.0 });
        }
        Self { center, scale }
    }

    pub(crate) fn transform(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.center.iter().zip(self.scale.iter()))
            .map(|(&x, (&c, &s))| (x - c) / s)
            .collect()
    }
}

/// Training loss over raw network output.
#[derive(Debug, Clone)]
pub(crate) enum LossSpec {
    /// Closed-form normal CRPS; truncation bounds renormalize the CDF
    /// inside the loss.
    NormalCrps { truncation: Truncation },
    /// Mean pinball loss of the Bernstein quantile function over an
    /// equidistant loss-level grid.
    BernsteinPinball {
        basis: BernsteinBasis,
        levels: Vec<f64>,
    },
}

impl LossSpec {
    pub(crate) fn for_quantile_head(degree: usize, n_loss_levels: usize) -> Result<Self> {
        let step = 1.0 / (n_loss_levels as f64 + 1.0);
        let levels: Vec<f64> = (1..=n_loss_levels).map(|i| i as f64 * step).collect();
        Ok(LossSpec::BernsteinPinball {
            basis: BernsteinBasis::new(degree, &levels)?,
            levels,
        })
    }

    /// Loss value and gradient with respect to the raw output vector.
    pub(crate) fn loss_and_grad(&self, raw: &[f64], y: f64) -> Result<(f64, Vec<f64>)> {
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(EnsembleError::ComputationError(
                "non-finite network output".to_string(),
            ));
        }
        match self {
            LossSpec::NormalCrps { truncation } => {
                let loc = raw[0];
                let pre = raw[1];
                let scale = softplus(pre) + SCALE_FLOOR;
                let (loss, d_loc, d_scale) = match truncation {
                    Truncation::None => {
                        let loss = crps_normal(loc, scale, y)?;
                        let (d_loc, d_scale) = crps_normal_grad(loc, scale, y);
                        (loss, d_loc, d_scale)
                    }
                    _ => crps_truncated_with_grad(loc, scale, truncation.bounds(), y),
                };
                Ok((loss, vec![d_loc, d_scale * sigmoid(pre)]))
            }
            LossSpec::BernsteinPinball { basis, levels } => {
                // Head transform: alpha_0 free, increments softplus-mapped
                // and accumulated.
                let mut alpha = Vec::with_capacity(raw.len());
                let mut acc = raw[0];
                alpha.push(acc);
                for &r in &raw[1..] {
                    acc += softplus(r);
                    alpha.push(acc);
                }
                let q = basis.evaluate(&alpha)?;
                let n = levels.len() as f64;
                let mut loss = 0.0;
                let mut d_alpha = vec![0.0; alpha.len()];
                for (l, (&ql, &tau)) in q.iter().zip(levels.iter()).enumerate() {
                    let err = y - ql;
                    loss += (tau * err).max((tau - 1.0) * err) / n;
                    let dq = (if err >= 0.0 { -tau } else { 1.0 - tau }) / n;
                    for (j, &b) in basis.row(l).iter().enumerate() {
                        d_alpha[j] += dq * b;
                    }
                }
                // Cumulative sum adjoint: suffix sums.
                let mut d_raw = vec![0.0; raw.len()];
                let mut suffix = 0.0;
                for j in (0..alpha.len()).rev() {
                    suffix += d_alpha[j];
                    d_raw[j] = if j == 0 { suffix } else { suffix * sigmoid(raw[j]) };
                }
                Ok((loss, d_raw))
            }
        }
    }
}

/// Bound term `phi(b) * b` that vanishes for infinite bounds.
fn pdf_times(b: f64) -> f64 {
    if b.is_finite() {
        std_normal_pdf(b) * b
    } else {
        0.0
    }
}

fn pdf_or_zero(b: f64) -> f64 {
    if b.is_finite() {
        std_normal_pdf(b)
    } else {
        0.0
    }
}

/// Truncated-normal CRPS and its `(location, scale)` gradient via the
/// Brier-score integral, with analytic parameter derivatives of the
/// renormalized CDF and Simpson quadrature in `x`, split at the
/// observation where the integrand kinks.
fn crps_truncated_with_grad(
    loc: f64,
    scale: f64,
    bounds: (f64, f64),
    y: f64,
) -> (f64, f64, f64) {
    const N_GRID: usize = 96;
    let (lower, upper) = bounds;
    let alpha = (lower - loc) / scale;
    let beta = (upper - loc) / scale;
    let f_lo = if alpha.is_finite() { std_normal_cdf(alpha) } else { 0.0 };
    let f_hi = if beta.is_finite() { std_normal_cdf(beta) } else { 1.0 };
    let denom = f_hi - f_lo;
    if !(denom > 0.0) {
        return (f64::NAN, f64::NAN, f64::NAN);
    }

    // Derivatives of the bound terms.
    let d_lo_mu = -pdf_or_zero(alpha) / scale;
    let d_hi_mu = -pdf_or_zero(beta) / scale;
    let d_lo_sigma = -pdf_times(alpha) / scale;
    let d_hi_sigma = -pdf_times(beta) / scale;
    let d_denom_mu = d_hi_mu - d_lo_mu;
    let d_denom_sigma = d_hi_sigma - d_lo_sigma;

    let lo = lower.max(loc - 8.0 * scale).min(y);
    let hi = upper.min(loc + 8.0 * scale).max(y);
    let split = y.clamp(lo, hi);

    let eval = |x: f64| -> (f64, f64, f64) {
        if x <= lower {
            return (0.0, 0.0, 0.0);
        }
        if x >= upper {
            return (1.0, 0.0, 0.0);
        }
        let zx = (x - loc) / scale;
        let num = std_normal_cdf(zx) - f_lo;
        let d_num_mu = -std_normal_pdf(zx) / scale - d_lo_mu;
        let d_num_sigma = -std_normal_pdf(zx) * zx / scale - d_lo_sigma;
        let f = (num / denom).clamp(0.0, 1.0);
        let d_mu = (d_num_mu * denom - num * d_denom_mu) / (denom * denom);
        let d_sigma = (d_num_sigma * denom - num * d_denom_sigma) / (denom * denom);
        (f, d_mu, d_sigma)
    };

    // One Simpson panel per side of the step in 1{x >= y}; each side is
    // smooth, so the rule keeps its full order.
    let panel = |a: f64, b: f64, step: f64| -> (f64, f64, f64) {
        if !(b > a) {
            return (0.0, 0.0, 0.0);
        }
        let h = (b - a) / N_GRID as f64;
        let term = |x: f64| -> (f64, f64, f64) {
            let (f, d_mu, d_sigma) = eval(x);
            let d = f - step;
            (d * d, 2.0 * d * d_mu, 2.0 * d * d_sigma)
        };
        let (mut s0, mut s1, mut s2) = term(a);
        let (e0, e1, e2) = term(b);
        s0 += e0;
        s1 += e1;
        s2 += e2;
        for i in 1..N_GRID {
            let (v0, v1, v2) = term(a + i as f64 * h);
            let w = if i % 2 == 1 { 4.0 } else { 2.0 };
            s0 += w * v0;
            s1 += w * v1;
            s2 += w * v2;
        }
        (s0 * h / 3.0, s1 * h / 3.0, s2 * h / 3.0)
    };

    let (l0, m0, s0) = panel(lo, split, 0.0);
    let (l1, m1, s1) = panel(split, hi, 1.0);
    (l0 + l1, m0 + m1, s0 + s1)
}

/// A trained member network with its standardization attributes.
#[derive(Debug, Clone)]
pub(crate) struct TrainedNetwork {
    pub network: Network,
    pub scaler: Standardizer,
}

impl TrainedNetwork {
    /// Raw network output for one unstandardized feature row.
    pub(crate) fn predict_raw(
        &self,
        row: &[f64],
        member: Option<usize>,
        kind: PassKind,
        rng: &mut StdRng,
    ) -> Vec<f64> {
        let x = self.scaler.transform(row);
        self.network.forward(&x, member, kind, rng)
    }
}

/// Strategy-specific extras consumed by the generic training loop.
#[derive(Debug, Clone, Default)]
pub(crate) struct TrainExtras {
    /// `(prior_std, kl_weight)` for Gaussian-posterior weights.
    pub kl: Option<(f64, f64)>,
    /// Concrete-dropout rate regularizer weight (0 disables).
    pub rate_penalty: f64,
}

/// Train one member network.
///
/// Returns [`EnsembleError::TrainingDivergence`] as soon as a minibatch or
/// validation loss stops being finite; the caller records the failure and
/// does not retry.
pub(crate) fn train_member(
    builder: &NetworkBuilder,
    loss: &LossSpec,
    train: &Dataset,
    valid: &Dataset,
    config: &TrainConfig,
    seed: u64,
    member_index: usize,
    extras: &TrainExtras,
) -> Result<TrainedNetwork> {
    config.validate()?;
    if train.n_features() != builder.input_dim {
        return Err(EnsembleError::DimensionMismatch {
            expected: builder.input_dim,
            got: train.n_features(),
        });
    }

    let scaler = Standardizer::fit(train);
    let x_train: Vec<Vec<f64>> = (0..train.len()).map(|i| scaler.transform(train.row(i))).collect();
    let x_valid: Vec<Vec<f64>> = (0..valid.len()).map(|i| scaler.transform(valid.row(i))).collect();

    let mut network = builder.build(seed);
    let mut adam = AdamState::new(&network);
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(0x5eed));

    let n_train = train.len() as f64;
    // Shared-weight networks train all factor slots jointly, cycling the
    // active member round-robin over minibatches.
    let joint = network.factor_members();

    let mut best: Option<(f64, Network)> = None;
    let mut stall = 0usize;
    let mut minibatch_counter = 0usize;

    for epoch in 0..config.epochs {
        let mut order: Vec<usize> = (0..train.len()).collect();
        order.shuffle(&mut rng);

        for batch in order.chunks(config.batch_size) {
            let member = if joint > 0 {
                Some(minibatch_counter % joint)
            } else {
                None
            };
            minibatch_counter += 1;

            let mut grads = NetworkGrads::zeros(&network);
            for &i in batch {
                let (raw, caches) = network.forward_cached(&x_train[i], member, &mut rng);
                let (sample_loss, d_raw) = loss
                    .loss_and_grad(&raw, train.target(i))
                    .map_err(|_| EnsembleError::TrainingDivergence {
                        member: member_index,
                        epoch,
                    })?;
                if !sample_loss.is_finite() {
                    return Err(EnsembleError::TrainingDivergence {
                        member: member_index,
                        epoch,
                    });
                }
                network.backward(&caches, &d_raw, member, &mut grads);
            }
            grads.scale(1.0 / batch.len() as f64);
            if let Some((prior_std, kl_weight)) = extras.kl {
                network.add_kl_grads(prior_std, kl_weight / n_train, &mut grads);
            }
            if extras.rate_penalty > 0.0 {
                network.add_rate_penalty_grads(extras.rate_penalty / n_train, &mut grads);
            }
            network.adam_step(&grads, &mut adam, config.learning_rate);
        }

        let val = validation_loss(&network, loss, &x_valid, valid.targets(), joint)
            .map_err(|e| match e {
                EnsembleError::ComputationError(_) => EnsembleError::TrainingDivergence {
                    member: member_index,
                    epoch,
                },
                other => other,
            })?;
        if !val.is_finite() {
            return Err(EnsembleError::TrainingDivergence {
                member: member_index,
                epoch,
            });
        }
        match &best {
            Some((best_val, _)) if val >= *best_val => {
                stall += 1;
                if stall > config.patience {
                    break;
                }
            }
            _ => {
                best = Some((val, network.clone()));
                stall = 0;
            }
        }
    }

    let network = best
        .map(|(_, net)| net)
        .ok_or_else(|| EnsembleError::TrainingDivergence {
            member: member_index,
            epoch: 0,
        })?;
    if let Some((prior_std, _)) = extras.kl {
        debug!(
            "member {member_index}: posterior KL to prior (std {prior_std}) = {:.3}",
            network.kl_divergence(prior_std)
        );
    }
    Ok(TrainedNetwork { network, scaler })
}

/// Deterministic validation loss; joint (shared-weight) networks average
/// over all member slots.
fn validation_loss(
    network: &Network,
    loss: &LossSpec,
    x_valid: &[Vec<f64>],
    y_valid: &[f64],
    joint: usize,
) -> Result<f64> {
    if x_valid.is_empty() {
        return Err(EnsembleError::EmptyData);
    }
    let mut rng = StdRng::seed_from_u64(0);
    let members: Vec<Option<usize>> = if joint > 0 {
        (0..joint).map(Some).collect()
    } else {
        vec![None]
    };
    let mut total = 0.0;
    let mut count = 0.0;
    for member in members {
        for (x, &y) in x_valid.iter().zip(y_valid.iter()) {
            let raw = network.forward(x, member, PassKind::Deterministic, &mut rng);
            let (l, _) = loss.loss_and_grad(&raw, y)?;
            total += l;
            count += 1.0;
        }
    }
    Ok(total / count)
}
