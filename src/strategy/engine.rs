//! The strategy engine: trains members under one of six diversity
//! mechanisms and generates per-instance ensembles.

use log::{debug, warn};
use rand::prelude::*;
use rayon::prelude::*;

use crate::core::{Dataset, Ensemble, EnsembleMember, MemberFailure, MemberProvenance};
use crate::error::{EnsembleError, Result};
use crate::heads::{Head, HeadSpec};
use crate::network::{
    train_member, Gate, LossSpec, NetworkBuilder, PassKind, TrainConfig, TrainExtras,
    TrainedNetwork,
};
use crate::utils::resample::bootstrap_indices;

/// Which diversity mechanism the engine applies.
///
/// The first three train member-specific parameters; the last three train a
/// single stochastic network and draw members at prediction time.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyKind {
    /// N independent trainings from independent random initializations.
    NaiveInit,
    /// N independent trainings on bootstrap resamples of the training split.
    Bagging,
    /// One shared-weight network with per-member rank-1 factors, trained
    /// jointly.
    BatchEnsemble,
    /// One network trained with fixed-rate dropout; members are stochastic
    /// dropout masks at prediction time.
    McDropout { p_input: f64, p_hidden: f64 },
    /// Dropout with rates learned through a concrete (relaxed Bernoulli)
    /// gate; members are stochastic masks at prediction time.
    ConcreteDropout {
        temperature: f64,
        init_rate: f64,
        rate_penalty: f64,
    },
    /// Mean-field Gaussian weight posterior; members are independent weight
    /// samples at prediction time.
    Bayesian { prior_std: f64, kl_weight: f64 },
}

impl StrategyKind {
    /// Monte-Carlo dropout with the usual rates: light on the input layer,
    /// heavier on hidden layers.
    pub fn mc_dropout() -> Self {
        StrategyKind::McDropout {
            p_input: 0.2,
            p_hidden: 0.5,
        }
    }

    /// Concrete dropout with a mild initial rate and temperature.
    pub fn concrete_dropout() -> Self {
        StrategyKind::ConcreteDropout {
            temperature: 0.1,
            init_rate: 0.1,
            rate_penalty: 1e-4,
        }
    }

    /// Mean-field Gaussian posterior with a unit prior.
    pub fn bayesian() -> Self {
        StrategyKind::Bayesian {
            prior_std: 1.0,
            kl_weight: 1.0,
        }
    }

    /// Whether each member costs a full training run.
    pub fn trains_per_member(&self) -> bool {
        matches!(self, StrategyKind::NaiveInit | StrategyKind::Bagging)
    }

    fn validate(&self) -> Result<()> {
        let bad_rate = |p: f64| !(p >= 0.0 && p < 1.0);
        match self {
            StrategyKind::NaiveInit | StrategyKind::Bagging | StrategyKind::BatchEnsemble => Ok(()),
            StrategyKind::McDropout { p_input, p_hidden } => {
                if bad_rate(*p_input) || bad_rate(*p_hidden) {
                    return Err(EnsembleError::ConfigurationError(format!(
                        "dropout rates must lie in [0, 1), got input {p_input}, hidden {p_hidden}"
                    )));
                }
                Ok(())
            }
            StrategyKind::ConcreteDropout {
                temperature,
                init_rate,
                rate_penalty,
            } => {
                if !(*temperature > 0.0) {
                    return Err(EnsembleError::ConfigurationError(format!(
                        "concrete temperature must be positive, got {temperature}"
                    )));
                }
                if !(*init_rate > 0.0 && *init_rate < 1.0) {
                    return Err(EnsembleError::ConfigurationError(format!(
                        "initial dropout rate must lie in (0, 1), got {init_rate}"
                    )));
                }
                if !(*rate_penalty >= 0.0) {
                    return Err(EnsembleError::ConfigurationError(format!(
                        "rate penalty must be non-negative, got {rate_penalty}"
                    )));
                }
                Ok(())
            }
            StrategyKind::Bayesian {
                prior_std,
                kl_weight,
            } => {
                if !(*prior_std > 0.0) {
                    return Err(EnsembleError::ConfigurationError(format!(
                        "prior standard deviation must be positive, got {prior_std}"
                    )));
                }
                if !(*kl_weight >= 0.0) {
                    return Err(EnsembleError::ConfigurationError(format!(
                        "KL weight must be non-negative, got {kl_weight}"
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Network shape plus the distribution head it feeds.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    /// Hidden layer widths.
    pub hidden: Vec<usize>,
    /// Which head consumes the raw output.
    pub head: HeadSpec,
}

impl NetworkConfig {
    /// Default two-layer architecture for the given head.
    pub fn new(head: HeadSpec) -> Self {
        Self {
            hidden: vec![48, 24],
            head,
        }
    }
}

/// Full strategy configuration: mechanism, member count, network design and
/// training hyperparameters. Read-only during training.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub kind: StrategyKind,
    /// Number of ensemble members (N_ENS).
    pub n_members: usize,
    pub network: NetworkConfig,
    pub train: TrainConfig,
}

impl StrategyConfig {
    pub fn new(kind: StrategyKind, n_members: usize, network: NetworkConfig) -> Self {
        Self {
            kind,
            n_members,
            network,
            train: TrainConfig::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.n_members == 0 {
            return Err(EnsembleError::ConfigurationError(
                "ensemble must have at least one member".to_string(),
            ));
        }
        if self.network.hidden.iter().any(|&w| w == 0) {
            return Err(EnsembleError::ConfigurationError(
                "hidden layer widths must be positive".to_string(),
            ));
        }
        self.kind.validate()?;
        self.train.validate()
    }
}

/// Trained state of the engine, shaped by the mechanism.
enum FittedState {
    /// One network (or a training failure record) per member.
    PerMember(Vec<std::result::Result<TrainedNetwork, EnsembleError>>),
    /// One shared-weight network with member factor slots.
    Joint(TrainedNetwork),
    /// One stochastic network members are drawn from.
    Sampling(TrainedNetwork),
}

/// Trains members under the configured mechanism and generates per-instance
/// ensembles.
pub struct EnsembleStrategyEngine {
    config: StrategyConfig,
    head: Head,
    input_dim: Option<usize>,
    state: Option<FittedState>,
}

/// Derive a decorrelated stream seed (splitmix64 finalizer).
fn mix_seed(base: u64, salt: u64) -> u64 {
    let mut z = base ^ salt.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Fold a feature row into a sampling seed, bit-exactly, so a member's
/// stochastic draw depends on the input's contents rather than its
/// position in the batch.
fn row_seed(base: u64, row: &[f64]) -> u64 {
    let mut h = base;
    for &x in row {
        h = mix_seed(h, x.to_bits());
    }
    h
}

impl EnsembleStrategyEngine {
    pub fn new(config: StrategyConfig) -> Result<Self> {
        config.validate()?;
        let head = config.network.head.build()?;
        Ok(Self {
            config,
            head,
            input_dim: None,
            state: None,
        })
    }

    /// The configured ensemble size.
    pub fn n_members(&self) -> usize {
        self.config.n_members
    }

    /// Whether [`fit`](Self::fit) has completed.
    pub fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    fn builder(&self, input_dim: usize) -> NetworkBuilder {
        let mut builder = NetworkBuilder::new(
            input_dim,
            self.config.network.hidden.clone(),
            self.config.network.head.raw_dim(),
        );
        match &self.config.kind {
            StrategyKind::NaiveInit | StrategyKind::Bagging => {}
            StrategyKind::BatchEnsemble => {
                builder.factor_members = self.config.n_members;
            }
            StrategyKind::McDropout { p_input, p_hidden } => {
                builder.input_gate = Gate::Fixed { rate: *p_input };
                builder.hidden_gate = Gate::Fixed { rate: *p_hidden };
            }
            StrategyKind::ConcreteDropout {
                temperature,
                init_rate,
                ..
            } => {
                let logit = (init_rate / (1.0 - init_rate)).ln();
                builder.input_gate = Gate::Concrete {
                    logit,
                    temperature: *temperature,
                };
                builder.hidden_gate = Gate::Concrete {
                    logit,
                    temperature: *temperature,
                };
            }
            StrategyKind::Bayesian { .. } => {
                builder.gaussian_weights = true;
            }
        }
        builder
    }

    fn extras(&self) -> TrainExtras {
        let mut extras = TrainExtras::default();
        match &self.config.kind {
            StrategyKind::ConcreteDropout { rate_penalty, .. } => {
                extras.rate_penalty = *rate_penalty
            }
            StrategyKind::Bayesian {
                prior_std,
                kl_weight,
            } => extras.kl = Some((*prior_std, *kl_weight)),
            _ => {}
        }
        extras
    }

    /// Train the engine. Per-member training divergence is recorded and
    /// resurfaces as a member failure at generation time; a diverging joint
    /// or sampling training fails the fit, since no member could be drawn.
    pub fn fit(&mut self, train: &Dataset, valid: &Dataset) -> Result<()> {
        let input_dim = train.n_features();
        if valid.n_features() != input_dim {
            return Err(EnsembleError::DimensionMismatch {
                expected: input_dim,
                got: valid.n_features(),
            });
        }
        let builder = self.builder(input_dim);
        let extras = self.extras();
        let config = &self.config.train;
        let loss = match &self.config.network.head {
            HeadSpec::Parametric { truncation } => LossSpec::NormalCrps {
                truncation: *truncation,
            },
            HeadSpec::Quantile { degree, .. } => {
                LossSpec::for_quantile_head(*degree, config.n_loss_levels)?
            }
        };

        let state = if self.config.kind.trains_per_member() {
            let bagging = self.config.kind == StrategyKind::Bagging;
            let train_one = |member: usize| {
                let init_seed = mix_seed(config.base_seed, member as u64);
                let data;
                let split = if bagging {
                    let resample_seed = mix_seed(init_seed, 1);
                    data = train.subset(&bootstrap_indices(train.len(), resample_seed))?;
                    &data
                } else {
                    train
                };
                train_member(
                    &builder, &loss, split, valid, config, init_seed, member, &extras,
                )
            };
            let results: Vec<_> = self.in_pool(|| {
                (0..self.config.n_members)
                    .into_par_iter()
                    .map(train_one)
                    .collect()
            })?;
            // Divergence is a per-member failure; anything else aborts.
            let mut per_member = Vec::with_capacity(results.len());
            for (member, result) in results.into_iter().enumerate() {
                match result {
                    Ok(net) => per_member.push(Ok(net)),
                    Err(err @ EnsembleError::TrainingDivergence { .. }) => {
                        warn!("member {member} diverged during training: {err}");
                        per_member.push(Err(err));
                    }
                    Err(other) => return Err(other),
                }
            }
            FittedState::PerMember(per_member)
        } else {
            let seed = mix_seed(config.base_seed, 0);
            let trained = train_member(&builder, &loss, train, valid, config, seed, 0, &extras)?;
            if let StrategyKind::ConcreteDropout { .. } = self.config.kind {
                debug!("learned dropout rates: {:?}", trained.network.learned_rates());
            }
            if self.config.kind == StrategyKind::BatchEnsemble {
                FittedState::Joint(trained)
            } else {
                FittedState::Sampling(trained)
            }
        };

        self.input_dim = Some(input_dim);
        self.state = Some(state);
        Ok(())
    }

    /// Generate one ensemble of `n_ens` members per input row.
    ///
    /// For mechanisms that train member-specific parameters, `n_ens` must
    /// equal the configured member count; sampling mechanisms draw any
    /// number of members from the one trained network.
    pub fn generate(&self, inputs: &[Vec<f64>], n_ens: usize) -> Result<Vec<Ensemble>> {
        let state = self.state.as_ref().ok_or(EnsembleError::FitRequired)?;
        let input_dim = self.input_dim.ok_or(EnsembleError::FitRequired)?;
        if n_ens == 0 {
            return Err(EnsembleError::ConfigurationError(
                "requested ensemble size must be positive".to_string(),
            ));
        }
        if inputs.is_empty() {
            return Err(EnsembleError::EmptyData);
        }
        for row in inputs {
            if row.len() != input_dim {
                return Err(EnsembleError::DimensionMismatch {
                    expected: input_dim,
                    got: row.len(),
                });
            }
        }
        let fixed_size = matches!(state, FittedState::PerMember(_) | FittedState::Joint(_));
        if fixed_size && n_ens != self.config.n_members {
            return Err(EnsembleError::ConfigurationError(format!(
                "requested {n_ens} members but {} were trained",
                self.config.n_members
            )));
        }

        let base_seed = self.config.train.base_seed;
        let per_row = |row: &Vec<f64>| -> Result<Ensemble> {
            let mut members = Vec::with_capacity(n_ens);
            let mut failures = Vec::new();
            for j in 0..n_ens {
                match self.draw_member(state, row, j, base_seed) {
                    Ok(member) => members.push(member),
                    Err(error) => {
                        failures.push(MemberFailure { index: j, error });
                    }
                }
            }
            Ok(Ensemble::new(n_ens, members, failures))
        };
        // Sampling draws are seeded per (member, row contents), so
        // prediction fans out over the worker pool; the other states are
        // cheap deterministic passes and stay sequential.
        if matches!(state, FittedState::Sampling(_)) {
            self.in_pool(|| inputs.par_iter().map(per_row).collect::<Result<Vec<_>>>())?
        } else {
            inputs.iter().map(per_row).collect()
        }
    }

    fn draw_member(
        &self,
        state: &FittedState,
        row: &[f64],
        j: usize,
        base_seed: u64,
    ) -> std::result::Result<EnsembleMember, EnsembleError> {
        let member_seed = mix_seed(base_seed, j as u64);
        let (raw, provenance) = match state {
            FittedState::PerMember(nets) => {
                let net = nets[j].as_ref().map_err(|e| e.clone())?;
                let provenance = match self.config.kind {
                    StrategyKind::Bagging => MemberProvenance::Bootstrap {
                        init_seed: member_seed,
                        resample_seed: mix_seed(member_seed, 1),
                    },
                    _ => MemberProvenance::RandomInit {
                        init_seed: member_seed,
                    },
                };
                let mut rng = StdRng::seed_from_u64(0);
                (
                    net.predict_raw(row, None, PassKind::Deterministic, &mut rng),
                    provenance,
                )
            }
            FittedState::Joint(net) => {
                let mut rng = StdRng::seed_from_u64(0);
                (
                    net.predict_raw(row, Some(j), PassKind::Deterministic, &mut rng),
                    MemberProvenance::RankFactor { slot: j },
                )
            }
            FittedState::Sampling(net) => {
                // One stochastic pass per (member, input); seeding from the
                // row's contents keeps the draw independent of where the
                // input sits in the batch.
                let mut rng = StdRng::seed_from_u64(row_seed(member_seed, row));
                let provenance = match self.config.kind {
                    StrategyKind::Bayesian { .. } => MemberProvenance::PosteriorSample {
                        sample_seed: member_seed,
                    },
                    _ => MemberProvenance::DropoutMask {
                        mask_seed: member_seed,
                    },
                };
                (
                    net.predict_raw(row, None, PassKind::Stochastic, &mut rng),
                    provenance,
                )
            }
        };
        let forecast = self.head.forecast(&raw).map_err(|e| e.for_member(j))?;
        Ok(EnsembleMember::new(j, provenance, forecast))
    }

    /// Run `op` on the configured worker pool (or rayon's global pool when
    /// no explicit size is set).
    fn in_pool<T: Send>(&self, op: impl FnOnce() -> T + Send) -> Result<T> {
        if self.config.train.n_workers == 0 {
            return Ok(op());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.train.n_workers)
            .build()
            .map_err(|e| EnsembleError::ConfigurationError(format!("worker pool: {e}")))?;
        Ok(pool.install(op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{QuantileLevels, Truncation};

    fn toy_dataset(n: usize, seed: u64) -> Dataset {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut rows = Vec::with_capacity(n);
        let mut ys = Vec::with_capacity(n);
        for _ in 0..n {
            let x: f64 = rng.gen_range(-1.0..1.0);
            let noise: f64 = rng.sample::<f64, _>(rand_distr::StandardNormal);
            rows.push(vec![x]);
            ys.push(1.5 * x + 0.2 * noise);
        }
        Dataset::new(rows, ys).unwrap()
    }

    fn wide_dataset(n: usize, seed: u64) -> Dataset {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut rows = Vec::with_capacity(n);
        let mut ys = Vec::with_capacity(n);
        for _ in 0..n {
            let row: Vec<f64> = (0..6).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let noise: f64 = rng.sample::<f64, _>(rand_distr::StandardNormal);
            ys.push(0.5 * row.iter().sum::<f64>() + 0.2 * noise);
            rows.push(row);
        }
        Dataset::new(rows, ys).unwrap()
    }

    fn quick_strategy(kind: StrategyKind, n_members: usize) -> StrategyConfig {
        let mut config = StrategyConfig::new(
            kind,
            n_members,
            NetworkConfig {
                hidden: vec![8],
                head: HeadSpec::Parametric {
                    truncation: Truncation::None,
                },
            },
        );
        config.train.epochs = 10;
        config.train.batch_size = 16;
        config.train.learning_rate = 1e-2;
        config.train.patience = 3;
        config
    }

    #[test]
    fn generate_before_fit_is_rejected() {
        let engine =
            EnsembleStrategyEngine::new(quick_strategy(StrategyKind::NaiveInit, 2)).unwrap();
        let err = engine.generate(&[vec![0.0]], 2).unwrap_err();
        assert_eq!(err, EnsembleError::FitRequired);
    }

    #[test]
    fn invalid_hyperparameters_are_rejected_at_construction() {
        let bad = quick_strategy(
            StrategyKind::McDropout {
                p_input: 1.0,
                p_hidden: 0.5,
            },
            2,
        );
        assert!(matches!(
            EnsembleStrategyEngine::new(bad),
            Err(EnsembleError::ConfigurationError(_))
        ));
        let bad = quick_strategy(StrategyKind::Bayesian { prior_std: 0.0, kl_weight: 1.0 }, 2);
        assert!(matches!(
            EnsembleStrategyEngine::new(bad),
            Err(EnsembleError::ConfigurationError(_))
        ));
        let bad = quick_strategy(StrategyKind::NaiveInit, 0);
        assert!(matches!(
            EnsembleStrategyEngine::new(bad),
            Err(EnsembleError::ConfigurationError(_))
        ));
    }

    #[test]
    fn naive_members_are_distinct_and_complete() {
        let train = toy_dataset(120, 1);
        let valid = toy_dataset(40, 2);
        let mut engine =
            EnsembleStrategyEngine::new(quick_strategy(StrategyKind::NaiveInit, 3)).unwrap();
        engine.fit(&train, &valid).unwrap();
        let ensembles = engine.generate(&[vec![0.3], vec![-0.7]], 3).unwrap();
        assert_eq!(ensembles.len(), 2);
        for ens in &ensembles {
            assert!(ens.is_complete());
            let locs: Vec<f64> = ens
                .members()
                .iter()
                .map(|m| m.forecast().location().unwrap())
                .collect();
            assert!(
                locs.windows(2).any(|w| (w[0] - w[1]).abs() > 1e-12),
                "independent initializations should not coincide: {locs:?}"
            );
        }
    }

    #[test]
    fn member_count_mismatch_is_a_configuration_error() {
        let train = toy_dataset(60, 3);
        let valid = toy_dataset(20, 4);
        let mut engine =
            EnsembleStrategyEngine::new(quick_strategy(StrategyKind::NaiveInit, 2)).unwrap();
        engine.fit(&train, &valid).unwrap();
        assert!(matches!(
            engine.generate(&[vec![0.0]], 5),
            Err(EnsembleError::ConfigurationError(_))
        ));
    }

    #[test]
    fn bagging_records_bootstrap_provenance() {
        let train = toy_dataset(80, 5);
        let valid = toy_dataset(20, 6);
        let mut engine =
            EnsembleStrategyEngine::new(quick_strategy(StrategyKind::Bagging, 2)).unwrap();
        engine.fit(&train, &valid).unwrap();
        let ens = engine.generate(&[vec![0.1]], 2).unwrap();
        for m in ens[0].members() {
            assert!(matches!(
                m.provenance(),
                MemberProvenance::Bootstrap { .. }
            ));
        }
    }

    #[test]
    fn batch_ensemble_slots_produce_distinct_forecasts() {
        let train = toy_dataset(150, 7);
        let valid = toy_dataset(40, 8);
        let mut engine =
            EnsembleStrategyEngine::new(quick_strategy(StrategyKind::BatchEnsemble, 3)).unwrap();
        engine.fit(&train, &valid).unwrap();
        let ens = engine.generate(&[vec![0.4]], 3).unwrap();
        assert!(ens[0].is_complete());
        let locs: Vec<f64> = ens[0]
            .members()
            .iter()
            .map(|m| m.forecast().location().unwrap())
            .collect();
        assert!(locs.windows(2).any(|w| (w[0] - w[1]).abs() > 1e-12));
        for (j, m) in ens[0].members().iter().enumerate() {
            assert_eq!(m.provenance(), MemberProvenance::RankFactor { slot: j });
        }
    }

    #[test]
    fn mc_dropout_draws_any_member_count_deterministically() {
        let train = toy_dataset(100, 9);
        let valid = toy_dataset(30, 10);
        let mut engine =
            EnsembleStrategyEngine::new(quick_strategy(StrategyKind::mc_dropout(), 4)).unwrap();
        engine.fit(&train, &valid).unwrap();
        // Sampling strategies honor any requested size.
        let small = engine.generate(&[vec![0.2]], 2).unwrap();
        let large = engine.generate(&[vec![0.2]], 7).unwrap();
        assert_eq!(small[0].valid_count(), 2);
        assert_eq!(large[0].valid_count(), 7);
        // Repeated generation is reproducible.
        let again = engine.generate(&[vec![0.2]], 7).unwrap();
        assert_eq!(large, again);
        // Output does not depend on batch position.
        let shifted = engine.generate(&[vec![-0.9], vec![0.2]], 7).unwrap();
        assert_eq!(
            large[0].members()[3].forecast(),
            shifted[1].members()[3].forecast()
        );
    }

    #[test]
    fn sampling_draws_follow_the_row_not_its_batch_position() {
        // Wide inputs give the dropout masks plenty of units to differ on,
        // so a position-dependent seed would show immediately.
        let train = wide_dataset(140, 21);
        let valid = wide_dataset(40, 22);
        let mut engine =
            EnsembleStrategyEngine::new(quick_strategy(StrategyKind::mc_dropout(), 3)).unwrap();
        engine.fit(&train, &valid).unwrap();
        let row = vec![0.3, -0.2, 0.8, 0.1, -0.5, 0.4];
        let other = vec![-0.6, 0.9, 0.0, 0.7, 0.2, -0.8];
        let first = engine.generate(&[row.clone(), other.clone()], 3).unwrap();
        let second = engine.generate(&[other, row], 3).unwrap();
        assert_eq!(first[0], second[1]);
        assert_eq!(first[1], second[0]);
    }

    #[test]
    fn worker_pool_generation_matches_sequential() {
        let train = toy_dataset(100, 17);
        let valid = toy_dataset(30, 18);
        let base = quick_strategy(StrategyKind::bayesian(), 3);
        let mut pooled = base.clone();
        pooled.train.n_workers = 2;
        let mut a = EnsembleStrategyEngine::new(base).unwrap();
        let mut b = EnsembleStrategyEngine::new(pooled).unwrap();
        a.fit(&train, &valid).unwrap();
        b.fit(&train, &valid).unwrap();
        let inputs: Vec<Vec<f64>> = (0..5).map(|i| vec![0.2 * i as f64 - 0.4]).collect();
        assert_eq!(a.generate(&inputs, 6).unwrap(), b.generate(&inputs, 6).unwrap());
    }

    #[test]
    fn bayesian_members_record_posterior_provenance_and_vary() {
        let train = toy_dataset(100, 11);
        let valid = toy_dataset(30, 12);
        let mut engine =
            EnsembleStrategyEngine::new(quick_strategy(StrategyKind::bayesian(), 4)).unwrap();
        engine.fit(&train, &valid).unwrap();
        let ens = engine.generate(&[vec![0.5]], 4).unwrap();
        assert!(ens[0].is_complete());
        let locs: Vec<f64> = ens[0]
            .members()
            .iter()
            .map(|m| m.forecast().location().unwrap())
            .collect();
        assert!(locs.windows(2).any(|w| (w[0] - w[1]).abs() > 1e-12));
        for m in ens[0].members() {
            assert!(matches!(
                m.provenance(),
                MemberProvenance::PosteriorSample { .. }
            ));
        }
    }

    #[test]
    fn diverged_member_surfaces_as_failure_not_silence() {
        let train = toy_dataset(60, 13);
        let valid = toy_dataset(20, 14);
        let mut config = quick_strategy(StrategyKind::NaiveInit, 2);
        config.train.learning_rate = 1e200;
        let mut engine = EnsembleStrategyEngine::new(config).unwrap();
        engine.fit(&train, &valid).unwrap();
        let ens = engine.generate(&[vec![0.0]], 2).unwrap();
        assert_eq!(ens[0].valid_count(), 0);
        assert_eq!(ens[0].failures().len(), 2);
        assert_eq!(ens[0].requested_size(), 2);
        for f in ens[0].failures() {
            assert!(matches!(
                f.error,
                EnsembleError::TrainingDivergence { .. }
            ));
        }
    }

    #[test]
    fn quantile_head_strategy_produces_monotone_forecasts() {
        let train = toy_dataset(120, 15);
        let valid = toy_dataset(40, 16);
        let levels = QuantileLevels::equidistant(9).unwrap();
        let mut config = quick_strategy(StrategyKind::NaiveInit, 2);
        config.network.head = HeadSpec::Quantile {
            degree: 6,
            levels: levels.clone(),
        };
        let mut engine = EnsembleStrategyEngine::new(config).unwrap();
        engine.fit(&train, &valid).unwrap();
        let ens = engine.generate(&[vec![0.0]], 2).unwrap();
        for m in ens[0].members() {
            let values = m.forecast().values().unwrap();
            assert!(values.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(m.forecast().levels().unwrap(), &levels);
        }
    }
}
