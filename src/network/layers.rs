//! Dense network building blocks for ensemble members.
//!
//! One generic layer covers every diversity mechanism: point or
//! Gaussian-posterior weights, fixed or learned (concrete) dropout gates on
//! the layer input, and optional per-member rank-1 factors for
//! shared-weight (BatchEnsemble) training. The forward pass caches enough
//! state for an explicit backward pass; no autodiff framework is involved.

use rand::prelude::*;

use crate::utils::{sigmoid, softplus};

/// Hidden activation. Output layers are identity; the heads apply their own
/// transforms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Activation {
    Softplus,
    Identity,
}

impl Activation {
    fn apply(self, z: f64) -> f64 {
        match self {
            Activation::Softplus => softplus(z),
            Activation::Identity => z,
        }
    }

    fn derivative(self, z: f64) -> f64 {
        match self {
            Activation::Softplus => sigmoid(z),
            Activation::Identity => 1.0,
        }
    }
}

/// Weight representation of a layer.
#[derive(Debug, Clone)]
pub(crate) enum Weights {
    /// Deterministic point weights (row-major, `out_dim x in_dim`).
    Point(Vec<f64>),
    /// Mean-field Gaussian posterior; a weight draw is
    /// `mu + softplus(rho) * eps`.
    Gaussian { mu: Vec<f64>, rho: Vec<f64> },
}

/// Stochastic gate applied to the layer input.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Gate {
    None,
    /// Inverted dropout with a fixed rate.
    Fixed { rate: f64 },
    /// Concrete (relaxed Bernoulli) dropout; the rate is `sigmoid(logit)`
    /// and is trained.
    Concrete { logit: f64, temperature: f64 },
}

/// Per-member rank-1 factors of a shared-weight layer.
#[derive(Debug, Clone)]
pub(crate) struct MemberFactors {
    pub input_scale: Vec<f64>,
    pub output_scale: Vec<f64>,
    pub bias: Vec<f64>,
}

#[derive(Debug, Clone)]
pub(crate) struct Layer {
    pub in_dim: usize,
    pub out_dim: usize,
    pub activation: Activation,
    pub weights: Weights,
    pub bias: Vec<f64>,
    pub gate: Gate,
    /// Empty unless the layer is shared across BatchEnsemble members.
    pub factors: Vec<MemberFactors>,
}

/// Whether a pass samples its stochastic elements or runs deterministically
/// (gates off, posterior at its mean).
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum PassKind {
    Stochastic,
    Deterministic,
}

/// Per-layer forward state kept for the backward pass.
#[derive(Debug, Clone)]
pub(crate) struct LayerCache {
    input: Vec<f64>,
    /// Gate multiplier per input unit (all ones when deterministic).
    gate_mult: Vec<f64>,
    /// Relaxed drop variables of a concrete gate (empty otherwise).
    gate_relaxed: Vec<f64>,
    gated: Vec<f64>,
    /// Per-weight posterior noise (empty for point weights).
    weight_eps: Vec<f64>,
    /// Effective weights used in this pass.
    w_eff: Vec<f64>,
    /// `x_gated * input_scale` when member factors apply, else `gated`.
    u: Vec<f64>,
    /// `W u` before output scaling (cached only when factors apply).
    pre_scale: Vec<f64>,
    z: Vec<f64>,
}

/// Gradient buffers mirroring one layer's parameters.
#[derive(Debug, Clone)]
pub(crate) struct LayerGrads {
    /// Gradient of point weights, or of the posterior mean.
    pub w: Vec<f64>,
    /// Gradient of the posterior spread parameter (empty for point weights).
    pub rho: Vec<f64>,
    pub bias: Vec<f64>,
    pub gate_logit: f64,
    pub factors: Vec<FactorGrads>,
}

#[derive(Debug, Clone)]
pub(crate) struct FactorGrads {
    pub input_scale: Vec<f64>,
    pub output_scale: Vec<f64>,
    pub bias: Vec<f64>,
}

#[derive(Debug, Clone)]
pub(crate) struct NetworkGrads {
    pub layers: Vec<LayerGrads>,
}

impl NetworkGrads {
    pub(crate) fn zeros(net: &Network) -> Self {
        let layers = net
            .layers
            .iter()
            .map(|layer| {
                let n_w = layer.in_dim * layer.out_dim;
                LayerGrads {
                    w: vec![0.0; n_w],
                    rho: match layer.weights {
                        Weights::Gaussian { .. } => vec![0.0; n_w],
                        Weights::Point(_) => vec![],
                    },
                    bias: vec![0.0; layer.out_dim],
                    gate_logit: 0.0,
                    factors: layer
                        .factors
                        .iter()
                        .map(|_| FactorGrads {
                            input_scale: vec![0.0; layer.in_dim],
                            output_scale: vec![0.0; layer.out_dim],
                            bias: vec![0.0; layer.out_dim],
                        })
                        .collect(),
                }
            })
            .collect();
        Self { layers }
    }

    /// Scale every accumulated gradient, e.g. by `1 / batch_size`.
    pub(crate) fn scale(&mut self, s: f64) {
        for layer in &mut self.layers {
            for g in layer
                .w
                .iter_mut()
                .chain(layer.rho.iter_mut())
                .chain(layer.bias.iter_mut())
            {
                *g *= s;
            }
            layer.gate_logit *= s;
            for f in &mut layer.factors {
                for g in f
                    .input_scale
                    .iter_mut()
                    .chain(f.output_scale.iter_mut())
                    .chain(f.bias.iter_mut())
                {
                    *g *= s;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Network {
    pub layers: Vec<Layer>,
}

impl Layer {
    fn effective_weights(&self, kind: PassKind, rng: &mut StdRng) -> (Vec<f64>, Vec<f64>) {
        match &self.weights {
            Weights::Point(w) => (w.clone(), vec![]),
            Weights::Gaussian { mu, rho } => match kind {
                PassKind::Deterministic => (mu.clone(), vec![]),
                PassKind::Stochastic => {
                    let mut w = Vec::with_capacity(mu.len());
                    let mut eps = Vec::with_capacity(mu.len());
                    for (m, r) in mu.iter().zip(rho.iter()) {
                        let e: f64 = rng.sample(rand_distr::StandardNormal);
                        w.push(m + softplus(*r) * e);
                        eps.push(e);
                    }
                    (w, eps)
                }
            },
        }
    }

    fn sample_gate(&self, kind: PassKind, rng: &mut StdRng) -> (Vec<f64>, Vec<f64>) {
        if kind == PassKind::Deterministic {
            return (vec![1.0; self.in_dim], vec![]);
        }
        match self.gate {
            Gate::None => (vec![1.0; self.in_dim], vec![]),
            Gate::Fixed { rate } => {
                let keep = 1.0 - rate;
                let mult = (0..self.in_dim)
                    .map(|_| if rng.gen::<f64>() < rate { 0.0 } else { 1.0 / keep })
                    .collect();
                (mult, vec![])
            }
            Gate::Concrete { logit, temperature } => {
                let p = sigmoid(logit);
                let keep = 1.0 - p;
                let mut mult = Vec::with_capacity(self.in_dim);
                let mut relaxed = Vec::with_capacity(self.in_dim);
                for _ in 0..self.in_dim {
                    let u: f64 = rng.gen::<f64>().clamp(1e-7, 1.0 - 1e-7);
                    let drop = sigmoid((logit + u.ln() - (1.0 - u).ln()) / temperature);
                    relaxed.push(drop);
                    mult.push((1.0 - drop) / keep);
                }
                (mult, relaxed)
            }
        }
    }

    fn forward(
        &self,
        input: &[f64],
        member: Option<usize>,
        kind: PassKind,
        rng: &mut StdRng,
    ) -> (Vec<f64>, LayerCache) {
        let (gate_mult, gate_relaxed) = self.sample_gate(kind, rng);
        let gated: Vec<f64> = input
            .iter()
            .zip(gate_mult.iter())
            .map(|(&x, &g)| x * g)
            .collect();
        let (w_eff, weight_eps) = self.effective_weights(kind, rng);

        let factors = member.and_then(|k| self.factors.get(k));
        let u: Vec<f64> = match factors {
            Some(f) => gated
                .iter()
                .zip(f.input_scale.iter())
                .map(|(&x, &r)| x * r)
                .collect(),
            None => gated.clone(),
        };

        let mut pre_scale = Vec::new();
        let mut z = Vec::with_capacity(self.out_dim);
        for o in 0..self.out_dim {
            let row = &w_eff[o * self.in_dim..(o + 1) * self.in_dim];
            let t: f64 = row.iter().zip(u.iter()).map(|(&w, &x)| w * x).sum();
            match factors {
                Some(f) => {
                    pre_scale.push(t);
                    z.push(f.output_scale[o] * t + self.bias[o] + f.bias[o]);
                }
                None => z.push(t + self.bias[o]),
            }
        }
        let out: Vec<f64> = z.iter().map(|&v| self.activation.apply(v)).collect();
        let cache = LayerCache {
            input: input.to_vec(),
            gate_mult,
            gate_relaxed,
            gated,
            weight_eps,
            w_eff,
            u,
            pre_scale,
            z,
        };
        (out, cache)
    }

    /// Accumulate parameter gradients and return the gradient with respect
    /// to the layer input.
    fn backward(
        &self,
        cache: &LayerCache,
        grad_out: &[f64],
        member: Option<usize>,
        grads: &mut LayerGrads,
    ) -> Vec<f64> {
        let dz: Vec<f64> = grad_out
            .iter()
            .zip(cache.z.iter())
            .map(|(&g, &z)| g * self.activation.derivative(z))
            .collect();

        let factors = member.and_then(|k| self.factors.get(k).map(|f| (k, f)));
        let mut du = vec![0.0; self.in_dim];
        match factors {
            Some((k, f)) => {
                let fg = &mut grads.factors[k];
                for o in 0..self.out_dim {
                    let s = f.output_scale[o];
                    fg.output_scale[o] += dz[o] * cache.pre_scale[o];
                    fg.bias[o] += dz[o];
                    grads.bias[o] += dz[o];
                    let row = &cache.w_eff[o * self.in_dim..(o + 1) * self.in_dim];
                    for i in 0..self.in_dim {
                        grads.w[o * self.in_dim + i] += dz[o] * s * cache.u[i];
                        du[i] += dz[o] * s * row[i];
                    }
                }
                for i in 0..self.in_dim {
                    fg.input_scale[i] += du[i] * cache.gated[i];
                    // From u = gated * input_scale.
                    du[i] *= f.input_scale[i];
                }
            }
            None => {
                for o in 0..self.out_dim {
                    grads.bias[o] += dz[o];
                    let row = &cache.w_eff[o * self.in_dim..(o + 1) * self.in_dim];
                    for i in 0..self.in_dim {
                        grads.w[o * self.in_dim + i] += dz[o] * cache.u[i];
                        du[i] += dz[o] * row[i];
                    }
                }
            }
        }

        // Posterior spread gradient rides on the effective-weight gradient.
        if let Weights::Gaussian { rho, .. } = &self.weights {
            if !cache.weight_eps.is_empty() {
                for o in 0..self.out_dim {
                    for i in 0..self.in_dim {
                        let idx = o * self.in_dim + i;
                        let dw = match factors {
                            Some((_, f)) => dz[o] * f.output_scale[o] * cache.u[i],
                            None => dz[o] * cache.u[i],
                        };
                        grads.rho[idx] += dw * cache.weight_eps[idx] * sigmoid(rho[idx]);
                    }
                }
            }
        }

        // Through the gate to the layer input.
        let dx: Vec<f64> = du
            .iter()
            .zip(cache.gate_mult.iter())
            .map(|(&d, &g)| d * g)
            .collect();

        if let Gate::Concrete { logit, temperature } = self.gate {
            if !cache.gate_relaxed.is_empty() {
                let p = sigmoid(logit);
                let keep = 1.0 - p;
                let mut dlogit = 0.0;
                for i in 0..self.in_dim {
                    let drop = cache.gate_relaxed[i];
                    // g = (1 - drop)/keep; both numerator and denominator
                    // depend on the logit.
                    let dg = -drop * (1.0 - drop) / (temperature * keep)
                        + (1.0 - drop) * p * (1.0 - p) / (keep * keep);
                    dlogit += du[i] * cache.input[i] * dg;
                }
                grads.gate_logit += dlogit;
            }
        }

        dx
    }
}

impl Network {
    /// Stochastic or deterministic forward pass; returns the raw output.
    pub(crate) fn forward(
        &self,
        input: &[f64],
        member: Option<usize>,
        kind: PassKind,
        rng: &mut StdRng,
    ) -> Vec<f64> {
        let mut x = input.to_vec();
        for layer in &self.layers {
            let (out, _) = layer.forward(&x, member, kind, rng);
            x = out;
        }
        x
    }

    /// Forward pass retaining per-layer caches for [`Network::backward`].
    pub(crate) fn forward_cached(
        &self,
        input: &[f64],
        member: Option<usize>,
        rng: &mut StdRng,
    ) -> (Vec<f64>, Vec<LayerCache>) {
        let mut x = input.to_vec();
        let mut caches = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (out, cache) = layer.forward(&x, member, PassKind::Stochastic, rng);
            caches.push(cache);
            x = out;
        }
        (x, caches)
    }

    /// Accumulate gradients for one sample into `grads`.
    pub(crate) fn backward(
        &self,
        caches: &[LayerCache],
        grad_out: &[f64],
        member: Option<usize>,
        grads: &mut NetworkGrads,
    ) {
        let mut grad = grad_out.to_vec();
        for (idx, layer) in self.layers.iter().enumerate().rev() {
            grad = layer.backward(&caches[idx], &grad, member, &mut grads.layers[idx]);
        }
    }

    /// KL divergence of the Gaussian posterior to a zero-mean prior with
    /// standard deviation `prior_std`, summed over all posterior layers.
    pub(crate) fn kl_divergence(&self, prior_std: f64) -> f64 {
        let prior_var = prior_std * prior_std;
        let mut kl = 0.0;
        for layer in &self.layers {
            if let Weights::Gaussian { mu, rho } = &layer.weights {
                for (m, r) in mu.iter().zip(rho.iter()) {
                    let s = softplus(*r);
                    kl += (prior_std / s).ln() + (s * s + m * m) / (2.0 * prior_var) - 0.5;
                }
            }
        }
        kl
    }

    /// Add the KL gradient, scaled by `scale`, onto `grads`.
    pub(crate) fn add_kl_grads(&self, prior_std: f64, scale: f64, grads: &mut NetworkGrads) {
        let prior_var = prior_std * prior_std;
        for (layer, lg) in self.layers.iter().zip(grads.layers.iter_mut()) {
            if let Weights::Gaussian { mu, rho } = &layer.weights {
                for idx in 0..mu.len() {
                    let s = softplus(rho[idx]);
                    lg.w[idx] += scale * mu[idx] / prior_var;
                    lg.rho[idx] += scale * (-1.0 / s + s / prior_var) * sigmoid(rho[idx]);
                }
            }
        }
    }

    /// Add the concrete-dropout rate regularizer gradient: the negative
    /// entropy of each learned rate, weighted by the gated fan-in.
    pub(crate) fn add_rate_penalty_grads(&self, penalty: f64, grads: &mut NetworkGrads) {
        for (layer, lg) in self.layers.iter().zip(grads.layers.iter_mut()) {
            if let Gate::Concrete { logit, .. } = layer.gate {
                let p = sigmoid(logit);
                lg.gate_logit += penalty * layer.in_dim as f64 * logit * p * (1.0 - p);
            }
        }
    }

    /// Learned concrete drop rates per gated layer (diagnostics).
    pub(crate) fn learned_rates(&self) -> Vec<f64> {
        self.layers.iter().filter_map(|l| match l.gate {
            Gate::Concrete { logit, .. } => Some(sigmoid(logit)),
            _ => None,
        }).collect()
    }

    /// Number of configured BatchEnsemble member slots (0 when unshared).
    pub(crate) fn factor_members(&self) -> usize {
        self.layers.first().map_or(0, |l| l.factors.len())
    }
}

/// Shapes and modes from which member networks are built.
#[derive(Debug, Clone)]
pub(crate) struct NetworkBuilder {
    pub input_dim: usize,
    pub hidden: Vec<usize>,
    pub output_dim: usize,
    pub gaussian_weights: bool,
    /// Initial posterior spread parameter (rho) for Gaussian weights.
    pub init_rho: f64,
    pub input_gate: Gate,
    pub hidden_gate: Gate,
    /// Number of BatchEnsemble member slots; 0 disables sharing.
    pub factor_members: usize,
}

impl NetworkBuilder {
    pub(crate) fn new(input_dim: usize, hidden: Vec<usize>, output_dim: usize) -> Self {
        Self {
            input_dim,
            hidden,
            output_dim,
            gaussian_weights: false,
            init_rho: -5.0,
            input_gate: Gate::None,
            hidden_gate: Gate::None,
            factor_members: 0,
        }
    }

    pub(crate) fn build(&self, seed: u64) -> Network {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut dims = vec![self.input_dim];
        dims.extend_from_slice(&self.hidden);
        dims.push(self.output_dim);

        let mut layers = Vec::with_capacity(dims.len() - 1);
        for i in 0..dims.len() - 1 {
            let (in_dim, out_dim) = (dims[i], dims[i + 1]);
            let is_output = i == dims.len() - 2;
            let n_w = in_dim * out_dim;

            // Glorot-uniform initialization.
            let limit = (6.0 / (in_dim + out_dim) as f64).sqrt();
            let init: Vec<f64> = (0..n_w).map(|_| rng.gen_range(-limit..limit)).collect();
            let weights = if self.gaussian_weights {
                Weights::Gaussian {
                    mu: init,
                    rho: vec![self.init_rho; n_w],
                }
            } else {
                Weights::Point(init)
            };

            // Gates never sit on the output layer.
            let gate = if is_output {
                Gate::None
            } else if i == 0 {
                self.input_gate
            } else {
                self.hidden_gate
            };

            let factors = (0..self.factor_members)
                .map(|_| MemberFactors {
                    input_scale: random_signs(in_dim, &mut rng),
                    output_scale: random_signs(out_dim, &mut rng),
                    bias: vec![0.0; out_dim],
                })
                .collect();

            layers.push(Layer {
                in_dim,
                out_dim,
                activation: if is_output {
                    Activation::Identity
                } else {
                    Activation::Softplus
                },
                weights,
                bias: vec![0.0; out_dim],
                gate,
                factors,
            });
        }
        Network { layers }
    }
}

/// Random sign vectors with slight magnitude jitter, the usual rank-1
/// factor initialization.
fn random_signs(n: usize, rng: &mut StdRng) -> Vec<f64> {
    (0..n)
        .map(|_| {
            let sign = if rng.gen::<bool>() { 1.0 } else { -1.0 };
            sign * (1.0 + 0.1 * rng.gen_range(-1.0..1.0))
        })
        .collect()
}

/// Adam optimizer state mirroring a network's parameter shapes.
#[derive(Debug, Clone)]
pub(crate) struct AdamState {
    m: NetworkGrads,
    v: NetworkGrads,
    t: usize,
}

impl AdamState {
    pub(crate) fn new(net: &Network) -> Self {
        Self {
            m: NetworkGrads::zeros(net),
            v: NetworkGrads::zeros(net),
            t: 0,
        }
    }
}

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;

fn adam_slice(p: &mut [f64], g: &[f64], m: &mut [f64], v: &mut [f64], t: usize, lr: f64) {
    let bc1 = 1.0 - ADAM_BETA1.powi(t as i32);
    let bc2 = 1.0 - ADAM_BETA2.powi(t as i32);
    for i in 0..p.len() {
        m[i] = ADAM_BETA1 * m[i] + (1.0 - ADAM_BETA1) * g[i];
        v[i] = ADAM_BETA2 * v[i] + (1.0 - ADAM_BETA2) * g[i] * g[i];
        let m_hat = m[i] / bc1;
        let v_hat = v[i] / bc2;
        p[i] -= lr * m_hat / (v_hat.sqrt() + ADAM_EPS);
    }
}

fn adam_scalar(p: &mut f64, g: f64, m: &mut f64, v: &mut f64, t: usize, lr: f64) {
    let mut ps = [*p];
    let gs = [g];
    let mut ms = [*m];
    let mut vs = [*v];
    adam_slice(&mut ps, &gs, &mut ms, &mut vs, t, lr);
    *p = ps[0];
    *m = ms[0];
    *v = vs[0];
}

impl Network {
    /// One Adam step over every trainable parameter.
    pub(crate) fn adam_step(&mut self, grads: &NetworkGrads, state: &mut AdamState, lr: f64) {
        state.t += 1;
        let t = state.t;
        for (idx, layer) in self.layers.iter_mut().enumerate() {
            let lg = &grads.layers[idx];
            let lm = &mut state.m.layers[idx];
            let lv = &mut state.v.layers[idx];
            match &mut layer.weights {
                Weights::Point(w) => adam_slice(w, &lg.w, &mut lm.w, &mut lv.w, t, lr),
                Weights::Gaussian { mu, rho } => {
                    adam_slice(mu, &lg.w, &mut lm.w, &mut lv.w, t, lr);
                    adam_slice(rho, &lg.rho, &mut lm.rho, &mut lv.rho, t, lr);
                }
            }
            adam_slice(&mut layer.bias, &lg.bias, &mut lm.bias, &mut lv.bias, t, lr);
            if let Gate::Concrete { logit, .. } = &mut layer.gate {
                adam_scalar(
                    logit,
                    lg.gate_logit,
                    &mut lm.gate_logit,
                    &mut lv.gate_logit,
                    t,
                    lr,
                );
            }
            for (k, f) in layer.factors.iter_mut().enumerate() {
                let fg = &lg.factors[k];
                let fm = &mut lm.factors[k];
                let fv = &mut lv.factors[k];
                adam_slice(
                    &mut f.input_scale,
                    &fg.input_scale,
                    &mut fm.input_scale,
                    &mut fv.input_scale,
                    t,
                    lr,
                );
                adam_slice(
                    &mut f.output_scale,
                    &fg.output_scale,
                    &mut fm.output_scale,
                    &mut fv.output_scale,
                    t,
                    lr,
                );
                adam_slice(&mut f.bias, &fg.bias, &mut fm.bias, &mut fv.bias, t, lr);
            }
        }
    }
}
