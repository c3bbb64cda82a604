//! Derivative-free optimization for aggregation-weight fitting.

/// Result of Nelder-Mead simplex optimization.
#[derive(Debug, Clone)]
pub struct NelderMeadResult {
    /// The optimal point found.
    pub optimal_point: Vec<f64>,
    /// The objective function value at the optimal point.
    pub optimal_value: f64,
    /// Number of iterations performed.
    pub iterations: usize,
    /// Whether the simplex collapsed below tolerance.
    pub converged: bool,
}

/// Configuration for Nelder-Mead optimization.
#[derive(Debug, Clone)]
pub struct NelderMeadConfig {
    /// Maximum number of iterations.
    pub max_iter: usize,
    /// Convergence tolerance on the simplex value spread.
    pub tolerance: f64,
    /// Initial simplex step size.
    pub initial_step: f64,
}

impl Default for NelderMeadConfig {
    fn default() -> Self {
        Self {
            max_iter: 1000,
            tolerance: 1e-10,
            initial_step: 0.1,
        }
    }
}

/// Minimize `objective` with the Nelder-Mead downhill simplex.
///
/// Unconstrained; callers needing constrained parameters (non-negative
/// weights summing to one) reparameterize inside the objective.
///
/// # Example
/// ```
/// use ensemble_forecast::utils::{nelder_mead, NelderMeadConfig};
///
/// let result = nelder_mead(
///     |x| (x[0] - 2.0).powi(2) + (x[1] + 1.0).powi(2),
///     &[0.0, 0.0],
///     NelderMeadConfig::default(),
/// );
/// assert!(result.converged);
/// assert!((result.optimal_point[0] - 2.0).abs() < 1e-4);
/// assert!((result.optimal_point[1] + 1.0).abs() < 1e-4);
/// ```
pub fn nelder_mead<F>(objective: F, initial: &[f64], config: NelderMeadConfig) -> NelderMeadResult
where
    F: Fn(&[f64]) -> f64,
{
    // Standard coefficients: reflection, expansion, contraction, shrink.
    const ALPHA: f64 = 1.0;
    const GAMMA: f64 = 2.0;
    const RHO: f64 = 0.5;
    const SIGMA: f64 = 0.5;

    let n = initial.len();
    if n == 0 {
        return NelderMeadResult {
            optimal_point: vec![],
            optimal_value: objective(&[]),
            iterations: 0,
            converged: true,
        };
    }

    let mut simplex: Vec<Vec<f64>> = Vec::with_capacity(n + 1);
    simplex.push(initial.to_vec());
    for i in 0..n {
        let mut vertex = initial.to_vec();
        vertex[i] += config.initial_step;
        simplex.push(vertex);
    }
    let mut values: Vec<f64> = simplex.iter().map(|v| objective(v)).collect();

    let mut iterations = 0;
    let mut converged = false;

    while iterations < config.max_iter {
        iterations += 1;

        // Order vertices by objective value (NaN sinks to the worst end).
        let mut order: Vec<usize> = (0..=n).collect();
        order.sort_by(|&a, &b| {
            values[a]
                .partial_cmp(&values[b])
                .unwrap_or(std::cmp::Ordering::Greater)
        });
        let simplex_sorted: Vec<Vec<f64>> = order.iter().map(|&i| simplex[i].clone()).collect();
        let values_sorted: Vec<f64> = order.iter().map(|&i| values[i]).collect();
        simplex = simplex_sorted;
        values = values_sorted;

        if (values[n] - values[0]).abs() < config.tolerance {
            converged = true;
            break;
        }

        // Centroid of all but the worst vertex.
        let mut centroid = vec![0.0; n];
        for vertex in simplex.iter().take(n) {
            for (c, &x) in centroid.iter_mut().zip(vertex.iter()) {
                *c += x / n as f64;
            }
        }

        let reflect = |coef: f64| -> Vec<f64> {
            centroid
                .iter()
                .zip(simplex[n].iter())
                .map(|(&c, &w)| c + coef * (c - w))
                .collect()
        };

        let reflected = reflect(ALPHA);
        let f_reflected = objective(&reflected);

        if f_reflected < values[0] {
            let expanded = reflect(GAMMA);
            let f_expanded = objective(&expanded);
            if f_expanded < f_reflected {
                simplex[n] = expanded;
                values[n] = f_expanded;
            } else {
                simplex[n] = reflected;
                values[n] = f_reflected;
            }
        } else if f_reflected <= values[n - 1] {
            // Ties are accepted: piecewise-linear objectives produce
            // equal-valued vertices, and rejecting them stalls the simplex
            // in a premature shrink.
            simplex[n] = reflected;
            values[n] = f_reflected;
        } else {
            let contracted = reflect(-RHO);
            let f_contracted = objective(&contracted);
            if f_contracted <= values[n] {
                simplex[n] = contracted;
                values[n] = f_contracted;
            } else {
                // Shrink toward the best vertex.
                let best = simplex[0].clone();
                for vertex in simplex.iter_mut().skip(1) {
                    for (x, &b) in vertex.iter_mut().zip(best.iter()) {
                        *x = b + SIGMA * (*x - b);
                    }
                }
                for (value, vertex) in values.iter_mut().zip(simplex.iter()).skip(1) {
                    *value = objective(vertex);
                }
            }
        }
    }

    NelderMeadResult {
        optimal_point: simplex[0].clone(),
        optimal_value: values[0],
        iterations,
        converged,
    }
}
