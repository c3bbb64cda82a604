//! Aggregation invariants exercised through the public API: the reference
//! fixture, identity laws and partial-ensemble policies.

use approx::assert_relative_eq;
use ensemble_forecast::core::MemberProvenance;
use ensemble_forecast::prelude::*;

fn grid() -> QuantileLevels {
    QuantileLevels::new(vec![0.1, 0.3, 0.5, 0.7, 0.9]).unwrap()
}

fn quantile_member(index: usize, values: Vec<f64>) -> EnsembleMember {
    EnsembleMember::new(
        index,
        MemberProvenance::RandomInit {
            init_seed: index as u64,
        },
        DistributionForecast::from_quantiles(grid(), values).unwrap(),
    )
}

fn ensemble_of(values: Vec<Vec<f64>>) -> Ensemble {
    let n = values.len();
    let members = values
        .into_iter()
        .enumerate()
        .map(|(i, v)| quantile_member(i, v))
        .collect();
    Ensemble::new(n, members, vec![])
}

fn engine(method: AggregationMethod, policy: PartialEnsemblePolicy) -> AggregationEngine {
    AggregationEngine::new(method, policy, grid())
}

#[test]
fn five_member_vi_reference_fixture() {
    let ensemble = ensemble_of(vec![
        vec![1.0, 2.0, 3.0, 4.0, 5.0],
        vec![2.0, 3.0, 4.0, 5.0, 6.0],
        vec![0.0, 1.0, 2.0, 3.0, 4.0],
        vec![3.0, 4.0, 5.0, 6.0, 7.0],
        vec![1.0, 2.0, 3.0, 4.0, 5.0],
    ]);
    assert_eq!(ensemble.requested_size(), 5);
    let agg = engine(
        AggregationMethod::Vincentization(VincentizationVariant::Vi),
        PartialEnsemblePolicy::FailFast,
    )
    .aggregate(&ensemble)
    .unwrap();
    let expected = [1.4, 2.4, 3.4, 4.4, 5.4];
    for (v, e) in agg.forecast().values().unwrap().iter().zip(expected.iter()) {
        assert_relative_eq!(v, e, epsilon = 1e-12);
    }
}

#[test]
fn linear_pool_with_one_member_is_exact() {
    let member = EnsembleMember::new(
        0,
        MemberProvenance::RandomInit { init_seed: 9 },
        DistributionForecast::parametric(3.0, 0.7, Truncation::LowerOnly(0.0)).unwrap(),
    );
    let ensemble = Ensemble::new(1, vec![member.clone()], vec![]);
    let agg = engine(AggregationMethod::LinearPool, PartialEnsemblePolicy::FailFast)
        .aggregate(&ensemble)
        .unwrap();
    assert_eq!(agg.forecast(), member.forecast());
}

#[test]
fn vi_over_identical_members_reproduces_the_member() {
    let values = vec![-2.0, -1.0, 0.0, 1.0, 2.0];
    let ensemble = ensemble_of(vec![values.clone(); 6]);
    let agg = engine(
        AggregationMethod::Vincentization(VincentizationVariant::Vi),
        PartialEnsemblePolicy::FailFast,
    )
    .aggregate(&ensemble)
    .unwrap();
    for (v, e) in agg.forecast().values().unwrap().iter().zip(values.iter()) {
        assert_relative_eq!(v, e, epsilon = 1e-12);
    }
}

#[test]
fn zero_valid_members_raises_aggregation_input_error() {
    let failed = Ensemble::new(
        3,
        vec![],
        (0..3)
            .map(|i| ensemble_forecast::core::MemberFailure {
                index: i,
                error: EnsembleError::TrainingDivergence { member: i, epoch: 0 },
            })
            .collect(),
    );
    for policy in [PartialEnsemblePolicy::FailFast, PartialEnsemblePolicy::BestEffort] {
        let result = engine(AggregationMethod::LinearPool, policy).aggregate(&failed);
        assert!(matches!(result, Err(EnsembleError::AggregationInputError(_))));
    }
}

#[test]
fn best_effort_uses_only_the_valid_members() {
    let partial = Ensemble::new(
        3,
        vec![
            quantile_member(0, vec![0.0, 1.0, 2.0, 3.0, 4.0]),
            quantile_member(2, vec![2.0, 3.0, 4.0, 5.0, 6.0]),
        ],
        vec![ensemble_forecast::core::MemberFailure {
            index: 1,
            error: EnsembleError::TrainingDivergence { member: 1, epoch: 7 },
        }],
    );
    let agg = engine(
        AggregationMethod::Vincentization(VincentizationVariant::Vi),
        PartialEnsemblePolicy::BestEffort,
    )
    .aggregate(&partial)
    .unwrap();
    assert_eq!(
        agg.forecast().values().unwrap(),
        &[1.0, 2.0, 3.0, 4.0, 5.0]
    );
}

#[test]
fn vi_aw_fits_weights_and_intercept_jointly() {
    // Member 0 tracks the truth with a constant -2 bias; member 1 is noise
    // far off target. vi-aw should upweight member 0 and absorb the bias.
    let mut ensembles = Vec::new();
    let mut observations = Vec::new();
    for i in 0..40 {
        let y = (i as f64 * 0.37).sin() * 4.0;
        let close: Vec<f64> = grid()
            .as_slice()
            .iter()
            .map(|&p| y - 2.0 + 0.5 * (p - 0.5))
            .collect();
        let far: Vec<f64> = grid()
            .as_slice()
            .iter()
            .map(|&p| 25.0 + (p - 0.5))
            .collect();
        ensembles.push(ensemble_of(vec![close, far]));
        observations.push(y);
    }
    let mut engine = engine(
        AggregationMethod::Vincentization(VincentizationVariant::ViAw),
        PartialEnsemblePolicy::FailFast,
    );
    engine.fit_weights(&ensembles, &observations).unwrap();

    let mut total_err = 0.0;
    for (ensemble, &y) in ensembles.iter().zip(observations.iter()) {
        let agg = engine.aggregate(ensemble).unwrap();
        total_err += (agg.forecast().values().unwrap()[2] - y).abs();
    }
    let mean_err = total_err / ensembles.len() as f64;
    assert!(
        mean_err < 1.0,
        "fitted vi-aw median should track the observations, mean error {mean_err}"
    );
}

#[test]
fn parametric_and_quantile_members_mix_in_one_ensemble() {
    let members = vec![
        EnsembleMember::new(
            0,
            MemberProvenance::RandomInit { init_seed: 0 },
            DistributionForecast::parametric(1.0, 1.0, Truncation::None).unwrap(),
        ),
        quantile_member(1, vec![-1.0, 0.0, 1.0, 2.0, 3.0]),
    ];
    let ensemble = Ensemble::new(2, members, vec![]);
    for method in [
        AggregationMethod::LinearPool,
        AggregationMethod::Vincentization(VincentizationVariant::Vi),
    ] {
        let agg = engine(method, PartialEnsemblePolicy::FailFast)
            .aggregate(&ensemble)
            .unwrap();
        let values = agg.forecast().values().unwrap();
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert!(values.iter().all(|v| v.is_finite()));
    }
}
