use super::*;
use approx::assert_relative_eq;

#[rstest]
fn removal_reverts_the_rank(scenario: Scenario, mut estimator: IncrementalEstimator) {
    estimator.add_batch(scenario.b1.clone(), false).unwrap();
    estimator.add_batch(scenario.b3.clone(), false).unwrap();
    assert_eq!(estimator.calibration_rank(), 3);
    assert_relative_eq!(estimator.sv_log2_sum(), -1.0, epsilon = 1e-9);

    let sol = estimator.remove_batch(1).unwrap();
    assert!(!sol.batch_accepted);
    assert!(!sol.is_informative_batch);
    assert!(sol.solution_valid);
    // Raw difference of the log2 sums
    assert_relative_eq!(sol.information_gain, 1.0, epsilon = 1e-9);
    assert_relative_eq!(estimator.information_gain(), 1.0, epsilon = 1e-9);
    assert_eq!(sol.marginalization.calibration_rank, 2);

    assert_eq!(estimator.num_batches(), 1);
    assert_eq!(estimator.calibration_rank(), 2);
    assert_eq!(estimator.calibration_rank_deficiency(), 1);
    assert_relative_eq!(estimator.sv_log2_sum(), 0.0, epsilon = 1e-9);
    assert_eq!(estimator.jacobian_transpose().ncols(), 3);
}

#[rstest]
fn removal_by_identity(scenario: Scenario, mut estimator: IncrementalEstimator) {
    estimator.add_batch(scenario.b1.clone(), false).unwrap();
    estimator.add_batch(scenario.b3.clone(), false).unwrap();

    assert_eq!(estimator.remove_batch_by(&scenario.b2).unwrap(), None);
    assert_eq!(estimator.num_batches(), 2);

    let sol = estimator.remove_batch_by(&scenario.b1).unwrap().unwrap();
    assert_eq!(estimator.num_batches(), 1);
    assert!(estimator.problem().contains(&scenario.b3));
    // Only theta_2 remains observed, psi1 left with its batch
    assert_eq!(sol.marginalization.calibration_rank, 1);
    assert_eq!(sol.marginalization.measurement_rank, 0);
    assert_eq!(estimator.problem().num_design_variables(), 1);
    assert_eq!(estimator.problem().groups_ordering(), &[THETA]);
}

#[rstest]
fn removing_everything_resets_the_baseline(scenario: Scenario, mut estimator: IncrementalEstimator) {
    estimator.add_batch(scenario.b1.clone(), false).unwrap();
    estimator.add_batch(scenario.b3.clone(), false).unwrap();
    estimator.remove_batch(0).unwrap();
    let sol = estimator.remove_batch(0).unwrap();

    assert_eq!(estimator.num_batches(), 0);
    assert!(!estimator.has_baseline());
    assert_eq!(sol.marginalization.calibration_rank, 0);
    assert_relative_eq!(sol.information_gain, 1.0, epsilon = 1e-9);
    assert_eq!(estimator.jacobian_transpose().len(), 0);
    assert!(estimator.remove_batch(0).is_err());
    assert!(matches!(
        estimator.reoptimize(),
        Err(EstimatorError::MarginalizedGroupMissing { .. })
    ));

    // The next batch is a first batch again
    scenario
        .theta
        .set_value(icalib::linalg::DVector::zeros(3))
        .unwrap();
    let sol = estimator.add_batch(scenario.b3.clone(), false).unwrap();
    assert!(sol.batch_accepted);
    assert_eq!(sol.information_gain, 0.0);
}
