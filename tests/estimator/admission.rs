use super::*;
use approx::assert_relative_eq;
use icalib::linalg::{DMatrix, DVector};
use icalib::problem::{ErrorTerm, ProblemError};
use icalib::solver::NonlinearSolver;

/// Unit residual on theta whose Jacobian is not a number.
#[derive(Debug)]
struct UndefinedJacobian {
    dv: [Arc<DesignVariable>; 1],
}

impl ErrorTerm for UndefinedJacobian {
    fn dimension(&self) -> usize {
        1
    }

    fn design_variables(&self) -> &[Arc<DesignVariable>] {
        &self.dv
    }

    fn evaluate(&self) -> DVector<f64> {
        DVector::from_element(1, 1.0)
    }

    fn jacobians(&self) -> Vec<DMatrix<f64>> {
        vec![DMatrix::from_element(1, 3, f64::NAN)]
    }
}

#[rstest]
fn first_batch_sets_the_baseline(scenario: Scenario, mut estimator: IncrementalEstimator) {
    assert!(!estimator.has_baseline());
    let sol = estimator.add_batch(scenario.b1.clone(), false).unwrap();

    assert!(sol.batch_accepted);
    assert!(sol.solution_valid);
    assert!(sol.is_informative_batch);
    assert_eq!(sol.information_gain, 0.0);
    assert_eq!(sol.marginalization.calibration_rank, 2);
    assert_eq!(sol.marginalization.calibration_rank_deficiency, 1);
    assert_eq!(sol.marginalization.measurement_rank, 1);
    assert_eq!(sol.rank, 3);
    assert_relative_eq!(sol.cost_start, 30.0);
    assert!(sol.cost_final < 1e-20);
    assert!(sol.num_iterations < 20);

    assert_eq!(estimator.num_batches(), 1);
    assert!(estimator.has_baseline());
    assert_eq!(estimator.problem().groups_ordering(), &[PSI, THETA]);
    assert_eq!(estimator.calibration_rank(), 2);
    assert_relative_eq!(estimator.sv_log2_sum(), 0.0, epsilon = 1e-12);
    assert_eq!(estimator.observable_basis(false).shape(), (3, 2));
    assert_eq!(estimator.unobservable_basis(true).shape(), (3, 1));
    assert_eq!(estimator.singular_values(false).len(), 3);
    assert_relative_eq!(estimator.initial_cost(), 30.0);
    assert!(estimator.peak_memory_usage() > 0);
    assert_relative_eq!(scenario.theta.value()[0], 1.0, epsilon = 1e-12);
    assert_relative_eq!(scenario.theta.value()[1], 2.0, epsilon = 1e-12);
    assert_relative_eq!(scenario.psi1.value()[0], 5.0, epsilon = 1e-12);
}

#[rstest]
fn uninformative_batch_is_rolled_back(scenario: Scenario, mut estimator: IncrementalEstimator) {
    estimator.add_batch(scenario.b1.clone(), false).unwrap();
    let theta_before = scenario.theta.value();
    let jt_before = estimator.jacobian_transpose().clone();

    let sol = estimator.add_batch(scenario.b2.clone(), false).unwrap();
    assert!(sol.solution_valid);
    assert!(!sol.is_informative_batch);
    assert!(!sol.batch_accepted);
    assert_relative_eq!(sol.information_gain, 0.0, epsilon = 1e-9);
    assert_eq!(sol.marginalization.calibration_rank, 2);

    assert_eq!(estimator.num_batches(), 1);
    assert!(!estimator.problem().contains(&scenario.b2));
    // The trial solved psi2 to 5, the rollback restored it
    assert_eq!(scenario.psi2.value()[0], 0.0);
    assert_eq!(scenario.theta.value(), theta_before);
    assert_eq!(estimator.jacobian_transpose(), &jt_before);
}

#[rstest]
fn rank_increase_beats_a_negative_gain(scenario: Scenario, mut estimator: IncrementalEstimator) {
    estimator.add_batch(scenario.b1.clone(), false).unwrap();
    let sol = estimator.add_batch(scenario.b3.clone(), false).unwrap();

    assert_relative_eq!(sol.information_gain, -0.5, epsilon = 1e-9);
    assert_eq!(sol.marginalization.calibration_rank, 3);
    assert!(sol.is_informative_batch);
    assert!(sol.batch_accepted);
    assert_eq!(estimator.num_batches(), 2);
    assert_relative_eq!(estimator.information_gain(), -0.5, epsilon = 1e-9);
    assert_relative_eq!(scenario.theta.value()[2], 3.0, epsilon = 1e-12);
}

#[rstest]
fn gain_above_threshold_is_informative(scenario: Scenario, mut estimator: IncrementalEstimator) {
    estimator.add_batch(scenario.b1.clone(), false).unwrap();
    let again = batch_of(vec![observe(&scenario.theta, &[2.0, 0.0, 0.0], &[2.2])]);
    let sol = estimator.add_batch(again, false).unwrap();

    assert!(sol.solution_valid);
    assert_eq!(sol.marginalization.calibration_rank, 2);
    assert_relative_eq!(sol.information_gain, 0.25 * 5.0_f64.log2(), epsilon = 1e-9);
    assert!(sol.information_gain > estimator.options().info_gain_delta);
    assert!(sol.batch_accepted);
    assert_relative_eq!(scenario.theta.value()[0], 1.08, epsilon = 1e-12);

    // A similar gain falls short of a higher threshold
    estimator.options_mut().info_gain_delta = 1.0;
    let more = batch_of(vec![observe(&scenario.theta, &[2.0, 0.0, 0.0], &[2.3])]);
    let sol = estimator.add_batch(more, false).unwrap();
    assert!(sol.solution_valid);
    assert_relative_eq!(
        sol.information_gain,
        0.5 * (3.0_f64.log2() - 0.5 * 5.0_f64.log2()),
        epsilon = 1e-9
    );
    assert!(!sol.batch_accepted);
    assert_eq!(estimator.num_batches(), 2);
}

#[rstest]
fn no_improvement_is_invalid(scenario: Scenario, mut estimator: IncrementalEstimator) {
    estimator.add_batch(scenario.b1.clone(), false).unwrap();
    // Already satisfied by the current estimate
    let redundant = batch_of(vec![observe(&scenario.theta, &[0.0, 0.0, 1.0], &[0.0])]);
    let sol = estimator.add_batch(redundant, false).unwrap();
    assert!(!sol.solution_valid);
    assert!(!sol.is_informative_batch);
    assert!(!sol.batch_accepted);
    assert_eq!(estimator.num_batches(), 1);
}

#[rstest]
#[case(false, false)]
#[case(true, true)]
fn iteration_cap(scenario: Scenario, #[case] still_valid: bool, #[case] accepted: bool) {
    let mut estimator = estimator_with(
        EstimatorOptions::builder()
            .max_iteration_hit_is_still_valid(still_valid)
            .check_validity(true)
            .build(),
        OptimizerOptions::builder().max_iterations(1).build(),
    );
    let sol = estimator.add_batch(scenario.b1.clone(), false).unwrap();
    assert_eq!(sol.num_iterations, 1);
    assert_eq!(sol.solution_valid, still_valid);
    assert_eq!(sol.batch_accepted, accepted);
    assert_eq!(estimator.num_batches(), usize::from(accepted));
    if !accepted {
        assert_eq!(scenario.theta.value().as_slice(), &[0.0, 0.0, 0.0]);
        assert!(!estimator.has_baseline());
    }
}

#[rstest]
fn convergence_on_the_last_iteration_is_valid(scenario: Scenario) {
    let mut estimator = estimator_with(
        EstimatorOptions::default(),
        OptimizerOptions::builder().max_iterations(2).build(),
    );
    let sol = estimator.add_batch(scenario.b1.clone(), false).unwrap();
    assert_eq!(sol.num_iterations, 2);
    assert!(sol.cost_final < 1e-20);
    assert!(sol.solution_valid);
    assert!(sol.batch_accepted);
    assert_eq!(estimator.num_batches(), 1);
}

#[rstest]
fn non_finite_jacobian_is_an_invalid_solution(scenario: Scenario) {
    let mut estimator = estimator_with(
        EstimatorOptions::builder().check_validity(true).build(),
        OptimizerOptions::default(),
    );
    estimator.add_batch(scenario.b1.clone(), false).unwrap();
    let theta_before = scenario.theta.value();

    let undefined: Arc<dyn ErrorTerm> = Arc::new(UndefinedJacobian {
        dv: [scenario.theta.clone()],
    });
    let sol = estimator.add_batch(batch_of(vec![undefined]), false).unwrap();
    assert!(!sol.solution_valid);
    assert!(!sol.is_informative_batch);
    assert!(!sol.batch_accepted);
    assert_eq!(sol.marginalization.calibration_rank, 0);
    assert_eq!(sol.marginalization.calibration_rank_deficiency, 3);

    assert_eq!(estimator.num_batches(), 1);
    assert_eq!(scenario.theta.value(), theta_before);
    assert!(estimator.jacobian_transpose().iter().all(|x| x.is_finite()));
    assert_eq!(estimator.calibration_rank(), 2);
}

#[rstest]
#[case(true, 0.0)]
#[case(false, 5.0)]
fn dropped_trial_is_rejected(
    scenario: Scenario,
    mut estimator: IncrementalEstimator,
    #[case] snapshot: bool,
    #[case] psi2: f64,
) {
    estimator.add_batch(scenario.b1.clone(), false).unwrap();
    let accepted = estimator.accepted_state().clone();
    {
        let trial = estimator.try_batch(scenario.b2.clone(), snapshot).unwrap();
        assert!(trial.is_pending());
        assert_eq!(trial.estimator().num_batches(), 2);
    }
    assert_eq!(estimator.num_batches(), 1);
    assert!(!estimator.problem().contains(&scenario.b2));
    assert_eq!(estimator.accepted_state(), &accepted);
    assert_relative_eq!(scenario.psi2.value()[0], psi2, epsilon = 1e-12);

    // The same batch can be tried again
    let sol = estimator.add_batch(scenario.b2.clone(), true).unwrap();
    assert!(sol.batch_accepted);
    assert_eq!(estimator.num_batches(), 2);
}

#[rstest]
fn forced_batch_is_kept(scenario: Scenario, mut estimator: IncrementalEstimator) {
    estimator.add_batch(scenario.b1.clone(), false).unwrap();
    let sol = estimator.add_batch(scenario.b2.clone(), true).unwrap();
    assert!(!sol.is_informative_batch);
    assert!(sol.batch_accepted);
    assert_eq!(estimator.num_batches(), 2);
    assert_relative_eq!(scenario.psi2.value()[0], 5.0, epsilon = 1e-12);
}

#[rstest]
fn trial_is_settled_once(scenario: Scenario, mut estimator: IncrementalEstimator) {
    let mut trial = estimator.try_batch(scenario.b1.clone(), true).unwrap();
    assert!(trial.is_pending());
    assert!(trial.snapshot_taken());
    assert_eq!(trial.estimator().num_batches(), 1);
    assert!(!trial.estimator().has_baseline());

    assert!(trial.accept().unwrap().batch_accepted);
    assert_eq!(trial.commit(), Some(Commit::Accepted));
    let err = trial.accept().unwrap_err();
    assert!(err.is_invalid_operation());
    assert!(matches!(
        err,
        EstimatorError::TrialConsumed {
            previous: Commit::Accepted
        }
    ));
    assert!(trial.reject(false).unwrap_err().is_invalid_operation());
    assert!(trial.into_solution().batch_accepted);
    assert_eq!(estimator.num_batches(), 1);
}

#[rstest]
fn restoring_requires_a_snapshot(scenario: Scenario, mut estimator: IncrementalEstimator) {
    estimator.add_batch(scenario.b1.clone(), false).unwrap();

    let mut trial = estimator.try_batch(scenario.b2.clone(), false).unwrap();
    let err = trial.reject(true).unwrap_err();
    assert!(matches!(err, EstimatorError::MissingSnapshot));
    assert!(!err.is_invalid_operation());
    assert!(trial.is_pending());

    let sol = trial.reject(false).unwrap();
    assert!(!sol.batch_accepted);
    drop(trial);
    assert_eq!(estimator.num_batches(), 1);
    // Not restored: psi2 keeps the value of the trial
    assert_relative_eq!(scenario.psi2.value()[0], 5.0, epsilon = 1e-12);
}

#[rstest]
fn trial_does_not_touch_the_accepted_state(scenario: Scenario, mut estimator: IncrementalEstimator) {
    estimator.add_batch(scenario.b1.clone(), false).unwrap();
    let accepted = estimator.accepted_state().clone();

    assert_eq!(estimator.rank(), 3);
    assert_eq!(estimator.rank_deficiency(), 1);

    let mut trial = estimator.try_batch(scenario.b3.clone(), true).unwrap();
    assert_eq!(trial.solution().marginalization.calibration_rank, 3);
    assert_eq!(trial.solution().rank, 4);
    assert_eq!(trial.solution().rank_deficiency, 0);
    assert_eq!(trial.estimator().solver().rank(), 4);
    // The accessors keep reporting the accepted state
    assert_eq!(trial.estimator().rank(), 3);
    assert_eq!(trial.estimator().rank_deficiency(), 1);
    assert_eq!(trial.estimator().accepted_state(), &accepted);
    trial.reject(true).unwrap();
    drop(trial);

    assert_eq!(estimator.accepted_state(), &accepted);
    assert_eq!(scenario.theta.value()[2], 0.0);
}

#[rstest]
fn missing_marginalized_group(scenario: Scenario, mut estimator: IncrementalEstimator) {
    let nuisance_only = batch_of(vec![observe(&scenario.psi1, &[1.0], &[1.0])]);
    let err = estimator.add_batch(nuisance_only.clone(), false).unwrap_err();
    assert!(err.is_invalid_operation());
    assert!(matches!(
        err,
        EstimatorError::MarginalizedGroupMissing { group: THETA }
    ));
    assert_eq!(estimator.num_batches(), 0);
    assert!(estimator.problem().groups_ordering().is_empty());
    assert_eq!(scenario.psi1.value()[0], 0.0);

    // The same batch instance cannot be inserted twice
    estimator.add_batch(scenario.b1.clone(), false).unwrap();
    let err = estimator.add_batch(scenario.b1.clone(), false).unwrap_err();
    assert!(matches!(
        err,
        EstimatorError::Problem {
            source: ProblemError::DuplicateBatch
        }
    ));
    assert_eq!(estimator.num_batches(), 1);
}

#[rstest]
fn reoptimize_keeps_the_batches(scenario: Scenario, mut estimator: IncrementalEstimator) {
    estimator.add_batch(scenario.b1.clone(), false).unwrap();
    estimator.add_batch(scenario.b3.clone(), false).unwrap();

    // Perturb the estimate behind the back of the estimator
    scenario
        .theta
        .set_value(icalib::linalg::DVector::from_column_slice(&[0.0, 0.0, 0.0]))
        .unwrap();
    let sol = estimator.reoptimize().unwrap();
    assert!(!sol.batch_accepted);
    assert_eq!(sol.information_gain, 0.0);
    assert!(sol.solution_valid);
    assert!(sol.cost_start > sol.cost_final);
    assert_eq!(estimator.num_batches(), 2);
    assert_eq!(estimator.calibration_rank(), 3);
    assert_relative_eq!(estimator.final_cost(), sol.cost_final);
    assert_relative_eq!(scenario.theta.value()[2], 3.0, epsilon = 1e-12);
}
