use crate::{batch_of, observe, observe_pair, psi, theta, PSI, THETA};
use icalib::estimator::*;
use icalib::problem::{Batch, DesignVariable};
use icalib::solver::{LinearSolverOptions, OptimizerOptions};
use rstest::*;
use std::sync::Arc;

mod admission;
mod removal;
mod stream;

/// Calibration parameters and the batches of the reference scenario.
pub struct Scenario {
    pub theta: Arc<DesignVariable>,
    pub psi1: Arc<DesignVariable>,
    pub psi2: Arc<DesignVariable>,
    /// Observes theta_0 and theta_1, and a prior on psi1.
    pub b1: Arc<Batch>,
    /// Only informs the new nuisance variable psi2.
    pub b2: Arc<Batch>,
    /// First observation of theta_2, with a small coefficient.
    pub b3: Arc<Batch>,
}

#[fixture]
pub fn scenario() -> Scenario {
    let _ = pretty_env_logger::try_init();

    let theta = theta();
    let psi1 = psi("psi1");
    let psi2 = psi("psi2");
    let b1 = batch_of(vec![
        observe(&theta, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0], &[1.0, 2.0]),
        observe(&psi1, &[1.0], &[5.0]),
    ]);
    let b2 = batch_of(vec![observe_pair(
        (&psi2, &[1.0]),
        (&theta, &[1.0, 0.0, 0.0]),
        &[6.0],
    )]);
    let b3 = batch_of(vec![observe(&theta, &[0.0, 0.0, 0.5], &[1.5])]);
    Scenario {
        theta,
        psi1,
        psi2,
        b1,
        b2,
        b3,
    }
}

pub fn estimator_with(options: EstimatorOptions, optimizer: OptimizerOptions) -> IncrementalEstimator {
    IncrementalEstimator::new(THETA, options, LinearSolverOptions::default(), optimizer)
}

#[fixture]
pub fn estimator() -> IncrementalEstimator {
    estimator_with(
        EstimatorOptions::builder().verbose(true).build(),
        OptimizerOptions::default(),
    )
}
