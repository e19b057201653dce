use super::*;
use icalib::problem::ErrorTerm;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;

/// Random batches over a shared calibration vector, each with its own nuisance variable, and occasionally observing
/// only a subset of the calibration parameters.
#[rstest]
#[case(1)]
#[case(3)]
fn random_stream_keeps_the_bookkeeping_consistent(#[case] num_threads: usize) {
    let _ = pretty_env_logger::try_init();

    let mut rng = Pcg64::seed_from_u64(7);
    let theta = theta();
    let truth = [0.1, -0.7, 1.3];
    let mut estimator = estimator_with(
        EstimatorOptions::builder().check_validity(true).build(),
        OptimizerOptions::builder().num_threads(num_threads).build(),
    );

    let mut kept = 0;
    let mut last_rank = 0;
    for i in 0..25 {
        let nuisance = psi(&format!("psi{i}"));
        let observed = rng.gen_range(1..=3);
        let mut terms: Vec<Arc<dyn ErrorTerm>> = Vec::new();
        for _ in 0..4 {
            let mut a = [0.0; 3];
            for coeff in a.iter_mut().take(observed) {
                *coeff = rng.gen_range(-2.0..2.0);
            }
            let offset = rng.gen_range(-1.0..1.0);
            let noise = rng.gen_range(-1e-3..1e-3);
            let b = a.iter().zip(truth).map(|(a, t)| a * t).sum::<f64>() + offset + noise;
            terms.push(observe_pair((&nuisance, &[1.0]), (&theta, &a), &[b]));
        }
        terms.push(observe(&nuisance, &[1.0], &[0.0]));
        let batch = batch_of(terms);

        let before = theta.value();
        let sol = estimator.add_batch(batch.clone(), false).unwrap();
        if sol.batch_accepted {
            kept += 1;
            assert!(sol.is_informative_batch);
            assert!(sol.marginalization.calibration_rank >= last_rank);
            last_rank = sol.marginalization.calibration_rank;
        } else {
            assert!(!estimator.problem().contains(&batch));
            assert_eq!(theta.value(), before);
            assert_eq!(nuisance.value()[0], 0.0);
        }

        assert_eq!(estimator.num_batches(), kept);
        if kept == 0 {
            continue;
        }
        assert_eq!(estimator.problem().groups_ordering().last(), Some(&THETA));
        assert_eq!(
            estimator.jacobian_transpose().nrows(),
            estimator.problem().num_design_variables() + 2
        );
        assert_eq!(
            estimator.calibration_rank() + estimator.calibration_rank_deficiency(),
            3
        );
    }

    assert!(kept >= 1);
    assert_eq!(estimator.calibration_rank(), last_rank);
}
