/*
    incremental-calibration, observability-aware batch selection for calibration
    Copyright (C) 2026-onwards The incremental-calibration developers

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use crate::io::ConfigError;
use crate::linalg::{DMatrix, DVector};
use crate::problem::{Batch, GroupId, IncrementalProblem, ProblemError};
use crate::solver::{
    LinearSolverOptions, Marginalization, Marginalizer, NonlinearSolver, Optimizer,
    OptimizerOptions, SolveSummary, SolverError, TruncatedSvdMarginalizer,
};
use log::Level;
use snafu::prelude::*;
use std::sync::Arc;
use std::time::Instant;

mod conf;
mod solution;
mod state;
mod trial;

pub use conf::{EstimatorConfig, EstimatorOptions};
pub use solution::BatchSolution;
pub use state::SpectralState;
pub use trial::{BatchTrial, Commit};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EstimatorError {
    #[snafu(display("marginalized group {group} does not appear in the problem"))]
    MarginalizedGroupMissing { group: GroupId },
    #[snafu(display("batch trial was already {previous:?}"))]
    TrialConsumed { previous: Commit },
    #[snafu(display("cannot restore the design variables: no snapshot was taken for this trial"))]
    MissingSnapshot,
    #[snafu(display("incremental problem: {source}"))]
    Problem { source: ProblemError },
    #[snafu(display("solver: {source}"))]
    Solver { source: SolverError },
}

impl EstimatorError {
    /// Whether this error stems from a misuse of the estimator rather than from the problem or the solver.
    pub fn is_invalid_operation(&self) -> bool {
        matches!(
            self,
            Self::MarginalizedGroupMissing { .. } | Self::TrialConsumed { .. }
        )
    }
}

/// Incremental estimator of calibration parameters.
///
/// Batches of error terms are proposed one at a time with `try_batch`. Each trial solves the whole problem including
/// the new batch, then analyzes the marginal information of the calibration parameters (the design variables of the
/// marginalized group) once all the other variables are marginalized out. The trial is then accepted, which makes its
/// spectrum the new reference, or rejected, which removes the batch and optionally restores the design variables.
///
/// A batch is informative if the solution is valid and either the mutual information gain exceeds
/// `EstimatorOptions::info_gain_delta` or the rank of the calibration parameters increases.
#[derive(Debug)]
pub struct IncrementalEstimator<S: NonlinearSolver = Optimizer, M: Marginalizer = TruncatedSvdMarginalizer> {
    marg_group_id: GroupId,
    options: EstimatorOptions,
    problem: IncrementalProblem,
    solver: S,
    marginalizer: M,
    accepted: SpectralState,
    has_baseline: bool,
    information_gain: f64,
    initial_cost: f64,
    final_cost: f64,
    memory_usage: usize,
    peak_memory_usage: usize,
    num_flops: f64,
}

impl IncrementalEstimator {
    /// Builds an estimator with the dense QR optimizer and the truncated SVD marginalizer.
    pub fn new(
        marg_group_id: GroupId,
        options: EstimatorOptions,
        linear_solver_options: LinearSolverOptions,
        optimizer_options: OptimizerOptions,
    ) -> Self {
        Self::with_solver(
            marg_group_id,
            options,
            Optimizer::new(optimizer_options, linear_solver_options),
            TruncatedSvdMarginalizer::default(),
        )
    }

    /// Builds an estimator from a validated configuration.
    pub fn from_config(cfg: EstimatorConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self::with_solver(
            cfg.marginalized_group,
            cfg.estimator,
            Optimizer::new(cfg.optimizer, cfg.linear_solver),
            TruncatedSvdMarginalizer::new(cfg.marginalization),
        ))
    }
}

impl<S: NonlinearSolver, M: Marginalizer> IncrementalEstimator<S, M> {
    /// Builds an estimator around the provided solver and marginalizer.
    pub fn with_solver(
        marg_group_id: GroupId,
        options: EstimatorOptions,
        solver: S,
        marginalizer: M,
    ) -> Self {
        Self {
            marg_group_id,
            options,
            problem: IncrementalProblem::new(),
            solver,
            marginalizer,
            accepted: SpectralState::default(),
            has_baseline: false,
            information_gain: 0.0,
            initial_cost: 0.0,
            final_cost: 0.0,
            memory_usage: 0,
            peak_memory_usage: 0,
            num_flops: 0.0,
        }
    }

    /// Inserts the batch and solves the problem, without committing to keeping the batch.
    ///
    /// The returned trial must be accepted or rejected. If `snapshot_first` is set, the values of the design variables
    /// are saved before solving so that `reject(true)` can restore them. The accepted state is untouched until the trial
    /// is accepted. On error, the batch is removed again and the design variables restored if a snapshot was taken.
    pub fn try_batch(
        &mut self,
        batch: Arc<Batch>,
        snapshot_first: bool,
    ) -> Result<BatchTrial<'_, S, M>, EstimatorError> {
        let start = Instant::now();
        self.problem.add(batch.clone()).context(ProblemSnafu)?;

        if let Err(e) = self.order_marginalized_design_variables() {
            self.problem.remove_batch(&batch);
            return Err(e);
        }

        if snapshot_first {
            self.problem.save_design_variables();
        } else {
            self.problem.clear_snapshot();
        }

        let (summary, marginalization) = match self.solve_and_marginalize() {
            Ok(result) => result,
            Err(e) => {
                warn!("batch trial failed, rolling it back: {e}");
                if let Err(rollback) = self.discard(&batch, snapshot_first) {
                    warn!("rollback of the failed trial is incomplete: {rollback}");
                }
                return Err(e);
            }
        };

        let solution_valid = self.is_valid(&summary, true);
        let (information_gain, rank_increased) = if self.has_baseline {
            let baseline = self.accepted.calibration_rank();
            if marginalization.calibration_rank < baseline {
                warn!(
                    "calibration rank decreases from {baseline} to {}",
                    marginalization.calibration_rank
                );
            }
            (
                0.5 * (marginalization.sv_log2_sum - self.accepted.sv_log2_sum()),
                marginalization.calibration_rank > baseline,
            )
        } else {
            (0.0, true)
        };
        let is_informative_batch = solution_valid
            && (information_gain > self.options.info_gain_delta || rank_increased);

        let solution = self.solution(
            &summary,
            marginalization,
            solution_valid,
            is_informative_batch,
            information_gain,
            start,
        );
        log!(
            self.log_level(),
            "trial of {batch} with {} batches in the problem: {solution}",
            self.problem.num_batches()
        );

        Ok(BatchTrial::new(self, batch, solution, snapshot_first))
    }

    /// Tries the batch and keeps it if it is informative or if `force` is set, otherwise rejects it and restores the
    /// design variables.
    pub fn add_batch(
        &mut self,
        batch: Arc<Batch>,
        force: bool,
    ) -> Result<BatchSolution, EstimatorError> {
        let mut trial = self.try_batch(batch, !force)?;
        if force || trial.solution().is_informative_batch {
            trial.accept()?;
        } else {
            trial.reject(true)?;
        }
        Ok(trial.into_solution())
    }

    /// Removes the batch at the provided index, solves the remaining problem and makes its spectrum the new reference.
    ///
    /// The reported information gain is the raw difference of the log2 sums, i.e. without the one half factor of
    /// `try_batch`.
    pub fn remove_batch(&mut self, idx: usize) -> Result<BatchSolution, EstimatorError> {
        let start = Instant::now();
        let batch = self.problem.remove(idx).context(ProblemSnafu)?;
        let previous = self.accepted.sv_log2_sum();

        if self.problem.is_empty() {
            self.solver.restore(&self.problem).context(SolverSnafu)?;
            self.accepted = SpectralState::default();
            self.has_baseline = false;
            self.information_gain = -previous;
            self.initial_cost = 0.0;
            self.final_cost = 0.0;
            self.record_resources();
            log!(self.log_level(), "removed {batch}, the problem is now empty");
            let summary = SolveSummary {
                converged: true,
                ..Default::default()
            };
            return Ok(self.solution(
                &summary,
                Marginalization::default(),
                true,
                false,
                self.information_gain,
                start,
            ));
        }

        if let Err(e) = self.order_marginalized_design_variables() {
            warn!("removing {batch} left no calibration parameters in the problem");
            self.solver.restore(&self.problem).context(SolverSnafu)?;
            self.accepted = SpectralState::default();
            self.has_baseline = false;
            return Err(e);
        }

        let (summary, marginalization) = self.solve_and_marginalize()?;
        let information_gain = marginalization.sv_log2_sum - previous;
        let solution_valid = self.is_valid(&summary, false);
        self.store_accepted(&marginalization, &summary, information_gain);
        let solution = self.solution(
            &summary,
            marginalization,
            solution_valid,
            false,
            information_gain,
            start,
        );
        log!(self.log_level(), "removed {batch}: {solution}");
        Ok(solution)
    }

    /// Removes the provided batch if it is part of the problem.
    pub fn remove_batch_by(
        &mut self,
        batch: &Arc<Batch>,
    ) -> Result<Option<BatchSolution>, EstimatorError> {
        match self.problem.position(batch) {
            Some(idx) => self.remove_batch(idx).map(Some),
            None => Ok(None),
        }
    }

    /// Solves the problem again with the current batches, and makes its spectrum the new reference.
    pub fn reoptimize(&mut self) -> Result<BatchSolution, EstimatorError> {
        let start = Instant::now();
        self.order_marginalized_design_variables()?;
        let (summary, marginalization) = self.solve_and_marginalize()?;
        let solution_valid = self.is_valid(&summary, false);
        self.store_accepted(&marginalization, &summary, 0.0);
        let solution = self.solution(&summary, marginalization, solution_valid, false, 0.0, start);
        log!(self.log_level(), "re-optimization: {solution}");
        Ok(solution)
    }

    /// Moves the marginalized group to the last position of the groups ordering, so that its columns trail the
    /// Jacobian.
    pub fn order_marginalized_design_variables(&mut self) -> Result<(), EstimatorError> {
        let mut ordering = self.problem.groups_ordering().to_vec();
        match move_to_back(&mut ordering, self.marg_group_id) {
            None => MarginalizedGroupMissingSnafu {
                group: self.marg_group_id,
            }
            .fail(),
            Some(true) => {
                trace!("groups ordering is now {ordering:?}");
                self.problem
                    .set_groups_ordering(ordering)
                    .context(ProblemSnafu)
            }
            Some(false) => Ok(()),
        }
    }

    /// Applies an accepted trial.
    pub(crate) fn commit_accept(&mut self, solution: &mut BatchSolution) {
        self.accepted = SpectralState {
            marginalization: solution.marginalization.clone(),
            qr_tolerance: solution.qr_tolerance,
            rank: solution.rank,
            rank_deficiency: solution.rank_deficiency,
        };
        self.has_baseline = true;
        self.information_gain = solution.information_gain;
        self.initial_cost = solution.cost_start;
        self.final_cost = solution.cost_final;
        self.memory_usage = solution.memory_usage;
        self.peak_memory_usage = solution.peak_memory_usage;
        self.num_flops = solution.num_flops;
        solution.batch_accepted = true;
        log!(
            self.log_level(),
            "batch accepted, {} batches in the problem",
            self.problem.num_batches()
        );
    }

    /// Removes a batch, optionally restores the design variables, and rebuilds the solver structure.
    pub(crate) fn discard(&mut self, batch: &Arc<Batch>, restore: bool) -> Result<(), EstimatorError> {
        self.problem.remove_batch(batch);
        if restore {
            self.problem
                .restore_design_variables()
                .context(ProblemSnafu)?;
        }
        self.solver.restore(&self.problem).context(SolverSnafu)?;
        log!(
            self.log_level(),
            "batch rejected{}, {} batches in the problem",
            if restore { " and design variables restored" } else { "" },
            self.problem.num_batches()
        );
        Ok(())
    }

    fn solve_and_marginalize(&mut self) -> Result<(SolveSummary, Marginalization), EstimatorError> {
        let summary = self.solver.optimize(&self.problem).context(SolverSnafu)?;
        let dim = self.problem.group_dim(self.marg_group_id);
        let jt = self.solver.jacobian_transpose();
        let marginalization = self
            .marginalizer
            .marginalize(jt, jt.nrows().saturating_sub(dim))
            .context(SolverSnafu)?;
        Ok((summary, marginalization))
    }

    /// A strict check requires the cost to decrease, otherwise it must not increase.
    fn is_valid(&self, summary: &SolveSummary, strict: bool) -> bool {
        let mut valid = if strict {
            summary.cost_final < summary.cost_start
        } else {
            summary.cost_final <= summary.cost_start
        };
        if !self.options.max_iteration_hit_is_still_valid
            && !summary.converged
            && summary.iterations >= self.solver.max_iterations()
        {
            valid = false;
        }
        if self.options.check_validity
            && (!summary.cost_final.is_finite()
                || self.solver.jacobian_transpose().iter().any(|x| !x.is_finite()))
        {
            valid = false;
        }
        valid
    }

    fn store_accepted(
        &mut self,
        marginalization: &Marginalization,
        summary: &SolveSummary,
        information_gain: f64,
    ) {
        self.accepted = SpectralState {
            marginalization: marginalization.clone(),
            qr_tolerance: self.solver.tolerance(),
            rank: self.solver.rank(),
            rank_deficiency: self.solver.rank_deficiency(),
        };
        self.has_baseline = true;
        self.information_gain = information_gain;
        self.initial_cost = summary.cost_start;
        self.final_cost = summary.cost_final;
        self.record_resources();
    }

    fn record_resources(&mut self) {
        self.memory_usage = self.solver.memory_usage();
        self.peak_memory_usage = self.solver.peak_memory_usage();
        self.num_flops = self.solver.num_flops();
    }

    fn solution(
        &self,
        summary: &SolveSummary,
        marginalization: Marginalization,
        solution_valid: bool,
        is_informative_batch: bool,
        information_gain: f64,
        start: Instant,
    ) -> BatchSolution {
        BatchSolution {
            batch_accepted: false,
            solution_valid,
            is_informative_batch,
            information_gain,
            marginalization,
            qr_tolerance: self.solver.tolerance(),
            rank: self.solver.rank(),
            rank_deficiency: self.solver.rank_deficiency(),
            num_iterations: summary.iterations,
            cost_start: summary.cost_start,
            cost_final: summary.cost_final,
            elapsed_time: start.elapsed(),
            peak_memory_usage: self.solver.peak_memory_usage(),
            memory_usage: self.solver.memory_usage(),
            num_flops: self.solver.num_flops(),
        }
    }

    fn log_level(&self) -> Level {
        if self.options.verbose {
            Level::Info
        } else {
            Level::Debug
        }
    }

    pub fn num_batches(&self) -> usize {
        self.problem.num_batches()
    }

    pub fn problem(&self) -> &IncrementalProblem {
        &self.problem
    }

    pub fn options(&self) -> &EstimatorOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut EstimatorOptions {
        &mut self.options
    }

    pub fn solver(&self) -> &S {
        &self.solver
    }

    /// Gives access to the solver, e.g. to change its options before the next trial.
    pub fn solver_mut(&mut self) -> &mut S {
        &mut self.solver
    }

    pub fn marginalizer(&self) -> &M {
        &self.marginalizer
    }

    pub fn marg_group_id(&self) -> GroupId {
        self.marg_group_id
    }

    /// Spectral state of the last accepted batch (or of the last removal or re-optimization).
    pub fn accepted_state(&self) -> &SpectralState {
        &self.accepted
    }

    /// Whether an accepted spectrum exists to compare new batches against.
    pub fn has_baseline(&self) -> bool {
        self.has_baseline
    }

    pub fn information_gain(&self) -> f64 {
        self.information_gain
    }

    pub fn sv_log2_sum(&self) -> f64 {
        self.accepted.sv_log2_sum()
    }

    /// Jacobian transpose of the last solve, which matches the current design variable values.
    pub fn jacobian_transpose(&self) -> &DMatrix<f64> {
        self.solver.jacobian_transpose()
    }

    /// Numerical rank of the full Jacobian of the accepted state.
    pub fn rank(&self) -> usize {
        self.accepted.rank
    }

    pub fn rank_deficiency(&self) -> usize {
        self.accepted.rank_deficiency
    }

    pub fn qr_tolerance(&self) -> f64 {
        self.accepted.qr_tolerance
    }

    pub fn svd_tolerance(&self) -> f64 {
        self.accepted.marginalization.svd_tolerance
    }

    pub fn measurement_rank(&self) -> usize {
        self.accepted.marginalization.measurement_rank
    }

    pub fn measurement_rank_deficiency(&self) -> usize {
        self.accepted.marginalization.measurement_rank_deficiency
    }

    pub fn calibration_rank(&self) -> usize {
        self.accepted.marginalization.calibration_rank
    }

    pub fn calibration_rank_deficiency(&self) -> usize {
        self.accepted.marginalization.calibration_rank_deficiency
    }

    pub fn observable_basis(&self, scaled: bool) -> &DMatrix<f64> {
        let marg = &self.accepted.marginalization;
        if scaled {
            &marg.observable_basis_scaled
        } else {
            &marg.observable_basis
        }
    }

    pub fn unobservable_basis(&self, scaled: bool) -> &DMatrix<f64> {
        let marg = &self.accepted.marginalization;
        if scaled {
            &marg.unobservable_basis_scaled
        } else {
            &marg.unobservable_basis
        }
    }

    pub fn calibration_covariance(&self, scaled: bool) -> &DMatrix<f64> {
        let marg = &self.accepted.marginalization;
        if scaled {
            &marg.calibration_covariance_scaled
        } else {
            &marg.calibration_covariance
        }
    }

    pub fn observable_covariance(&self, scaled: bool) -> &DMatrix<f64> {
        let marg = &self.accepted.marginalization;
        if scaled {
            &marg.observable_covariance_scaled
        } else {
            &marg.observable_covariance
        }
    }

    pub fn singular_values(&self, scaled: bool) -> &DVector<f64> {
        let marg = &self.accepted.marginalization;
        if scaled {
            &marg.singular_values_scaled
        } else {
            &marg.singular_values
        }
    }

    /// Linear solver memory as of the last commit, in bytes.
    pub fn memory_usage(&self) -> usize {
        self.memory_usage
    }

    pub fn peak_memory_usage(&self) -> usize {
        self.peak_memory_usage
    }

    pub fn num_flops(&self) -> f64 {
        self.num_flops
    }

    /// Cost before the last committed solve.
    pub fn initial_cost(&self) -> f64 {
        self.initial_cost
    }

    /// Cost after the last committed solve.
    pub fn final_cost(&self) -> f64 {
        self.final_cost
    }
}

/// Swaps `group` with the last entry. Returns whether the ordering changed, or `None` if the group is absent.
fn move_to_back(ordering: &mut [GroupId], group: GroupId) -> Option<bool> {
    let pos = ordering.iter().position(|g| *g == group)?;
    let last = ordering.len() - 1;
    if pos == last {
        Some(false)
    } else {
        ordering.swap(pos, last);
        Some(true)
    }
}
