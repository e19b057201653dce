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

use super::linear::{LinearSolverOptions, QrLinearSolver};
use super::{SolverError, SolverProblemSnafu};
use crate::linalg::{DMatrix, DVector};
use crate::problem::IncrementalProblem;
use log::Level;
use serde_derive::{Deserialize, Serialize};
use snafu::ResultExt;
use std::fmt;
use typed_builder::TypedBuilder;

/// A bounded nonlinear least-squares solver over an incremental problem.
///
/// After `optimize` or `restore` returns, the factorization exposed by the accessors must match the current values of
/// the design variables of the problem.
pub trait NonlinearSolver {
    /// Minimizes the cost of the problem, starting from the current design variable values.
    fn optimize(&mut self, problem: &IncrementalProblem) -> Result<SolveSummary, SolverError>;

    /// Rebuilds the linear system structure and factorization at the current values, without iterating.
    fn restore(&mut self, problem: &IncrementalProblem) -> Result<(), SolverError>;

    /// Iteration cap of `optimize`.
    fn max_iterations(&self) -> usize;

    fn jacobian_transpose(&self) -> &DMatrix<f64>;

    fn rank(&self) -> usize;

    fn rank_deficiency(&self) -> usize;

    /// QR tolerance of the last factorization.
    fn tolerance(&self) -> f64;

    fn memory_usage(&self) -> usize;

    fn peak_memory_usage(&self) -> usize;

    fn num_flops(&self) -> f64;
}

/// How the optimizer handles a step which increases the cost.
#[derive(Copy, Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub enum TrustRegionPolicy {
    /// Undo the step and stop.
    #[default]
    GaussNewton,
    /// Undo the step, increase the damping and retry.
    LevenbergMarquardt,
}

#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Serialize, TypedBuilder)]
#[builder(doc)]
#[serde(default)]
pub struct OptimizerOptions {
    #[builder(default = 20)]
    pub max_iterations: usize,
    /// Threads used to evaluate the error terms.
    #[builder(default = 1)]
    pub num_threads: usize,
    #[builder(default = false)]
    pub verbose: bool,
    /// Stop when the norm of the step falls below this value.
    #[builder(default = 1e-10)]
    pub convergence_delta_x: f64,
    /// Stop when the relative cost decrease falls below this value.
    #[builder(default = 1e-12)]
    pub convergence_delta_j: f64,
    #[builder(default)]
    pub trust_region_policy: TrustRegionPolicy,
    #[builder(default = 1e-3)]
    pub lm_lambda_init: f64,
    #[builder(default = 10.0)]
    pub lm_lambda_factor: f64,
    #[builder(default = 1e10)]
    pub lm_lambda_max: f64,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Outcome of a bounded solve.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SolveSummary {
    /// Number of iterations, including the ones whose step was undone.
    pub iterations: usize,
    pub failed_iterations: usize,
    pub cost_start: f64,
    pub cost_final: f64,
    pub converged: bool,
}

impl fmt::Display for SolveSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in {} iterations ({} failed): cost {:.6e} -> {:.6e}",
            if self.converged {
                "converged"
            } else {
                "stopped"
            },
            self.iterations,
            self.failed_iterations,
            self.cost_start,
            self.cost_final
        )
    }
}

/// Gauss-Newton / Levenberg-Marquardt optimizer on top of the dense QR linear solver.
#[derive(Debug, Default)]
pub struct Optimizer {
    options: OptimizerOptions,
    linear_solver: QrLinearSolver,
}

impl Optimizer {
    pub fn new(options: OptimizerOptions, linear_options: LinearSolverOptions) -> Self {
        Self {
            options,
            linear_solver: QrLinearSolver::new(linear_options),
        }
    }

    pub fn options(&self) -> &OptimizerOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: OptimizerOptions) {
        self.options = options;
    }

    pub fn linear_solver(&self) -> &QrLinearSolver {
        &self.linear_solver
    }

    pub fn linear_solver_mut(&mut self) -> &mut QrLinearSolver {
        &mut self.linear_solver
    }

    fn num_threads(&self) -> usize {
        self.options.num_threads.max(1)
    }

    fn log_level(&self) -> Level {
        if self.options.verbose {
            Level::Info
        } else {
            Level::Debug
        }
    }

    /// Adds the step to the active design variables, following their column placement.
    fn apply(&self, step: &DVector<f64>) -> Result<(), SolverError> {
        for dv in self.linear_solver.design_variables() {
            if let Some(base) = dv.column_base() {
                dv.update(step.rows(base, dv.minimal_dimension()))
                    .context(SolverProblemSnafu)?;
            }
        }
        Ok(())
    }
}

impl NonlinearSolver for Optimizer {
    fn optimize(&mut self, problem: &IncrementalProblem) -> Result<SolveSummary, SolverError> {
        self.restore(problem)?;
        let num_threads = self.num_threads();
        let level = self.log_level();

        let mut summary = SolveSummary {
            cost_start: self.linear_solver.cost(),
            ..Default::default()
        };
        let mut cost = summary.cost_start;
        let mut lambda = self.options.lm_lambda_init;

        while summary.iterations < self.options.max_iterations {
            summary.iterations += 1;
            let damping = match self.options.trust_region_policy {
                TrustRegionPolicy::GaussNewton => 0.0,
                TrustRegionPolicy::LevenbergMarquardt => lambda,
            };

            let dx = self.linear_solver.solve(damping)?;
            if dx.iter().any(|x| !x.is_finite()) {
                warn!(
                    "[{}/{}] non-finite step, stopping at cost {cost:.6e}",
                    summary.iterations,
                    self.options.max_iterations
                );
                break;
            }
            let step_norm = dx.norm();
            if step_norm <= self.options.convergence_delta_x {
                summary.converged = true;
                break;
            }

            self.apply(&dx)?;
            self.linear_solver.build_system(num_threads)?;
            let new_cost = self.linear_solver.cost();

            if new_cost < cost {
                self.linear_solver.analyze_system()?;
                let decrease = cost - new_cost;
                log!(
                    level,
                    "[{}/{}] cost {cost:.6e} -> {new_cost:.6e} (|dx| = {step_norm:.3e})",
                    summary.iterations,
                    self.options.max_iterations
                );
                let relative = decrease <= self.options.convergence_delta_j * cost;
                cost = new_cost;
                lambda = (lambda / self.options.lm_lambda_factor).max(f64::EPSILON);
                if relative {
                    summary.converged = true;
                    break;
                }
            } else {
                self.apply(&-dx)?;
                self.linear_solver.build_system(num_threads)?;
                self.linear_solver.analyze_system()?;
                summary.failed_iterations += 1;
                if (new_cost - cost).abs() <= self.options.convergence_delta_j * cost {
                    // Rounding noise at the minimum
                    summary.converged = true;
                    break;
                }
                log!(
                    level,
                    "[{}/{}] step rejected, cost {cost:.6e} -> {new_cost:.6e}",
                    summary.iterations,
                    self.options.max_iterations
                );
                match self.options.trust_region_policy {
                    TrustRegionPolicy::GaussNewton => break,
                    TrustRegionPolicy::LevenbergMarquardt => {
                        lambda *= self.options.lm_lambda_factor;
                        if lambda > self.options.lm_lambda_max {
                            warn!("damping {lambda:.3e} exceeds its maximum, stopping");
                            break;
                        }
                    }
                }
            }
        }

        summary.cost_final = cost;
        log!(level, "{summary}");
        Ok(summary)
    }

    fn restore(&mut self, problem: &IncrementalProblem) -> Result<(), SolverError> {
        self.linear_solver.init();
        self.linear_solver.init_matrix_structure(problem);
        self.linear_solver.build_system(self.num_threads())?;
        self.linear_solver.analyze_system()
    }

    fn max_iterations(&self) -> usize {
        self.options.max_iterations
    }

    fn jacobian_transpose(&self) -> &DMatrix<f64> {
        self.linear_solver.jacobian_transpose()
    }

    fn rank(&self) -> usize {
        self.linear_solver.rank()
    }

    fn rank_deficiency(&self) -> usize {
        self.linear_solver.rank_deficiency()
    }

    fn tolerance(&self) -> f64 {
        self.linear_solver.tolerance()
    }

    fn memory_usage(&self) -> usize {
        self.linear_solver.memory_usage()
    }

    fn peak_memory_usage(&self) -> usize {
        self.linear_solver.peak_memory_usage()
    }

    fn num_flops(&self) -> f64 {
        self.linear_solver.num_flops()
    }
}
