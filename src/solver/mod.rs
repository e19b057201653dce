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

use crate::problem::ProblemError;
use snafu::prelude::*;

mod linear;
mod marginalize;
mod optimizer;

pub use linear::{LinearSolverOptions, QrLinearSolver, SolverState};
pub use marginalize::{
    Marginalization, MarginalizationOptions, Marginalizer, TruncatedSvdMarginalizer,
};
pub use optimizer::{NonlinearSolver, Optimizer, OptimizerOptions, SolveSummary, TrustRegionPolicy};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SolverError {
    #[snafu(display("linear solver is {state:?}, {action} requires it to be {needed:?}"))]
    NotReady {
        state: SolverState,
        needed: SolverState,
        action: &'static str,
    },
    #[snafu(display("could not build a pool of {num_threads} threads: {source}"))]
    ThreadPool {
        num_threads: usize,
        source: rayon::ThreadPoolBuildError,
    },
    #[snafu(display("error term #{term} returned {got} Jacobian blocks for {expected} design variables"))]
    JacobianBlockCount {
        term: usize,
        expected: usize,
        got: usize,
    },
    #[snafu(display(
        "error term #{term} returned a {rows}x{cols} Jacobian block, expected {exp_rows}x{exp_cols}"
    ))]
    JacobianShape {
        term: usize,
        rows: usize,
        cols: usize,
        exp_rows: usize,
        exp_cols: usize,
    },
    #[snafu(display("error term #{term} returned a residual of {got} entries, expected {expected}"))]
    ResidualDimension {
        term: usize,
        expected: usize,
        got: usize,
    },
    #[snafu(display("marginalized block starts at column {start} but the Jacobian has {cols} columns"))]
    MarginalizationOutOfRange { start: usize, cols: usize },
    #[snafu(display("while updating the problem: {source}"))]
    SolverProblem { source: ProblemError },
}
