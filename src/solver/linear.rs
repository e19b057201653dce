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

use super::{
    JacobianBlockCountSnafu, JacobianShapeSnafu, NotReadySnafu, ResidualDimensionSnafu,
    SolverError, ThreadPoolSnafu,
};
use crate::linalg::{DMatrix, DVector};
use crate::problem::{DesignVariable, ErrorTerm, IncrementalProblem};
use nalgebra::{ColPivQR, Dyn};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde_derive::{Deserialize, Serialize};
use snafu::prelude::*;
use std::mem::size_of;
use std::sync::Arc;
use typed_builder::TypedBuilder;

/// Options of the dense QR linear solver.
#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Serialize, TypedBuilder)]
#[builder(doc)]
#[serde(default)]
pub struct LinearSolverOptions {
    /// Scale every Jacobian column to unit norm before the factorization.
    #[builder(default = false)]
    pub column_normalization: bool,
    /// Pivots of R below this magnitude are treated as zero. A negative value selects `20 (m + n) eps max|col|`.
    #[builder(default = -1.0)]
    pub qr_tolerance: f64,
}

impl Default for LinearSolverOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Lifecycle of the linear solver structure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SolverState {
    /// Options applied, no structure.
    Uninitialized,
    /// Design variables placed and error terms assigned to rows.
    Structured,
    /// The system was evaluated and factorized at the current design variable values.
    Factorized,
}

/// Dense linear system solver based on a column-pivoted QR decomposition of the Jacobian.
///
/// The solver stores the transpose of the Jacobian (one row per active column of the problem, one column per
/// residual row) and the stacked residual of all the error terms.
#[derive(Debug)]
pub struct QrLinearSolver {
    options: LinearSolverOptions,
    state: SolverState,
    design_variables: Vec<Arc<DesignVariable>>,
    error_terms: Vec<Arc<dyn ErrorTerm>>,
    row_bases: Vec<usize>,
    num_cols: usize,
    num_rows: usize,
    jt: DMatrix<f64>,
    residual: DVector<f64>,
    col_scaling: DVector<f64>,
    qr: Option<ColPivQR<f64, Dyn, Dyn>>,
    rank: usize,
    tolerance: f64,
    memory_usage: usize,
    peak_memory_usage: usize,
    num_flops: f64,
    pool: Option<(usize, ThreadPool)>,
}

/// Evaluation of a single error term.
type TermEvaluation = (DVector<f64>, Vec<DMatrix<f64>>);

impl QrLinearSolver {
    pub fn new(options: LinearSolverOptions) -> Self {
        Self {
            options,
            state: SolverState::Uninitialized,
            design_variables: Vec::new(),
            error_terms: Vec::new(),
            row_bases: Vec::new(),
            num_cols: 0,
            num_rows: 0,
            jt: DMatrix::zeros(0, 0),
            residual: DVector::zeros(0),
            col_scaling: DVector::zeros(0),
            qr: None,
            rank: 0,
            tolerance: 0.0,
            memory_usage: 0,
            peak_memory_usage: 0,
            num_flops: 0.0,
            pool: None,
        }
    }

    pub fn options(&self) -> &LinearSolverOptions {
        &self.options
    }

    /// Replaces the options, which take effect at the next `init`.
    pub fn set_options(&mut self, options: LinearSolverOptions) {
        self.options = options;
    }

    pub fn state(&self) -> SolverState {
        self.state
    }

    /// Clears all the structure. The peak memory usage is kept.
    pub fn init(&mut self) {
        self.state = SolverState::Uninitialized;
        self.design_variables.clear();
        self.error_terms.clear();
        self.row_bases.clear();
        self.num_cols = 0;
        self.num_rows = 0;
        self.jt = DMatrix::zeros(0, 0);
        self.residual = DVector::zeros(0);
        self.col_scaling = DVector::zeros(0);
        self.qr = None;
        self.rank = 0;
        self.tolerance = 0.0;
        self.memory_usage = 0;
        self.num_flops = 0.0;
    }

    /// Places the design variables of the problem and assigns the rows of its error terms.
    ///
    /// Active variables receive consecutive block indices and column bases following the problem ordering, inactive
    /// ones lose their placement.
    pub fn init_matrix_structure(&mut self, problem: &IncrementalProblem) {
        self.design_variables.clear();
        let mut column = 0;
        for dv in problem.design_variables() {
            if dv.is_active() {
                dv.set_placement(Some(self.design_variables.len()), Some(column));
                column += dv.minimal_dimension();
                self.design_variables.push(dv.clone());
            } else {
                dv.set_placement(None, None);
            }
        }
        self.num_cols = column;

        self.error_terms = problem.error_terms().to_vec();
        self.row_bases.clear();
        let mut row = 0;
        for et in &self.error_terms {
            self.row_bases.push(row);
            row += et.dimension();
        }
        self.num_rows = row;

        self.jt = DMatrix::zeros(self.num_cols, self.num_rows);
        self.residual = DVector::zeros(self.num_rows);
        self.col_scaling = DVector::from_element(self.num_cols, 1.0);
        self.qr = None;
        self.rank = 0;
        self.state = SolverState::Structured;
        self.track_memory();
        trace!(
            "linear system structure: {} blocks, {} columns, {} rows",
            self.design_variables.len(),
            self.num_cols,
            self.num_rows
        );
    }

    /// Evaluates all the error terms at the current design variable values and fills the Jacobian transpose.
    pub fn build_system(&mut self, num_threads: usize) -> Result<(), SolverError> {
        ensure!(
            self.state != SolverState::Uninitialized,
            NotReadySnafu {
                state: self.state,
                needed: SolverState::Structured,
                action: "building the system"
            }
        );

        let evaluate = |et: &Arc<dyn ErrorTerm>| -> TermEvaluation { (et.evaluate(), et.jacobians()) };
        if num_threads > 1 {
            self.ensure_pool(num_threads)?;
        }
        let evaluations: Vec<TermEvaluation> = match &self.pool {
            Some((_, pool)) if num_threads > 1 && self.error_terms.len() > 1 => {
                let terms = &self.error_terms;
                pool.install(|| terms.par_iter().map(evaluate).collect())
            }
            _ => self.error_terms.iter().map(evaluate).collect(),
        };

        self.jt.fill(0.0);
        for (term, (et, (res, jacs))) in self.error_terms.iter().zip(evaluations).enumerate() {
            let dim = et.dimension();
            let row = self.row_bases[term];
            ensure!(
                res.len() == dim,
                ResidualDimensionSnafu {
                    term,
                    expected: dim,
                    got: res.len()
                }
            );
            let dvs = et.design_variables();
            ensure!(
                jacs.len() == dvs.len(),
                JacobianBlockCountSnafu {
                    term,
                    expected: dvs.len(),
                    got: jacs.len()
                }
            );
            self.residual.rows_mut(row, dim).copy_from(&res);
            for (dv, jac) in dvs.iter().zip(&jacs) {
                let cols = dv.minimal_dimension();
                ensure!(
                    jac.nrows() == dim && jac.ncols() == cols,
                    JacobianShapeSnafu {
                        term,
                        rows: jac.nrows(),
                        cols: jac.ncols(),
                        exp_rows: dim,
                        exp_cols: cols
                    }
                );
                if let Some(base) = dv.column_base() {
                    let mut block = self.jt.view_mut((base, row), (cols, dim));
                    block += jac.transpose();
                }
            }
        }

        self.state = SolverState::Structured;
        Ok(())
    }

    /// Factorizes the current system with a column-pivoted QR and computes its numerical rank.
    pub fn analyze_system(&mut self) -> Result<(), SolverError> {
        ensure!(
            self.state != SolverState::Uninitialized,
            NotReadySnafu {
                state: self.state,
                needed: SolverState::Structured,
                action: "analyzing the system"
            }
        );

        let mut jacobian = self.jt.transpose();
        self.col_scaling = DVector::from_element(self.num_cols, 1.0);
        if self.options.column_normalization {
            for (j, mut col) in jacobian.column_iter_mut().enumerate() {
                let norm = col.norm();
                if norm > 0.0 {
                    col /= norm;
                    self.col_scaling[j] = 1.0 / norm;
                }
            }
        }

        self.tolerance = if self.options.qr_tolerance >= 0.0 {
            self.options.qr_tolerance
        } else {
            let max_col_norm = jacobian
                .column_iter()
                .map(|col| col.norm())
                .fold(0.0, f64::max);
            auto_qr_tolerance(self.num_rows, self.num_cols, max_col_norm)
        };

        if self.num_rows == 0 || self.num_cols == 0 {
            self.qr = None;
            self.rank = 0;
            self.num_flops = 0.0;
        } else {
            let qr = jacobian.col_piv_qr();
            self.rank = pivot_rank(&qr, self.tolerance);
            self.num_flops = qr_flops(self.num_rows, self.num_cols);
            self.qr = Some(qr);
        }

        self.state = SolverState::Factorized;
        self.track_memory();
        Ok(())
    }

    /// Computes the step `dx` minimizing `|J dx + r|^2 + damping |dx|^2`.
    ///
    /// Without damping, directions along negligible pivots are left at zero.
    pub fn solve(&self, damping: f64) -> Result<DVector<f64>, SolverError> {
        ensure!(
            self.state == SolverState::Factorized,
            NotReadySnafu {
                state: self.state,
                needed: SolverState::Factorized,
                action: "solving"
            }
        );
        let Some(qr) = &self.qr else {
            return Ok(DVector::zeros(self.num_cols));
        };

        let rhs = -&self.residual;
        let scaled_dx = if damping > 0.0 {
            let mut augmented = DMatrix::zeros(self.num_rows + self.num_cols, self.num_cols);
            augmented
                .rows_mut(0, self.num_rows)
                .copy_from(&(self.jt.transpose() * DMatrix::from_diagonal(&self.col_scaling)));
            augmented
                .rows_mut(self.num_rows, self.num_cols)
                .fill_diagonal(damping.sqrt());
            let mut aug_rhs = DVector::zeros(self.num_rows + self.num_cols);
            aug_rhs.rows_mut(0, self.num_rows).copy_from(&rhs);
            truncated_solve(&augmented.col_piv_qr(), &aug_rhs, 0.0)
        } else {
            truncated_solve(qr, &rhs, self.tolerance)
        };
        Ok(scaled_dx.component_mul(&self.col_scaling))
    }

    pub fn jacobian_transpose(&self) -> &DMatrix<f64> {
        &self.jt
    }

    pub fn residual(&self) -> &DVector<f64> {
        &self.residual
    }

    /// Squared norm of the stacked residual as of the last `build_system`.
    pub fn cost(&self) -> f64 {
        self.residual.norm_squared()
    }

    /// Active design variables in column order.
    pub fn design_variables(&self) -> &[Arc<DesignVariable>] {
        &self.design_variables
    }

    /// First residual row of each error term.
    pub fn row_bases(&self) -> &[usize] {
        &self.row_bases
    }

    pub fn num_cols(&self) -> usize {
        self.num_cols
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn rank_deficiency(&self) -> usize {
        self.num_cols - self.rank
    }

    /// Tolerance used in the last factorization.
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Bytes held by the dense buffers and the factorization.
    pub fn memory_usage(&self) -> usize {
        self.memory_usage
    }

    pub fn peak_memory_usage(&self) -> usize {
        self.peak_memory_usage
    }

    /// Floating point operations of the last factorization.
    pub fn num_flops(&self) -> f64 {
        self.num_flops
    }

    /// Builds the thread pool unless one of the requested size is already cached.
    fn ensure_pool(&mut self, num_threads: usize) -> Result<(), SolverError> {
        if !matches!(&self.pool, Some((n, _)) if *n == num_threads) {
            let pool = ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build()
                .context(ThreadPoolSnafu { num_threads })?;
            self.pool = Some((num_threads, pool));
        }
        Ok(())
    }

    fn track_memory(&mut self) {
        let floats = self.jt.len()
            + self.residual.len()
            + self.col_scaling.len()
            + if self.qr.is_some() {
                self.num_rows * self.num_cols + self.num_rows.min(self.num_cols)
            } else {
                0
            };
        self.memory_usage = floats * size_of::<f64>() + self.row_bases.len() * size_of::<usize>();
        self.peak_memory_usage = self.peak_memory_usage.max(self.memory_usage);
    }
}

impl Default for QrLinearSolver {
    fn default() -> Self {
        Self::new(LinearSolverOptions::default())
    }
}

/// Default QR rank tolerance of an `m x n` matrix.
pub(crate) fn auto_qr_tolerance(m: usize, n: usize, max_col_norm: f64) -> f64 {
    20.0 * (m + n) as f64 * f64::EPSILON * max_col_norm
}

/// Pivots of R. There are only `min(m, n)` of them, R being `min(m, n) x n`.
pub(crate) fn pivots(qr: &ColPivQR<f64, Dyn, Dyn>) -> DVector<f64> {
    let r = qr.r();
    DVector::from_fn(r.nrows().min(r.ncols()), |i, _| r[(i, i)])
}

/// Number of pivots of R strictly above the tolerance.
pub(crate) fn pivot_rank(qr: &ColPivQR<f64, Dyn, Dyn>, tolerance: f64) -> usize {
    pivots(qr).iter().filter(|r| r.abs() > tolerance).count()
}

/// Least squares solution of `A x = b` from the pivoted QR of `A`, zeroing the components of negligible pivots.
pub(crate) fn truncated_solve(
    qr: &ColPivQR<f64, Dyn, Dyn>,
    b: &DVector<f64>,
    tolerance: f64,
) -> DVector<f64> {
    let r = qr.r();
    let c = qr.q().transpose() * b;
    let k = r.nrows();
    let mut x = DVector::zeros(r.ncols());
    for i in (0..k).rev() {
        let pivot = r[(i, i)];
        if pivot.abs() <= tolerance || pivot == 0.0 {
            continue;
        }
        let mut acc = c[i];
        for j in (i + 1)..k {
            acc -= r[(i, j)] * x[j];
        }
        x[i] = acc / pivot;
    }
    qr.p().inv_permute_rows(&mut x);
    x
}

/// Householder QR cost of an `m x n` matrix.
fn qr_flops(m: usize, n: usize) -> f64 {
    let (m, n) = (m as f64, n as f64);
    let k = m.min(n);
    2.0 * m * n * k - (m + n) * k * k + 2.0 * k.powi(3) / 3.0
}
