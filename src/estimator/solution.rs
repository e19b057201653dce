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

use crate::solver::Marginalization;
use std::fmt;
use std::time::Duration;

/// Outcome of a batch trial, of a batch removal or of a re-optimization.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchSolution {
    /// Whether the batch was kept in the problem
    pub batch_accepted: bool,
    /// Whether the optimizer produced a usable solution
    pub solution_valid: bool,
    /// Whether the batch brings enough new information to be kept
    pub is_informative_batch: bool,
    /// Mutual information gain with respect to the accepted state
    pub information_gain: f64,
    /// Marginal analysis of the calibration parameters at the solution
    pub marginalization: Marginalization,
    /// QR tolerance of the full Jacobian factorization
    pub qr_tolerance: f64,
    /// Numerical rank of the full Jacobian
    pub rank: usize,
    pub rank_deficiency: usize,
    pub num_iterations: usize,
    pub cost_start: f64,
    pub cost_final: f64,
    /// Wall clock duration of the operation
    pub elapsed_time: Duration,
    /// Peak memory of the linear solver, in bytes
    pub peak_memory_usage: usize,
    /// Memory of the linear solver at the end of the operation, in bytes
    pub memory_usage: usize,
    /// Floating point operations of the last factorization
    pub num_flops: f64,
}

impl BatchSolution {
    /// Sum of the base-2 logarithms of the retained singular values of the marginal Jacobian.
    pub fn sv_log2_sum(&self) -> f64 {
        self.marginalization.sv_log2_sum
    }
}

impl fmt::Display for BatchSolution {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "Batch {} ({} solution, {}informative): MI gain {:.6}",
            if self.batch_accepted {
                "accepted"
            } else {
                "not accepted"
            },
            if self.solution_valid {
                "valid"
            } else {
                "invalid"
            },
            if self.is_informative_batch { "" } else { "not " },
            self.information_gain
        )?;
        writeln!(
            f,
            "\tcost {:.6e} -> {:.6e} in {} iterations ({:.3} s)",
            self.cost_start,
            self.cost_final,
            self.num_iterations,
            self.elapsed_time.as_secs_f64()
        )?;
        writeln!(
            f,
            "\trank {} (deficiency {}, QR tol {:.3e}); {}",
            self.rank, self.rank_deficiency, self.qr_tolerance, self.marginalization
        )?;
        write!(
            f,
            "\tmemory {} B (peak {} B), {:.3e} flops",
            self.memory_usage, self.peak_memory_usage, self.num_flops
        )
    }
}
