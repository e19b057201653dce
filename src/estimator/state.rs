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

/// The spectral state of the last accepted batch, against which new batches are compared.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpectralState {
    pub marginalization: Marginalization,
    /// QR tolerance of the full Jacobian factorization
    pub qr_tolerance: f64,
    /// Numerical rank of the full Jacobian
    pub rank: usize,
    pub rank_deficiency: usize,
}

impl SpectralState {
    pub fn sv_log2_sum(&self) -> f64 {
        self.marginalization.sv_log2_sum
    }

    pub fn calibration_rank(&self) -> usize {
        self.marginalization.calibration_rank
    }
}
