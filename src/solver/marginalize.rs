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

use super::linear::{auto_qr_tolerance, pivot_rank, pivots};
use super::{MarginalizationOutOfRangeSnafu, SolverError};
use crate::linalg::{DMatrix, DVector};
use nalgebra::SVD;
use serde_derive::{Deserialize, Serialize};
use snafu::ensure;
use std::fmt;
use typed_builder::TypedBuilder;

/// Spectral analysis of the marginalized block of the Jacobian.
///
/// The "scaled" quantities are computed on the marginal Jacobian after normalizing each of its columns to unit norm,
/// which makes them comparable across calibration parameters of different units.
#[derive(Clone, Debug, PartialEq)]
pub struct Marginalization {
    /// Numerical rank of the non-marginalized columns.
    pub measurement_rank: usize,
    pub measurement_rank_deficiency: usize,
    /// Numerical rank of the marginal Jacobian of the calibration parameters.
    pub calibration_rank: usize,
    pub calibration_rank_deficiency: usize,
    /// Tolerance used to truncate the singular values.
    pub svd_tolerance: f64,
    /// Right singular vectors spanning the unobservable directions (one per column).
    pub unobservable_basis: DMatrix<f64>,
    pub unobservable_basis_scaled: DMatrix<f64>,
    /// Right singular vectors spanning the observable directions (one per column).
    pub observable_basis: DMatrix<f64>,
    pub observable_basis_scaled: DMatrix<f64>,
    /// Covariance of the calibration parameters, restricted to the observable subspace.
    pub calibration_covariance: DMatrix<f64>,
    pub calibration_covariance_scaled: DMatrix<f64>,
    /// Covariance expressed in the observable basis.
    pub observable_covariance: DMatrix<f64>,
    pub observable_covariance_scaled: DMatrix<f64>,
    /// All the singular values of the marginal Jacobian, in descending order.
    pub singular_values: DVector<f64>,
    pub singular_values_scaled: DVector<f64>,
    /// Sum of the base-2 logarithms of the retained singular values.
    pub sv_log2_sum: f64,
}

impl Default for Marginalization {
    fn default() -> Self {
        Self {
            measurement_rank: 0,
            measurement_rank_deficiency: 0,
            calibration_rank: 0,
            calibration_rank_deficiency: 0,
            svd_tolerance: 0.0,
            unobservable_basis: DMatrix::zeros(0, 0),
            unobservable_basis_scaled: DMatrix::zeros(0, 0),
            observable_basis: DMatrix::zeros(0, 0),
            observable_basis_scaled: DMatrix::zeros(0, 0),
            calibration_covariance: DMatrix::zeros(0, 0),
            calibration_covariance_scaled: DMatrix::zeros(0, 0),
            observable_covariance: DMatrix::zeros(0, 0),
            observable_covariance_scaled: DMatrix::zeros(0, 0),
            singular_values: DVector::zeros(0),
            singular_values_scaled: DVector::zeros(0),
            sv_log2_sum: 0.0,
        }
    }
}

impl fmt::Display for Marginalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "measurement rank {} (deficiency {}), calibration rank {} (deficiency {}), log2 sum {:.6}",
            self.measurement_rank,
            self.measurement_rank_deficiency,
            self.calibration_rank,
            self.calibration_rank_deficiency,
            self.sv_log2_sum
        )
    }
}

/// Computes the marginal information of the trailing columns of a Jacobian.
pub trait Marginalizer {
    /// Marginalizes out the columns `..start` of the Jacobian whose transpose is `jt`, and analyzes the columns
    /// `start..`.
    fn marginalize(&self, jt: &DMatrix<f64>, start: usize) -> Result<Marginalization, SolverError>;
}

#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Serialize, TypedBuilder)]
#[builder(doc)]
#[serde(default)]
pub struct MarginalizationOptions {
    /// Singular values at or below this value are truncated. A negative value selects `20 (m + d) eps sigma_max`.
    #[builder(default = -1.0)]
    pub svd_tolerance: f64,
    /// Rank tolerance of the non-marginalized columns. A negative value selects `20 (m + n) eps max|col|`.
    #[builder(default = -1.0)]
    pub qr_tolerance: f64,
}

impl Default for MarginalizationOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Marginalizer based on a projection onto the orthogonal complement of the nuisance columns, followed by a
/// truncated singular value decomposition.
#[derive(Copy, Clone, Debug, Default)]
pub struct TruncatedSvdMarginalizer {
    pub options: MarginalizationOptions,
}

/// Iteration cap of the SVD, which otherwise never stops on non-finite input.
const MAX_SVD_ITERATIONS: usize = 10_000;

/// Sorted spectrum and subspaces of one matrix.
#[derive(Clone)]
struct Spectrum {
    rank: usize,
    tolerance: f64,
    singular_values: DVector<f64>,
    observable: DMatrix<f64>,
    unobservable: DMatrix<f64>,
    covariance: DMatrix<f64>,
    observable_covariance: DMatrix<f64>,
}

impl Spectrum {
    /// Spectrum of a block without any observable direction.
    fn unobservable(d: usize, tolerance: f64) -> Self {
        Self {
            rank: 0,
            tolerance,
            singular_values: DVector::zeros(d),
            observable: DMatrix::zeros(d, 0),
            unobservable: DMatrix::identity(d, d),
            covariance: DMatrix::zeros(d, d),
            observable_covariance: DMatrix::zeros(0, 0),
        }
    }
}

impl TruncatedSvdMarginalizer {
    pub fn new(options: MarginalizationOptions) -> Self {
        Self { options }
    }

    fn spectrum(&self, a: &DMatrix<f64>) -> Spectrum {
        let (m, d) = a.shape();
        if d == 0 {
            return Spectrum::unobservable(0, self.options.svd_tolerance.max(0.0));
        }
        // Zero padding keeps the full right singular basis available for short matrices
        let padded = if m < d {
            a.clone().resize_vertically(d, 0.0)
        } else {
            a.clone()
        };

        let Some(svd) = SVD::try_new(padded, false, true, f64::EPSILON, MAX_SVD_ITERATIONS) else {
            warn!("SVD of the {m}x{d} marginal Jacobian did not converge, reporting it as unobservable");
            return Spectrum::unobservable(d, self.options.svd_tolerance.max(0.0));
        };
        let v_t = svd.v_t.unwrap_or_else(|| DMatrix::identity(d, d));
        let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
        order.sort_by(|i, j| svd.singular_values[*j].total_cmp(&svd.singular_values[*i]));

        let singular_values = DVector::from_iterator(d, order.iter().map(|i| svd.singular_values[*i]));
        let mut v = DMatrix::zeros(d, d);
        for (col, i) in order.iter().enumerate() {
            v.set_column(col, &v_t.row(*i).transpose());
        }

        let sigma_max = singular_values.iter().copied().fold(0.0, f64::max);
        let tolerance = if self.options.svd_tolerance >= 0.0 {
            self.options.svd_tolerance
        } else {
            20.0 * (m + d) as f64 * f64::EPSILON * sigma_max
        };
        let rank = singular_values.iter().filter(|s| **s > tolerance).count();

        let observable = v.columns(0, rank).into_owned();
        let unobservable = v.columns(rank, d - rank).into_owned();
        let inv_sq = DVector::from_iterator(rank, singular_values.iter().take(rank).map(|s| 1.0 / (s * s)));
        let observable_covariance = DMatrix::from_diagonal(&inv_sq);
        let covariance = &observable * &observable_covariance * observable.transpose();

        Spectrum {
            rank,
            tolerance,
            singular_values,
            observable,
            unobservable,
            covariance,
            observable_covariance,
        }
    }

    fn assemble(measurement_rank: usize, start: usize, raw: Spectrum, scaled: Spectrum) -> Marginalization {
        let sv_log2_sum: f64 = raw
            .singular_values
            .iter()
            .take(raw.rank)
            .map(|s| s.log2())
            .sum();

        Marginalization {
            measurement_rank,
            measurement_rank_deficiency: start - measurement_rank,
            calibration_rank: raw.rank,
            calibration_rank_deficiency: raw.singular_values.len() - raw.rank,
            svd_tolerance: raw.tolerance,
            unobservable_basis: raw.unobservable,
            unobservable_basis_scaled: scaled.unobservable,
            observable_basis: raw.observable,
            observable_basis_scaled: scaled.observable,
            calibration_covariance: raw.covariance,
            calibration_covariance_scaled: scaled.covariance,
            observable_covariance: raw.observable_covariance,
            observable_covariance_scaled: scaled.observable_covariance,
            singular_values: raw.singular_values,
            singular_values_scaled: scaled.singular_values,
            sv_log2_sum,
        }
    }
}

impl Marginalizer for TruncatedSvdMarginalizer {
    fn marginalize(&self, jt: &DMatrix<f64>, start: usize) -> Result<Marginalization, SolverError> {
        let (cols, m) = jt.shape();
        ensure!(
            start <= cols,
            MarginalizationOutOfRangeSnafu { start, cols }
        );
        let d = cols - start;
        if jt.iter().any(|x| !x.is_finite()) {
            warn!("non-finite Jacobian, reporting the calibration parameters as unobservable");
            let none = Spectrum::unobservable(d, self.options.svd_tolerance.max(0.0));
            return Ok(Self::assemble(0, start, none.clone(), none));
        }
        let jacobian = jt.transpose();
        let j_theta = jacobian.columns(start, d);

        // Project the calibration columns onto the orthogonal complement of the range of the nuisance columns
        let (measurement_rank, a_theta) = if start > 0 && m > 0 {
            let j_psi = jacobian.columns(0, start).into_owned();
            let tolerance = if self.options.qr_tolerance >= 0.0 {
                self.options.qr_tolerance
            } else {
                let max_col_norm = j_psi.column_iter().map(|c| c.norm()).fold(0.0, f64::max);
                auto_qr_tolerance(m, start, max_col_norm)
            };
            let qr = j_psi.col_piv_qr();
            let rank = pivot_rank(&qr, tolerance);
            let r_diag = pivots(&qr);
            let q = qr.q();
            let mut a_theta = j_theta.into_owned();
            for (i, r_ii) in r_diag.iter().enumerate() {
                if r_ii.abs() > tolerance {
                    let qi = q.column(i);
                    let coeffs = qi.transpose() * &a_theta;
                    a_theta -= qi * coeffs;
                }
            }
            (rank, a_theta)
        } else {
            (0, j_theta.into_owned())
        };

        let raw = self.spectrum(&a_theta);

        let mut a_scaled = a_theta;
        for mut col in a_scaled.column_iter_mut() {
            let norm = col.norm();
            if norm > 0.0 {
                col /= norm;
            }
        }
        let scaled = self.spectrum(&a_scaled);

        Ok(Self::assemble(measurement_rank, start, raw, scaled))
    }
}
