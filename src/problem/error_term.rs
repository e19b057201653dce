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

use super::{DesignVariable, NoDesignVariablesSnafu, ProblemError, ShapeMismatchSnafu};
use crate::linalg::{DMatrix, DVector};
use snafu::ensure;
use std::fmt::Debug;
use std::sync::Arc;

/// A trait defining a measurement constraint of the least-squares problem.
///
/// The residual must be whitened, i.e. already multiplied by the square root of the information matrix of the
/// measurement, such that the cost of the term is the squared norm of `evaluate`.
pub trait ErrorTerm: Debug + Send + Sync {
    /// Dimension of the residual.
    fn dimension(&self) -> usize;

    /// Design variables this error term depends on, in the order of the Jacobian blocks.
    fn design_variables(&self) -> &[Arc<DesignVariable>];

    /// Whitened residual at the current values of the design variables.
    fn evaluate(&self) -> DVector<f64>;

    /// Jacobians of the whitened residual, one block per design variable (dimension x minimal dimension).
    fn jacobians(&self) -> Vec<DMatrix<f64>>;

    /// Squared norm of the whitened residual.
    fn squared_error(&self) -> f64 {
        self.evaluate().norm_squared()
    }
}

/// An affine error term: `r = L (A_1 x_1 + ... + A_n x_n - b)`, where `L` is the square root of the information matrix.
#[derive(Clone, Debug)]
pub struct LinearErrorTerm {
    design_variables: Vec<Arc<DesignVariable>>,
    coefficients: Vec<DMatrix<f64>>,
    measurement: DVector<f64>,
    sqrt_information: Option<DMatrix<f64>>,
}

impl LinearErrorTerm {
    /// Builds the term from (variable, coefficient) pairs and the measurement `b`.
    pub fn new(
        blocks: Vec<(Arc<DesignVariable>, DMatrix<f64>)>,
        measurement: DVector<f64>,
    ) -> Result<Self, ProblemError> {
        ensure!(!blocks.is_empty(), NoDesignVariablesSnafu);
        let dim = measurement.len();
        let mut design_variables = Vec::with_capacity(blocks.len());
        let mut coefficients = Vec::with_capacity(blocks.len());
        for (dv, coeff) in blocks {
            ensure!(
                coeff.nrows() == dim && coeff.ncols() == dv.minimal_dimension(),
                ShapeMismatchSnafu {
                    what: "coefficient block",
                    rows: coeff.nrows(),
                    cols: coeff.ncols(),
                    exp_rows: dim,
                    exp_cols: dv.minimal_dimension(),
                }
            );
            design_variables.push(dv);
            coefficients.push(coeff);
        }
        Ok(Self {
            design_variables,
            coefficients,
            measurement,
            sqrt_information: None,
        })
    }

    /// Convenience constructor for a single variable observed through the row-major coefficients `a`.
    pub fn observe(
        dv: Arc<DesignVariable>,
        a: &[f64],
        measurement: &[f64],
    ) -> Result<Self, ProblemError> {
        let rows = measurement.len();
        let cols = dv.minimal_dimension();
        ensure!(
            a.len() == rows * cols,
            ShapeMismatchSnafu {
                what: "coefficient slice",
                rows: a.len(),
                cols: 1_usize,
                exp_rows: rows * cols,
                exp_cols: 1_usize,
            }
        );
        Self::new(
            vec![(dv, DMatrix::from_row_slice(rows, cols, a))],
            DVector::from_column_slice(measurement),
        )
    }

    /// Sets the square root of the information matrix used to whiten the residual.
    pub fn with_sqrt_information(mut self, sqrt_info: DMatrix<f64>) -> Result<Self, ProblemError> {
        let dim = self.measurement.len();
        ensure!(
            sqrt_info.nrows() == dim && sqrt_info.ncols() == dim,
            ShapeMismatchSnafu {
                what: "square root information",
                rows: sqrt_info.nrows(),
                cols: sqrt_info.ncols(),
                exp_rows: dim,
                exp_cols: dim,
            }
        );
        self.sqrt_information = Some(sqrt_info);
        Ok(self)
    }

    /// Whitens with an isotropic standard deviation.
    pub fn with_sigma(self, sigma: f64) -> Result<Self, ProblemError> {
        let dim = self.measurement.len();
        self.with_sqrt_information(DMatrix::identity(dim, dim) / sigma)
    }

    pub fn into_shared(self) -> Arc<dyn ErrorTerm> {
        Arc::new(self)
    }
}

impl ErrorTerm for LinearErrorTerm {
    fn dimension(&self) -> usize {
        self.measurement.len()
    }

    fn design_variables(&self) -> &[Arc<DesignVariable>] {
        &self.design_variables
    }

    fn evaluate(&self) -> DVector<f64> {
        let mut prediction = -&self.measurement;
        for (dv, coeff) in self.design_variables.iter().zip(&self.coefficients) {
            prediction += coeff * dv.value();
        }
        match &self.sqrt_information {
            Some(sqrt_info) => sqrt_info * prediction,
            None => prediction,
        }
    }

    fn jacobians(&self) -> Vec<DMatrix<f64>> {
        self.coefficients
            .iter()
            .map(|coeff| match &self.sqrt_information {
                Some(sqrt_info) => sqrt_info * coeff,
                None => coeff.clone(),
            })
            .collect()
    }
}
