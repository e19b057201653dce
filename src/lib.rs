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

/*! # incremental-calibration

Incremental nonlinear least-squares calibration. Batches of measurements are proposed one at a time and only kept
if they bring new, well-observed information about the calibration parameters, as measured by the mutual
information gain and the numerical rank of their marginal Jacobian. Rejected batches are rolled back exactly, both in
the design variable values and in the structure of the linear solver.

```no_run
use incremental_calibration::prelude::*;

let theta = DesignVariable::from_slice("theta", 1, &[0.0, 0.0]);
let mut batch = Batch::new();
batch.add_error_term(
    LinearErrorTerm::observe(theta.clone(), &[1.0, 0.0, 0.0, 1.0], &[0.5, -0.2])
        .unwrap()
        .into_shared(),
);

let mut estimator = IncrementalEstimator::new(
    1,
    EstimatorOptions::default(),
    LinearSolverOptions::default(),
    OptimizerOptions::default(),
);
let solution = estimator.add_batch(batch.into_shared(), false).unwrap();
println!("{solution}");
```
*/

/// Design variables, error terms, batches and the incremental problem which aggregates them.
pub mod problem;

/// The linear solver, the nonlinear optimizer and the marginalization of the calibration parameters.
pub mod solver;

/// The incremental estimator and its batch admission protocol.
pub mod estimator;

/// Loading of the configuration from YAML.
pub mod io;

#[macro_use]
extern crate log;
extern crate nalgebra as na;

/// Re-export nalgebra
pub mod linalg {
    pub use na::base::*;
}

/// Re-export some useful things
pub use self::estimator::{BatchSolution, BatchTrial, EstimatorError, IncrementalEstimator};
pub use self::problem::{Batch, DesignVariable, ErrorTerm, GroupId, IncrementalProblem};

pub mod prelude {
    pub use crate::estimator::*;
    pub use crate::io::{ConfigError, ConfigRepr};
    pub use crate::problem::*;
    pub use crate::solver::*;
}
