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

use crate::io::{ConfigError, ConfigRepr, InvalidConfigSnafu};
use crate::problem::GroupId;
use crate::solver::{LinearSolverOptions, MarginalizationOptions, OptimizerOptions};
use serde_derive::{Deserialize, Serialize};
use snafu::ensure;
use typed_builder::TypedBuilder;

/// Options of the batch admission.
#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Serialize, TypedBuilder)]
#[builder(doc)]
#[serde(default)]
pub struct EstimatorOptions {
    /// Minimum mutual information gain for a batch to be informative
    #[builder(default = 0.2)]
    pub info_gain_delta: f64,
    /// Also invalidate solutions with a non-finite cost or Jacobian
    #[builder(default = false)]
    pub check_validity: bool,
    /// Hitting the iteration cap does not invalidate the solution
    #[builder(default = false)]
    pub max_iteration_hit_is_still_valid: bool,
    /// Log every batch decision at info level
    #[builder(default = false)]
    pub verbose: bool,
}

impl Default for EstimatorOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// All the options needed to build an incremental estimator, as stored in a configuration file.
///
/// ```yaml
/// marginalized_group: 1
/// estimator:
///   info_gain_delta: 0.5
/// optimizer:
///   max_iterations: 50
///   trust_region_policy: LevenbergMarquardt
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, TypedBuilder)]
#[builder(doc)]
pub struct EstimatorConfig {
    /// Group of the calibration parameters
    pub marginalized_group: GroupId,
    #[builder(default)]
    #[serde(default)]
    pub estimator: EstimatorOptions,
    #[builder(default)]
    #[serde(default)]
    pub linear_solver: LinearSolverOptions,
    #[builder(default)]
    #[serde(default)]
    pub optimizer: OptimizerOptions,
    #[builder(default)]
    #[serde(default)]
    pub marginalization: MarginalizationOptions,
}

impl EstimatorConfig {
    /// Checks that the options can drive an estimation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.estimator.info_gain_delta.is_finite(),
            InvalidConfigSnafu {
                msg: format!(
                    "info_gain_delta must be finite, got {}",
                    self.estimator.info_gain_delta
                )
            }
        );
        ensure!(
            self.optimizer.max_iterations > 0,
            InvalidConfigSnafu {
                msg: "max_iterations must be positive"
            }
        );
        ensure!(
            self.optimizer.num_threads > 0,
            InvalidConfigSnafu {
                msg: "num_threads must be positive"
            }
        );
        ensure!(
            self.optimizer.lm_lambda_init > 0.0
                && self.optimizer.lm_lambda_factor > 1.0
                && self.optimizer.lm_lambda_max >= self.optimizer.lm_lambda_init,
            InvalidConfigSnafu {
                msg: format!(
                    "damping must satisfy 0 < init <= max and factor > 1, got init {}, factor {}, max {}",
                    self.optimizer.lm_lambda_init,
                    self.optimizer.lm_lambda_factor,
                    self.optimizer.lm_lambda_max
                )
            }
        );
        ensure!(
            !self.linear_solver.qr_tolerance.is_nan()
                && !self.marginalization.qr_tolerance.is_nan()
                && !self.marginalization.svd_tolerance.is_nan(),
            InvalidConfigSnafu {
                msg: "tolerances must be numbers"
            }
        );
        Ok(())
    }
}

impl ConfigRepr for EstimatorConfig {}
