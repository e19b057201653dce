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

use super::{DesignVariable, ErrorTerm, GroupId};
use std::fmt;
use std::sync::Arc;

/// A batch of measurements: an ordered set of error terms and the design variables they reference.
///
/// Batches are built by the caller and handed over to the estimator as `Arc<Batch>`; two batches are the same batch
/// only if they are the same allocation.
#[derive(Debug, Default)]
pub struct Batch {
    design_variables: Vec<Arc<DesignVariable>>,
    error_terms: Vec<Arc<dyn ErrorTerm>>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a design variable, returns false if it was already part of this batch.
    pub fn add_design_variable(&mut self, dv: Arc<DesignVariable>) -> bool {
        if self.contains_design_variable(&dv) {
            false
        } else {
            self.design_variables.push(dv);
            true
        }
    }

    /// Appends an error term and registers any design variable it references that is not yet part of the batch.
    pub fn add_error_term(&mut self, et: Arc<dyn ErrorTerm>) {
        for dv in et.design_variables() {
            self.add_design_variable(dv.clone());
        }
        self.error_terms.push(et);
    }

    pub fn contains_design_variable(&self, dv: &Arc<DesignVariable>) -> bool {
        self.design_variables.iter().any(|other| Arc::ptr_eq(other, dv))
    }

    pub fn design_variables(&self) -> &[Arc<DesignVariable>] {
        &self.design_variables
    }

    pub fn error_terms(&self) -> &[Arc<dyn ErrorTerm>] {
        &self.error_terms
    }

    pub fn num_design_variables(&self) -> usize {
        self.design_variables.len()
    }

    pub fn num_error_terms(&self) -> usize {
        self.error_terms.len()
    }

    /// Distinct groups referenced by this batch, in order of first appearance.
    pub fn groups(&self) -> Vec<GroupId> {
        let mut groups = Vec::new();
        for dv in &self.design_variables {
            if !groups.contains(&dv.group()) {
                groups.push(dv.group());
            }
        }
        groups
    }

    /// Sum of the squared whitened residuals of this batch alone.
    pub fn cost(&self) -> f64 {
        self.error_terms.iter().map(|et| et.squared_error()).sum()
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "batch of {} error terms over {} design variables (groups {:?})",
            self.error_terms.len(),
            self.design_variables.len(),
            self.groups()
        )
    }
}
