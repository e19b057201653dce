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

use super::{GroupId, ProblemError, VariableDimensionSnafu};
use crate::linalg::{DVector, DVectorView};
use snafu::ensure;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A parameter block of the calibration problem.
///
/// Design variables are shared between the batches that reference them, the incremental problem and the caller,
/// hence they are always handled as `Arc<DesignVariable>` and compared by identity. The value is a Euclidean vector
/// whose length is the minimal dimension of the variable.
///
/// The block index and column base are assigned by the linear solver when it lays out the Jacobian, and are `None`
/// for inactive (fixed) variables which do not receive any column.
#[derive(Debug)]
pub struct DesignVariable {
    name: String,
    group: GroupId,
    state: RwLock<VariableState>,
}

#[derive(Clone, Debug)]
struct VariableState {
    value: DVector<f64>,
    active: bool,
    block_index: Option<usize>,
    column_base: Option<usize>,
}

impl DesignVariable {
    /// Creates a new active design variable in the provided group.
    pub fn new<S: Into<String>>(name: S, group: GroupId, value: DVector<f64>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            group,
            state: RwLock::new(VariableState {
                value,
                active: true,
                block_index: None,
                column_base: None,
            }),
        })
    }

    /// Creates a new design variable from a slice of initial values.
    pub fn from_slice<S: Into<String>>(name: S, group: GroupId, value: &[f64]) -> Arc<Self> {
        Self::new(name, group, DVector::from_column_slice(value))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    /// Number of columns this variable spans in the Jacobian when active.
    pub fn minimal_dimension(&self) -> usize {
        self.read().value.len()
    }

    /// Returns a copy of the current value.
    pub fn value(&self) -> DVector<f64> {
        self.read().value.clone()
    }

    /// Overwrites the value, which must keep the same dimension.
    pub fn set_value(&self, value: DVector<f64>) -> Result<(), ProblemError> {
        let mut state = self.write();
        ensure!(
            value.len() == state.value.len(),
            VariableDimensionSnafu {
                name: self.name.clone(),
                expected: state.value.len(),
                got: value.len()
            }
        );
        state.value = value;
        Ok(())
    }

    /// Applies an additive update to the value.
    pub fn update(&self, delta: DVectorView<f64>) -> Result<(), ProblemError> {
        let mut state = self.write();
        ensure!(
            delta.len() == state.value.len(),
            VariableDimensionSnafu {
                name: self.name.clone(),
                expected: state.value.len(),
                got: delta.len()
            }
        );
        state.value += delta;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.read().active
    }

    /// Activates or fixes this variable. Inactive variables keep their value and get no Jacobian columns.
    pub fn set_active(&self, active: bool) {
        self.write().active = active;
    }

    /// Block index assigned by the linear solver, if any.
    pub fn block_index(&self) -> Option<usize> {
        self.read().block_index
    }

    /// First Jacobian column of this variable, if placed.
    pub fn column_base(&self) -> Option<usize> {
        self.read().column_base
    }

    pub(crate) fn set_placement(&self, block_index: Option<usize>, column_base: Option<usize>) {
        let mut state = self.write();
        state.block_index = block_index;
        state.column_base = column_base;
    }

    fn read(&self) -> RwLockReadGuard<'_, VariableState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, VariableState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Display for DesignVariable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.read();
        write!(
            f,
            "{} (group {}, {}): {:?}",
            self.name,
            self.group,
            if state.active { "active" } else { "fixed" },
            state.value.as_slice()
        )
    }
}

/// Identity key of a shared design variable, stable for as long as the `Arc` is alive.
pub(crate) fn identity(dv: &Arc<DesignVariable>) -> usize {
    Arc::as_ptr(dv) as usize
}
