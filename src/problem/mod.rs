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

use snafu::prelude::*;

mod batch;
mod error_term;
mod incremental;
mod variable;

pub use batch::Batch;
pub use error_term::{ErrorTerm, LinearErrorTerm};
pub use incremental::IncrementalProblem;
pub use variable::DesignVariable;

/// Identifier of a design variable group. Groups partition the design variables for ordering and marginalization.
pub type GroupId = usize;

#[derive(Debug, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProblemError {
    #[snafu(display("batch is already part of the problem"))]
    DuplicateBatch,
    #[snafu(display("batch index {idx} is out of range ({count} batches)"))]
    BatchIndexOutOfRange { idx: usize, count: usize },
    #[snafu(display("group {group} is not part of the problem"))]
    UnknownGroup { group: GroupId },
    #[snafu(display("groups ordering {got:?} is not a permutation of the {expected} groups in the problem"))]
    InvalidGroupsOrdering { expected: usize, got: Vec<GroupId> },
    #[snafu(display("no design variable snapshot available to restore"))]
    NoSnapshot,
    #[snafu(display("design variable `{name}` has dimension {expected}, got a vector of {got}"))]
    VariableDimension {
        name: String,
        expected: usize,
        got: usize,
    },
    #[snafu(display("{what} has shape {rows}x{cols}, expected {exp_rows}x{exp_cols}"))]
    ShapeMismatch {
        what: &'static str,
        rows: usize,
        cols: usize,
        exp_rows: usize,
        exp_cols: usize,
    },
    #[snafu(display("error term needs at least one design variable"))]
    NoDesignVariables,
}
