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
    BatchSolution, EstimatorError, IncrementalEstimator, MissingSnapshotSnafu, TrialConsumedSnafu,
};
use crate::problem::Batch;
use crate::solver::{Marginalizer, NonlinearSolver};
use snafu::ensure;
use std::mem;
use std::sync::Arc;

/// How a batch trial was settled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Commit {
    Accepted,
    Rejected,
}

/// A pending batch trial, returned by `IncrementalEstimator::try_batch`.
///
/// The trial holds the estimator until it is dropped, so only one trial can be pending at a time. It must be settled
/// exactly once with `accept` or `reject`. Dropping a pending trial rejects it, restoring the design variables if a
/// snapshot was taken.
pub struct BatchTrial<'a, S: NonlinearSolver, M: Marginalizer> {
    estimator: &'a mut IncrementalEstimator<S, M>,
    batch: Arc<Batch>,
    solution: BatchSolution,
    snapshot_taken: bool,
    commit: Option<Commit>,
}

impl<'a, S: NonlinearSolver, M: Marginalizer> BatchTrial<'a, S, M> {
    pub(crate) fn new(
        estimator: &'a mut IncrementalEstimator<S, M>,
        batch: Arc<Batch>,
        solution: BatchSolution,
        snapshot_taken: bool,
    ) -> Self {
        Self {
            estimator,
            batch,
            solution,
            snapshot_taken,
            commit: None,
        }
    }

    /// Result of the trial. `batch_accepted` is updated when the trial is settled.
    pub fn solution(&self) -> &BatchSolution {
        &self.solution
    }

    pub fn batch(&self) -> &Arc<Batch> {
        &self.batch
    }

    /// Read access to the estimator while the trial is pending, e.g. to inspect the trial Jacobian.
    pub fn estimator(&self) -> &IncrementalEstimator<S, M> {
        &*self.estimator
    }

    /// Whether the design variable values were saved before solving.
    pub fn snapshot_taken(&self) -> bool {
        self.snapshot_taken
    }

    pub fn is_pending(&self) -> bool {
        self.commit.is_none()
    }

    pub fn commit(&self) -> Option<Commit> {
        self.commit
    }

    /// Keeps the batch and makes the spectrum of this trial the accepted state.
    pub fn accept(&mut self) -> Result<&BatchSolution, EstimatorError> {
        if let Some(previous) = self.commit {
            return TrialConsumedSnafu { previous }.fail();
        }
        self.estimator.commit_accept(&mut self.solution);
        self.commit = Some(Commit::Accepted);
        Ok(&self.solution)
    }

    /// Removes the batch from the problem and rebuilds the solver structure. With `restore`, the design variables are
    /// set back to their values before the trial, which requires the trial to have been started with a snapshot.
    pub fn reject(&mut self, restore: bool) -> Result<&BatchSolution, EstimatorError> {
        if let Some(previous) = self.commit {
            return TrialConsumedSnafu { previous }.fail();
        }
        ensure!(!restore || self.snapshot_taken, MissingSnapshotSnafu);
        self.commit = Some(Commit::Rejected);
        self.solution.batch_accepted = false;
        self.estimator.discard(&self.batch, restore)?;
        Ok(&self.solution)
    }

    /// Consumes the trial and returns its solution. A trial still pending is rejected on the way.
    pub fn into_solution(mut self) -> BatchSolution {
        mem::take(&mut self.solution)
    }
}

impl<S: NonlinearSolver, M: Marginalizer> Drop for BatchTrial<'_, S, M> {
    fn drop(&mut self) {
        if self.commit.is_none() {
            warn!("batch trial dropped while pending, rejecting {}", self.batch);
            self.commit = Some(Commit::Rejected);
            if let Err(e) = self.estimator.discard(&self.batch, self.snapshot_taken) {
                error!("rejection of the dropped trial is incomplete: {e}");
            }
        }
    }
}
