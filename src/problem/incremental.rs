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

use super::variable::identity;
use super::*;
use crate::linalg::DVector;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// The container of all the batches of the incremental estimation.
///
/// It keeps the de-duplicated set of design variables referenced by its batches, partitioned by group. The column
/// layout of the Jacobian follows the groups ordering, and within a group the insertion order of the variables.
/// Error terms are kept in batch order.
#[derive(Debug, Default)]
pub struct IncrementalProblem {
    batches: Vec<Arc<Batch>>,
    groups: BTreeMap<GroupId, Vec<Arc<DesignVariable>>>,
    groups_ordering: Vec<GroupId>,
    /// Number of batches referencing each design variable, keyed by identity.
    ref_counts: HashMap<usize, usize>,
    error_terms: Vec<Arc<dyn ErrorTerm>>,
    snapshot: Option<Vec<(Arc<DesignVariable>, DVector<f64>)>>,
}

impl IncrementalProblem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a batch. Fails if this very batch is already part of the problem.
    pub fn add(&mut self, batch: Arc<Batch>) -> Result<(), ProblemError> {
        ensure!(!self.contains(&batch), DuplicateBatchSnafu);

        for dv in batch.design_variables() {
            let count = self.ref_counts.entry(identity(dv)).or_insert(0);
            *count += 1;
            if *count == 1 {
                let group = dv.group();
                if !self.groups.contains_key(&group) {
                    self.groups_ordering.push(group);
                }
                self.groups.entry(group).or_default().push(dv.clone());
            }
        }
        self.error_terms.extend(batch.error_terms().iter().cloned());
        self.batches.push(batch);
        Ok(())
    }

    /// Removes the batch at the provided index and returns it.
    ///
    /// Design variables which are no longer referenced by any batch leave the problem, and so do empty groups.
    pub fn remove(&mut self, idx: usize) -> Result<Arc<Batch>, ProblemError> {
        ensure!(
            idx < self.batches.len(),
            BatchIndexOutOfRangeSnafu {
                idx,
                count: self.batches.len()
            }
        );
        let batch = self.batches.remove(idx);

        for dv in batch.design_variables() {
            let key = identity(dv);
            let remaining = match self.ref_counts.get_mut(&key) {
                Some(count) => {
                    *count -= 1;
                    *count
                }
                None => continue,
            };
            if remaining == 0 {
                self.ref_counts.remove(&key);
                let group = dv.group();
                if let Some(members) = self.groups.get_mut(&group) {
                    members.retain(|other| !Arc::ptr_eq(other, dv));
                    if members.is_empty() {
                        self.groups.remove(&group);
                        self.groups_ordering.retain(|g| *g != group);
                    }
                }
            }
        }

        self.error_terms = self
            .batches
            .iter()
            .flat_map(|b| b.error_terms().iter().cloned())
            .collect();

        Ok(batch)
    }

    /// Removes the provided batch if it is part of the problem, returning its former index.
    pub fn remove_batch(&mut self, batch: &Arc<Batch>) -> Option<usize> {
        let idx = self.position(batch)?;
        self.remove(idx).ok().map(|_| idx)
    }

    /// Index of the provided batch, looked up by identity.
    pub fn position(&self, batch: &Arc<Batch>) -> Option<usize> {
        self.batches.iter().position(|b| Arc::ptr_eq(b, batch))
    }

    pub fn contains(&self, batch: &Arc<Batch>) -> bool {
        self.position(batch).is_some()
    }

    pub fn batch(&self, idx: usize) -> Option<&Arc<Batch>> {
        self.batches.get(idx)
    }

    pub fn batches(&self) -> &[Arc<Batch>] {
        &self.batches
    }

    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Sum of the minimal dimensions of the active design variables of a group (zero for an unknown group).
    pub fn group_dim(&self, group: GroupId) -> usize {
        self.groups.get(&group).map_or(0, |members| {
            members
                .iter()
                .filter(|dv| dv.is_active())
                .map(|dv| dv.minimal_dimension())
                .sum()
        })
    }

    pub fn groups_ordering(&self) -> &[GroupId] {
        &self.groups_ordering
    }

    /// Sets the groups ordering, which must be a permutation of the groups currently in the problem.
    pub fn set_groups_ordering(&mut self, ordering: Vec<GroupId>) -> Result<(), ProblemError> {
        let mut sorted = ordering.clone();
        sorted.sort_unstable();
        sorted.dedup();
        ensure!(
            sorted.len() == ordering.len()
                && sorted.len() == self.groups.len()
                && sorted.iter().all(|g| self.groups.contains_key(g)),
            InvalidGroupsOrderingSnafu {
                expected: self.groups.len(),
                got: ordering
            }
        );
        self.groups_ordering = ordering;
        Ok(())
    }

    /// Design variables of a group, in insertion order.
    pub fn group(&self, group: GroupId) -> Result<&[Arc<DesignVariable>], ProblemError> {
        self.groups
            .get(&group)
            .map(|members| members.as_slice())
            .context(UnknownGroupSnafu { group })
    }

    /// All the design variables, following the groups ordering.
    pub fn design_variables(&self) -> impl Iterator<Item = &Arc<DesignVariable>> + '_ {
        self.groups_ordering
            .iter()
            .filter_map(move |g| self.groups.get(g))
            .flatten()
    }

    pub fn design_variable(&self, idx: usize) -> Option<&Arc<DesignVariable>> {
        self.design_variables().nth(idx)
    }

    pub fn num_design_variables(&self) -> usize {
        self.ref_counts.len()
    }

    pub fn error_terms(&self) -> &[Arc<dyn ErrorTerm>] {
        &self.error_terms
    }

    pub fn error_term(&self, idx: usize) -> Option<&Arc<dyn ErrorTerm>> {
        self.error_terms.get(idx)
    }

    pub fn num_error_terms(&self) -> usize {
        self.error_terms.len()
    }

    /// Sum of the squared whitened residuals over all the error terms.
    pub fn cost(&self) -> f64 {
        self.error_terms.iter().map(|et| et.squared_error()).sum()
    }

    /// Stores the values of all the active design variables, replacing any previous snapshot.
    pub fn save_design_variables(&mut self) {
        let snapshot = self
            .design_variables()
            .filter(|dv| dv.is_active())
            .map(|dv| (dv.clone(), dv.value()))
            .collect::<Vec<_>>();
        trace!("saved the values of {} design variables", snapshot.len());
        self.snapshot = Some(snapshot);
    }

    /// Restores the values saved by the last call to `save_design_variables`.
    ///
    /// The snapshot is kept, so restoring twice yields the same values. Variables which have left the problem since
    /// the snapshot are restored as well, since the caller may still hold them.
    pub fn restore_design_variables(&mut self) -> Result<(), ProblemError> {
        let snapshot = self.snapshot.as_ref().context(NoSnapshotSnafu)?;
        for (dv, value) in snapshot {
            dv.set_value(value.clone())?;
        }
        trace!("restored the values of {} design variables", snapshot.len());
        Ok(())
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn clear_snapshot(&mut self) {
        self.snapshot = None;
    }
}

impl fmt::Display for IncrementalProblem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} batches, {} design variables in groups {:?}, {} error terms",
            self.batches.len(),
            self.num_design_variables(),
            self.groups_ordering,
            self.error_terms.len()
        )
    }
}
