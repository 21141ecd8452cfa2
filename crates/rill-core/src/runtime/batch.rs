//! Batches submitted to the reactive controller and the reports it returns.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::execute::{ExecutionRecord, Outcome};
use crate::graph::{Cell, CellId, Fault};
use crate::state::Value;

/// A set of changes applied and run together.
#[derive(Debug, Default)]
pub struct Batch {
    pub(crate) upserts: Vec<Cell>,
    pub(crate) deletes: Vec<CellId>,
    pub(crate) disable: Vec<CellId>,
    pub(crate) enable: Vec<CellId>,
    pub(crate) assignments: Vec<(String, Value)>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new cell, or replace the cell sharing its id.
    pub fn upsert(mut self, cell: Cell) -> Self {
        self.upserts.push(cell);
        self
    }

    pub fn delete(mut self, id: CellId) -> Self {
        self.deletes.push(id);
        self
    }

    pub fn disable(mut self, id: CellId) -> Self {
        self.disable.push(id);
        self
    }

    pub fn enable(mut self, id: CellId) -> Self {
        self.enable.push(id);
        self
    }

    /// Bind a host-provided value; cells reading `name` re-run.
    pub fn assign(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.assignments.push((name.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty()
            && self.deletes.is_empty()
            && self.disable.is_empty()
            && self.enable.is_empty()
            && self.assignments.is_empty()
    }
}

impl FromIterator<Cell> for Batch {
    fn from_iter<I: IntoIterator<Item = Cell>>(cells: I) -> Self {
        Self {
            upserts: cells.into_iter().collect(),
            ..Self::default()
        }
    }
}

/// What a batch changed.
#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    /// Cells whose status, output or faults changed (including deleted cells).
    pub changed: BTreeSet<CellId>,
    /// One record per cell run or skipped, in execution order.
    pub records: Vec<ExecutionRecord>,
    /// Faults of every changed cell that has any.
    pub faults: BTreeMap<CellId, Vec<Fault>>,
}

impl BatchReport {
    /// Latest record for `id` in this batch.
    pub fn record(&self, id: CellId) -> Option<&ExecutionRecord> {
        self.records.iter().rev().find(|r| r.cell_id == id)
    }

    pub fn outcome(&self, id: CellId) -> Option<&Outcome> {
        self.record(id).map(|r| &r.outcome)
    }

    /// Whether `id` ran to completion in this batch.
    pub fn ran(&self, id: CellId) -> bool {
        self.record(id).is_some_and(ExecutionRecord::is_success)
    }

    /// Cells that ran to completion, in execution order.
    pub fn executed(&self) -> Vec<CellId> {
        self.records
            .iter()
            .filter(|r| r.is_success())
            .map(|r| r.cell_id)
            .collect()
    }

    pub fn has_faults(&self) -> bool {
        !self.faults.is_empty()
    }

    pub(crate) fn merge(&mut self, other: BatchReport) {
        self.changed.extend(other.changed);
        self.records.extend(other.records);
        self.faults.extend(other.faults);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::graph::CellBody;

    #[test]
    fn test_builder() {
        let cell = Cell::new(CellId::new(), "x = 1", CellBody::empty());
        let id = cell.id();
        let batch = Batch::new().upsert(cell).disable(id).assign("n", 3_i64);
        assert!(!batch.is_empty());
        assert_eq!(batch.upserts.len(), 1);
        assert_eq!(batch.assignments[0].1, Value::Int(3));
        assert!(Batch::new().is_empty());
    }

    #[test]
    fn test_latest_record_wins() {
        let id = CellId::new();
        let mut report = BatchReport::default();
        report.records.push(ExecutionRecord::faulted(
            id,
            Fault::MissingReference { name: "x".into(), definers: vec![] },
            Duration::ZERO,
        ));
        report.records.push(ExecutionRecord::success(id, None, Duration::ZERO));
        assert!(report.ran(id));
        assert_eq!(report.executed(), vec![id]);
    }
}
