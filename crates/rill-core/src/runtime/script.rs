//! Non-interactive whole-notebook runner.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::execute::{AbortHandle, Direct, ExecutionRecord, ExecutionStrategy, Outcome};
use crate::graph::{CellId, DependencyGraph, Interruption};
use crate::state::{Namespace, Value};

/// What a script run produced.
#[derive(Debug, Default)]
pub struct ScriptReport {
    /// Final namespace after every cell ran.
    pub namespace: Namespace,
    /// Output of each cell that ran, keyed by cell.
    pub outputs: BTreeMap<CellId, Option<Value>>,
    /// Cells skipped because an ancestor stopped.
    pub cancelled: BTreeMap<CellId, Interruption>,
}

/// Runs every enabled cell once, in topological order, failing fast.
///
/// Disabled cells (and cells below them) are skipped. A structural fault
/// or a cell failure aborts the run with [`Error::CellFailed`]; a stop
/// signal only skips the stopped cell's descendants.
pub struct ScriptRunner<'g> {
    graph: &'g DependencyGraph,
    strategy: &'g dyn ExecutionStrategy,
}

impl<'g> ScriptRunner<'g> {
    pub fn new(graph: &'g DependencyGraph) -> Self {
        Self::with_strategy(graph, &Direct)
    }

    pub fn with_strategy(graph: &'g DependencyGraph, strategy: &'g dyn ExecutionStrategy) -> Self {
        Self { graph, strategy }
    }

    /// Cells to run, in order. Fails on the first structural fault.
    fn order(&self) -> Result<Vec<CellId>> {
        let faults = self.graph.structural_faults();
        let mut enabled = Vec::new();
        for cell in self.graph.cells() {
            let id = cell.id();
            if self.graph.is_disabled(id) {
                tracing::debug!("skipping disabled {}", id);
                continue;
            }
            if let Some(fault) = faults.get(&id).and_then(|f| f.first()) {
                return Err(Error::CellFailed {
                    cell_id: id,
                    fault: fault.clone(),
                });
            }
            enabled.push(id);
        }
        Ok(self.graph.topological_sort(&enabled))
    }

    /// Run on the calling thread. Suspending cells are driven to completion
    /// in place.
    pub fn run(&self) -> Result<ScriptReport> {
        let order = self.order()?;
        tracing::info!("running script: {} cells", order.len());
        let abort = AbortHandle::new();
        let mut report = ScriptReport::default();

        for id in order {
            if let Some(why) = self.skip(id, &report) {
                report.cancelled.insert(id, why);
                continue;
            }
            let cell = self.graph.get(id)?;
            let record = if cell.requires_suspension() {
                futures::executor::block_on(self.strategy.execute_suspending(
                    cell,
                    &mut report.namespace,
                    self.graph,
                    &abort,
                ))
            } else {
                self.strategy
                    .execute(cell, &mut report.namespace, self.graph, &abort)
            };
            self.absorb(record, &mut report)?;
        }
        Ok(report)
    }

    /// Run through the suspending entry point.
    pub async fn run_async(&self) -> Result<ScriptReport> {
        let order = self.order()?;
        tracing::info!("running script: {} cells (suspending)", order.len());
        let abort = AbortHandle::new();
        let mut report = ScriptReport::default();

        for id in order {
            if let Some(why) = self.skip(id, &report) {
                report.cancelled.insert(id, why);
                continue;
            }
            let cell = self.graph.get(id)?;
            let record = self
                .strategy
                .execute_suspending(cell, &mut report.namespace, self.graph, &abort)
                .await;
            self.absorb(record, &mut report)?;
        }
        Ok(report)
    }

    /// Interruption inherited from a stopped or cancelled parent.
    fn skip(&self, id: CellId, report: &ScriptReport) -> Option<Interruption> {
        self.graph
            .parents_of(id)
            .iter()
            .find_map(|p| report.cancelled.get(p).copied())
    }

    fn absorb(&self, record: ExecutionRecord, report: &mut ScriptReport) -> Result<()> {
        let id = record.cell_id;
        match record.outcome {
            Outcome::Success => {
                report.outputs.insert(id, record.output);
                Ok(())
            }
            Outcome::Stopped => {
                tracing::info!("{} stopped; skipping its descendants", id);
                report.outputs.insert(id, record.output);
                for child in self.graph.children_of(id) {
                    report.cancelled.insert(*child, Interruption::Stopped { by: id });
                }
                Ok(())
            }
            Outcome::Faulted(fault) => Err(Error::CellFailed { cell_id: id, fault }),
            Outcome::Cancelled(why) => {
                report.cancelled.insert(id, why);
                Ok(())
            }
        }
    }
}
