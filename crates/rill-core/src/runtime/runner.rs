//! Pull-based runner: evaluate one cell on demand.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::execute::{AbortHandle, Direct, ExecutionRecord, ExecutionStrategy, Outcome};
use crate::graph::{CellId, DependencyGraph};
use crate::state::{Namespace, Value};

/// Result of pulling a cell.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    /// The cell's trailing expression value.
    pub output: Option<Value>,
    /// Every name the cell defined.
    pub defs: BTreeMap<String, Value>,
}

/// Runs a cell together with just the ancestors its inputs need.
///
/// Never touches the controller's namespace or cell state: each run starts
/// from an empty namespace. Callers may substitute values for some of the
/// cell's references, in which case the cells defining them are skipped.
pub struct Runner<'g> {
    graph: &'g DependencyGraph,
    strategy: &'g dyn ExecutionStrategy,
}

impl<'g> Runner<'g> {
    pub fn new(graph: &'g DependencyGraph) -> Self {
        Self::with_strategy(graph, &Direct)
    }

    pub fn with_strategy(graph: &'g DependencyGraph, strategy: &'g dyn ExecutionStrategy) -> Self {
        Self { graph, strategy }
    }

    /// Ancestors needed to run `id` given `substitutions`, in execution order.
    ///
    /// Only definers of names not substituted are followed.
    pub fn plan(&self, id: CellId, substitutions: &BTreeMap<String, Value>) -> Result<Vec<CellId>> {
        let cell = self.graph.get(id)?;
        for name in substitutions.keys() {
            if !cell.refs().contains(name) {
                return Err(Error::InvalidSubstitution {
                    cell_id: id,
                    name: name.clone(),
                });
            }
        }

        let mut needed = BTreeSet::new();
        let mut pending: Vec<String> = cell
            .refs()
            .iter()
            .filter(|name| !substitutions.contains_key(*name))
            .cloned()
            .collect();
        let mut seen_names: BTreeSet<String> = pending.iter().cloned().collect();

        while let Some(name) = pending.pop() {
            for &definer in self.graph.definers(&name) {
                if definer == id || !needed.insert(definer) {
                    continue;
                }
                let Some(parent) = self.graph.cell(definer) else {
                    continue;
                };
                for reference in parent.refs() {
                    if seen_names.insert(reference.clone()) {
                        pending.push(reference.clone());
                    }
                }
            }
        }

        Ok(self.graph.topological_sort(&needed))
    }

    /// Run `id` through the blocking entry point.
    ///
    /// Fails with [`Error::SuspensionRequired`] if the cell or a needed
    /// ancestor only runs under the suspending entry point.
    pub fn run(&self, id: CellId, substitutions: BTreeMap<String, Value>) -> Result<RunOutput> {
        let ancestors = self.plan(id, &substitutions)?;
        if let Some(&blocked) = ancestors
            .iter()
            .chain(std::iter::once(&id))
            .find(|&&c| self.graph.cell(c).is_some_and(|c| c.requires_suspension()))
        {
            return Err(Error::SuspensionRequired(blocked));
        }

        tracing::debug!("pulling {} with {} ancestors", id, ancestors.len());
        let abort = AbortHandle::new();
        let mut namespace = Namespace::new();
        for &ancestor in &ancestors {
            let cell = self.graph.get(ancestor)?;
            let record = self.strategy.execute(cell, &mut namespace, self.graph, &abort);
            check(&record)?;
        }
        namespace.extend(substitutions);

        let cell = self.graph.get(id)?;
        let record = self.strategy.execute(cell, &mut namespace, self.graph, &abort);
        check(&record)?;
        Ok(collect(record, cell.defs(), &namespace))
    }

    /// Run `id` through the suspending entry point.
    pub async fn run_suspending(&self, id: CellId, substitutions: BTreeMap<String, Value>) -> Result<RunOutput> {
        let ancestors = self.plan(id, &substitutions)?;
        tracing::debug!("pulling {} with {} ancestors (suspending)", id, ancestors.len());
        let abort = AbortHandle::new();
        let mut namespace = Namespace::new();
        for &ancestor in &ancestors {
            let cell = self.graph.get(ancestor)?;
            let record = self
                .strategy
                .execute_suspending(cell, &mut namespace, self.graph, &abort)
                .await;
            check(&record)?;
        }
        namespace.extend(substitutions);

        let cell = self.graph.get(id)?;
        let record = self
            .strategy
            .execute_suspending(cell, &mut namespace, self.graph, &abort)
            .await;
        check(&record)?;
        Ok(collect(record, cell.defs(), &namespace))
    }
}

fn check(record: &ExecutionRecord) -> Result<()> {
    match &record.outcome {
        Outcome::Success => Ok(()),
        Outcome::Faulted(fault) => Err(Error::CellFailed {
            cell_id: record.cell_id,
            fault: fault.clone(),
        }),
        Outcome::Stopped | Outcome::Cancelled(_) => Err(Error::Stopped(record.cell_id)),
    }
}

fn collect(record: ExecutionRecord, defs: &BTreeSet<String>, namespace: &Namespace) -> RunOutput {
    RunOutput {
        output: record.output,
        defs: defs
            .iter()
            .filter_map(|name| Some((name.clone(), namespace.get(name)?.clone())))
            .collect(),
    }
}
