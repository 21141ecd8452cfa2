//! Push-based reactive controller.
//!
//! Given a batch of changes, the controller updates the graph, works out the
//! minimal set of cells that must re-run, runs them in dependency order and
//! records the outcome on each cell.

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use super::batch::{Batch, BatchReport};
use crate::config::{EngineConfig, OnCellChange};
use crate::error::{Error, Result};
use crate::execute::{
    AbortHandle, ExecutionCallback, ExecutionRecord, ExecutionStrategy, NoopCallback, Outcome,
};
use crate::graph::{Cell, CellId, CellStatus, DependencyGraph, Fault, Interruption};
use crate::state::{Namespace, Value};

/// Graph handle shared with structural readers.
///
/// The inner `Arc` is the snapshot a running batch executes against.
pub type SharedGraph = Arc<RwLock<Arc<DependencyGraph>>>;

/// Helper to convert PoisonError to our Error type.
fn lock_error<T>(e: PoisonError<T>) -> Error {
    Error::Execution(format!("graph lock poisoned (a thread panicked): {e}"))
}

/// Mutable access to the graph. Fails while a snapshot is still alive.
fn exclusive(graph: &mut Arc<DependencyGraph>) -> Result<&mut DependencyGraph> {
    Arc::get_mut(graph)
        .ok_or_else(|| Error::Execution("graph snapshot still held outside the controller".into()))
}

/// Reactive controller owning the graph, the namespace and a strategy.
///
/// The graph is shared behind a lock so structural readers (diagnostics,
/// editor assists) can inspect it between and during runs. A run plans under
/// the write lock, executes against a snapshot taken without holding any
/// lock, and records results under the write lock again.
pub struct ReactiveController {
    graph: SharedGraph,
    namespace: Namespace,
    strategy: Box<dyn ExecutionStrategy>,
    config: EngineConfig,
    callback: Option<Arc<dyn ExecutionCallback>>,
    abort: AbortHandle,
}

impl ReactiveController {
    /// Create a controller using the strategy `config` selects.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let strategy = config.build_strategy()?;
        Ok(Self::with_strategy(config, strategy))
    }

    pub fn with_strategy(config: EngineConfig, strategy: Box<dyn ExecutionStrategy>) -> Self {
        tracing::info!(
            "reactive controller: {} execution, {:?} on change",
            strategy.name(),
            config.on_cell_change
        );
        Self {
            graph: Arc::new(RwLock::new(Arc::new(DependencyGraph::new()))),
            namespace: Namespace::new(),
            strategy,
            config,
            callback: None,
            abort: AbortHandle::new(),
        }
    }

    /// Set the execution callback.
    pub fn set_callback(&mut self, callback: impl ExecutionCallback + 'static) {
        self.callback = Some(Arc::new(callback));
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Switch between eager and lazy handling of descendants.
    pub fn set_on_cell_change(&mut self, mode: OnCellChange) {
        self.config.on_cell_change = mode;
    }

    /// Shared handle to the graph for structural readers.
    ///
    /// Readers must not keep a clone of the inner `Arc` past their read;
    /// applying the next batch needs it back exclusively.
    pub fn shared_graph(&self) -> SharedGraph {
        Arc::clone(&self.graph)
    }

    /// Read access to the graph.
    pub fn graph(&self) -> Result<RwLockReadGuard<'_, Arc<DependencyGraph>>> {
        self.graph.read().map_err(lock_error)
    }

    /// The graph a batch executes against, detached from the lock.
    fn snapshot(&self) -> Result<Arc<DependencyGraph>> {
        Ok(Arc::clone(&*self.graph()?))
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Current status of a cell.
    pub fn status(&self, id: CellId) -> Result<CellStatus> {
        Ok(self.graph()?.get(id)?.status())
    }

    /// Output of a cell's last run.
    pub fn output(&self, id: CellId) -> Result<Option<Value>> {
        Ok(self.graph()?.get(id)?.output().cloned())
    }

    /// Faults currently recorded on a cell.
    pub fn faults(&self, id: CellId) -> Result<Vec<Fault>> {
        Ok(self.graph()?.get(id)?.faults().to_vec())
    }

    pub fn is_stale(&self, id: CellId) -> Result<bool> {
        Ok(self.graph()?.get(id)?.is_stale())
    }

    /// Handle the host can use to interrupt a run from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Cancel every cell of the current run that has not started yet.
    pub fn interrupt(&self) {
        if self.abort.abort() {
            tracing::info!("interrupt requested");
        }
    }

    /// Drop every value in the namespace. Cells keep their outputs.
    pub fn teardown(&mut self) {
        tracing::info!("tearing down namespace ({} names)", self.namespace.len());
        self.namespace.clear();
    }

    /// Apply a batch and run whatever it affects.
    ///
    /// Batches containing suspending cells are driven to completion on the
    /// calling thread through the suspending entry point. From inside an
    /// async runtime use [`run_async`](Self::run_async) instead.
    pub fn run(&mut self, batch: Batch) -> Result<BatchReport> {
        self.abort.reset();
        let (order, changed) = self.plan(batch)?;
        let records = self.execute(&order)?;
        let mut report = self.absorb(changed, records)?;

        if let Some(roots) = self.heal_roots(&report)? {
            let (order, changed) = self.reschedule(&roots)?;
            let records = self.execute(&order)?;
            let healed = self.absorb(changed, records)?;
            report.merge(healed);
        }
        self.finish(report)
    }

    /// Like [`run`](Self::run), through the suspending entry point.
    pub async fn run_async(&mut self, batch: Batch) -> Result<BatchReport> {
        self.abort.reset();
        let (order, changed) = self.plan(batch)?;
        let records = self.execute_async(&order).await?;
        let mut report = self.absorb(changed, records)?;

        if let Some(roots) = self.heal_roots(&report)? {
            let (order, changed) = self.reschedule(&roots)?;
            let records = self.execute_async(&order).await?;
            let healed = self.absorb(changed, records)?;
            report.merge(healed);
        }
        self.finish(report)
    }

    /// Run every stale cell (and whatever depends on them).
    pub fn run_stale(&mut self) -> Result<BatchReport> {
        self.abort.reset();
        let stale = self.stale_roots()?;
        let (order, changed) = self.reschedule(&stale)?;
        let records = self.execute(&order)?;
        let report = self.absorb(changed, records)?;
        self.finish(report)
    }

    /// Like [`run_stale`](Self::run_stale), through the suspending entry point.
    pub async fn run_stale_async(&mut self) -> Result<BatchReport> {
        self.abort.reset();
        let stale = self.stale_roots()?;
        let (order, changed) = self.reschedule(&stale)?;
        let records = self.execute_async(&order).await?;
        let report = self.absorb(changed, records)?;
        self.finish(report)
    }

    /// Apply `batch` to the graph and pick the cells to run.
    fn plan(&mut self, batch: Batch) -> Result<(Vec<CellId>, BTreeSet<CellId>)> {
        let lazy = self.config.on_cell_change == OnCellChange::Lazy;
        let mut guard = self.graph.write().map_err(lock_error)?;
        let graph = exclusive(&mut guard)?;
        let roots = apply(graph, &mut self.namespace, batch)?;
        let mut changed = roots.changed;
        let order = schedule(
            graph,
            &mut self.namespace,
            &roots.direct,
            &roots.indirect,
            lazy,
            &mut changed,
        );
        Ok((order, changed))
    }

    fn stale_roots(&self) -> Result<BTreeSet<CellId>> {
        let graph = self.graph()?;
        Ok(graph
            .stale_cells()
            .into_iter()
            .filter(|&id| is_runnable(&graph, id))
            .collect())
    }

    /// Schedule `roots` and their descendants eagerly.
    fn reschedule(&mut self, roots: &BTreeSet<CellId>) -> Result<(Vec<CellId>, BTreeSet<CellId>)> {
        let mut guard = self.graph.write().map_err(lock_error)?;
        let graph = exclusive(&mut guard)?;
        let mut changed = BTreeSet::new();
        let order = schedule(
            graph,
            &mut self.namespace,
            roots,
            &BTreeSet::new(),
            false,
            &mut changed,
        );
        Ok((order, changed))
    }

    fn execute(&mut self, order: &[CellId]) -> Result<Vec<ExecutionRecord>> {
        if order.is_empty() {
            return Ok(Vec::new());
        }
        let graph = self.snapshot()?;
        let observer: &dyn ExecutionCallback = match &self.callback {
            Some(callback) => callback.as_ref(),
            None => &NoopCallback,
        };
        let suspends = order
            .iter()
            .any(|&id| graph.cell(id).is_some_and(Cell::requires_suspension));
        if suspends {
            tracing::info!(
                "running {} cells ({}, suspending on the calling thread)",
                order.len(),
                self.strategy.name()
            );
            return Ok(futures::executor::block_on(self.strategy.run_batch_suspending(
                order,
                &graph,
                &mut self.namespace,
                observer,
                &self.abort,
            )));
        }
        tracing::info!("running {} cells ({})", order.len(), self.strategy.name());
        Ok(self
            .strategy
            .run_batch(order, &graph, &mut self.namespace, observer, &self.abort))
    }

    async fn execute_async(&mut self, order: &[CellId]) -> Result<Vec<ExecutionRecord>> {
        if order.is_empty() {
            return Ok(Vec::new());
        }
        // No lock guard lives across the await
        let graph = self.snapshot()?;
        let observer: &dyn ExecutionCallback = match &self.callback {
            Some(callback) => callback.as_ref(),
            None => &NoopCallback,
        };
        tracing::info!("running {} cells ({}, suspending)", order.len(), self.strategy.name());
        Ok(self
            .strategy
            .run_batch_suspending(order, &graph, &mut self.namespace, observer, &self.abort)
            .await)
    }

    /// Record each outcome on its cell.
    fn absorb(&mut self, mut changed: BTreeSet<CellId>, records: Vec<ExecutionRecord>) -> Result<BatchReport> {
        let mut guard = self.graph.write().map_err(lock_error)?;
        let graph = exclusive(&mut guard)?;
        for record in &records {
            let id = record.cell_id;
            let Ok(cell) = graph.cell_mut(id) else {
                continue;
            };
            match &record.outcome {
                Outcome::Success => {
                    cell.set_output(record.output.clone());
                    cell.set_faults(Vec::new());
                    cell.set_interruption(None);
                    cell.set_stale(false);
                    cell.set_status(CellStatus::Idle);
                }
                Outcome::Stopped => {
                    cell.set_output(record.output.clone());
                    cell.set_faults(Vec::new());
                    cell.set_interruption(Some(Interruption::Stopped { by: id }));
                    cell.set_stale(false);
                    cell.set_status(CellStatus::Idle);
                }
                Outcome::Faulted(fault) => {
                    cell.set_output(None);
                    cell.set_faults(vec![fault.clone()]);
                    cell.set_interruption(None);
                    cell.set_stale(false);
                    cell.set_status(CellStatus::Idle);
                }
                Outcome::Cancelled(why) => {
                    cell.set_output(None);
                    cell.set_faults(Vec::new());
                    cell.set_interruption(Some(*why));
                    cell.set_stale(true);
                    cell.set_status(CellStatus::Cancelled);
                }
            }
            changed.insert(id);
        }
        Ok(BatchReport {
            changed,
            records,
            faults: Default::default(),
        })
    }

    /// Cells to re-run because they read a name whose definer did not run
    /// in this pass.
    fn heal_roots(&self, report: &BatchReport) -> Result<Option<BTreeSet<CellId>>> {
        if !self.config.self_heal {
            return Ok(None);
        }
        let graph = self.graph()?;
        let ran: BTreeSet<CellId> = report.executed().into_iter().collect();
        let mut roots = BTreeSet::new();
        for record in &report.records {
            let Some(Fault::MissingReference { definers, .. }) = record.fault() else {
                continue;
            };
            if definers.iter().any(|d| ran.contains(d)) {
                continue;
            }
            let runnable: Vec<CellId> = definers
                .iter()
                .copied()
                .filter(|&d| is_runnable(&graph, d))
                .collect();
            if runnable.is_empty() {
                continue;
            }
            roots.insert(record.cell_id);
            roots.extend(runnable);
        }
        if roots.is_empty() {
            return Ok(None);
        }
        tracing::debug!("self-healing {} cells", roots.len());
        Ok(Some(roots))
    }

    fn finish(&self, mut report: BatchReport) -> Result<BatchReport> {
        let graph = self.graph()?;
        report.faults = report
            .changed
            .iter()
            .filter_map(|&id| {
                let cell = graph.cell(id)?;
                (!cell.faults().is_empty()).then(|| (id, cell.faults().to_vec()))
            })
            .collect();
        tracing::debug!(
            "batch done: {} changed, {} records, {} faulted",
            report.changed.len(),
            report.records.len(),
            report.faults.len()
        );
        Ok(report)
    }
}

/// Where a batch starts running.
struct Roots {
    /// Cells the batch edited, or whose structural faults it resolved.
    direct: BTreeSet<CellId>,
    /// Cells whose inputs the batch changed without editing them.
    indirect: BTreeSet<CellId>,
    /// Every cell the batch touched.
    changed: BTreeSet<CellId>,
}

/// Apply the structural part of a batch to the graph and namespace.
///
/// Ids are checked against the membership the batch itself produces, so a
/// rejected batch leaves both untouched.
fn apply(graph: &mut DependencyGraph, namespace: &mut Namespace, batch: Batch) -> Result<Roots> {
    let mut live: BTreeSet<CellId> = graph.cells().iter().map(|c| c.id()).collect();
    for &id in &batch.deletes {
        if !live.remove(&id) {
            return Err(Error::CellNotFound(id));
        }
    }
    live.extend(batch.upserts.iter().map(|c| c.id()));
    for &id in batch.disable.iter().chain(&batch.enable) {
        if !live.contains(&id) {
            return Err(Error::CellNotFound(id));
        }
    }

    let mut roots = BTreeSet::new();
    let mut indirect = BTreeSet::new();
    let mut changed = BTreeSet::new();

    for id in batch.deletes {
        let (cell, children) = graph.delete(id)?;
        namespace.remove_all(cell.defs());
        indirect.extend(children);
        changed.insert(id);
    }

    for cell in batch.upserts {
        let id = cell.id();
        let defs = cell.defs().clone();
        if let Some((old, old_children)) = graph.replace(cell)? {
            namespace.remove_all(old.defs().difference(&defs));
            indirect.extend(old_children);
        }
        roots.insert(id);
        changed.insert(id);
    }

    for id in batch.disable {
        graph.disable(id)?;
        changed.insert(id);
        changed.extend(graph.descendants(id));
    }

    for id in batch.enable {
        indirect.extend(graph.enable(id)?);
        changed.insert(id);
        changed.extend(graph.descendants(id));
    }

    for (name, value) in batch.assignments {
        indirect.extend(
            graph
                .cells()
                .iter()
                .filter(|c| c.refs().contains(&name))
                .map(|c| c.id()),
        );
        namespace.insert(name, value);
    }

    // Recorded structural faults follow the graph: newly faulted cells are
    // withheld, cleared cells re-run
    let faults = graph.structural_faults();
    let ids: Vec<CellId> = graph.cells().iter().map(|c| c.id()).collect();
    for id in ids {
        let current = faults.get(&id).cloned().unwrap_or_default();
        let cell = graph.cell_mut(id)?;
        let recorded: Vec<Fault> = cell
            .faults()
            .iter()
            .filter(|f| f.is_structural())
            .cloned()
            .collect();
        if recorded == current {
            continue;
        }
        cell.set_faults(current);
        roots.insert(id);
        changed.insert(id);
    }

    roots.retain(|&id| graph.contains(id));
    indirect.retain(|&id| graph.contains(id) && !roots.contains(&id));
    tracing::debug!(
        "batch applied: {} direct, {} indirect, {} changed",
        roots.len(),
        indirect.len(),
        changed.len()
    );
    Ok(Roots {
        direct: roots,
        indirect,
        changed,
    })
}

/// Whether a cell may run: not disabled, and neither it nor an ancestor
/// carries a structural fault.
fn is_runnable(graph: &DependencyGraph, id: CellId) -> bool {
    let Some(cell) = graph.cell(id) else {
        return false;
    };
    if graph.is_disabled(id) || has_structural_fault(cell.faults()) {
        return false;
    }
    !graph
        .ancestors(id)
        .iter()
        .filter_map(|a| graph.cell(*a))
        .any(|a| has_structural_fault(a.faults()))
}

fn has_structural_fault(faults: &[Fault]) -> bool {
    faults.iter().any(Fault::is_structural)
}

/// Pick the cells to run, in topological order, and prepare them.
///
/// Affected cells that cannot run become stale and lose their definitions.
/// Under lazy handling only the `direct` roots run; every other affected cell
/// becomes stale. Cells to run are queued and their definitions invalidated.
fn schedule(
    graph: &mut DependencyGraph,
    namespace: &mut Namespace,
    direct: &BTreeSet<CellId>,
    indirect: &BTreeSet<CellId>,
    lazy: bool,
    changed: &mut BTreeSet<CellId>,
) -> Vec<CellId> {
    let mut affected: BTreeSet<CellId> = direct.union(indirect).copied().collect();
    for &root in direct.iter().chain(indirect) {
        affected.extend(graph.descendants(root));
    }

    let (runnable, blocked): (BTreeSet<CellId>, BTreeSet<CellId>) = {
        let view: &DependencyGraph = graph;
        affected.into_iter().partition(|&id| is_runnable(view, id))
    };

    for &id in &blocked {
        if let Some(cell) = graph.cell(id) {
            namespace.remove_all(cell.defs());
        }
    }
    graph.set_stale(&blocked, true);
    changed.extend(&blocked);

    let to_run: BTreeSet<CellId> = if lazy {
        let (now, later): (BTreeSet<CellId>, BTreeSet<CellId>) =
            runnable.into_iter().partition(|id| direct.contains(id));
        graph.set_stale(&later, true);
        changed.extend(&later);
        now
    } else {
        runnable
    };

    let order = graph.topological_sort(&to_run);
    for &id in &order {
        if let Some(cell) = graph.cell(id) {
            cell.set_status(CellStatus::Queued);
            namespace.remove_all(cell.defs());
        }
    }
    changed.extend(&order);
    tracing::debug!(
        "scheduled {} cells ({} blocked{})",
        order.len(),
        blocked.len(),
        if lazy { ", lazy" } else { "" }
    );
    order
}
