//! The execution strategy contract and the sequential batch driver.

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use rustc_hash::FxHashMap;

use super::context::{AbortHandle, CellError, ExecutionCallback, Scope};
use super::record::{ExecutionRecord, Outcome};
use crate::graph::{BodyResult, Cell, CellBody, CellId, CellStatus, DependencyGraph, Fault, Interruption};
use crate::state::Namespace;

/// A discipline for running one cell against a namespace.
///
/// Running a cell is split into [`prepare`](Self::prepare), which builds the
/// cell's [`Scope`] from the namespace, the body itself, and
/// [`commit`](Self::commit), which writes the cell's declared definitions
/// back. On success exactly those definitions are bound and nothing else.
pub trait ExecutionStrategy: Send + Sync {
    /// Strategy name for logging.
    fn name(&self) -> &'static str;

    /// Build the scope the cell body runs against.
    fn prepare(&self, cell: &Cell, namespace: &Namespace, graph: &DependencyGraph) -> Result<Scope, Fault>;

    /// Copy the cell's declared definitions from `scope` into `namespace`.
    ///
    /// A definition the body did not bind this run is removed, so no reader
    /// observes a value from an earlier run.
    fn commit(&self, cell: &Cell, scope: Scope, namespace: &mut Namespace) {
        for name in cell.defs() {
            match scope.bound(name) {
                Some(value) => {
                    namespace.insert(name.clone(), value.clone());
                }
                None => {
                    namespace.remove(name);
                }
            }
        }
        for name in cell.deleted_refs() {
            if scope.was_deleted(name) {
                namespace.remove(name);
            }
        }
    }

    /// Run one cell through the blocking entry point.
    ///
    /// Cells that require suspension fault with [`Fault::RequiresSuspension`].
    fn execute(&self, cell: &Cell, namespace: &mut Namespace, graph: &DependencyGraph, abort: &AbortHandle) -> ExecutionRecord {
        execute_blocking_with(self, cell, namespace, graph, abort)
    }

    /// Run one cell through the suspending entry point. Accepts every cell.
    fn execute_suspending<'a>(
        &'a self,
        cell: &'a Cell,
        namespace: &'a mut Namespace,
        graph: &'a DependencyGraph,
        abort: &'a AbortHandle,
    ) -> BoxFuture<'a, ExecutionRecord> {
        execute_suspending_with(self, cell, namespace, graph, abort).boxed()
    }

    /// Run `order` (already topologically sorted) one cell at a time.
    ///
    /// A faulted or stopped cell cancels its descendants for the rest of the
    /// batch. Once `abort` is raised, every cell not yet started is cancelled.
    /// Returns one record per cell in `order`.
    fn run_batch(
        &self,
        order: &[CellId],
        graph: &DependencyGraph,
        namespace: &mut Namespace,
        observer: &dyn ExecutionCallback,
        abort: &AbortHandle,
    ) -> Vec<ExecutionRecord> {
        let mut skipped = FxHashMap::default();
        let mut records = Vec::with_capacity(order.len());
        for &id in order {
            let Some(cell) = graph.cell(id) else {
                continue;
            };
            if let Some(why) = interruption_for(id, &skipped, abort) {
                records.push(cancel(cell, why, observer));
                continue;
            }
            start(cell, observer);
            let record = self.execute(cell, namespace, graph, abort);
            settle(cell, &record, graph, observer, &mut skipped);
            records.push(record);
        }
        records
    }

    /// Suspending counterpart of [`run_batch`](Self::run_batch).
    fn run_batch_suspending<'a>(
        &'a self,
        order: &'a [CellId],
        graph: &'a DependencyGraph,
        namespace: &'a mut Namespace,
        observer: &'a dyn ExecutionCallback,
        abort: &'a AbortHandle,
    ) -> BoxFuture<'a, Vec<ExecutionRecord>> {
        async move {
            let mut skipped = FxHashMap::default();
            let mut records = Vec::with_capacity(order.len());
            for &id in order {
                let Some(cell) = graph.cell(id) else {
                    continue;
                };
                if let Some(why) = interruption_for(id, &skipped, abort) {
                    records.push(cancel(cell, why, observer));
                    continue;
                }
                start(cell, observer);
                let record = self.execute_suspending(cell, namespace, graph, abort).await;
                settle(cell, &record, graph, observer, &mut skipped);
                records.push(record);
            }
            records
        }
        .boxed()
    }
}

fn interruption_for(
    id: CellId,
    skipped: &FxHashMap<CellId, Interruption>,
    abort: &AbortHandle,
) -> Option<Interruption> {
    skipped
        .get(&id)
        .copied()
        .or_else(|| abort.is_aborted().then_some(Interruption::Aborted))
}

pub(crate) fn start(cell: &Cell, observer: &dyn ExecutionCallback) {
    cell.set_status(CellStatus::Running);
    observer.on_cell_started(cell.id());
}

pub(crate) fn cancel(cell: &Cell, why: Interruption, observer: &dyn ExecutionCallback) -> ExecutionRecord {
    tracing::debug!("skipping {}: {}", cell.id(), why);
    cell.set_status(CellStatus::Cancelled);
    observer.on_cell_cancelled(cell.id(), why);
    ExecutionRecord::cancelled(cell.id(), why)
}

/// Publish a finished record and mark descendants the record interrupts.
fn settle(
    cell: &Cell,
    record: &ExecutionRecord,
    graph: &DependencyGraph,
    observer: &dyn ExecutionCallback,
    skipped: &mut FxHashMap<CellId, Interruption>,
) {
    notify(cell, record, observer);
    if let Some(why) = record.interruption() {
        for descendant in graph.descendants(cell.id()) {
            skipped.entry(descendant).or_insert(why);
        }
    }
}

pub(crate) fn notify(cell: &Cell, record: &ExecutionRecord, observer: &dyn ExecutionCallback) {
    match &record.outcome {
        Outcome::Success | Outcome::Stopped => {
            cell.set_status(CellStatus::Idle);
            observer.on_cell_completed(cell.id(), record.output.as_ref());
        }
        Outcome::Faulted(fault) => {
            cell.set_status(CellStatus::Idle);
            observer.on_cell_faulted(cell.id(), fault);
        }
        Outcome::Cancelled(why) => {
            cell.set_status(CellStatus::Cancelled);
            observer.on_cell_cancelled(cell.id(), *why);
        }
    }
}

/// Prepare a scope for the blocking entry point.
pub(crate) fn begin<S: ExecutionStrategy + ?Sized>(
    strategy: &S,
    cell: &Cell,
    namespace: &Namespace,
    graph: &DependencyGraph,
    abort: &AbortHandle,
) -> Result<Scope, Fault> {
    if cell.requires_suspension() {
        return Err(Fault::RequiresSuspension);
    }
    let mut scope = strategy.prepare(cell, namespace, graph)?;
    scope.attach_abort(abort);
    Ok(scope)
}

/// Run a blocking body. A panic is reported as a raised error.
pub(crate) fn run_blocking(cell: &Cell, scope: &mut Scope) -> BodyResult {
    match cell.body() {
        CellBody::Blocking(body) => std::panic::catch_unwind(AssertUnwindSafe(|| body(scope)))
            .unwrap_or_else(|panic| Err(CellError::raised(panic_message(panic.as_ref())))),
        CellBody::Suspending(_) => Err(CellError::raised("suspending body run on the blocking path")),
    }
}

/// Turn a body result into a record, committing the scope when the body
/// completed or stopped.
pub(crate) fn finish<S: ExecutionStrategy + ?Sized>(
    strategy: &S,
    cell: &Cell,
    scope: Scope,
    result: BodyResult,
    namespace: &mut Namespace,
    graph: &DependencyGraph,
    started: Instant,
) -> ExecutionRecord {
    let id = cell.id();
    match result {
        Ok(output) => {
            strategy.commit(cell, scope, namespace);
            ExecutionRecord::success(id, output, started.elapsed())
        }
        Err(CellError::Stop(output)) => {
            strategy.commit(cell, scope, namespace);
            tracing::debug!("{} raised a stop signal", id);
            ExecutionRecord::stopped(id, output, started.elapsed())
        }
        Err(error) => {
            let fault = classify(cell, error, graph);
            tracing::debug!("{} faulted under {}: {}", id, strategy.name(), fault);
            ExecutionRecord::faulted(id, fault, started.elapsed())
        }
    }
}

/// Map a body error to a fault.
///
/// An unresolved name some cell in the graph defines is a missing reference
/// (the definer has not run yet); any other unresolved name is undefined.
fn classify(cell: &Cell, error: CellError, graph: &DependencyGraph) -> Fault {
    match error {
        CellError::Unresolved(name) => {
            let definers: Vec<CellId> = graph
                .definers(&name)
                .iter()
                .copied()
                .filter(|&d| d != cell.id())
                .collect();
            if definers.is_empty() {
                Fault::UndefinedName { name }
            } else {
                Fault::MissingReference { name, definers }
            }
        }
        CellError::DeleteNonlocal(name) => Fault::DeleteNonlocal {
            defined_by: graph.definers(&name).iter().copied().collect(),
            name,
        },
        CellError::Raised(message) => Fault::Exception { message },
        CellError::Stop(_) => Fault::Exception {
            message: "execution stopped".to_string(),
        },
    }
}

fn execute_blocking_with<S: ExecutionStrategy + ?Sized>(
    strategy: &S,
    cell: &Cell,
    namespace: &mut Namespace,
    graph: &DependencyGraph,
    abort: &AbortHandle,
) -> ExecutionRecord {
    let started = Instant::now();
    let mut scope = match begin(strategy, cell, namespace, graph, abort) {
        Ok(scope) => scope,
        Err(fault) => return ExecutionRecord::faulted(cell.id(), fault, started.elapsed()),
    };
    let result = run_blocking(cell, &mut scope);
    finish(strategy, cell, scope, result, namespace, graph, started)
}

async fn execute_suspending_with<S: ExecutionStrategy + ?Sized>(
    strategy: &S,
    cell: &Cell,
    namespace: &mut Namespace,
    graph: &DependencyGraph,
    abort: &AbortHandle,
) -> ExecutionRecord {
    let started = Instant::now();
    let mut scope = match strategy.prepare(cell, namespace, graph) {
        Ok(scope) => scope,
        Err(fault) => return ExecutionRecord::faulted(cell.id(), fault, started.elapsed()),
    };
    scope.attach_abort(abort);

    let (scope, result) = match cell.body() {
        CellBody::Blocking(_) => {
            let result = run_blocking(cell, &mut scope);
            (scope, result)
        }
        CellBody::Suspending(body) => {
            // The scope moves into the future; a panic loses it, so a
            // replacement scope stands in and nothing is committed.
            let fallback = Scope::for_cell(cell);
            match AssertUnwindSafe(body(scope)).catch_unwind().await {
                Ok(done) => done,
                Err(panic) => (fallback, Err(CellError::raised(panic_message(panic.as_ref())))),
            }
        }
    };
    finish(strategy, cell, scope, result, namespace, graph, started)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("cell panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("cell panicked: {s}")
    } else {
        "cell panicked".to_string()
    }
}
