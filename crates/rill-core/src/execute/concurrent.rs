//! Concurrent executor.
//!
//! Runs independent cells of a batch in parallel on a bounded rayon pool.
//! Dependency order is kept with one coordination token per cell.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};

use super::context::{AbortHandle, ExecutionCallback, Scope};
use super::record::ExecutionRecord;
use super::strategy::{self, ExecutionStrategy};
use crate::error::Result;
use crate::graph::{Cell, CellId, DependencyGraph, Fault, Interruption};
use crate::state::Namespace;

/// Lock a mutex, recovering the data if a worker panicked while holding it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy)]
enum TokenState {
    Held,
    /// Released, carrying the interruption the holder imposes on its children.
    Released(Option<Interruption>),
}

/// Per-run coordination object: one exclusive token per cell in the batch.
///
/// Every token starts held. A worker releases its cell's token when the cell
/// finishes, however it finished; children blocked on it then wake up.
struct TokenTable {
    states: Mutex<FxHashMap<CellId, TokenState>>,
    released: Condvar,
}

impl TokenTable {
    fn new(cells: &[CellId]) -> Self {
        Self {
            states: Mutex::new(cells.iter().map(|&id| (id, TokenState::Held)).collect()),
            released: Condvar::new(),
        }
    }

    /// Block until every parent's token is released.
    ///
    /// Returns early with the first interruption a released parent carries.
    fn wait_for(&self, parents: &[CellId]) -> Option<Interruption> {
        let mut states = lock(&self.states);
        for parent in parents {
            loop {
                match states.get(parent) {
                    Some(TokenState::Held) => {
                        states = self
                            .released
                            .wait(states)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    Some(TokenState::Released(Some(why))) => return Some(*why),
                    Some(TokenState::Released(None)) | None => break,
                }
            }
        }
        None
    }

    fn release(&self, id: CellId, interruption: Option<Interruption>) {
        lock(&self.states).insert(id, TokenState::Released(interruption));
        self.released.notify_all();
    }
}

/// Runs cells in parallel while respecting dependency order.
///
/// Each cell runs through an inner [`Direct`](super::Direct) or
/// [`Isolated`](super::Isolated) strategy. Workers pull cells from a queue
/// in topological order and wait for every in-batch parent to release its
/// token first; a parent that faulted, stopped or was cancelled cancels its
/// children instead. The namespace is locked only while a cell's scope is
/// prepared and committed, never while its body runs.
///
/// Suspending batches run sequentially through the inner strategy.
pub struct Concurrent {
    inner: Box<dyn ExecutionStrategy>,
    pool: rayon::ThreadPool,
    workers: usize,
}

impl Concurrent {
    /// Create a concurrent strategy with `workers` threads (at least one).
    pub fn new(inner: impl ExecutionStrategy + 'static, workers: usize) -> Result<Self> {
        Self::from_boxed(Box::new(inner), workers)
    }

    pub fn from_boxed(inner: Box<dyn ExecutionStrategy>, workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("rill-worker-{i}"))
            .build()?;
        tracing::info!("concurrent execution with {} workers over {}", workers, inner.name());
        Ok(Self { inner, pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn inner(&self) -> &dyn ExecutionStrategy {
        self.inner.as_ref()
    }

    /// Run one cell once its parents have released their tokens.
    #[allow(clippy::too_many_arguments)]
    fn run_cell(
        &self,
        cell: &Cell,
        parents: &[CellId],
        tokens: &TokenTable,
        namespace: &Mutex<&mut Namespace>,
        graph: &DependencyGraph,
        observer: &dyn ExecutionCallback,
        abort: &AbortHandle,
    ) -> ExecutionRecord {
        if let Some(why) = tokens.wait_for(parents) {
            return strategy::cancel(cell, why, observer);
        }
        if abort.is_aborted() {
            return strategy::cancel(cell, Interruption::Aborted, observer);
        }

        strategy::start(cell, observer);
        let started = Instant::now();
        let inner = self.inner.as_ref();

        let prepared: std::result::Result<Scope, Fault> = {
            let ns = lock(namespace);
            strategy::begin(inner, cell, &**ns, graph, abort)
        };
        let record = match prepared {
            Ok(mut scope) => {
                let result = strategy::run_blocking(cell, &mut scope);
                let mut ns = lock(namespace);
                strategy::finish(inner, cell, scope, result, &mut **ns, graph, started)
            }
            Err(fault) => ExecutionRecord::faulted(cell.id(), fault, started.elapsed()),
        };
        strategy::notify(cell, &record, observer);
        record
    }
}

impl ExecutionStrategy for Concurrent {
    fn name(&self) -> &'static str {
        "concurrent"
    }

    fn prepare(&self, cell: &Cell, namespace: &Namespace, graph: &DependencyGraph) -> std::result::Result<Scope, Fault> {
        self.inner.prepare(cell, namespace, graph)
    }

    fn commit(&self, cell: &Cell, scope: Scope, namespace: &mut Namespace) {
        self.inner.commit(cell, scope, namespace);
    }

    fn run_batch(
        &self,
        order: &[CellId],
        graph: &DependencyGraph,
        namespace: &mut Namespace,
        observer: &dyn ExecutionCallback,
        abort: &AbortHandle,
    ) -> Vec<ExecutionRecord> {
        let order: Vec<CellId> = order.iter().copied().filter(|&id| graph.contains(id)).collect();
        if order.is_empty() {
            return Vec::new();
        }

        // Only parents earlier in the order are waited on, so a worker never
        // blocks on a cell no worker has dequeued yet
        let mut seen = FxHashSet::default();
        let mut parents: FxHashMap<CellId, Vec<CellId>> = FxHashMap::default();
        for &id in &order {
            let earlier = graph
                .parents_of(id)
                .iter()
                .copied()
                .filter(|p| seen.contains(p))
                .collect();
            parents.insert(id, earlier);
            seen.insert(id);
        }

        let tokens = TokenTable::new(&order);
        let queue = Mutex::new(order.iter().copied().collect::<VecDeque<_>>());
        let namespace = Mutex::new(namespace);
        let finished: Mutex<FxHashMap<CellId, ExecutionRecord>> = Mutex::new(FxHashMap::default());

        tracing::debug!("running {} cells on {} workers", order.len(), self.workers);

        self.pool.scope(|s| {
            for _ in 0..self.workers.min(order.len()) {
                s.spawn(|_| {
                    loop {
                        let Some(id) = lock(&queue).pop_front() else {
                            break;
                        };
                        let Some(cell) = graph.cell(id) else {
                            tokens.release(id, None);
                            continue;
                        };
                        let waits = parents.get(&id).map(Vec::as_slice).unwrap_or_default();
                        let record =
                            self.run_cell(cell, waits, &tokens, &namespace, graph, observer, abort);
                        tokens.release(id, record.interruption());
                        lock(&finished).insert(id, record);
                    }
                });
            }
        });

        let mut finished = finished.into_inner().unwrap_or_else(PoisonError::into_inner);
        order.iter().filter_map(|id| finished.remove(id)).collect()
    }
}
