//! Execution context and callbacks for cells.
//!
//! Provides the scope a cell body runs against, the errors a body can raise,
//! progress reporting, and cooperative cancellation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::graph::{Cell, CellId, Fault, Interruption};
use crate::state::Value;

/// Interrupt flag shared by a controller, its strategies and running cells.
///
/// Raising the flag cancels every cell of the batch that has not started;
/// a running body sees it through [`Scope::is_aborted`]. The controller
/// lowers it again before each batch.
///
/// ```
/// use std::thread;
/// use rill_core::execute::AbortHandle;
///
/// let interrupt = AbortHandle::new();
/// let seen = interrupt.clone();
/// let worker = thread::spawn(move || {
///     let mut spins = 0_u64;
///     while !seen.is_aborted() {
///         spins += 1;
///         thread::yield_now();
///     }
///     spins
/// });
///
/// assert!(interrupt.abort());
/// assert!(!interrupt.abort(), "already raised");
/// worker.join().unwrap();
/// ```
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    raised: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the current batch was interrupted.
    pub fn is_aborted(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Raise the flag. Returns `false` if it was already raised.
    pub fn abort(&self) -> bool {
        !self.raised.swap(true, Ordering::AcqRel)
    }

    /// Lower the flag for the next batch.
    pub fn reset(&self) {
        self.raised.store(false, Ordering::Release);
    }
}

/// Callback trait for execution progress reporting.
///
/// Callbacks may be invoked from worker threads under concurrent execution.
pub trait ExecutionCallback: Send + Sync {
    /// Called when a cell starts executing.
    fn on_cell_started(&self, cell_id: CellId);

    /// Called when a cell completes successfully.
    fn on_cell_completed(&self, cell_id: CellId, output: Option<&Value>);

    /// Called when a cell faults.
    fn on_cell_faulted(&self, cell_id: CellId, fault: &Fault);

    /// Called when a cell is skipped for this batch.
    fn on_cell_cancelled(&self, _cell_id: CellId, _why: Interruption) {}
}

/// Callback that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallback;

impl ExecutionCallback for NoopCallback {
    fn on_cell_started(&self, _: CellId) {}
    fn on_cell_completed(&self, _: CellId, _: Option<&Value>) {}
    fn on_cell_faulted(&self, _: CellId, _: &Fault) {}
}

/// Outcome a cell body reports instead of a value.
#[derive(Debug, Clone, Error)]
pub enum CellError {
    /// The body read a name that is not in its scope.
    #[error("name '{0}' is not defined")]
    Unresolved(String),

    /// User-level stop signal; the optional value becomes the cell's output.
    #[error("execution stopped")]
    Stop(Option<Value>),

    /// The body deleted a name it does not own.
    #[error("cannot delete '{0}': it is not defined by this cell")]
    DeleteNonlocal(String),

    /// Any other exception raised by the body.
    #[error("{0}")]
    Raised(String),
}

impl CellError {
    pub fn raised(message: impl Into<String>) -> Self {
        CellError::Raised(message.into())
    }
}

/// A cell's private view of the namespace for one run.
///
/// Holds the values the strategy handed the cell as inputs plus every name
/// the body binds. Nothing reaches the shared namespace until the strategy
/// commits the scope, and then only the cell's declared definitions.
#[derive(Debug)]
pub struct Scope {
    cell_id: CellId,
    inputs: FxHashMap<String, Value>,
    locals: FxHashMap<String, Value>,
    deleted: BTreeSet<String>,
    /// Names the body may delete: its definitions and declared deletions
    deletable: BTreeSet<String>,
    abort: AbortHandle,
}

impl Scope {
    /// Empty scope for `cell`.
    pub fn for_cell(cell: &Cell) -> Self {
        Self {
            cell_id: cell.id(),
            inputs: FxHashMap::default(),
            locals: FxHashMap::default(),
            deleted: BTreeSet::new(),
            deletable: cell.defs().union(cell.deleted_refs()).cloned().collect(),
            abort: AbortHandle::new(),
        }
    }

    pub(crate) fn insert_input(&mut self, name: impl Into<String>, value: Value) {
        self.inputs.insert(name.into(), value);
    }

    pub(crate) fn attach_abort(&mut self, abort: &AbortHandle) {
        self.abort = abort.clone();
    }

    pub fn cell_id(&self) -> CellId {
        self.cell_id
    }

    /// Look up a name, locals first.
    ///
    /// Containers come back aliased: mutating the returned value mutates
    /// whatever the scope holds.
    pub fn get(&self, name: &str) -> Result<Value, CellError> {
        if self.deleted.contains(name) {
            return Err(CellError::Unresolved(name.to_string()));
        }
        self.locals
            .get(name)
            .or_else(|| self.inputs.get(name))
            .cloned()
            .ok_or_else(|| CellError::Unresolved(name.to_string()))
    }

    /// Bind a name in this scope.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        self.deleted.remove(&name);
        self.locals.insert(name, value.into());
    }

    /// Delete a name. Only the cell's definitions and declared deletions may be removed.
    pub fn delete(&mut self, name: &str) -> Result<(), CellError> {
        if !self.deletable.contains(name) {
            return Err(CellError::DeleteNonlocal(name.to_string()));
        }
        let had_local = self.locals.remove(name).is_some();
        let had_input = self.inputs.remove(name).is_some();
        if !had_local && !had_input {
            return Err(CellError::Unresolved(name.to_string()));
        }
        self.deleted.insert(name.to_string());
        Ok(())
    }

    /// Whether the host asked the current batch to stop.
    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Value the body bound to `name`, if any.
    pub(crate) fn bound(&self, name: &str) -> Option<&Value> {
        self.locals.get(name)
    }

    pub(crate) fn was_deleted(&self, name: &str) -> bool {
        self.deleted.contains(name)
    }
}
