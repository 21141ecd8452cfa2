//! Cell records.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::fault::{Fault, Interruption};
use crate::execute::{CellError, Scope};
use crate::state::Value;

/// Unique, stable identifier for a cell.
///
/// An edited cell keeps its id; a replaced cell gets a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId(Uuid);

impl CellId {
    /// Generate a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CellId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        write!(f, "cell_{}", &simple[..8])
    }
}

/// Runtime status of a registered cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CellStatus {
    Idle,
    Queued,
    Running,
    /// Blocked because some ancestor is disabled by the user.
    DisabledTransitively,
    /// Skipped in the last batch (see [`Cell::interruption`]).
    Cancelled,
}

impl CellStatus {
    fn to_u8(self) -> u8 {
        match self {
            CellStatus::Idle => 0,
            CellStatus::Queued => 1,
            CellStatus::Running => 2,
            CellStatus::DisabledTransitively => 3,
            CellStatus::Cancelled => 4,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => CellStatus::Queued,
            2 => CellStatus::Running,
            3 => CellStatus::DisabledTransitively,
            4 => CellStatus::Cancelled,
            _ => CellStatus::Idle,
        }
    }
}

/// Status storage that execution threads can update through `&Cell`.
#[derive(Debug)]
struct StatusSlot(AtomicU8);

impl StatusSlot {
    fn new(status: CellStatus) -> Self {
        Self(AtomicU8::new(status.to_u8()))
    }

    fn load(&self) -> CellStatus {
        CellStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, status: CellStatus) {
        self.0.store(status.to_u8(), Ordering::Release);
    }
}

/// Result of running a cell body: the trailing expression's value, if any.
pub type BodyResult = std::result::Result<Option<Value>, CellError>;

type BlockingFn = dyn Fn(&mut Scope) -> BodyResult + Send + Sync;
type SuspendingFn = dyn Fn(Scope) -> BoxFuture<'static, (Scope, BodyResult)> + Send + Sync;

/// Compiled body of a cell.
#[derive(Clone)]
pub enum CellBody {
    /// Runs to completion on the calling thread.
    Blocking(Arc<BlockingFn>),
    /// May suspend cooperatively; only runs under the suspending entry point.
    /// The scope is moved into the future and handed back with the result.
    Suspending(Arc<SuspendingFn>),
}

impl CellBody {
    pub fn blocking(body: impl Fn(&mut Scope) -> BodyResult + Send + Sync + 'static) -> Self {
        CellBody::Blocking(Arc::new(body))
    }

    pub fn suspending<F, Fut>(body: F) -> Self
    where
        F: Fn(Scope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = (Scope, BodyResult)> + Send + 'static,
    {
        CellBody::Suspending(Arc::new(move |scope| body(scope).boxed()))
    }

    /// Body that does nothing and has no output.
    pub fn empty() -> Self {
        CellBody::blocking(|_| Ok(None))
    }
}

impl fmt::Debug for CellBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellBody::Blocking(_) => write!(f, "CellBody::Blocking"),
            CellBody::Suspending(_) => write!(f, "CellBody::Suspending"),
        }
    }
}

/// A unit of code with declared inputs and outputs.
///
/// Produced by the compiler; once registered, its runtime fields are owned
/// by the [`DependencyGraph`](super::DependencyGraph).
#[derive(Debug)]
pub struct Cell {
    id: CellId,
    code: String,
    defs: BTreeSet<String>,
    refs: BTreeSet<String>,
    deleted_refs: BTreeSet<String>,
    /// For each defined name, the free names its value was computed from.
    name_deps: BTreeMap<String, BTreeSet<String>>,
    body: CellBody,

    status: StatusSlot,
    user_disabled: bool,
    stale: bool,
    output: Option<Value>,
    faults: Vec<Fault>,
    interruption: Option<Interruption>,
}

impl Cell {
    pub fn new(id: CellId, code: impl Into<String>, body: CellBody) -> Self {
        Self {
            id,
            code: code.into(),
            defs: BTreeSet::new(),
            refs: BTreeSet::new(),
            deleted_refs: BTreeSet::new(),
            name_deps: BTreeMap::new(),
            body,
            status: StatusSlot::new(CellStatus::Idle),
            user_disabled: false,
            stale: false,
            output: None,
            faults: Vec::new(),
            interruption: None,
        }
    }

    /// Declare names this cell defines.
    pub fn defines<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.defs.extend(names.into_iter().map(Into::into));
        self
    }

    /// Declare names this cell reads without defining them.
    pub fn references<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.refs.extend(names.into_iter().map(Into::into));
        self
    }

    /// Declare names this cell deletes. A deletion also counts as a reference.
    pub fn deletes<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        for name in names {
            let name = name.into();
            self.refs.insert(name.clone());
            self.deleted_refs.insert(name);
        }
        self
    }

    /// Record the free names the value of `name` depends on.
    pub fn with_name_deps<S: Into<String>>(
        mut self,
        name: impl Into<String>,
        deps: impl IntoIterator<Item = S>,
    ) -> Self {
        self.name_deps
            .entry(name.into())
            .or_default()
            .extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn defs(&self) -> &BTreeSet<String> {
        &self.defs
    }

    pub fn refs(&self) -> &BTreeSet<String> {
        &self.refs
    }

    pub fn deleted_refs(&self) -> &BTreeSet<String> {
        &self.deleted_refs
    }

    pub fn name_deps(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.name_deps
    }

    pub fn body(&self) -> &CellBody {
        &self.body
    }

    /// Whether the body only runs under the suspending calling convention.
    pub fn requires_suspension(&self) -> bool {
        matches!(self.body, CellBody::Suspending(_))
    }

    pub fn status(&self) -> CellStatus {
        self.status.load()
    }

    pub fn is_user_disabled(&self) -> bool {
        self.user_disabled
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Output of the last successful run.
    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    pub fn faults(&self) -> &[Fault] {
        &self.faults
    }

    pub fn interruption(&self) -> Option<Interruption> {
        self.interruption
    }

    /// Status updates go through an atomic so a running strategy can
    /// publish them while the graph is shared read-only.
    pub(crate) fn set_status(&self, status: CellStatus) {
        self.status.store(status);
    }

    pub(crate) fn set_user_disabled(&mut self, disabled: bool) {
        self.user_disabled = disabled;
    }

    pub(crate) fn set_stale(&mut self, stale: bool) {
        self.stale = stale;
    }

    pub(crate) fn set_output(&mut self, output: Option<Value>) {
        self.output = output;
    }

    pub(crate) fn set_faults(&mut self, faults: Vec<Fault>) {
        self.faults = faults;
    }

    pub(crate) fn set_interruption(&mut self, interruption: Option<Interruption>) {
        self.interruption = interruption;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let cell = Cell::new(CellId::new(), "del y; x = y + z", CellBody::empty())
            .defines(["x"])
            .references(["z"])
            .deletes(["y"])
            .with_name_deps("x", ["y", "z"]);

        assert!(cell.defs().contains("x"));
        assert!(cell.refs().contains("y"));
        assert!(cell.refs().contains("z"));
        assert!(cell.deleted_refs().contains("y"));
        assert_eq!(cell.name_deps()["x"].len(), 2);
        assert_eq!(cell.status(), CellStatus::Idle);
        assert!(!cell.requires_suspension());
    }

    #[test]
    fn test_suspending_body() {
        let cell = Cell::new(
            CellId::new(),
            "await f()",
            CellBody::suspending(|scope| async move { (scope, Ok(None)) }),
        );
        assert!(cell.requires_suspension());
    }

    #[test]
    fn test_status_slot() {
        let cell = Cell::new(CellId::new(), "", CellBody::empty());
        for status in [
            CellStatus::Queued,
            CellStatus::Running,
            CellStatus::DisabledTransitively,
            CellStatus::Cancelled,
            CellStatus::Idle,
        ] {
            cell.set_status(status);
            assert_eq!(cell.status(), status);
        }
    }

    #[test]
    fn test_display_is_short() {
        let id = CellId::new();
        assert_eq!(id.to_string().len(), "cell_".len() + 8);
    }
}
