//! Faults recorded on cells.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use super::cell::CellId;

/// A directed edge: `(parent, child)`.
pub type Edge = (CellId, CellId);

fn join_ids(ids: &[CellId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_edges(edges: &[Edge]) -> String {
    let mut out = String::new();
    for (i, (from, to)) in edges.iter().enumerate() {
        if i == 0 {
            out.push_str(&from.to_string());
        }
        out.push_str(" → ");
        out.push_str(&to.to_string());
    }
    out
}

/// A fault attached to a cell.
///
/// Structural faults (multiple definitions, cycles, non-local deletes) come
/// from the shape of the graph and withhold the cell from execution until
/// resolved. The rest are produced by running the cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Fault {
    /// The same name is defined by two or more live cells.
    #[error("'{name}' is also defined by {}", join_ids(.others))]
    MultipleDefinition { name: String, others: Vec<CellId> },

    /// The cell participates in a dependency cycle.
    #[error("cyclic dependency: {}", join_edges(.edges))]
    Cycle { edges: Vec<Edge> },

    /// The cell deletes a name owned by another cell.
    #[error("'{name}' is deleted here but defined by {}", join_ids(.defined_by))]
    DeleteNonlocal { name: String, defined_by: Vec<CellId> },

    /// A name defined elsewhere in the graph had no value yet.
    #[error("'{name}' is defined by {} but has no value yet", join_ids(.definers))]
    MissingReference { name: String, definers: Vec<CellId> },

    /// A name no cell defines.
    #[error("name '{name}' is not defined")]
    UndefinedName { name: String },

    /// Isolated execution could not copy a referenced value.
    #[error("could not copy '{name}' for isolated execution: {reason}")]
    Duplication { name: String, reason: String },

    /// The cell body raised an error.
    #[error("{message}")]
    Exception { message: String },

    /// The cell was run through the blocking entry point but must suspend.
    #[error("cell requires the suspending calling convention")]
    RequiresSuspension,
}

impl Fault {
    /// Faults derived from graph structure rather than from running the cell.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Fault::MultipleDefinition { .. } | Fault::Cycle { .. } | Fault::DeleteNonlocal { .. }
        )
    }

    /// Faults that re-running after the definers may clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, Fault::MissingReference { .. })
    }
}

/// Why a cell was skipped instead of run. Not a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Interruption {
    /// An ancestor (or the cell itself) raised a stop signal.
    Stopped { by: CellId },
    /// An ancestor faulted in the same batch.
    AncestorFailed { by: CellId },
    /// The host interrupted the batch.
    Aborted,
}

impl fmt::Display for Interruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interruption::Stopped { by } => write!(f, "stopped by {by}"),
            Interruption::AncestorFailed { by } => write!(f, "ancestor {by} failed"),
            Interruption::Aborted => write!(f, "interrupted"),
        }
    }
}
