//! Error types for rill-core.

use thiserror::Error;

use crate::graph::{CellId, Fault};

/// Result type for rill-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the engine's API.
///
/// Faults that belong to a single cell (conflicts, exceptions raised by the
/// cell body, ...) are recorded on the cell as [`Fault`]s instead. An
/// `Error` is only produced when the caller asked for something the engine
/// cannot do, or when a non-interactive runner propagates a cell failure.
#[derive(Debug, Error)]
pub enum Error {
    /// Cell not found.
    #[error("cell not found: {0}")]
    CellNotFound(CellId),

    /// A cell with this id is already registered.
    #[error("cell already registered: {0}")]
    DuplicateCell(CellId),

    /// A substituted name is not a reference of the target cell.
    #[error("cannot substitute '{name}': not a reference of {cell_id}")]
    InvalidSubstitution { cell_id: CellId, name: String },

    /// The cell (or an ancestor it needs) only runs under the suspending entry point.
    #[error("{0} requires the suspending calling convention")]
    SuspensionRequired(CellId),

    /// A cell failed while running non-interactively.
    #[error("{cell_id} failed: {fault}")]
    CellFailed { cell_id: CellId, fault: Fault },

    /// A cell raised a stop signal while its output was required.
    #[error("{0} stopped before producing its output")]
    Stopped(CellId),

    /// Execution infrastructure error (thread pool, poisoned lock, ...).
    #[error("execution error: {0}")]
    Execution(String),

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Render the error together with a recovery hint, if one applies.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Error::CellNotFound(_) => Some("the cell may have been deleted; re-submit it"),
            Error::DuplicateCell(_) => Some("delete the existing cell before registering it again"),
            Error::InvalidSubstitution { .. } => {
                Some("only names the cell reads but does not define can be substituted")
            }
            Error::SuspensionRequired(_) => Some("use the async entry point instead"),
            Error::CellFailed { fault, .. } if fault.is_transient() => {
                Some("run the defining cell first")
            }
            _ => None,
        };
        match hint {
            Some(hint) => format!("{self}\n  hint: {hint}"),
            None => self.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for Error {
    fn from(e: rayon::ThreadPoolBuildError) -> Self {
        Error::Execution(format!("failed to build worker pool: {e}"))
    }
}
