//! Per-run execution records.

use std::time::Duration;

use serde::Serialize;

use crate::graph::{CellId, Fault, Interruption};
use crate::state::Value;

/// How one run of a cell ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Success,
    Faulted(Fault),
    /// The body raised a stop signal.
    Stopped,
    /// The cell did not run.
    Cancelled(Interruption),
}

/// Capture of a single cell run, absorbed into the cell afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub cell_id: CellId,
    pub outcome: Outcome,
    pub output: Option<Value>,
    pub duration: Duration,
}

impl ExecutionRecord {
    pub fn success(cell_id: CellId, output: Option<Value>, duration: Duration) -> Self {
        Self {
            cell_id,
            outcome: Outcome::Success,
            output,
            duration,
        }
    }

    pub fn faulted(cell_id: CellId, fault: Fault, duration: Duration) -> Self {
        Self {
            cell_id,
            outcome: Outcome::Faulted(fault),
            output: None,
            duration,
        }
    }

    pub fn stopped(cell_id: CellId, output: Option<Value>, duration: Duration) -> Self {
        Self {
            cell_id,
            outcome: Outcome::Stopped,
            output,
            duration,
        }
    }

    pub fn cancelled(cell_id: CellId, why: Interruption) -> Self {
        Self {
            cell_id,
            outcome: Outcome::Cancelled(why),
            output: None,
            duration: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success)
    }

    pub fn fault(&self) -> Option<&Fault> {
        match &self.outcome {
            Outcome::Faulted(fault) => Some(fault),
            _ => None,
        }
    }

    /// Interruption this record imposes on the cell's descendants, if any.
    pub fn interruption(&self) -> Option<Interruption> {
        match self.outcome {
            Outcome::Success => None,
            Outcome::Faulted(_) => Some(Interruption::AncestorFailed { by: self.cell_id }),
            Outcome::Stopped => Some(Interruption::Stopped { by: self.cell_id }),
            Outcome::Cancelled(why) => Some(why),
        }
    }
}
