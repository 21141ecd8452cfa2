//! Dependency graph over cells.
//!
//! This module provides:
//! - Cell records and their runtime status
//! - Dependency graph maintenance as cells come and go
//! - Topological ordering for execution
//! - Structural fault detection (multiple definitions, cycles, non-local deletes)

mod cell;
mod dependency;
mod fault;

pub use cell::{BodyResult, Cell, CellBody, CellId, CellStatus};
pub use dependency::DependencyGraph;
pub use fault::{Edge, Fault, Interruption};
