//! Runtime state shared by cells.
//!
//! This module provides:
//! - Values with reference semantics for containers
//! - The evaluation namespace
//! - Per-kind deep duplication used by isolated execution

mod duplicate;
mod namespace;
mod value;

pub use duplicate::{DEFAULT_MAX_DEPTH, DuplicationError, DuplicationRegistry, Duplicator};
pub use namespace::Namespace;
pub use value::{Function, Object, ObjectData, Shared, Value, ValueKind};
