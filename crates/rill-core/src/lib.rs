//! Core engine for rill reactive notebooks.
//!
//! This crate provides:
//! - Dependency graph over cells with conflict and cycle detection
//! - Pluggable execution strategies (direct, isolated, concurrent)
//! - Push-based reactive controller with eager and lazy modes
//! - Pull-based and whole-notebook runners

pub mod config;
pub mod error;
pub mod execute;
pub mod graph;
pub mod runtime;
pub mod state;

pub use config::{EngineConfig, ExecutionMode, OnCellChange};
pub use error::{Error, Result};
pub use execute::{
    AbortHandle, CellError, Concurrent, Direct, ExecutionCallback, ExecutionRecord,
    ExecutionStrategy, Isolated, Outcome, Scope,
};
pub use graph::{Cell, CellBody, CellId, CellStatus, DependencyGraph, Fault, Interruption};
pub use runtime::{Batch, BatchReport, ReactiveController, RunOutput, Runner, ScriptReport, ScriptRunner};
pub use state::{DuplicationRegistry, Namespace, Value};
