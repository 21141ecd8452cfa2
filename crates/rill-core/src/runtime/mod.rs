//! Controllers that decide what runs, and when.
//!
//! - `ReactiveController` - Push-based: applies a batch of edits and re-runs
//!   whatever they affect
//! - `Runner` - Pull-based: evaluates one cell with just the ancestors it needs
//! - `ScriptRunner` - Runs the whole notebook once, failing fast

mod batch;
mod controller;
mod runner;
mod script;

pub use batch::{Batch, BatchReport};
pub use controller::{ReactiveController, SharedGraph};
pub use runner::{RunOutput, Runner};
pub use script::{ScriptReport, ScriptRunner};
