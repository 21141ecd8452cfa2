//! Execution strategies for cells.
//!
//! # Strategies
//!
//! - **`Direct`** - Runs against the shared namespace values. Fast but no isolation.
//! - **`Isolated`** - Runs against deep copies of every value the cell can reach,
//!   so undeclared mutation of another cell's data never leaks.
//! - **`Concurrent`** - Runs independent cells of a batch in parallel on a rayon
//!   pool, delegating each cell to `Direct` or `Isolated`.
//!
//! # Architecture
//!
//! ```text
//! Cell + Namespace
//!     │
//!     └── ExecutionStrategy::prepare ──► Scope (the cell's inputs)
//!             │
//!             └── CellBody (blocking or suspending)
//!                     │
//!                     └── ExecutionStrategy::commit ──► declared defs into Namespace
//!                             │
//!                             └── ExecutionRecord
//! ```
//!
//! # Module Structure
//!
//! - `context` - Scope, cell errors, callbacks and cooperative cancellation
//! - `record` - ExecutionRecord and Outcome
//! - `strategy` - The ExecutionStrategy trait and sequential batch driver
//! - `direct`, `isolated`, `concurrent` - Strategy implementations

mod concurrent;
mod context;
mod direct;
mod isolated;
mod record;
mod strategy;

pub use concurrent::Concurrent;
pub use context::{AbortHandle, CellError, ExecutionCallback, NoopCallback, Scope};
pub use direct::Direct;
pub use isolated::Isolated;
pub use record::{ExecutionRecord, Outcome};
pub use strategy::ExecutionStrategy;
