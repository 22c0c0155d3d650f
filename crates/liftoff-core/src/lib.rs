//! Runtime core for liftoff.
//!
//! This crate provides the pieces that live below the HTTP surface:
//! - [`PersistenceGateway`]: Pooled SQLite access with statement instrumentation
//! - [`Instrumentation`]: Observer chain fed one [`StatementEvent`] per statement
//! - [`ExecutionContext`]: Ambient snapshot restored around deferred work
//! - [`TaskRunner`]: Worker pool that runs units under their captured context
//!
//! # Architecture
//!
//! ```text
//! request scope ──schedule──▶ TaskRunner queue ──▶ worker
//!  (ExecutionContext)          (QueuedTask)         │
//!                                                   ▼
//!                                  ExecutionContext::scope(unit)
//!                                                   │
//!                                                   ▼
//!                          PersistenceGateway ─▶ Instrumentation ─▶ observers
//! ```

pub mod context;
pub mod instrument;
pub mod params;
pub mod persistence;
pub mod tasks;

pub use context::ExecutionContext;
pub use instrument::{
    Instrumentation, InstrumentationError, LogObserver, StatementStart, StatementEvent, StatementObserver,
    normalize_statement,
};
pub use params::{Param, Params, UnknownParameter};
pub use persistence::{PersistenceError, PersistenceGateway};
pub use tasks::{QueuedTask, TaskError, TaskId, TaskRunner, TaskStats, TaskUnit};
