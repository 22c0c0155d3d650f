//! Statement instrumentation.
//!
//! [`Instrumentation`] wraps every statement executed through the
//! [`PersistenceGateway`](crate::PersistenceGateway) with a `before`/`after`
//! pair and hands a [`StatementEvent`] to each registered
//! [`StatementObserver`]. Observers are purely observational: their errors
//! and panics are logged and swallowed.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;
use tracing::{debug, warn};

use crate::params::Params;

/// One executed statement, produced after execution and consumed immediately.
#[derive(Debug, Clone)]
pub struct StatementEvent {
    /// Wall-clock time the statement started.
    pub started_at: SystemTime,
    /// Time spent executing the statement.
    pub elapsed: Duration,
    /// Statement text with newlines collapsed to spaces.
    pub statement: String,
    /// Rendered parameter list.
    pub params: String,
    /// Whether the statement returned successfully.
    pub succeeded: bool,
}

impl StatementEvent {
    /// Elapsed cost in whole milliseconds.
    pub fn cost_ms(&self) -> u64 {
        u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Failure inside an observer. Never propagated to the statement's caller.
#[derive(Error, Debug)]
pub enum InstrumentationError {
    /// The observer reported a failure.
    #[error("Observer '{observer}' failed: {reason}")]
    Observer {
        /// Name of the failing observer.
        observer: String,
        /// Description of the failure.
        reason: String,
    },
}

impl InstrumentationError {
    /// Create a new `Observer` error.
    pub fn observer(observer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Observer {
            observer: observer.into(),
            reason: reason.into(),
        }
    }
}

/// Receives statement events.
pub trait StatementObserver: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Called before the statement is sent to the database.
    fn before(&self, _statement: &str, _params: &Params) -> Result<(), InstrumentationError> {
        Ok(())
    }

    /// Called once the statement has completed, successfully or not.
    fn after(&self, event: &StatementEvent) -> Result<(), InstrumentationError>;
}

/// Emits one debug line per statement.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl StatementObserver for LogObserver {
    fn name(&self) -> &str {
        "log"
    }

    fn after(&self, event: &StatementEvent) -> Result<(), InstrumentationError> {
        debug!(
            cost_ms = event.cost_ms(),
            sql = %event.statement,
            params = %event.params,
            ok = event.succeeded,
            "Statement executed"
        );
        Ok(())
    }
}

/// Start marker returned by [`Instrumentation::before`].
#[derive(Debug, Clone, Copy)]
pub struct StatementStart {
    started_at: SystemTime,
    clock: Instant,
}

/// Ordered set of statement observers.
#[derive(Clone, Default)]
pub struct Instrumentation {
    observers: Vec<Arc<dyn StatementObserver>>,
}

impl Instrumentation {
    /// Instrumentation without observers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Instrumentation that logs every statement.
    pub fn with_logging() -> Self {
        Self::new().with_observer(LogObserver)
    }

    /// Add an observer.
    pub fn with_observer(mut self, observer: impl StatementObserver + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Add a shared observer.
    pub fn add_observer(&mut self, observer: Arc<dyn StatementObserver>) {
        self.observers.push(observer);
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Stamp the start of a statement and notify observers.
    pub fn before(&self, statement: &str, params: &Params) -> StatementStart {
        for observer in &self.observers {
            guard(observer.name(), || observer.before(statement, params));
        }

        StatementStart {
            started_at: SystemTime::now(),
            clock: Instant::now(),
        }
    }

    /// Build the event for a finished statement and notify observers.
    pub fn after(&self, start: StatementStart, statement: &str, params: &Params, succeeded: bool) {
        let elapsed = start.clock.elapsed();

        if self.observers.is_empty() {
            return;
        }

        let event = StatementEvent {
            started_at: start.started_at,
            elapsed,
            statement: normalize_statement(statement),
            params: params.render(),
            succeeded,
        };

        for observer in &self.observers {
            guard(observer.name(), || observer.after(&event));
        }
    }
}

impl std::fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumentation")
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Collapse line breaks so a statement fits on one log line.
pub fn normalize_statement(statement: &str) -> String {
    statement.replace(['\r', '\n'], " ").trim().to_string()
}

fn guard(observer: &str, f: impl FnOnce() -> Result<(), InstrumentationError>) {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(observer, error = %e, "Instrumentation failed, statement unaffected"),
        Err(_) => warn!(observer, "Instrumentation observer panicked, statement unaffected"),
    }
}
