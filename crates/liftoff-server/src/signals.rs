//! Named application signals.
//!
//! Routable modules connect handlers while routes are discovered. Once the
//! task runner is up the registry is frozen into [`Signals`]; emitting a
//! signal schedules every connected handler as deferred work under the
//! emitter's context.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use liftoff_core::{TaskError, TaskRunner};

/// A connected handler.
pub type SignalHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Collects handlers before the runner exists.
#[derive(Default)]
pub struct SignalRegistry {
    handlers: BTreeMap<String, Vec<SignalHandler>>,
}

impl SignalRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `handler` to `signal`.
    pub fn connect<F, Fut>(&mut self, signal: impl Into<String>, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let signal = signal.into();
        debug!(signal = %signal, "Signal handler connected");
        self.handlers
            .entry(signal)
            .or_default()
            .push(Arc::new(move |payload| Box::pin(handler(payload))));
    }

    /// Number of handlers connected to `signal`.
    pub fn handler_count(&self, signal: &str) -> usize {
        self.handlers.get(signal).map_or(0, Vec::len)
    }

    /// Freeze the registry and bind it to `runner`.
    pub fn bind(self, runner: TaskRunner) -> Signals {
        Signals {
            handlers: Arc::new(self.handlers),
            runner,
        }
    }
}

impl fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalRegistry")
            .field("signals", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Frozen signal table bound to the task runner.
#[derive(Clone)]
pub struct Signals {
    handlers: Arc<BTreeMap<String, Vec<SignalHandler>>>,
    runner: TaskRunner,
}

impl Signals {
    /// Schedule every handler of `signal` with `payload`.
    ///
    /// Returns how many handlers were scheduled; zero for an unknown signal.
    pub fn emit(&self, signal: &str, payload: serde_json::Value) -> Result<usize, TaskError> {
        let Some(handlers) = self.handlers.get(signal) else {
            debug!(signal, "Signal emitted without handlers");
            return Ok(0);
        };

        for handler in handlers {
            let handler = Arc::clone(handler);
            let payload = payload.clone();
            self.runner.schedule(move || handler(payload))?;
        }

        debug!(signal, handlers = handlers.len(), "Signal emitted");
        Ok(handlers.len())
    }

    /// Names of signals with at least one handler.
    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for Signals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signals")
            .field("signals", &self.names())
            .finish_non_exhaustive()
    }
}
