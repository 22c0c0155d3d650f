//! Ambient execution context.
//!
//! An [`ExecutionContext`] is an immutable snapshot of what code needs to
//! behave as if it ran inline with its caller: the configuration, the
//! connection pool and the originating request id. It is captured when work
//! is scheduled and restored, as a task-local, for exactly the duration of
//! the deferred call. The task-local scope is torn down on every exit path,
//! including panics, because it is tied to the lifetime of the wrapped future.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use liftoff_common::ConfigStore;

use crate::persistence::PersistenceGateway;

tokio::task_local! {
    static CURRENT: ExecutionContext;
}

/// Snapshot of ambient application state.
#[derive(Clone)]
pub struct ExecutionContext {
    config: Arc<ConfigStore>,
    db: PersistenceGateway,
    request_id: Option<Arc<str>>,
}

impl ExecutionContext {
    /// Create a context not bound to any request.
    pub fn new(config: Arc<ConfigStore>, db: PersistenceGateway) -> Self {
        Self {
            config,
            db,
            request_id: None,
        }
    }

    /// Derive a context for a specific request.
    pub fn with_request_id(&self, request_id: impl Into<String>) -> Self {
        Self {
            config: Arc::clone(&self.config),
            db: self.db.clone(),
            request_id: Some(Arc::from(request_id.into())),
        }
    }

    /// The configuration store.
    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    /// Shared handle to the configuration store.
    pub fn config_handle(&self) -> Arc<ConfigStore> {
        Arc::clone(&self.config)
    }

    /// The connection pool handle.
    pub fn db(&self) -> &PersistenceGateway {
        &self.db
    }

    /// Identifier of the request that produced this context.
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// The context restored for the running task, if any.
    pub fn current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// The running task's context, or `fallback` outside any scope.
    pub fn capture_or(fallback: &Self) -> Self {
        Self::current().unwrap_or_else(|| fallback.clone())
    }

    /// Run `future` with this context restored as the ambient one.
    pub fn scope<F>(self, future: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        CURRENT.scope(self, future)
    }

    /// Run a synchronous closure with this context restored.
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT.sync_scope(self, f)
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("profile", &self.config.profile())
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}
