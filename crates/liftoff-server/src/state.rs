//! Shared application state.
//!
//! [`AppContext`] is what exists once persistence and support services are
//! up; routable modules receive it while routes are discovered.
//! [`AppState`] adds the task runner, signals, hooks and mapper, and is the
//! axum state handed to every handler.

use std::sync::Arc;

use liftoff_common::{ConfigStore, Settings};
use liftoff_core::{ExecutionContext, PersistenceGateway, TaskRunner};
use liftoff_support::{CacheClient, SupportServices};

use crate::error_mapper::ErrorMapper;
use crate::lifecycle::RequestLifecycle;
use crate::registry::MountedRoute;
use crate::signals::Signals;

/// Components available to routable modules.
#[derive(Clone)]
pub struct AppContext {
    base: ExecutionContext,
    support: SupportServices,
}

impl AppContext {
    /// Create a context over an open pool.
    pub fn new(config: Arc<ConfigStore>, db: PersistenceGateway, support: SupportServices) -> Self {
        Self {
            base: ExecutionContext::new(config, db),
            support,
        }
    }

    /// Configuration store.
    pub fn config(&self) -> &ConfigStore {
        self.base.config()
    }

    /// Typed settings.
    pub fn settings(&self) -> &Settings {
        self.base.config().settings()
    }

    /// Connection pool handle.
    pub fn db(&self) -> &PersistenceGateway {
        self.base.db()
    }

    /// Support services.
    pub fn support(&self) -> &SupportServices {
        &self.support
    }

    /// Application cache.
    pub fn cache(&self) -> &CacheClient {
        &self.support.cache
    }

    /// Context not bound to any request.
    pub fn base_context(&self) -> &ExecutionContext {
        &self.base
    }

    /// Context for one request.
    pub fn execution_context(&self, request_id: &str) -> ExecutionContext {
        self.base.with_request_id(request_id)
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("profile", &self.config().profile())
            .field("support", &self.support)
            .finish_non_exhaustive()
    }
}

/// Shared state across all request handlers.
///
/// This struct is cloned for each request, so it uses `Arc` for shared data.
#[derive(Clone)]
pub struct AppState {
    context: Arc<AppContext>,
    tasks: TaskRunner,
    signals: Signals,
    lifecycle: Arc<RequestLifecycle>,
    errors: Arc<ErrorMapper>,
    routes: Arc<[MountedRoute]>,
}

impl AppState {
    /// Assemble the state from fully initialized parts.
    pub fn new(
        context: AppContext,
        tasks: TaskRunner,
        signals: Signals,
        lifecycle: RequestLifecycle,
        errors: ErrorMapper,
        routes: Vec<MountedRoute>,
    ) -> Self {
        Self {
            context: Arc::new(context),
            tasks,
            signals,
            lifecycle: Arc::new(lifecycle),
            errors: Arc::new(errors),
            routes: routes.into(),
        }
    }

    /// Components shared with routable modules.
    pub fn context(&self) -> &AppContext {
        &self.context
    }

    /// Deferred work runner.
    pub fn tasks(&self) -> &TaskRunner {
        &self.tasks
    }

    /// Signal table.
    pub fn signals(&self) -> &Signals {
        &self.signals
    }

    /// Request hooks.
    pub fn lifecycle(&self) -> &RequestLifecycle {
        &self.lifecycle
    }

    /// Fault mapping table.
    pub fn errors(&self) -> &ErrorMapper {
        &self.errors
    }

    /// Routes mounted during discovery.
    pub fn routes(&self) -> &[MountedRoute] {
        &self.routes
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("routes_count", &self.routes.len())
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}
