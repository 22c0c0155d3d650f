//! Startup sequence.
//!
//! [`Bootstrapper::initialize`] runs a fixed sequence of steps once:
//!
//! | Step          | Produces                                            |
//! |---------------|-----------------------------------------------------|
//! | `Config`      | immutable configuration store                       |
//! | `Logging`     | global tracing subscriber                           |
//! | `Handlers`    | error mapper and request hooks                      |
//! | `Persistence` | connected, instrumented pool                        |
//! | `Support`     | cache, rate limiter, optional error reporter        |
//! | `Routes`      | route table and signal handlers                     |
//! | `Tasks`       | task runner, bound signals, assembled router        |
//!
//! Any failure is fatal and stops the sequence; nothing is served from a
//! partially initialized process.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use thiserror::Error;
use tracing::{error, info};

use liftoff_common::{
    CONFIG_FILE_ENV, ConfigError, ConfigLoader, MODE_ENV, Profile, Settings, SupportError,
};
use liftoff_core::{
    Instrumentation, PersistenceError, PersistenceGateway, StatementObserver, TaskError,
    TaskRunner,
};
use liftoff_support::SupportServices;

use crate::api;
use crate::error_mapper::ErrorMapper;
use crate::lifecycle::{RequestLifecycle, rate_limit_hook};
use crate::registry::{Namespace, RegistryError, RouteRegistry};
use crate::router::build_router;
use crate::server::{ServerConfig, ServerError, serve};
use crate::signals::SignalRegistry;
use crate::state::{AppContext, AppState};
use crate::telemetry::{LoggerHandle, TelemetryError, init_logging};

/// One step of the startup sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BootStep {
    /// Load configuration.
    Config,
    /// Install logging.
    Logging,
    /// Register the error mapper and request hooks.
    Handlers,
    /// Open the connection pool.
    Persistence,
    /// Build cache, limiter and reporter.
    Support,
    /// Discover routes.
    Routes,
    /// Start the task runner and assemble the router.
    Tasks,
}

impl BootStep {
    /// Every step, in order.
    pub const ALL: [BootStep; 7] = [
        BootStep::Config,
        BootStep::Logging,
        BootStep::Handlers,
        BootStep::Persistence,
        BootStep::Support,
        BootStep::Routes,
        BootStep::Tasks,
    ];
}

impl fmt::Display for BootStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootStep::Config => "config",
            BootStep::Logging => "logging",
            BootStep::Handlers => "handlers",
            BootStep::Persistence => "persistence",
            BootStep::Support => "support",
            BootStep::Routes => "routes",
            BootStep::Tasks => "tasks",
        };
        f.write_str(name)
    }
}

/// Fatal startup errors.
#[derive(Error, Debug)]
pub enum StartupFault {
    /// Configuration could not be loaded.
    #[error("Configuration failed: {0}")]
    Config(#[from] ConfigError),

    /// Logging could not be installed.
    #[error("Logging setup failed: {0}")]
    Logging(#[from] TelemetryError),

    /// The connection pool could not be opened.
    #[error("Persistence setup failed: {0}")]
    Persistence(#[from] PersistenceError),

    /// A support service is misconfigured.
    #[error("Support services failed: {0}")]
    Support(#[from] SupportError),

    /// Route discovery failed.
    #[error("Route discovery failed: {0}")]
    Routes(#[from] RegistryError),

    /// The task runner could not start.
    #[error("Task runner failed: {0}")]
    Tasks(#[from] TaskError),

    /// The sequence already ran on this bootstrapper.
    #[error("Application is already initialized")]
    AlreadyInitialized,
}

impl StartupFault {
    /// The step that failed.
    pub fn step(&self) -> Option<BootStep> {
        match self {
            StartupFault::Config(_) => Some(BootStep::Config),
            StartupFault::Logging(_) => Some(BootStep::Logging),
            StartupFault::Persistence(_) => Some(BootStep::Persistence),
            StartupFault::Support(_) => Some(BootStep::Support),
            StartupFault::Routes(_) => Some(BootStep::Routes),
            StartupFault::Tasks(_) => Some(BootStep::Tasks),
            StartupFault::AlreadyInitialized => None,
        }
    }
}

/// Runs the startup sequence.
pub struct Bootstrapper {
    mode: String,
    config_file: Option<PathBuf>,
    use_env: bool,
    overrides: Vec<(String, String)>,
    namespace: Option<Namespace>,
    observers: Vec<Arc<dyn StatementObserver>>,
    completed: Vec<BootStep>,
    started: bool,
}

impl Bootstrapper {
    /// Mode from `LIFTOFF_MODE` (default `dev`), config file from
    /// `LIFTOFF_CONFIG`, environment overrides enabled.
    pub fn new() -> Self {
        let mut bootstrapper =
            Self::with_mode(std::env::var(MODE_ENV).unwrap_or_else(|_| "dev".to_string()));
        bootstrapper.config_file = std::env::var_os(CONFIG_FILE_ENV).map(PathBuf::from);
        bootstrapper
    }

    /// Explicit mode. The discriminator is validated by the `Config` step.
    pub fn with_mode(mode: impl Into<String>) -> Self {
        Self {
            mode: mode.into(),
            config_file: None,
            use_env: true,
            overrides: Vec::new(),
            namespace: None,
            observers: Vec::new(),
            completed: Vec::new(),
            started: false,
        }
    }

    /// Layer a TOML file over the profile.
    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Ignore `LIFTOFF__*` environment variables.
    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    /// Set a dotted option, winning over every other source.
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    /// Discover routes from `namespace` instead of the bundled API.
    pub fn with_namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = Some(namespace);
        self
    }

    /// Add a statement observer next to the log observer.
    pub fn with_observer(mut self, observer: Arc<dyn StatementObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Steps that finished, in order.
    pub fn completed_steps(&self) -> &[BootStep] {
        &self.completed
    }

    /// Run the sequence.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error, or
    /// [`StartupFault::AlreadyInitialized`] on a second call.
    pub async fn initialize(&mut self) -> Result<Application, StartupFault> {
        if self.started {
            return Err(StartupFault::AlreadyInitialized);
        }
        self.started = true;

        let result = self.run_steps().await;
        if let Err(e) = &result {
            // Logging may not be up yet; the caller also reports the fault.
            error!(step = ?e.step(), error = %e, "Startup failed");
        }
        result
    }

    async fn run_steps(&mut self) -> Result<Application, StartupFault> {
        // Config
        let profile: Profile = self.mode.parse()?;
        let mut loader = ConfigLoader::new(profile);
        if let Some(path) = &self.config_file {
            loader = loader.with_file(path);
        }
        if !self.use_env {
            loader = loader.without_env();
        }
        for (key, value) in &self.overrides {
            loader = loader.with_override(key, value);
        }
        let config = Arc::new(loader.load()?);
        let settings = config.settings().clone();
        self.complete(BootStep::Config);

        // Logging
        let logger = init_logging(&settings.log)?;
        self.complete(BootStep::Logging);

        // Handlers
        let mut errors = ErrorMapper::with_defaults();
        let mut lifecycle =
            RequestLifecycle::with_core_hooks().with_timeout(settings.server.request_timeout());
        self.complete(BootStep::Handlers);

        // Persistence
        let mut instrumentation = Instrumentation::with_logging();
        for observer in self.observers.drain(..) {
            instrumentation.add_observer(observer);
        }
        let db = PersistenceGateway::connect(&settings.database, instrumentation).await?;
        db.ping().await?;
        self.complete(BootStep::Persistence);

        // Support
        let support = SupportServices::init(&settings, profile.as_str())?;
        if settings.rate_limit.enabled {
            lifecycle.register_before("rate_limit", rate_limit_hook(Arc::clone(&support.limiter)));
        }
        if let Some(reporter) = &support.reporter {
            errors.set_reporter(Arc::clone(reporter));
        }
        self.complete(BootStep::Support);

        // Routes
        let context = AppContext::new(config, db, support);
        let namespace = self.namespace.take().unwrap_or_else(api::namespace);
        let mut signal_registry = SignalRegistry::new();
        let registry = RouteRegistry::discover(&namespace, &context, &mut signal_registry)?;
        self.complete(BootStep::Routes);

        // Tasks
        let tasks = TaskRunner::start(context.base_context().clone(), settings.tasks.workers)?;
        let signals = signal_registry.bind(tasks.clone());
        let (routes, routes_router) = registry.into_parts();
        let state = AppState::new(context, tasks, signals, lifecycle, errors, routes);
        let router = build_router(routes_router, state.clone());
        self.complete(BootStep::Tasks);

        info!(
            profile = %profile,
            app = %settings.app_name,
            routes = state.routes().len(),
            "Application initialized"
        );

        Ok(Application {
            profile,
            settings,
            state,
            router,
            logger,
        })
    }

    fn complete(&mut self, step: BootStep) {
        info!(step = %step, "Startup step complete");
        self.completed.push(step);
    }
}

impl Default for Bootstrapper {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Bootstrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bootstrapper")
            .field("mode", &self.mode)
            .field("config_file", &self.config_file)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

static PROCESS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Run the default sequence, at most once per process.
///
/// # Errors
///
/// Returns the first failing step's error, or
/// [`StartupFault::AlreadyInitialized`] if this was called before.
pub async fn initialize() -> Result<Application, StartupFault> {
    claim(&PROCESS_INITIALIZED)?;
    Bootstrapper::new().initialize().await
}

fn claim(flag: &AtomicBool) -> Result<(), StartupFault> {
    if flag.swap(true, Ordering::SeqCst) {
        return Err(StartupFault::AlreadyInitialized);
    }
    Ok(())
}

/// A fully initialized process, ready to serve.
pub struct Application {
    profile: Profile,
    settings: Settings,
    state: AppState,
    router: Router,
    logger: LoggerHandle,
}

impl Application {
    /// Selected profile.
    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Effective settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Shared state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// The assembled router.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Logging setup result.
    pub fn logger(&self) -> &LoggerHandle {
        &self.logger
    }

    /// Serve until a shutdown signal, then drain deferred work and close
    /// the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or cannot be bound.
    pub async fn run(self) -> Result<(), ServerError> {
        let config = ServerConfig::from_settings(&self.settings.server)?;
        let served = serve(self.router.clone(), &config).await;
        self.shutdown().await;
        served
    }

    /// Drain deferred work and close the pool.
    pub async fn shutdown(&self) {
        self.state.tasks().shutdown().await;
        self.state.context().db().close().await;
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("profile", &self.profile)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
