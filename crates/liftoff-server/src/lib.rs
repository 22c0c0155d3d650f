//! Bootstrap sequence and HTTP surface for liftoff.
//!
//! This crate wires the lower crates into a running service:
//!
//! - Ordered, fail-fast startup ([`Bootstrapper`])
//! - Module discovery and route mounting ([`RouteRegistry`])
//! - Request hooks and fault mapping ([`RequestLifecycle`], [`ErrorMapper`])
//! - Named signals dispatched as deferred work ([`Signals`])
//! - Process logging ([`init_logging`])
//!
//! # Quick Start
//!
//! ```ignore
//! use liftoff_server::Bootstrapper;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let app = Bootstrapper::new().initialize().await?;
//!     app.run().await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod bootstrap;
pub mod error_mapper;
pub mod fault;
pub mod lifecycle;
pub mod registry;
pub mod router;
pub mod server;
pub mod signals;
pub mod state;
pub mod telemetry;

pub use bootstrap::{Application, BootStep, Bootstrapper, StartupFault, initialize};
pub use error_mapper::{ErrorMapper, ErrorResponse, FaultBuilder};
pub use fault::{ApplicationError, FaultKind, RequestFault};
pub use lifecycle::{
    REQUEST_ID_HEADER, RequestInfo, RequestLifecycle, RequestOutcome, UNKNOWN_CLIENT,
};
pub use registry::{
    Module, MountedRoute, Namespace, RegistryError, Routable, RouteBinding, RouteDescriptor,
    RouteRegistry,
};
pub use server::{ServerConfig, ServerError};
pub use signals::{SignalRegistry, Signals};
pub use state::{AppContext, AppState};
pub use telemetry::{LoggerHandle, TelemetryError, init_logging};
