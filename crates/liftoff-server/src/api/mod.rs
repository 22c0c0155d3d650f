//! Bundled HTTP API.
//!
//! ```text
//! api
//! ├── health        /health
//! └── v1
//!     ├── jobs      /v1/jobs
//!     ├── meta      /v1/meta
//!     └── schema    (payload types, no routes)
//! ```

pub mod health;
pub mod v1;

use crate::registry::{Module, Namespace};

/// The namespace discovered by default at startup.
pub fn namespace() -> Namespace {
    Namespace::new("api")
        .with_module(Module::routable("health", health::HealthRoutes))
        .with_child(v1::namespace())
}
