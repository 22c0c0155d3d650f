//! Version 1 endpoints.

pub mod jobs;
pub mod meta;
pub mod schema;

use crate::registry::{Module, Namespace};

/// The `v1` namespace.
pub fn namespace() -> Namespace {
    Namespace::new("v1")
        .with_module(Module::routable("jobs", jobs::JobRoutes))
        .with_module(Module::routable("meta", meta::MetaRoutes))
        .with_module(Module::plain("schema"))
}
