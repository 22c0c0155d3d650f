//! Route discovery.
//!
//! Modules opt into routing by implementing [`Routable`] and being listed
//! in a [`Namespace`]. [`RouteRegistry::discover`] walks the namespace tree
//! once at startup, skips modules that are not routable and mounts every
//! routable's router under its prefix. Two modules claiming the same prefix
//! abort discovery.

use std::collections::HashMap;
use std::fmt;

use axum::Router;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::signals::SignalRegistry;
use crate::state::{AppContext, AppState};

/// Route discovery errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Two modules claim the same prefix.
    #[error("Route prefix '{prefix}' claimed by both '{existing}' and '{incoming}'")]
    PrefixCollision {
        /// The normalized prefix.
        prefix: String,
        /// Module that registered first.
        existing: String,
        /// Module that tried to register second.
        incoming: String,
    },

    /// A prefix cannot be mounted.
    #[error("Module '{module}' has invalid prefix '{prefix}': {reason}")]
    InvalidPrefix {
        /// Offending module.
        module: String,
        /// The rejected prefix.
        prefix: String,
        /// Why it was rejected.
        reason: &'static str,
    },
}

/// One handler binding advertised by a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteBinding {
    /// HTTP method.
    pub method: String,
    /// Path relative to the module prefix.
    pub path: String,
}

/// Path prefix plus the bindings mounted under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDescriptor {
    /// Mount prefix, such as `/v1/jobs`.
    pub prefix: String,
    /// Advertised bindings.
    pub bindings: Vec<RouteBinding>,
}

impl RouteDescriptor {
    /// A descriptor without bindings.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            bindings: Vec::new(),
        }
    }

    /// Advertise a binding.
    pub fn route(mut self, method: &str, path: impl Into<String>) -> Self {
        self.bindings.push(RouteBinding {
            method: method.to_ascii_uppercase(),
            path: path.into(),
        });
        self
    }
}

/// Capability of a module that exposes HTTP handlers.
pub trait Routable: Send + Sync {
    /// Prefix and bindings.
    fn descriptor(&self) -> RouteDescriptor;

    /// Build the module's router. Paths are relative to the prefix.
    fn router(&self, ctx: &AppContext) -> Router<AppState>;

    /// Connect signal handlers.
    fn register_signals(&self, _signals: &mut SignalRegistry) {}
}

/// A named unit in a namespace, optionally routable.
pub struct Module {
    name: String,
    routable: Option<Box<dyn Routable>>,
}

impl Module {
    /// A module exposing routes.
    pub fn routable(name: impl Into<String>, routable: impl Routable + 'static) -> Self {
        Self {
            name: name.into(),
            routable: Some(Box::new(routable)),
        }
    }

    /// A module without routes.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routable: None,
        }
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the module exposes routes.
    pub fn is_routable(&self) -> bool {
        self.routable.is_some()
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("routable", &self.is_routable())
            .finish()
    }
}

/// A tree of modules.
#[derive(Debug)]
pub struct Namespace {
    name: String,
    modules: Vec<Module>,
    children: Vec<Namespace>,
}

impl Namespace {
    /// An empty namespace.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            modules: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Add a module.
    pub fn with_module(mut self, module: Module) -> Self {
        self.modules.push(module);
        self
    }

    /// Add a child namespace.
    pub fn with_child(mut self, child: Namespace) -> Self {
        self.children.push(child);
        self
    }

    /// Namespace name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Visit every module depth first, with its dotted path.
    fn walk<'a>(&'a self, parent: &str, visit: &mut dyn FnMut(String, &'a Module)) {
        let path = if parent.is_empty() {
            self.name.clone()
        } else {
            format!("{parent}.{}", self.name)
        };

        for module in &self.modules {
            visit(format!("{path}.{}", module.name), module);
        }
        for child in &self.children {
            child.walk(&path, visit);
        }
    }
}

/// A module mounted during discovery.
#[derive(Debug, Clone, Serialize)]
pub struct MountedRoute {
    /// Dotted module path, such as `api.v1.jobs`.
    pub module: String,
    /// Descriptor with the normalized prefix.
    #[serde(flatten)]
    pub descriptor: RouteDescriptor,
}

/// The discovered route table.
pub struct RouteRegistry {
    mounted: Vec<MountedRoute>,
    router: Router<AppState>,
}

impl RouteRegistry {
    /// Walk `namespace` and mount every routable module.
    ///
    /// Signal handlers of mounted modules are connected to `signals`.
    ///
    /// # Errors
    ///
    /// Returns an error on an invalid or duplicate prefix. Nothing is
    /// mounted in that case.
    pub fn discover(
        namespace: &Namespace,
        ctx: &AppContext,
        signals: &mut SignalRegistry,
    ) -> Result<Self, RegistryError> {
        let mut found: Vec<(String, &dyn Routable)> = Vec::new();
        namespace.walk("", &mut |path, module| match &module.routable {
            Some(routable) => found.push((path, routable.as_ref())),
            None => debug!(module = %path, "Module has no routes, skipping"),
        });

        let mut owners: HashMap<String, String> = HashMap::new();
        let mut mounted = Vec::with_capacity(found.len());
        for (path, routable) in &found {
            let mut descriptor = routable.descriptor();
            let prefix = normalize_prefix(&descriptor.prefix).map_err(|reason| {
                RegistryError::InvalidPrefix {
                    module: path.clone(),
                    prefix: descriptor.prefix.clone(),
                    reason,
                }
            })?;

            if let Some(existing) = owners.insert(prefix.clone(), path.clone()) {
                return Err(RegistryError::PrefixCollision {
                    prefix,
                    existing,
                    incoming: path.clone(),
                });
            }

            descriptor.prefix = prefix;
            mounted.push(MountedRoute {
                module: path.clone(),
                descriptor,
            });
        }

        let mut router = Router::new();
        for (route, (_, routable)) in mounted.iter().zip(&found) {
            router = router.nest(&route.descriptor.prefix, routable.router(ctx));
            routable.register_signals(signals);
            debug!(
                module = %route.module,
                prefix = %route.descriptor.prefix,
                bindings = route.descriptor.bindings.len(),
                "Routes mounted"
            );
        }

        info!(modules = mounted.len(), namespace = %namespace.name(), "Route discovery complete");
        Ok(Self { mounted, router })
    }

    /// Mounted modules in discovery order.
    pub fn descriptors(&self) -> &[MountedRoute] {
        &self.mounted
    }

    /// Split into the route table and the router.
    pub fn into_parts(self) -> (Vec<MountedRoute>, Router<AppState>) {
        (self.mounted, self.router)
    }
}

impl fmt::Debug for RouteRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteRegistry")
            .field("mounted", &self.mounted)
            .finish_non_exhaustive()
    }
}

/// Normalize a mount prefix: trailing slashes are dropped.
pub fn normalize_prefix(prefix: &str) -> Result<String, &'static str> {
    let trimmed = prefix.trim();
    if !trimmed.starts_with('/') {
        return Err("must start with '/'");
    }

    let normalized = trimmed.trim_end_matches('/');
    if normalized.is_empty() {
        return Err("cannot mount at the root");
    }
    if normalized.contains("//") {
        return Err("contains an empty segment");
    }
    Ok(normalized.to_string())
}
