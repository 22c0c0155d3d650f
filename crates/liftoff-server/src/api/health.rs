//! Liveness and readiness checks.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use liftoff_core::TaskStats;

use crate::fault::RequestFault;
use crate::registry::{Routable, RouteDescriptor};
use crate::state::{AppContext, AppState};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `ok` while the process serves requests.
    pub status: &'static str,
    /// Configured service name.
    pub app: String,
    /// Crate version.
    pub version: &'static str,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    /// `ready` when every dependency answered.
    pub status: &'static str,
    /// Open database connections.
    pub connections: u32,
    /// Cache backend name.
    pub cache: &'static str,
    /// Task runner counters.
    pub tasks: TaskStats,
}

/// `/health` routes.
#[derive(Debug, Clone, Copy)]
pub struct HealthRoutes;

impl Routable for HealthRoutes {
    fn descriptor(&self) -> RouteDescriptor {
        RouteDescriptor::new("/health")
            .route("GET", "/")
            .route("GET", "/ready")
    }

    fn router(&self, ctx: &AppContext) -> Router<AppState> {
        let app = ctx.settings().app_name.clone();
        Router::new()
            .route(
                "/",
                get(move || {
                    let app = app.clone();
                    async move { health_check(app) }
                }),
            )
            .route("/ready", get(readiness_check))
    }
}

fn health_check(app: String) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        app,
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn readiness_check(
    State(state): State<AppState>,
) -> Result<Json<ReadinessResponse>, RequestFault> {
    let ctx = state.context();
    ctx.db()
        .ping()
        .await
        .map_err(|e| RequestFault::unavailable(format!("database: {e}")))?;

    if !state.tasks().is_open() {
        return Err(RequestFault::unavailable("task runner is closed"));
    }

    Ok(Json(ReadinessResponse {
        status: "ready",
        connections: ctx.db().connections(),
        cache: ctx.cache().backend(),
        tasks: state.tasks().stats(),
    }))
}
