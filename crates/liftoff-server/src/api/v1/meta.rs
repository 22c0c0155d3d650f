//! Introspection of the running process.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::registry::{Routable, RouteDescriptor};
use crate::state::{AppContext, AppState};

/// `/v1/meta` routes.
#[derive(Debug, Clone, Copy)]
pub struct MetaRoutes;

impl Routable for MetaRoutes {
    fn descriptor(&self) -> RouteDescriptor {
        RouteDescriptor::new("/v1/meta")
            .route("GET", "/routes")
            .route("GET", "/signals")
    }

    fn router(&self, _ctx: &AppContext) -> Router<AppState> {
        Router::new()
            .route("/routes", get(list_routes))
            .route("/signals", get(list_signals))
    }
}

async fn list_routes(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "routes": state.routes() }))
}

async fn list_signals(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "signals": state.signals().names() }))
}
