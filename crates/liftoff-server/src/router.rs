//! HTTP router configuration.
//!
//! Wraps the discovered routes with the request lifecycle and the shared
//! middleware stack. Unmatched paths raise a `NotFound` fault so they go
//! through the error mapper like any other fault.

use axum::Router;
use axum::http::Uri;
use axum::middleware;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::fault::RequestFault;
use crate::lifecycle::lifecycle_middleware;
use crate::state::AppState;

/// Build the application router.
///
/// Layers, outermost first: CORS, HTTP tracing, request lifecycle. The
/// handler timeout is enforced inside the lifecycle so overruns are mapped.
pub fn build_router(routes: Router<AppState>, state: AppState) -> Router {
    routes
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            lifecycle_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn not_found(uri: Uri) -> RequestFault {
    RequestFault::NotFound {
        path: uri.path().to_string(),
    }
}
