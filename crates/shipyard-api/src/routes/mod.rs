//! API routes.

pub mod builds;
pub mod health;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::ws::ws_handler;
use crate::{NotifierState, OrchestratorState};

/// Routes served by the orchestrator role.
pub fn orchestrator_router(state: OrchestratorState) -> Router {
    Router::new()
        .nest("/builds", builds::router())
        .merge(health::ready_router())
        .with_state(state)
}

/// Routes served by the notifier role.
pub fn notifier_router(state: NotifierState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Wrap role routes with the health check and the shared HTTP layers.
pub fn finish(routes: Router) -> Router {
    routes
        .merge(health::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
