//! Thin HTTP surface: request routing and state wiring. All decisions live
//! in the core modules; handlers translate between HTTP and the pipeline.

mod handlers;

use crate::advisor::Advisor;
use crate::backends::BackendRegistry;
use crate::config::Config;
use crate::db::Database;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
    pub backends: Arc<BackendRegistry>,
    pub advisor: Option<Arc<dyn Advisor>>,
}

/// Build the router over the application state.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/tasks/intake", post(handlers::intake))
        .route("/tasks/:id/retriage", post(handlers::retriage))
        .route("/tasks/:id", get(handlers::get_task))
        .route("/plan/rebalance", post(handlers::rebalance))
        .route("/webhooks/:backend", post(handlers::webhook))
        .route("/outbox/stats", get(handlers::outbox_stats))
        .route("/outbox/requeue/:id", post(handlers::outbox_requeue))
        .route(
            "/mapping/:backend/:external_id",
            get(handlers::mapping_lookup),
        )
        .route("/audit/traces", get(handlers::audit_traces))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
