//! REST API over the index registry

mod api;

use crate::registry::IndexRegistry;
use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use api::{HealthResponse, SearchParams, SharesResponse};

/// Shared application state; the registry does its own locking
pub type AppState = Arc<IndexRegistry>;

/// Create the router with all API routes
pub fn create_router(registry: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(api::health_handler))
        .route("/api/shares", get(api::shares_handler))
        .route("/api/shares/{id}/search", get(api::search_handler))
        .route("/api/shares/{id}/status", get(api::status_handler))
        .route(
            "/api/shares/{id}/incremental",
            get(api::incremental_stats_handler).post(api::incremental_trigger_handler),
        )
        .route("/api/shares/{id}/integrity", get(api::integrity_handler))
        .route("/api/shares/{id}/rebuild", post(api::rebuild_handler))
        .route("/api/shares/{id}/repair", post(api::repair_handler))
        .route("/api/shares/{id}/index", delete(api::delete_handler))
        .route("/api/incremental/config", put(api::incremental_config_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}
