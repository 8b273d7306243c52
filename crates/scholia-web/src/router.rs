//! Axum router — maps all URL paths to handlers.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::harvest::{
    create_source, delete_source, get_source, list_logs, list_sources, metrics, trigger_harvest,
};
use crate::handlers::search::search;
use crate::state::{AppState, SharedState};

/// Build and return the full Axum router.
pub fn build_router(state: AppState) -> Router {
    let shared: SharedState = Arc::new(state);

    Router::new()
        .route("/search", get(search))
        .route("/harvest/sources", get(list_sources).post(create_source))
        .route("/harvest/sources/{id}", get(get_source).delete(delete_source))
        .route("/harvest/sources/{id}/harvest", post(trigger_harvest))
        .route("/harvest/logs", get(list_logs))
        .route("/harvest/metrics", get(metrics))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}
