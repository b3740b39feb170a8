//! Router configuration for the API server

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::AppState;
use super::handlers;

/// Create the main router with all routes
pub fn create_router(state: AppState) -> Router {
    let upload_limit = match state.max_upload_bytes {
        0 => DefaultBodyLimit::disable(),
        max => DefaultBodyLimit::max(max),
    };

    Router::new()
        // Subscriptions
        .route(
            "/api/subscriptions",
            get(handlers::list_subscriptions).post(handlers::create_subscription),
        )
        .route("/api/subscriptions/:id", get(handlers::get_subscription))
        .route(
            "/api/subscriptions/:id/status",
            put(handlers::update_subscription_status),
        )
        // Runs and their logs
        .route("/api/runs", get(handlers::list_runs))
        .route("/api/runs/:id/log", get(handlers::get_run_log))
        // Files
        .route("/api/files", post(handlers::upload_file).layer(upload_limit))
        .route(
            "/api/files/:id",
            get(handlers::get_file).delete(handlers::trash_file),
        )
        .route("/api/files/:id/status", put(handlers::update_file_status))
        .route("/api/fetch", post(handlers::fetch_file))
        // Scheduler
        .route("/api/scheduler", get(handlers::scheduler_status))
        .route("/api/scheduler/tick", post(handlers::trigger_tick))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
