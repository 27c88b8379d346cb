use axum::{
    http::Method,
    routing::{any, get},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::relay_ws::relay_ws_handler;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    // Cross-origin pages may read status but never change configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(handlers::health_check))
        // Bridged realtime channel
        .route("/relay", any(relay_ws_handler))
        .route("/relay/status", get(handlers::relay_status))
        // Configuration management (domain-separated endpoints)
        .route(
            "/config/coach",
            get(handlers::config::get_coach_config).patch(handlers::config::update_coach_config),
        )
        .route(
            "/config/upstream",
            get(handlers::config::get_upstream_config)
                .patch(handlers::config::update_upstream_config),
        );

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
