use super::handlers;
use super::state::AppState;
use super::ws;
use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Streaming sessions over HTTP
        .route(
            "/stream",
            get(handlers::open_stream)
                .post(handlers::relay_chunk)
                .delete(handlers::end_stream),
        )
        .route("/stream/sessions", get(handlers::list_sessions))
        // Streaming sessions over a socket
        .route("/ws", get(ws::socket_stream))
        .layer(CorsLayer::permissive())
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
