//! HTTP API server for streaming sessions
//!
//! - GET /stream - Open a session, backend output as server-sent events
//! - POST /stream - Relay one chunk
//! - DELETE /stream - End a session (question sessions drain for the answer)
//! - GET /stream/sessions - List live sessions
//! - GET /ws - Socket transport carrying codec-encoded chunks
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;
mod ws;

pub use handlers::{EndResponse, ErrorResponse, SuccessResponse};
pub use routes::create_router;
pub use state::AppState;
