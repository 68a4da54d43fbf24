use super::state::AppState;
use crate::bridge::{OpenedSession, SessionInfo, SessionState};
use crate::error::SessionError;
use crate::protocol::{Chunk, ChunkMetadata, EndQuery, OpenQuery, RelayRequest, ServerFrame, SessionKind};
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndResponse {
    pub success: bool,
    pub state: SessionState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: error.into() })).into_response()
}

fn session_error_response(err: SessionError) -> Response {
    let status = match err {
        SessionError::DuplicateSession(_) => StatusCode::CONFLICT,
        SessionError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        SessionError::UpstreamError(_) | SessionError::RelayFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

/// Memory sessions always have a memory id, generated when the client has none
pub(super) fn resolve_memory_id(query: &OpenQuery) -> String {
    match (&query.memory_id, query.kind) {
        (Some(id), _) if !id.is_empty() => id.clone(),
        (_, SessionKind::Memory) => format!("memory-{}", uuid::Uuid::new_v4()),
        (_, SessionKind::Question) => String::new(),
    }
}

/// Open a session for a client, or an error response
pub(super) async fn open_session(state: &AppState, query: &OpenQuery) -> Result<OpenedSession, Response> {
    if query.session_id.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "sessionId is required"));
    }

    let memory_id = resolve_memory_id(query);

    info!(
        "Opening {} session {} (memory {})",
        query.kind.as_str(),
        query.session_id,
        memory_id
    );

    state
        .bridge
        .open(&query.session_id, query.kind, &memory_id)
        .await
        .map_err(|e| {
            warn!("Failed to open session {}: {}", query.session_id, e);
            session_error_response(e)
        })
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /stream?sessionId=&type=&memoryId=
/// Open a session and stream backend output as server-sent events
pub async fn open_stream(State(state): State<AppState>, Query(query): Query<OpenQuery>) -> Response {
    let opened = match open_session(&state, &query).await {
        Ok(opened) => opened,
        Err(response) => return response,
    };

    let (tx, rx) = mpsc::channel(state.frame_capacity);

    // Fresh queue, the acknowledgment always fits
    let _ = tx.try_send(ServerFrame::Connected {
        session_id: query.session_id.clone(),
    });

    let bridge = state.bridge.clone();
    tokio::spawn(async move { bridge.relay_outbound(opened, tx).await });

    let events = ReceiverStream::new(rx).map(|frame| Event::default().json_data(&frame));

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// POST /stream
/// Relay one chunk from the client to the session's upstream stream
pub async fn relay_chunk(
    State(state): State<AppState>,
    body: Result<Json<RelayRequest>, JsonRejection>,
) -> Response {
    let req = match body {
        Ok(Json(req)) => req,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.body_text()),
    };

    let chunk = match relay_request_chunk(&req) {
        Ok(chunk) => chunk,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };

    match state.bridge.relay_inbound(&req.session_id, chunk).await {
        Ok(()) => (StatusCode::OK, Json(SuccessResponse { success: true })).into_response(),
        Err(e) => {
            if !matches!(e, SessionError::SessionNotFound(_)) {
                error!("Failed to relay chunk for {}: {}", req.session_id, e);
            }
            session_error_response(e)
        }
    }
}

/// Validate a relay request and turn it into a chunk
pub(super) fn relay_request_chunk(req: &RelayRequest) -> Result<Chunk, &'static str> {
    if req.session_id.is_empty() {
        return Err("sessionId is required");
    }

    let chunk = match (&req.audio_data, &req.text_data) {
        (Some(_), Some(_)) => return Err("audioData and textData are mutually exclusive"),
        (Some(audio), None) => Chunk::audio(audio.clone()),
        (None, Some(text)) => Chunk::text(text.clone()),
        (None, None) if req.final_marker => {
            return Ok(Chunk::final_marker(final_placeholder(&req.session_id)));
        }
        (None, None) => return Err("one of audioData, textData or finalMarker is required"),
    };

    if req.final_marker {
        // The registry rewrites metadata; only the final flag matters here
        return Ok(chunk.with_metadata(final_placeholder(&req.session_id)));
    }

    Ok(chunk)
}

fn final_placeholder(session_id: &str) -> ChunkMetadata {
    ChunkMetadata::new(session_id, "", crate::protocol::ChunkType::Question).finalized()
}

/// DELETE /stream?sessionId=&force=
/// End a session; question sessions drain for the answer unless forced
pub async fn end_stream(State(state): State<AppState>, Query(query): Query<EndQuery>) -> Response {
    info!(
        "Ending session {}{}",
        query.session_id,
        if query.force { " (forced)" } else { "" }
    );

    match state.bridge.end(&query.session_id, query.force).await {
        Ok(session_state) => (
            StatusCode::OK,
            Json(EndResponse {
                success: true,
                state: session_state,
            }),
        )
            .into_response(),
        Err(e) => session_error_response(e),
    }
}

/// GET /stream/sessions
/// List live sessions
pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let sessions: Vec<SessionInfo> = state.bridge.registry().list().await;
    (StatusCode::OK, Json(sessions))
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(audio: Option<Vec<u8>>, text: Option<&str>, final_marker: bool) -> RelayRequest {
        RelayRequest {
            session_id: "s".to_string(),
            audio_data: audio,
            text_data: text.map(str::to_string),
            final_marker,
        }
    }

    #[test]
    fn test_relay_request_validation() {
        assert!(relay_request_chunk(&request(Some(vec![1]), Some("x"), false)).is_err());
        assert!(relay_request_chunk(&request(None, None, false)).is_err());

        let marker = relay_request_chunk(&request(None, None, true)).unwrap();
        assert!(marker.is_final());
        assert!(!marker.has_payload());

        let text = relay_request_chunk(&request(None, Some("hi"), false)).unwrap();
        assert_eq!(text, Chunk::text("hi"));

        let last = relay_request_chunk(&request(Some(vec![1, 2]), None, true)).unwrap();
        assert!(last.is_final());
        assert!(last.has_payload());
    }

    #[test]
    fn test_memory_id_generated_for_memory_sessions() {
        let query = OpenQuery {
            session_id: "s".to_string(),
            kind: SessionKind::Memory,
            memory_id: None,
        };
        assert!(resolve_memory_id(&query).starts_with("memory-"));

        let query = OpenQuery {
            kind: SessionKind::Question,
            ..query
        };
        assert_eq!(resolve_memory_id(&query), "");
    }

    #[test]
    fn test_end_response_json() {
        let response: EndResponse = serde_json::from_str(r#"{"success":true,"state":"draining"}"#).unwrap();
        assert!(response.success);
        assert_eq!(response.state, SessionState::Draining);

        let json = serde_json::to_string(&EndResponse {
            success: true,
            state: SessionState::Closing,
        })
        .unwrap();
        assert_eq!(json, r#"{"success":true,"state":"closing"}"#);
    }
}
