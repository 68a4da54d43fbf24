use super::handlers::open_session;
use super::state::AppState;
use crate::bridge::OpenedSession;
use crate::error::SessionError;
use crate::protocol::{self, OpenQuery, ServerFrame};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// GET /ws?sessionId=&type=&memoryId=
/// Socket transport: binary frames are codec-encoded chunks in both directions
pub async fn socket_stream(
    State(state): State<AppState>,
    Query(query): Query<OpenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    // Open before upgrading so a duplicate session is a plain HTTP error
    let opened = match open_session(&state, &query).await {
        Ok(opened) => opened,
        Err(response) => return response,
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, opened))
}

/// Encode an outbound frame for the socket. Chunks go out binary, the
/// acknowledgment and errors as JSON text.
fn socket_message(frame: ServerFrame) -> Option<Message> {
    match frame {
        ServerFrame::Transcript { chunk } | ServerFrame::Answer { chunk } => {
            Some(Message::Binary(protocol::encode(&chunk)))
        }
        ServerFrame::Connected { .. } | ServerFrame::Error { .. } => {
            serde_json::to_string(&frame).ok().map(Message::Text)
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, opened: OpenedSession) {
    let session_id = opened.ticket.session_id.clone();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (frames_tx, mut frames_rx) = mpsc::channel(state.frame_capacity);

    // Fresh queue, the acknowledgment always fits
    let _ = frames_tx.try_send(ServerFrame::Connected {
        session_id: session_id.clone(),
    });

    info!(session_id = %session_id, "Socket session connected");

    let bridge = state.bridge.clone();
    let relay_task = tokio::spawn(async move { bridge.relay_outbound(opened, frames_tx).await });

    // Backend output → socket, close once the relay finishes
    let send_task = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            let Some(message) = socket_message(frame) else {
                continue;
            };
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    // Socket → backend
    while let Some(Ok(message)) = ws_receiver.next().await {
        let bytes = match message {
            Message::Binary(bytes) => bytes,
            Message::Text(text) => text.into_bytes(),
            Message::Close(_) => break,
            _ => continue,
        };

        let chunk = match protocol::decode(&bytes) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(session_id = %session_id, "Dropping inbound frame: {}", e);
                continue;
            }
        };

        match state.bridge.relay_inbound(&session_id, chunk).await {
            Ok(()) => {}
            Err(SessionError::SessionNotFound(_)) => break,
            Err(e) => warn!(session_id = %session_id, "Relay failed: {}", e),
        }
    }

    // Client side is done: dropping the frame queue lets the relay cancel the session
    send_task.abort();
    let _ = relay_task.await;
    debug!(session_id = %session_id, "Socket session disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Chunk;

    #[test]
    fn test_acknowledgment_goes_out_as_text() {
        let message = socket_message(ServerFrame::Connected {
            session_id: "s1".to_string(),
        });
        assert_eq!(
            message,
            Some(Message::Text(r#"{"type":"connected","sessionId":"s1"}"#.to_string()))
        );
    }

    #[test]
    fn test_chunks_go_out_binary() {
        let chunk = Chunk::text("hi");
        assert_eq!(
            socket_message(ServerFrame::Answer { chunk: chunk.clone() }),
            Some(Message::Binary(protocol::encode(&chunk)))
        );
    }
}
