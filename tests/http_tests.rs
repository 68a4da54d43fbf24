// Router tests, driven in-process with tower's oneshot

use axum::body::{Body, BodyDataStream};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use recall_stream::bridge::SessionRegistry;
use recall_stream::client::SseDecoder;
use recall_stream::protocol::{Chunk, ChunkMetadata, ChunkType, ServerFrame};
use recall_stream::upstream::{BackendPeer, MemoryConnector};
use recall_stream::{create_router, AppState};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tower::ServiceExt;

fn app() -> (Router, Arc<SessionRegistry>, mpsc::UnboundedReceiver<BackendPeer>) {
    let (connector, peers) = MemoryConnector::new(16);
    let registry = Arc::new(SessionRegistry::new());
    let app = create_router(AppState::with_registry(registry.clone(), Arc::new(connector), 16));
    (app, registry, peers)
}

fn request(method: Method, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Server-sent frames of one response body, in order
struct FrameReader {
    body: BodyDataStream,
    decoder: SseDecoder,
    pending: VecDeque<String>,
}

impl FrameReader {
    fn new(response: axum::response::Response) -> Self {
        Self {
            body: response.into_body().into_data_stream(),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
        }
    }

    /// Next frame, or None when the stream ended
    async fn next(&mut self) -> Option<ServerFrame> {
        loop {
            if let Some(data) = self.pending.pop_front() {
                return Some(serde_json::from_str(&data).unwrap());
            }
            let bytes = timeout(Duration::from_secs(5), self.body.next())
                .await
                .expect("frame should arrive")?
                .unwrap();
            self.pending.extend(self.decoder.push(&bytes));
        }
    }
}

#[tokio::test]
async fn test_health_check() {
    let (app, _, _) = app();
    let response = app.oneshot(request(Method::GET, "/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_relay_to_unknown_session_is_not_found() {
    let (app, _, _) = app();
    let response = app
        .oneshot(request(
            Method::POST,
            "/stream",
            Some(serde_json::json!({"sessionId": "nope", "textData": "hi"})),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn test_bad_relay_bodies_rejected() {
    let (app, _, _) = app();

    let both = app
        .clone()
        .oneshot(request(
            Method::POST,
            "/stream",
            Some(serde_json::json!({"sessionId": "s", "textData": "hi", "audioData": [1, 2]})),
        ))
        .await
        .unwrap();
    assert_eq!(both.status(), StatusCode::BAD_REQUEST);

    let not_json = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/stream")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(not_json.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_end_unknown_session_is_not_found() {
    let (app, _, _) = app();
    let response = app
        .oneshot(request(Method::DELETE, "/stream?sessionId=ghost", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_question_session_drains_for_answer() {
    let (app, registry, mut peers) = app();

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/stream?sessionId=q1&type=question", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let mut frames = FrameReader::new(response);
    assert_eq!(
        frames.next().await,
        Some(ServerFrame::Connected {
            session_id: "q1".to_string()
        })
    );

    let mut peer = peers.recv().await.unwrap();

    // Question text, then the final marker
    for body in [
        serde_json::json!({"sessionId": "q1", "textData": "what is next"}),
        serde_json::json!({"sessionId": "q1", "finalMarker": true}),
    ] {
        let response = app
            .clone()
            .oneshot(request(Method::POST, "/stream", Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, serde_json::json!({"success": true}));
    }

    let first = peer.recv().await.unwrap();
    assert_eq!(first.text_data(), Some("what is next"));
    assert_eq!(first.chunk_type(), Some(ChunkType::Question));
    let marker = peer.recv().await.unwrap();
    assert!(marker.is_final());

    // Client ends: only the write side closes
    let response = app
        .clone()
        .oneshot(request(Method::DELETE, "/stream?sessionId=q1", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["state"], "draining");
    assert_eq!(peer.recv().await, None);

    let sessions = json_body(
        app.clone()
            .oneshot(request(Method::GET, "/stream/sessions", None))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(sessions[0]["sessionId"], "q1");
    assert_eq!(sessions[0]["state"], "draining");

    // The answer still reaches the client
    let answer = Chunk::text("next is lunch").with_metadata(ChunkMetadata::new("q1", "", ChunkType::Answer));
    assert!(peer.emit(answer.clone()).await);
    assert_eq!(
        frames.next().await,
        Some(ServerFrame::Answer { chunk: answer })
    );

    peer.end().await;
    assert_eq!(frames.next().await, None);
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_upstream_error_forwarded_as_frame() {
    let (app, registry, mut peers) = app();

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/stream?sessionId=m1&type=memory", None))
        .await
        .unwrap();
    let mut frames = FrameReader::new(response);
    assert!(matches!(
        frames.next().await,
        Some(ServerFrame::Connected { .. })
    ));

    let peer = peers.recv().await.unwrap();
    assert!(peer.open.memory_id.starts_with("memory-"));

    assert!(peer.fail("transcriber restarted").await);
    assert_eq!(
        frames.next().await,
        Some(ServerFrame::error("transcriber restarted"))
    );

    // Error does not close the session
    assert!(peer.emit(Chunk::text("still here")).await);
    assert_eq!(
        frames.next().await,
        Some(ServerFrame::Transcript {
            chunk: Chunk::text("still here")
        })
    );
    assert_eq!(registry.len().await, 1);
}

#[tokio::test]
async fn test_client_disconnect_releases_session() {
    let (app, registry, mut peers) = app();

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/stream?sessionId=gone&type=memory", None))
        .await
        .unwrap();
    let mut peer = peers.recv().await.unwrap();
    drop(response);

    // Write side ends once the relay notices the client is gone
    assert_eq!(timeout(Duration::from_secs(5), peer.recv()).await.unwrap(), None);

    timeout(Duration::from_secs(5), async {
        while !registry.is_empty().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_forced_end_cancels_draining_question() {
    let (app, registry, mut peers) = app();

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/stream?sessionId=f1&type=question", None))
        .await
        .unwrap();
    let mut frames = FrameReader::new(response);
    frames.next().await;
    let peer = peers.recv().await.unwrap();

    let drained = app
        .clone()
        .oneshot(request(Method::DELETE, "/stream?sessionId=f1", None))
        .await
        .unwrap();
    assert_eq!(json_body(drained).await["state"], "draining");

    let forced = app
        .clone()
        .oneshot(request(Method::DELETE, "/stream?sessionId=f1&force=true", None))
        .await
        .unwrap();
    assert_eq!(forced.status(), StatusCode::OK);

    assert_eq!(frames.next().await, None);
    assert!(timeout(Duration::from_secs(5), async {
        while !peer.is_read_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok());
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_back_to_back_frames_all_arrive() {
    let (app, _registry, mut peers) = app();

    let response = app
        .oneshot(request(Method::GET, "/stream?sessionId=b1&type=memory", None))
        .await
        .unwrap();
    let mut frames = FrameReader::new(response);
    let peer = peers.recv().await.unwrap();

    // Emitted before the body is read, so they may share one body chunk
    for text in ["one", "two", "three"] {
        assert!(peer.emit(Chunk::text(text)).await);
    }
    peer.end().await;

    assert!(matches!(frames.next().await, Some(ServerFrame::Connected { .. })));
    for text in ["one", "two", "three"] {
        assert_eq!(
            frames.next().await,
            Some(ServerFrame::Transcript {
                chunk: Chunk::text(text)
            })
        );
    }
    assert_eq!(frames.next().await, None);
}
