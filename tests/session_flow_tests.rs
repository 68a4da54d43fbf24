// End-to-end session tests
//
// Client session manager -> transport -> bridge -> echo backend and back.

use recall_stream::answer::AnswerStreamParser;
use recall_stream::bridge::{SessionBridge, SessionRegistry};
use recall_stream::client::{
    ClientConfig, ClientSessionManager, HttpTransport, LocalTransport, SessionStatus, Transport, WsTransport,
};
use recall_stream::upstream::{spawn_echo_backend, MemoryConnector};
use recall_stream::{create_router, AppState, Chunk, SessionKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn echo_bridge() -> SessionBridge {
    let (connector, peers) = MemoryConnector::new(32);
    spawn_echo_backend(peers);
    SessionBridge::new(Arc::new(SessionRegistry::new()), Arc::new(connector))
}

/// Serve the router with an echo backend on an ephemeral port
async fn spawn_server() -> (String, Arc<SessionRegistry>) {
    let (connector, peers) = MemoryConnector::new(32);
    spawn_echo_backend(peers);

    let registry = Arc::new(SessionRegistry::new());
    let app = create_router(AppState::with_registry(registry.clone(), Arc::new(connector), 32));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), registry)
}

async fn ask(manager: &ClientSessionManager, question: &str) -> AnswerStreamParser {
    let (chunks_tx, mut chunks_rx) = mpsc::channel(32);
    let (status_tx, _status_rx) = mpsc::channel(32);

    manager
        .start_recording_session(SessionKind::Question, chunks_tx, status_tx)
        .await
        .unwrap();
    assert!(manager.send_text_data(question).await);
    assert!(manager.send_final_marker().await);

    let mut parser = AnswerStreamParser::new();
    timeout(Duration::from_secs(5), async {
        while let Some(chunk) = chunks_rx.recv().await {
            parser.push(&chunk);
            if parser.state().is_complete {
                break;
            }
        }
    })
    .await
    .expect("answer should complete");

    parser
}

fn assert_echo_answer(parser: &AnswerStreamParser, question: &str) {
    let state = parser.state();
    assert_eq!(parser.transcript(), question);
    assert!(parser.transcript_complete());
    assert_eq!(state.memories.len(), 1);
    assert_eq!(state.memories[0].text, "echo memory");
    assert_eq!(state.thinking_text, "repeating the question");
    assert!(state.thinking_complete);
    assert!(state.thinking_elapsed_seconds.is_some());
    assert_eq!(state.answer_text, format!("You said: {}", question));
    assert!(state.is_complete);
}

async fn wait_until_empty(registry: &SessionRegistry) {
    timeout(Duration::from_secs(5), async {
        while !registry.is_empty().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registry should drain");
}

#[tokio::test]
async fn test_question_drains_for_answer_in_process() {
    let bridge = echo_bridge();
    let transport = Arc::new(LocalTransport::new(bridge.clone(), 32));
    let manager = ClientSessionManager::new(transport, ClientConfig::default());

    let parser = ask(&manager, "what did we decide").await;
    assert_echo_answer(&parser, "what did we decide");

    // Backend ended the stream after the answer
    wait_until_empty(bridge.registry()).await;
    manager.end_session().await;
}

#[tokio::test]
async fn test_memory_session_streams_transcript() {
    let bridge = echo_bridge();
    let transport = Arc::new(LocalTransport::new(bridge.clone(), 32));
    let manager = ClientSessionManager::new(transport, ClientConfig::default());

    let (chunks_tx, mut chunks_rx) = mpsc::channel(32);
    let (status_tx, _status_rx) = mpsc::channel(32);
    manager
        .start_recording_session(SessionKind::Memory, chunks_tx, status_tx)
        .await
        .unwrap();

    assert!(manager.send_text_data("first note").await);
    assert!(manager.send_audio_data(vec![0u8; 640]).await);

    let first: Chunk = chunks_rx.recv().await.unwrap();
    assert_eq!(first.text_data(), Some("first note"));
    let second = chunks_rx.recv().await.unwrap();
    assert_eq!(second.text_data(), Some("[640 bytes of audio]"));

    assert_eq!(bridge.registry().len().await, 1);
    manager.end_session().await;
    wait_until_empty(bridge.registry()).await;
}

#[tokio::test]
async fn test_switching_kind_closes_previous_bridge_session() {
    let bridge = echo_bridge();
    let transport = Arc::new(LocalTransport::new(bridge.clone(), 32));
    let manager = ClientSessionManager::new(transport, ClientConfig::default());

    let (chunks_tx, _chunks_rx) = mpsc::channel(32);
    let (status_tx, mut status_rx) = mpsc::channel(32);
    manager
        .start_recording_session(SessionKind::Memory, chunks_tx, status_tx)
        .await
        .unwrap();
    let memory_session = manager.active_session_id().await.unwrap();

    let parser = ask(&manager, "and now a question").await;
    assert_echo_answer(&parser, "and now a question");

    let mut ended = false;
    while let Ok(status) = status_rx.try_recv() {
        if let SessionStatus::Ended { session_id } = status {
            ended |= session_id == memory_session;
        }
    }
    assert!(ended, "memory session ended before the question started");
    assert!(bridge.registry().state(&memory_session).await.is_none());
}

#[tokio::test]
async fn test_question_over_socket() {
    let (server, registry) = spawn_server().await;
    let socket_base = server.replacen("http", "ws", 1);
    let transport: Arc<dyn Transport> =
        Arc::new(WsTransport::new(&socket_base, 32, Duration::from_secs(5)).unwrap());
    let manager = ClientSessionManager::new(transport, ClientConfig::default());

    let parser = ask(&manager, "socket question").await;
    assert_echo_answer(&parser, "socket question");

    manager.end_session().await;
    wait_until_empty(&registry).await;
}

#[tokio::test]
async fn test_question_over_http() {
    let (server, registry) = spawn_server().await;
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&server, 32).unwrap());
    let manager = ClientSessionManager::new(transport, ClientConfig::default());

    let parser = ask(&manager, "http question").await;
    assert_echo_answer(&parser, "http question");

    manager.end_session().await;
    wait_until_empty(&registry).await;
}

#[tokio::test]
async fn test_duplicate_session_rejected_over_http() {
    let (server, _registry) = spawn_server().await;
    let client = reqwest::Client::new();
    let url = format!("{}/stream?sessionId=dup&type=memory", server);

    let first = client.get(&url).send().await.unwrap();
    assert!(first.status().is_success());

    let second = client.get(&url).send().await.unwrap();
    assert_eq!(second.status(), reqwest::StatusCode::CONFLICT);
    drop(first);
}
