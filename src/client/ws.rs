use super::local::frame_event;
use super::transport::{OpenRequest, Transport, TransportEvent, TransportLink, TransportSession};
use crate::error::ClientError;
use crate::protocol::{self, Chunk, ServerFrame};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Socket transport: codec-encoded chunks as binary frames both ways
#[derive(Clone)]
pub struct WsTransport {
    socket_url: Url,
    capacity: usize,
    grace_close: Duration,
}

impl WsTransport {
    /// `base_url` is the server root, e.g. `ws://127.0.0.1:3000`
    pub fn new(base_url: &str, capacity: usize, grace_close: Duration) -> Result<Self, ClientError> {
        let socket_url = Url::parse(base_url)
            .and_then(|base| base.join("ws"))
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        Ok(Self {
            socket_url,
            capacity,
            grace_close,
        })
    }
}

/// Decode one inbound socket message
fn socket_event(message: Message) -> Option<TransportEvent> {
    match message {
        Message::Binary(bytes) => match protocol::decode(&bytes) {
            Ok(chunk) => Some(TransportEvent::Chunk(chunk)),
            Err(e) => {
                warn!("Dropping inbound frame: {}", e);
                None
            }
        },
        Message::Text(text) => match serde_json::from_str::<ServerFrame>(&text) {
            Ok(frame) => Some(frame_event(frame)),
            Err(_) => Some(TransportEvent::Error(text)),
        },
        Message::Close(_) => Some(TransportEvent::Closed),
        _ => None,
    }
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn open(&self, request: OpenRequest) -> Result<TransportSession, ClientError> {
        let mut url = self.socket_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("sessionId", &request.session_id)
                .append_pair("type", request.kind.as_str());
            if let Some(memory_id) = &request.memory_id {
                query.append_pair("memoryId", memory_id);
            }
        }

        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        info!(session_id = %request.session_id, "Socket connected");

        let (events_tx, events_rx) = mpsc::channel(self.capacity);
        let (chunks_tx, mut chunks_rx) = mpsc::channel::<Chunk>(self.capacity);
        let cancel = CancellationToken::new();

        // Writer: chunks out, grace close after the final one
        let writer_cancel = cancel.clone();
        let grace_close = self.grace_close;
        let session_id = request.session_id.clone();
        tokio::spawn(async move {
            let mut grace: Option<Instant> = None;

            loop {
                let grace_expired = async move {
                    match grace {
                        Some(deadline) => sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    _ = grace_expired => {
                        debug!(session_id = %session_id, "Server did not close, closing socket");
                        break;
                    }
                    chunk = chunks_rx.recv() => {
                        let Some(chunk) = chunk else { break };
                        let is_final = chunk.is_final();
                        if sink.send(Message::Binary(protocol::encode(&chunk))).await.is_err() {
                            break;
                        }
                        if is_final && grace.is_none() {
                            grace = Some(Instant::now() + grace_close);
                        }
                    }
                }
            }

            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
            writer_cancel.cancel();
        });

        // Reader: frames in until either side closes
        let reader_cancel = cancel.clone();
        let session_id = request.session_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    next = source.next() => {
                        let message = match next {
                            Some(Ok(message)) => message,
                            Some(Err(e)) => {
                                warn!(session_id = %session_id, "Socket error: {}", e);
                                break;
                            }
                            None => break,
                        };
                        match socket_event(message) {
                            Some(TransportEvent::Closed) => break,
                            Some(event) => {
                                if events_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            None => {}
                        }
                    }
                }
            }

            reader_cancel.cancel();
            let _ = events_tx.send(TransportEvent::Closed).await;
            debug!(session_id = %session_id, "Socket closed");
        });

        Ok(TransportSession {
            link: Box::new(WsLink {
                chunks: chunks_tx,
                cancel,
            }),
            events: events_rx,
        })
    }

    fn name(&self) -> &str {
        "ws"
    }
}

struct WsLink {
    chunks: mpsc::Sender<Chunk>,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl TransportLink for WsLink {
    async fn send(&self, chunk: Chunk) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::NotConnected);
        }
        self.chunks.send(chunk).await.map_err(|_| ClientError::NotConnected)
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChunkMetadata, ChunkType};

    #[test]
    fn test_socket_url() {
        let transport = WsTransport::new("ws://127.0.0.1:3000", 8, Duration::from_secs(5)).unwrap();
        assert_eq!(transport.socket_url.as_str(), "ws://127.0.0.1:3000/ws");
    }

    #[test]
    fn test_binary_frames_decode_to_chunks() {
        let chunk = Chunk::text("hello").with_metadata(ChunkMetadata::new("s1", "", ChunkType::Answer));
        let event = socket_event(Message::Binary(protocol::encode(&chunk)));
        assert_eq!(event, Some(TransportEvent::Chunk(chunk)));
    }

    #[test]
    fn test_text_frames_are_errors() {
        let frame = serde_json::to_string(&ServerFrame::error("backend down")).unwrap();
        assert_eq!(
            socket_event(Message::Text(frame)),
            Some(TransportEvent::Error("backend down".to_string()))
        );
        assert_eq!(
            socket_event(Message::Text("plain".to_string())),
            Some(TransportEvent::Error("plain".to_string()))
        );
    }

    #[test]
    fn test_connected_acknowledgment() {
        let frame = serde_json::to_string(&ServerFrame::Connected {
            session_id: "s1".to_string(),
        })
        .unwrap();
        assert_eq!(socket_event(Message::Text(frame)), Some(TransportEvent::Connected));
    }

    #[test]
    fn test_malformed_binary_frame_is_dropped() {
        assert_eq!(socket_event(Message::Binary(b"not json".to_vec())), None);
    }
}
