use super::{StreamOpen, UpstreamConnector, UpstreamEvent, UpstreamStream};
use crate::protocol::{Chunk, ChunkMetadata, ChunkType, Payload, SessionKind};
use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// In-process connector. Every opened stream is handed to the backend side as a
/// [`BackendPeer`].
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<BackendPeer>,
    capacity: usize,
}

impl MemoryConnector {
    pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<BackendPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                capacity: capacity.max(1),
            },
            rx,
        )
    }
}

#[async_trait::async_trait]
impl UpstreamConnector for MemoryConnector {
    async fn open(&self, open: StreamOpen) -> Result<UpstreamStream> {
        let (sink, inbound) = mpsc::channel(self.capacity);
        let (events_tx, events) = mpsc::channel(self.capacity);

        self.peers
            .send(BackendPeer {
                open,
                inbound,
                events: events_tx,
            })
            .ok()
            .context("In-memory backend is gone")?;

        Ok(UpstreamStream { sink, events })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Backend end of one in-memory stream
pub struct BackendPeer {
    pub open: StreamOpen,
    inbound: mpsc::Receiver<Chunk>,
    events: mpsc::Sender<UpstreamEvent>,
}

impl BackendPeer {
    /// Next chunk written by the bridge, `None` once the write side ended
    pub async fn recv(&mut self) -> Option<Chunk> {
        self.inbound.recv().await
    }

    /// Emit a chunk; false when the read side is gone
    pub async fn emit(&self, chunk: Chunk) -> bool {
        self.events.send(UpstreamEvent::Message(chunk)).await.is_ok()
    }

    pub async fn fail(&self, message: impl Into<String>) -> bool {
        self.events
            .send(UpstreamEvent::Error(message.into()))
            .await
            .is_ok()
    }

    /// Signal end of stream
    pub async fn end(self) {
        let _ = self.events.send(UpstreamEvent::End).await;
    }

    /// Whether the bridge dropped the read side
    pub fn is_read_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// Development backend that echoes input back.
///
/// Memory sessions get one transcript chunk per input chunk. Question sessions
/// get the transcript, a citation, and an answer with a thinking span once the
/// final marker arrives.
pub fn spawn_echo_backend(mut peers: mpsc::UnboundedReceiver<BackendPeer>) {
    tokio::spawn(async move {
        while let Some(peer) = peers.recv().await {
            tokio::spawn(echo_session(peer));
        }
        info!("Echo backend stopped");
    });
}

async fn echo_session(mut peer: BackendPeer) {
    let session_id = peer.open.session_id.clone();
    let memory_id = peer.open.memory_id.clone();
    let meta = |chunk_type| ChunkMetadata::new(session_id.clone(), memory_id.clone(), chunk_type);
    let mut heard = String::new();
    let mut first = true;

    debug!(session_id = %session_id, kind = ?peer.open.kind, "Echo session opened");

    while let Some(chunk) = peer.recv().await {
        let piece = match &chunk.payload {
            Payload::Text(text) => text.clone(),
            Payload::Audio(bytes) => format!("[{} bytes of audio]", bytes.len()),
            Payload::Empty => String::new(),
        };

        if !piece.is_empty() {
            heard.push_str(&piece);
            let mut out = Chunk::text(piece);
            if first {
                out = out.with_metadata(meta(ChunkType::Transcript));
                first = false;
            }
            if !peer.emit(out).await {
                return;
            }
        }

        if chunk.is_final() {
            if peer.open.kind == SessionKind::Question {
                let transcript_done = Chunk::final_marker(meta(ChunkType::Transcript));
                let mut citation = meta(ChunkType::Memory);
                citation.score = 1.0;
                let answer = [
                    transcript_done,
                    Chunk::text("echo memory").with_metadata(citation),
                    Chunk::text("<think>repeating").with_metadata(meta(ChunkType::Answer)),
                    Chunk::text(" the question</think>You said: "),
                    Chunk::text(heard.clone()),
                    Chunk::final_marker(meta(ChunkType::Answer)),
                ];
                for out in answer {
                    if !peer.emit(out).await {
                        return;
                    }
                }
                break;
            }
            first = true;
        }
    }

    debug!(session_id = %session_id, "Echo session ended");
    peer.end().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(kind: SessionKind) -> StreamOpen {
        StreamOpen {
            session_id: "s".to_string(),
            kind,
            memory_id: "m".to_string(),
        }
    }

    #[tokio::test]
    async fn test_memory_connector_hands_out_peers() {
        let (connector, mut peers) = MemoryConnector::new(8);
        let mut stream = connector.open(open(SessionKind::Memory)).await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        stream.sink.send(Chunk::text("in")).await.unwrap();
        assert_eq!(peer.recv().await, Some(Chunk::text("in")));

        assert!(peer.emit(Chunk::text("out")).await);
        assert_eq!(
            stream.events.recv().await,
            Some(UpstreamEvent::Message(Chunk::text("out")))
        );

        drop(stream.sink);
        assert_eq!(peer.recv().await, None);

        drop(stream.events);
        assert!(peer.is_read_closed());
    }

    #[tokio::test]
    async fn test_echo_backend_answers_question() {
        let (connector, peers) = MemoryConnector::new(16);
        spawn_echo_backend(peers);

        let mut stream = connector.open(open(SessionKind::Question)).await.unwrap();
        stream.sink.send(Chunk::text("why")).await.unwrap();
        stream
            .sink
            .send(Chunk::final_marker(ChunkMetadata::new("s", "m", ChunkType::Question)))
            .await
            .unwrap();

        let mut saw_final_answer = false;
        while let Some(event) = stream.events.recv().await {
            match event {
                UpstreamEvent::Message(chunk) => {
                    if chunk.is_final() && chunk.chunk_type() == Some(ChunkType::Answer) {
                        saw_final_answer = true;
                    }
                }
                UpstreamEvent::End => break,
                UpstreamEvent::Error(e) => panic!("unexpected error {}", e),
            }
        }
        assert!(saw_final_answer);
    }
}
