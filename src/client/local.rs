use super::transport::{OpenRequest, Transport, TransportEvent, TransportLink, TransportSession};
use crate::bridge::SessionBridge;
use crate::error::{ClientError, SessionError};
use crate::protocol::{Chunk, ServerFrame};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(super) fn client_error(err: SessionError) -> ClientError {
    match err {
        SessionError::UpstreamError(message) => ClientError::UpstreamError(message),
        other => ClientError::Transport(other.to_string()),
    }
}

/// Map a server frame to a transport event
pub(super) fn frame_event(frame: ServerFrame) -> TransportEvent {
    match frame {
        ServerFrame::Connected { .. } => TransportEvent::Connected,
        ServerFrame::Transcript { chunk } | ServerFrame::Answer { chunk } => TransportEvent::Chunk(chunk),
        ServerFrame::Error { message } => TransportEvent::Error(message),
    }
}

/// In-process transport straight onto a [`SessionBridge`]
#[derive(Clone)]
pub struct LocalTransport {
    bridge: SessionBridge,
    capacity: usize,
}

impl LocalTransport {
    pub fn new(bridge: SessionBridge, capacity: usize) -> Self {
        Self { bridge, capacity }
    }
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    async fn open(&self, request: OpenRequest) -> Result<TransportSession, ClientError> {
        let memory_id = request.memory_id.unwrap_or_default();
        let opened = self
            .bridge
            .open(&request.session_id, request.kind, &memory_id)
            .await
            .map_err(client_error)?;

        let (frames_tx, mut frames_rx) = mpsc::channel(self.capacity);
        let (events_tx, events_rx) = mpsc::channel(self.capacity);
        let cancel = CancellationToken::new();

        // Acknowledged through the frame queue, like the remote transports
        let _ = frames_tx.try_send(ServerFrame::Connected {
            session_id: request.session_id.clone(),
        });

        let bridge = self.bridge.clone();
        tokio::spawn(async move { bridge.relay_outbound(opened, frames_tx).await });

        let pump_cancel = cancel.clone();
        let session_id = request.session_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    frame = frames_rx.recv() => match frame {
                        Some(frame) => {
                            if events_tx.send(frame_event(frame)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = events_tx.send(TransportEvent::Closed).await;
            debug!(session_id = %session_id, "Local transport closed");
        });

        Ok(TransportSession {
            link: Box::new(LocalLink {
                bridge: self.bridge.clone(),
                session_id: request.session_id,
                cancel,
            }),
            events: events_rx,
        })
    }

    fn name(&self) -> &str {
        "local"
    }
}

struct LocalLink {
    bridge: SessionBridge,
    session_id: String,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl TransportLink for LocalLink {
    async fn send(&self, chunk: Chunk) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::NotConnected);
        }
        self.bridge
            .relay_inbound(&self.session_id, chunk)
            .await
            .map_err(client_error)
    }

    async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let _ = self.bridge.end(&self.session_id, true).await;
    }
}
