use super::registry::{CloseMode, SessionRegistry, SessionState, SessionTicket, WriteOutcome};
use crate::error::SessionError;
use crate::protocol::{Chunk, ServerFrame, SessionKind};
use crate::upstream::{StreamOpen, UpstreamConnector, UpstreamEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A freshly opened session, ready to be relayed to a client transport
pub struct OpenedSession {
    pub ticket: SessionTicket,
    events: mpsc::Receiver<UpstreamEvent>,
}

/// Adapts client transports onto backend duplex streams.
///
/// Cheap to clone; all clones share the registry and the connector.
#[derive(Clone)]
pub struct SessionBridge {
    registry: Arc<SessionRegistry>,
    connector: Arc<dyn UpstreamConnector>,
}

impl SessionBridge {
    pub fn new(registry: Arc<SessionRegistry>, connector: Arc<dyn UpstreamConnector>) -> Self {
        Self { registry, connector }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Open a session and its upstream stream
    pub async fn open(
        &self,
        session_id: &str,
        kind: SessionKind,
        memory_id: &str,
    ) -> Result<OpenedSession, SessionError> {
        let ticket = self.registry.reserve(session_id, kind, memory_id).await?;

        let stream = match self
            .connector
            .open(StreamOpen {
                session_id: session_id.to_string(),
                kind,
                memory_id: memory_id.to_string(),
            })
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                error!(session_id, connector = self.connector.name(), "Failed to open upstream stream: {:#}", e);
                self.registry.finish(&ticket).await;
                return Err(SessionError::UpstreamError(e.to_string()));
            }
        };

        if !self.registry.activate(&ticket, stream.sink).await {
            // Closed while the upstream was being opened
            self.registry.finish(&ticket).await;
            return Err(SessionError::SessionNotFound(session_id.to_string()));
        }

        Ok(OpenedSession {
            ticket,
            events: stream.events,
        })
    }

    /// Relay one client chunk to the session's upstream stream.
    ///
    /// Writing to a closing or draining session is a no-op.
    pub async fn relay_inbound(&self, session_id: &str, chunk: Chunk) -> Result<(), SessionError> {
        let Some(pending) = self.registry.prepare_inbound(session_id, chunk).await? else {
            return Ok(());
        };

        match pending.send().await {
            WriteOutcome::Written => Ok(()),
            WriteOutcome::Dropped => {
                debug!(session_id, "Session closed before the chunk was written, dropping");
                Ok(())
            }
            // Upstream write side already gone; fine if we are tearing down
            WriteOutcome::UpstreamGone => match self.registry.state(session_id).await {
                Some(SessionState::Open) => Err(SessionError::RelayFailed(session_id.to_string())),
                _ => Ok(()),
            },
        }
    }

    /// End a session from the client side.
    ///
    /// Question sessions drain unless `force` is set, so the answer still arrives.
    pub async fn end(&self, session_id: &str, force: bool) -> Result<SessionState, SessionError> {
        let kind = self
            .registry
            .kind(session_id)
            .await
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;

        let mode = if kind == SessionKind::Question && !force {
            CloseMode::DrainForAnswer
        } else {
            CloseMode::Immediate
        };

        self.registry.close(session_id, mode).await
    }

    /// Forward upstream output to a client transport until either side ends.
    ///
    /// `client` is the transport's frame queue; a closed queue means the
    /// client is gone. Dropping `client` on return closes the transport.
    pub async fn relay_outbound(&self, session: OpenedSession, client: mpsc::Sender<ServerFrame>) {
        let OpenedSession { ticket, mut events } = session;
        let session_id = ticket.session_id.clone();

        loop {
            tokio::select! {
                biased;

                _ = ticket.cancel.cancelled() => {
                    debug!(session_id = %session_id, "Session cancelled, ending upstream read side");
                    break;
                }

                _ = client.closed() => {
                    self.registry.cancel(&ticket).await;
                    break;
                }

                event = events.recv() => match event {
                    Some(UpstreamEvent::Message(chunk)) => {
                        if client.is_closed() {
                            debug!(session_id = %session_id, "Client gone, dropping message");
                            continue;
                        }
                        let frame = ServerFrame::for_chunk(chunk, ticket.kind);
                        if client.send(frame).await.is_err() {
                            debug!(session_id = %session_id, "Client closed during send, dropping message");
                        }
                    }
                    Some(UpstreamEvent::Error(message)) => {
                        warn!(session_id = %session_id, "Upstream error: {}", message);
                        let _ = client.send(ServerFrame::error(message)).await;
                    }
                    Some(UpstreamEvent::End) | None => {
                        info!(session_id = %session_id, "Upstream stream ended");
                        break;
                    }
                },
            }
        }

        drop(events);
        self.registry.finish(&ticket).await;
    }
}
