use crate::error::SessionError;
use crate::protocol::{Chunk, ChunkMetadata, SessionKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Lifecycle of a registered session. Removal from the registry is CLOSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Slot reserved, upstream stream still being opened
    Opening,
    Open,
    /// Write side ended, waiting for the backend to finish the answer
    Draining,
    /// Torn down, waiting for the relay task to confirm
    Closing,
}

/// How `close` ends a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// End the write side only and keep relaying until the backend ends
    DrainForAnswer,
    /// End both sides now
    Immediate,
}

/// Identifies one registration of a session id
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub session_id: String,
    pub kind: SessionKind,
    pub generation: u64,
    /// Fired when the session is torn down from outside the relay task
    pub cancel: CancellationToken,
}

/// Snapshot of a registered session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: SessionKind,
    pub memory_id: String,
    pub state: SessionState,
    pub opened_at: DateTime<Utc>,
    pub first_chunk_sent: bool,
}

/// The upstream write half. Writes happen under the lock, so ending the
/// write side waits for an in-flight write and no write follows it.
type UpstreamWriter = Arc<Mutex<Option<mpsc::Sender<Chunk>>>>;

/// What became of a relayed chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The session closed after the chunk was prepared
    Dropped,
    /// The upstream write half went away while the session was still open
    UpstreamGone,
}

/// A relayed chunk, rewritten and ready to be written upstream
pub struct PendingWrite {
    pub chunk: Chunk,
    writer: UpstreamWriter,
    cancel: CancellationToken,
}

impl PendingWrite {
    /// Write the chunk unless the session closed since it was prepared
    pub async fn send(self) -> WriteOutcome {
        let writer = self.writer.lock().await;
        let Some(sink) = writer.as_ref() else {
            return WriteOutcome::Dropped;
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => WriteOutcome::Dropped,
            sent = sink.send(self.chunk) => match sent {
                Ok(()) => WriteOutcome::Written,
                Err(_) => WriteOutcome::UpstreamGone,
            },
        }
    }
}

async fn end_write_side(writer: &UpstreamWriter) {
    writer.lock().await.take();
}

struct SessionEntry {
    generation: u64,
    kind: SessionKind,
    memory_id: String,
    writer: UpstreamWriter,
    first_chunk_sent: bool,
    state: SessionState,
    cancel: CancellationToken,
    opened_at: DateTime<Utc>,
}

impl SessionEntry {
    fn metadata(&self, session_id: &str, is_final: bool) -> ChunkMetadata {
        let mut metadata = ChunkMetadata::new(session_id, self.memory_id.clone(), self.kind.input_type());
        metadata.is_final = is_final;
        metadata
    }

    /// Attach metadata to the first payload chunk and to final markers only
    fn prepare_inbound(&mut self, session_id: &str, chunk: Chunk) -> Option<Chunk> {
        let is_final = chunk.is_final();

        let metadata = if chunk.has_payload() {
            if !self.first_chunk_sent {
                self.first_chunk_sent = true;
                Some(self.metadata(session_id, is_final))
            } else if is_final {
                Some(self.metadata(session_id, true))
            } else {
                None
            }
        } else if is_final {
            Some(self.metadata(session_id, true))
        } else {
            return None;
        };

        Some(Chunk {
            metadata,
            payload: chunk.payload,
        })
    }

    /// Fire the cancel token, once. The caller ends the write side.
    fn begin_closing(&mut self) -> bool {
        if self.state == SessionState::Closing {
            return false;
        }
        self.state = SessionState::Closing;
        self.cancel.cancel();
        true
    }
}

/// Process-wide table of live sessions, one upstream stream per session id.
///
/// Only the bridge acting for a session mutates its entry; every mutation is
/// keyed by the ticket generation so a stale task never touches a newer
/// session that reused the id.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Reserve a slot for `session_id`. A closing session may be replaced, any
    /// other live session makes this fail with `DuplicateSession`.
    pub async fn reserve(
        &self,
        session_id: &str,
        kind: SessionKind,
        memory_id: &str,
    ) -> Result<SessionTicket, SessionError> {
        let mut sessions = self.sessions.write().await;

        if let Some(existing) = sessions.get(session_id) {
            if existing.state != SessionState::Closing {
                return Err(SessionError::DuplicateSession(session_id.to_string()));
            }
            debug!(session_id, "Replacing closing session");
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                generation,
                kind,
                memory_id: memory_id.to_string(),
                writer: Arc::new(Mutex::new(None)),
                first_chunk_sent: false,
                state: SessionState::Opening,
                cancel: cancel.clone(),
                opened_at: Utc::now(),
            },
        );

        Ok(SessionTicket {
            session_id: session_id.to_string(),
            kind,
            generation,
            cancel,
        })
    }

    /// Attach the upstream write half to a reserved slot
    pub async fn activate(&self, ticket: &SessionTicket, sink: mpsc::Sender<Chunk>) -> bool {
        let mut sessions = self.sessions.write().await;

        match sessions.get_mut(&ticket.session_id) {
            Some(entry) if entry.generation == ticket.generation && entry.state == SessionState::Opening => {
                entry.writer = Arc::new(Mutex::new(Some(sink)));
                entry.state = SessionState::Open;
                info!(session_id = %ticket.session_id, kind = ticket.kind.as_str(), "Session OPEN");
                true
            }
            _ => false,
        }
    }

    /// Rewrite the chunk for upstream, or `None` when the session is no longer
    /// writable (idempotent close).
    pub async fn prepare_inbound(&self, session_id: &str, chunk: Chunk) -> Result<Option<PendingWrite>, SessionError> {
        let mut sessions = self.sessions.write().await;

        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;

        match entry.state {
            SessionState::Opening => Err(SessionError::SessionNotFound(session_id.to_string())),
            SessionState::Draining | SessionState::Closing => {
                debug!(session_id, state = ?entry.state, "Ignoring chunk for closing session");
                Ok(None)
            }
            SessionState::Open => {
                let writer = entry.writer.clone();
                let cancel = entry.cancel.clone();
                match entry.prepare_inbound(session_id, chunk) {
                    Some(chunk) => Ok(Some(PendingWrite { chunk, writer, cancel })),
                    None => {
                        debug!(session_id, "Ignoring empty non-final chunk");
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Close a session from the client side
    pub async fn close(&self, session_id: &str, mode: CloseMode) -> Result<SessionState, SessionError> {
        let (state, writer) = {
            let mut sessions = self.sessions.write().await;

            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;

            match (mode, entry.state) {
                (_, SessionState::Closing) => {}
                (CloseMode::DrainForAnswer, SessionState::Draining) => {}
                (CloseMode::DrainForAnswer, _) => {
                    entry.state = SessionState::Draining;
                    info!(session_id, "Session DRAINING, write side ended");
                }
                (CloseMode::Immediate, _) => {
                    entry.begin_closing();
                    info!(session_id, "Session CLOSING");
                }
            }

            (entry.state, entry.writer.clone())
        };

        end_write_side(&writer).await;
        Ok(state)
    }

    /// The client transport went away: tear the session down if this ticket
    /// still owns it. Returns false when it was already closing.
    pub async fn cancel(&self, ticket: &SessionTicket) -> bool {
        let (first, writer) = {
            let mut sessions = self.sessions.write().await;

            match sessions.get_mut(&ticket.session_id) {
                Some(entry) if entry.generation == ticket.generation => {
                    let first = entry.begin_closing();
                    if first {
                        info!(session_id = %ticket.session_id, "Client gone, session CLOSING");
                    }
                    (first, entry.writer.clone())
                }
                _ => return false,
            }
        };

        end_write_side(&writer).await;
        first
    }

    /// Upstream confirmed the end: remove the entry (CLOSED)
    pub async fn finish(&self, ticket: &SessionTicket) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;

            let owned = sessions
                .get(&ticket.session_id)
                .is_some_and(|entry| entry.generation == ticket.generation);

            if owned {
                sessions.remove(&ticket.session_id)
            } else {
                None
            }
        };

        let Some(entry) = removed else {
            return false;
        };
        end_write_side(&entry.writer).await;
        info!(session_id = %ticket.session_id, "Session CLOSED");
        true
    }

    pub async fn state(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.read().await.get(session_id).map(|e| e.state)
    }

    pub async fn kind(&self, session_id: &str) -> Option<SessionKind> {
        self.sessions.read().await.get(session_id).map(|e| e.kind)
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, entry)| SessionInfo {
                session_id: id.clone(),
                kind: entry.kind,
                memory_id: entry.memory_id.clone(),
                state: entry.state,
                opened_at: entry.opened_at,
                first_chunk_sent: entry.first_chunk_sent,
            })
            .collect();
        list.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        list
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
