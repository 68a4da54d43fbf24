use super::config::ClientConfig;
use super::transport::{OpenRequest, Transport, TransportEvent, TransportLink};
use super::watchdog::Watchdog;
use crate::error::{ClientError, TimeoutPhase};
use crate::protocol::{Chunk, ChunkMetadata, ChunkType, Payload, SessionKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Session lifecycle notifications for the caller
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    Connecting { session_id: String },
    Connected { session_id: String },
    /// One per failure event
    Error(ClientError),
    Ended { session_id: String },
}

struct SessionFlags {
    connected: AtomicBool,
    /// Latched before teardown; suppresses sends
    ending: AtomicBool,
    /// Next payload chunk starts a turn and carries metadata
    first_chunk_pending: AtomicBool,
}

enum LoopCommand {
    Rewire {
        chunks: mpsc::Sender<Chunk>,
        status: mpsc::Sender<SessionStatus>,
    },
    ArmAnswerWatchdog,
}

struct ActiveSession {
    session_id: String,
    kind: SessionKind,
    memory_id: String,
    link: Arc<dyn TransportLink>,
    flags: Arc<SessionFlags>,
    control: mpsc::Sender<LoopCommand>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveSession {
    fn is_live(&self) -> bool {
        self.flags.connected.load(Ordering::SeqCst)
            && !self.flags.ending.load(Ordering::SeqCst)
            && !self.task.is_finished()
    }

    fn metadata(&self) -> ChunkMetadata {
        ChunkMetadata::new(&self.session_id, &self.memory_id, self.kind.input_type())
    }

    /// End the session and wait until its loop confirms
    async fn shutdown(self) {
        self.flags.ending.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(session_id = %self.session_id, "Session task panicked: {}", e);
        }
    }
}

/// Everything a send needs, copied out of the active session
struct Writer {
    link: Arc<dyn TransportLink>,
    flags: Arc<SessionFlags>,
    metadata: ChunkMetadata,
    control: mpsc::Sender<LoopCommand>,
    kind: SessionKind,
}

/// Owns the single active client session.
///
/// Inbound chunks and status changes are delivered over the channels passed to
/// [`start_recording_session`](Self::start_recording_session); a single loop per
/// session consumes the transport and feeds them. Failed sessions are never
/// retried automatically.
pub struct ClientSessionManager {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    active: Mutex<Option<ActiveSession>>,
    start_lock: Mutex<()>,
}

impl ClientSessionManager {
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            transport,
            config,
            active: Mutex::new(None),
            start_lock: Mutex::new(()),
        }
    }

    /// Start (or reuse) a session of `kind`.
    ///
    /// A connected session of the same kind is reused with the new channels. A
    /// session of another kind is fully ended first. Returns once the bridge
    /// acknowledged the session, or fails with `SessionTimeout` after the
    /// connect timeout.
    pub async fn start_recording_session(
        &self,
        kind: SessionKind,
        chunks: mpsc::Sender<Chunk>,
        status: mpsc::Sender<SessionStatus>,
    ) -> Result<(), ClientError> {
        let _starting = self.start_lock.lock().await;

        let previous = {
            let mut active = self.active.lock().await;
            match active.as_ref() {
                Some(session) if session.kind == kind && session.is_live() => {
                    debug!(session_id = %session.session_id, "Reusing {} session", kind.as_str());
                    return session
                        .control
                        .send(LoopCommand::Rewire { chunks, status })
                        .await
                        .map_err(|_| ClientError::NotConnected);
                }
                _ => active.take(),
            }
        };

        if let Some(previous) = previous {
            info!(
                session_id = %previous.session_id,
                "Ending {} session before starting {} session",
                previous.kind.as_str(),
                kind.as_str()
            );
            previous.shutdown().await;
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let memory_id = match kind {
            SessionKind::Memory => format!("memory-{}", uuid::Uuid::new_v4()),
            SessionKind::Question => String::new(),
        };

        let _ = status
            .send(SessionStatus::Connecting {
                session_id: session_id.clone(),
            })
            .await;

        let deadline = Instant::now() + self.config.connect_timeout;
        let request = OpenRequest {
            session_id: session_id.clone(),
            kind,
            memory_id: (!memory_id.is_empty()).then(|| memory_id.clone()),
        };

        let opened = match timeout_at(deadline, self.transport.open(request)).await {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                error!(session_id = %session_id, transport = self.transport.name(), "Failed to open session: {}", e);
                let _ = status.send(SessionStatus::Error(e.clone())).await;
                return Err(e);
            }
            Err(_) => {
                let e = ClientError::SessionTimeout {
                    session_id: session_id.clone(),
                    phase: TimeoutPhase::Connect,
                };
                warn!("{}", e);
                let _ = status.send(SessionStatus::Error(e.clone())).await;
                return Err(e);
            }
        };

        let link: Arc<dyn TransportLink> = Arc::from(opened.link);
        let flags = Arc::new(SessionFlags {
            connected: AtomicBool::new(false),
            ending: AtomicBool::new(false),
            first_chunk_pending: AtomicBool::new(true),
        });
        let (control_tx, control_rx) = mpsc::channel(8);
        let (connected_tx, connected_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let mut watchdog = Watchdog::new();
        watchdog.arm_at(TimeoutPhase::Connect, deadline);

        let session_loop = SessionLoop {
            session_id: session_id.clone(),
            link: link.clone(),
            events: opened.events,
            control: control_rx,
            chunks,
            status,
            flags: flags.clone(),
            cancel: cancel.clone(),
            watchdog,
            answer_timeout: self.config.answer_timeout,
            connected: Some(connected_tx),
        };
        let task = tokio::spawn(session_loop.run());

        *self.active.lock().await = Some(ActiveSession {
            session_id: session_id.clone(),
            kind,
            memory_id,
            link,
            flags,
            control: control_tx,
            cancel,
            task,
        });

        let result = match connected_rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Transport(
                "session ended before it connected".to_string(),
            )),
        };

        match result {
            Ok(()) => {
                info!(session_id = %session_id, "{} session connected", kind.as_str());
                Ok(())
            }
            Err(e) => {
                self.discard(&session_id).await;
                Err(e)
            }
        }
    }

    async fn discard(&self, session_id: &str) {
        let session = {
            let mut active = self.active.lock().await;
            if active.as_ref().is_some_and(|s| s.session_id == session_id) {
                active.take()
            } else {
                None
            }
        };
        if let Some(session) = session {
            session.shutdown().await;
        }
    }

    async fn writer(&self) -> Option<Writer> {
        let active = self.active.lock().await;
        let session = active.as_ref()?;

        if !session.flags.connected.load(Ordering::SeqCst) || session.flags.ending.load(Ordering::SeqCst) {
            return None;
        }

        Some(Writer {
            link: session.link.clone(),
            flags: session.flags.clone(),
            metadata: session.metadata(),
            control: session.control.clone(),
            kind: session.kind,
        })
    }

    async fn send_payload(&self, payload: Payload) -> bool {
        let Some(writer) = self.writer().await else {
            return false;
        };

        let mut chunk = Chunk {
            metadata: None,
            payload,
        };
        if writer.flags.first_chunk_pending.swap(false, Ordering::SeqCst) {
            chunk.metadata = Some(writer.metadata);
        }

        match writer.link.send(chunk).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send chunk: {}", e);
                false
            }
        }
    }

    /// Send captured audio; false when no session is connected
    pub async fn send_audio_data(&self, bytes: Vec<u8>) -> bool {
        self.send_payload(Payload::Audio(bytes)).await
    }

    /// Send typed text; false when no session is connected
    pub async fn send_text_data(&self, text: impl Into<String>) -> bool {
        self.send_payload(Payload::Text(text.into())).await
    }

    /// Tell the backend the input of this turn is complete.
    ///
    /// The session stays open for output. On question sessions this arms the
    /// answer watchdog.
    pub async fn send_final_marker(&self) -> bool {
        let Some(writer) = self.writer().await else {
            return false;
        };

        let chunk = Chunk::final_marker(writer.metadata);
        writer.flags.first_chunk_pending.store(true, Ordering::SeqCst);

        if let Err(e) = writer.link.send(chunk).await {
            warn!("Failed to send final marker: {}", e);
            return false;
        }

        if writer.kind == SessionKind::Question {
            let _ = writer.control.send(LoopCommand::ArmAnswerWatchdog).await;
        }

        true
    }

    /// End the active session, if any. Safe to call repeatedly.
    pub async fn end_session(&self) {
        let session = self.active.lock().await.take();
        if let Some(session) = session {
            info!(session_id = %session.session_id, "Ending session");
            session.shutdown().await;
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.active.lock().await.as_ref().is_some_and(|s| s.is_live())
    }

    pub async fn active_session_id(&self) -> Option<String> {
        self.active.lock().await.as_ref().map(|s| s.session_id.clone())
    }

    pub async fn active_kind(&self) -> Option<SessionKind> {
        self.active.lock().await.as_ref().map(|s| s.kind)
    }
}

/// Per-session state machine: transport events in, chunks and status out
struct SessionLoop {
    session_id: String,
    link: Arc<dyn TransportLink>,
    events: mpsc::Receiver<TransportEvent>,
    control: mpsc::Receiver<LoopCommand>,
    chunks: mpsc::Sender<Chunk>,
    status: mpsc::Sender<SessionStatus>,
    flags: Arc<SessionFlags>,
    cancel: CancellationToken,
    watchdog: Watchdog,
    answer_timeout: Duration,
    connected: Option<oneshot::Sender<Result<(), ClientError>>>,
}

impl SessionLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!(session_id = %self.session_id, "Session cancelled");
                    break;
                }

                phase = self.watchdog.expired() => {
                    let e = ClientError::SessionTimeout {
                        session_id: self.session_id.clone(),
                        phase,
                    };
                    warn!("{}", e);
                    self.fail(e).await;
                    break;
                }

                Some(command) = self.control.recv() => self.handle_command(command),

                event = self.events.recv() => {
                    if !self.handle_event(event).await {
                        break;
                    }
                }
            }
        }

        self.teardown().await;
    }

    fn handle_command(&mut self, command: LoopCommand) {
        match command {
            LoopCommand::Rewire { chunks, status } => {
                self.chunks = chunks;
                self.status = status;
            }
            LoopCommand::ArmAnswerWatchdog => {
                self.watchdog.arm(TimeoutPhase::Answer, self.answer_timeout);
            }
        }
    }

    /// Returns false when the session is over
    async fn handle_event(&mut self, event: Option<TransportEvent>) -> bool {
        match event {
            Some(TransportEvent::Connected) => {
                if !self.flags.connected.swap(true, Ordering::SeqCst) {
                    self.watchdog.disarm(TimeoutPhase::Connect);
                    if let Some(waiter) = self.connected.take() {
                        let _ = waiter.send(Ok(()));
                    }
                    let connected = SessionStatus::Connected {
                        session_id: self.session_id.clone(),
                    };
                    deliver(&self.cancel, &self.status, connected).await;
                }
                true
            }
            Some(TransportEvent::Chunk(chunk)) => {
                if chunk.is_final() && chunk.chunk_type() == Some(ChunkType::Answer) {
                    self.watchdog.disarm(TimeoutPhase::Answer);
                }
                if !deliver(&self.cancel, &self.chunks, chunk).await {
                    debug!(session_id = %self.session_id, "Chunk handler gone, dropping chunk");
                }
                true
            }
            Some(TransportEvent::Error(message)) => {
                warn!(session_id = %self.session_id, "Upstream error: {}", message);
                let e = ClientError::UpstreamError(message);
                if self.flags.connected.load(Ordering::SeqCst) {
                    deliver(&self.cancel, &self.status, SessionStatus::Error(e)).await;
                    true
                } else {
                    self.fail(e).await;
                    false
                }
            }
            Some(TransportEvent::Closed) | None => {
                info!(session_id = %self.session_id, "Transport closed");
                false
            }
        }
    }

    /// Surface a failure once: to a waiting starter and on the status channel
    async fn fail(&mut self, e: ClientError) {
        if let Some(waiter) = self.connected.take() {
            let _ = waiter.send(Err(e.clone()));
        }
        deliver(&self.cancel, &self.status, SessionStatus::Error(e)).await;
    }

    async fn teardown(mut self) {
        self.flags.ending.store(true, Ordering::SeqCst);
        self.flags.connected.store(false, Ordering::SeqCst);
        self.link.close().await;

        if let Some(waiter) = self.connected.take() {
            let _ = waiter.send(Err(ClientError::Transport(
                "transport closed before the session connected".to_string(),
            )));
        }

        // Never wait on a caller that stopped reading
        let ended = SessionStatus::Ended {
            session_id: self.session_id.clone(),
        };
        if self.status.try_send(ended).is_err() {
            debug!(session_id = %self.session_id, "Status handler full or gone, dropping Ended");
        }
        debug!(session_id = %self.session_id, "Session loop stopped");
    }
}

/// Hand `item` to a caller channel unless the session is cancelled first
async fn deliver<T>(cancel: &CancellationToken, tx: &mpsc::Sender<T>, item: T) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}
