use crate::error::ClientError;
use crate::protocol::{Chunk, SessionKind};
use tokio::sync::mpsc;

/// What the client asks the server to open
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub session_id: String,
    pub kind: SessionKind,
    pub memory_id: Option<String>,
}

/// Something that happened on a client transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The bridge acknowledged the session
    Connected,
    Chunk(Chunk),
    /// Error frame from the bridge; the transport stays open
    Error(String),
    Closed,
}

/// Write side of an open transport
#[async_trait::async_trait]
pub trait TransportLink: Send + Sync {
    /// Send one chunk and wait for the transport to accept it
    async fn send(&self, chunk: Chunk) -> Result<(), ClientError>;

    /// Close the transport; safe to call more than once
    async fn close(&self);
}

/// An open transport: write side plus the ordered event stream
pub struct TransportSession {
    pub link: Box<dyn TransportLink>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Client-reachable way to the session bridge
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, request: OpenRequest) -> Result<TransportSession, ClientError>;

    /// Transport name for logging
    fn name(&self) -> &str;
}
