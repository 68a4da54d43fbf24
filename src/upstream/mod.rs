//! Backend duplex streams
//!
//! The transcription/answer backend is reached through one duplex stream per
//! session. A stream is a write half (`sink`, dropping it ends the write side)
//! and an event receiver (dropping it ends the read side).

mod memory;
mod nats;

pub use memory::{spawn_echo_backend, BackendPeer, MemoryConnector};
pub use nats::NatsConnector;

use crate::protocol::{Chunk, SessionKind};
use anyhow::Result;
use tokio::sync::mpsc;

/// Parameters of a new upstream stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOpen {
    pub session_id: String,
    pub kind: SessionKind,
    pub memory_id: String,
}

/// Something the backend emitted on a stream
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Message(Chunk),
    Error(String),
    End,
}

/// One open backend duplex stream
pub struct UpstreamStream {
    /// Write half, drop to end the write side
    pub sink: mpsc::Sender<Chunk>,
    /// Read half, in backend emission order
    pub events: mpsc::Receiver<UpstreamEvent>,
}

/// Opens backend duplex streams, many sessions over one backend connection
#[async_trait::async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn open(&self, open: StreamOpen) -> Result<UpstreamStream>;

    /// Connector name for logging
    fn name(&self) -> &str;
}
