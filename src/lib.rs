pub mod answer;
pub mod bridge;
pub mod capture;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod nats;
pub mod protocol;
pub mod upstream;

pub use answer::{AnswerParseState, AnswerSink, AnswerStreamParser, MemoryCitation};
pub use bridge::{SessionBridge, SessionRegistry, SessionState};
pub use capture::{CaptureBackend, CaptureConfig, CaptureProcessor, MicrophoneBackend};
pub use client::{ClientConfig, ClientSessionManager, SessionStatus, Transport};
pub use config::Config;
pub use error::{CaptureError, ClientError, CodecError, SessionError, TimeoutPhase};
pub use http::{create_router, AppState};
pub use nats::NatsClient;
pub use protocol::{decode, encode, Chunk, ChunkMetadata, ChunkType, Payload, SessionKind};
pub use upstream::{MemoryConnector, NatsConnector, UpstreamConnector};
