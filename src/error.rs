use std::fmt;
use thiserror::Error;

/// Decode failures. A malformed chunk is dropped and logged, never fatal to a session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed chunk: {0}")]
    MalformedChunk(String),
}

/// Server-side session lifecycle errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {0} already exists")]
    DuplicateSession(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("failed to relay chunk for session {0}")]
    RelayFailed(String),
}

/// Which watchdog fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// No `connected` acknowledgment within the connect window
    Connect,
    /// No final answer chunk after the final marker
    Answer,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::Connect => write!(f, "connect"),
            TimeoutPhase::Answer => write!(f, "answer"),
        }
    }
}

/// Client-side errors surfaced through the status channel
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("session {session_id} {phase} timed out, please try again")]
    SessionTimeout {
        session_id: String,
        phase: TimeoutPhase,
    },

    #[error("no connected session")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream error: {0}")]
    UpstreamError(String),
}

/// Capture pipeline errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("microphone permission denied: {0}")]
    MicrophonePermissionDenied(String),

    #[error("invalid audio payload: {0}")]
    InvalidAudioPayload(String),

    #[error("audio device error: {0}")]
    Device(String),
}
