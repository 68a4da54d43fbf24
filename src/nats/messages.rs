use crate::protocol::SessionKind;
use serde::{Deserialize, Serialize};

/// Control message on a session's control subjects.
///
/// Chunks travel codec-encoded on the data subjects; stream lifecycle travels
/// here so the backend can tell "end of input" from "end of stream".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Client side opened the stream (published before any chunk)
    Open {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "type")]
        kind: SessionKind,
        #[serde(rename = "memoryId")]
        memory_id: String,
        timestamp: String, // RFC3339 timestamp
    },
    /// Client write side ended, backend may keep emitting
    EndInput,
    /// Backend finished the stream
    End,
    /// Backend failed
    Error { message: String },
}

/// Subject names for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSubjects {
    pub inbound: String,
    pub inbound_control: String,
    pub outbound: String,
    pub outbound_control: String,
}

impl SessionSubjects {
    pub fn new(prefix: &str, session_id: &str) -> Self {
        Self {
            inbound: format!("{}.in.{}", prefix, session_id),
            inbound_control: format!("{}.ctl.in.{}", prefix, session_id),
            outbound: format!("{}.out.{}", prefix, session_id),
            outbound_control: format!("{}.ctl.out.{}", prefix, session_id),
        }
    }
}
