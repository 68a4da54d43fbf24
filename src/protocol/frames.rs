use super::chunk::{Chunk, ChunkType, SessionKind};
use serde::{Deserialize, Serialize};

/// JSON frame pushed to HTTP clients as `data: <json>\n\n`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Transcript {
        chunk: Chunk,
    },
    Answer {
        chunk: Chunk,
    },
    Error {
        message: String,
    },
}

impl ServerFrame {
    /// Wrap a backend chunk in the frame type clients expect.
    ///
    /// TRANSCRIPT chunks become `transcript` frames, everything else belongs to
    /// the answer stream. Chunks without metadata follow the session kind.
    pub fn for_chunk(chunk: Chunk, kind: SessionKind) -> Self {
        let is_transcript = match chunk.chunk_type() {
            Some(ChunkType::Transcript) => true,
            Some(_) => false,
            None => kind == SessionKind::Memory,
        };

        if is_transcript {
            ServerFrame::Transcript { chunk }
        } else {
            ServerFrame::Answer { chunk }
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }
}

/// Body of `POST /stream`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    pub session_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_data: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_data: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub final_marker: bool,
}

/// Query of `GET /stream` and the socket endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenQuery {
    pub session_id: String,

    #[serde(rename = "type")]
    pub kind: SessionKind,

    #[serde(default)]
    pub memory_id: Option<String>,
}

/// Query of `DELETE /stream`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndQuery {
    pub session_id: String,

    /// End a question session immediately instead of draining for the answer
    #[serde(default)]
    pub force: bool,
}
