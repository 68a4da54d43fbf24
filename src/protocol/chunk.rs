use crate::error::CodecError;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Kind of content a chunk belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkType {
    Memory,
    Question,
    Transcript,
    Answer,
}

/// Kind of session a client opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Recording a memory: the backend answers with transcripts
    Memory,
    /// Asking a question: the backend answers with transcript, citations and an answer
    Question,
}

impl SessionKind {
    /// Chunk type the client tags its input with
    pub fn input_type(self) -> ChunkType {
        match self {
            SessionKind::Memory => ChunkType::Memory,
            SessionKind::Question => ChunkType::Question,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Memory => "memory",
            SessionKind::Question => "question",
        }
    }
}

impl std::str::FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(SessionKind::Memory),
            "question" => Ok(SessionKind::Question),
            other => Err(format!("unknown session type: {}", other)),
        }
    }
}

/// Turn metadata, carried by the first chunk of a turn and by final markers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub session_id: String,

    #[serde(default)]
    pub memory_id: String,

    #[serde(rename = "type")]
    pub chunk_type: ChunkType,

    /// Marks the end of this logical turn
    #[serde(default)]
    pub is_final: bool,

    /// Relevance score, meaning defined by the producer
    #[serde(default)]
    pub score: f32,
}

impl ChunkMetadata {
    pub fn new(session_id: impl Into<String>, memory_id: impl Into<String>, chunk_type: ChunkType) -> Self {
        Self {
            session_id: session_id.into(),
            memory_id: memory_id.into(),
            chunk_type,
            is_final: false,
            score: 0.0,
        }
    }

    pub fn finalized(mut self) -> Self {
        self.is_final = true;
        self
    }
}

/// Chunk payload: text, audio, or nothing (final marker)
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Audio(Vec<u8>),
    Empty,
}

/// One unit of the bidirectional streaming protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireChunk", try_from = "WireChunk")]
pub struct Chunk {
    pub metadata: Option<ChunkMetadata>,
    pub payload: Payload,
}

impl Chunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            metadata: None,
            payload: Payload::Text(text.into()),
        }
    }

    pub fn audio(bytes: Vec<u8>) -> Self {
        Self {
            metadata: None,
            payload: Payload::Audio(bytes),
        }
    }

    /// Payload-less chunk marking the end of input for the turn
    pub fn final_marker(metadata: ChunkMetadata) -> Self {
        Self {
            metadata: Some(metadata.finalized()),
            payload: Payload::Empty,
        }
    }

    pub fn with_metadata(mut self, metadata: ChunkMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn has_payload(&self) -> bool {
        !matches!(self.payload, Payload::Empty)
    }

    pub fn is_final(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.is_final)
    }

    pub fn chunk_type(&self) -> Option<ChunkType> {
        self.metadata.as_ref().map(|m| m.chunk_type)
    }

    pub fn text_data(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Field-per-payload shape used on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ChunkMetadata>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_data: Option<String>,

    /// Base64-encoded bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_data: Option<String>,
}

impl From<Chunk> for WireChunk {
    fn from(chunk: Chunk) -> Self {
        let metadata = chunk.metadata.map(|mut m| {
            if !m.score.is_finite() {
                m.score = 0.0;
            }
            m
        });

        let (text_data, audio_data) = match chunk.payload {
            Payload::Text(text) => (Some(text), None),
            Payload::Audio(bytes) => (
                None,
                Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
            ),
            Payload::Empty => (None, None),
        };

        Self {
            metadata,
            text_data,
            audio_data,
        }
    }
}

impl TryFrom<WireChunk> for Chunk {
    type Error = CodecError;

    fn try_from(wire: WireChunk) -> Result<Self, Self::Error> {
        let payload = match (wire.text_data, wire.audio_data) {
            (Some(_), Some(_)) => {
                return Err(CodecError::MalformedChunk(
                    "chunk carries both textData and audioData".to_string(),
                ))
            }
            (Some(text), None) => Payload::Text(text),
            (None, Some(encoded)) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| CodecError::MalformedChunk(format!("audioData: {}", e)))?;
                Payload::Audio(bytes)
            }
            (None, None) => Payload::Empty,
        };

        Ok(Self {
            metadata: wire.metadata,
            payload,
        })
    }
}
