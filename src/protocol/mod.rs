//! Streaming chunk protocol
//!
//! - `Chunk` is the unit exchanged in both directions (text, audio, or final marker)
//! - `encode`/`decode` define the socket wire form
//! - `ServerFrame` and the request types define the HTTP streaming endpoint

mod chunk;
mod codec;
mod frames;

pub use chunk::{Chunk, ChunkMetadata, ChunkType, Payload, SessionKind, WireChunk};
pub use codec::{decode, encode};
pub use frames::{EndQuery, OpenQuery, RelayRequest, ServerFrame};
