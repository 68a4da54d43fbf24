use super::chunk::Chunk;
use crate::error::CodecError;

/// Encode a chunk to its wire form (JSON).
///
/// Field order is fixed by the wire struct, so identical chunks always encode
/// to identical bytes. Non-finite scores are written as `0`.
pub fn encode(chunk: &Chunk) -> Vec<u8> {
    // Strings, bools and finite floats always serialize.
    serde_json::to_vec(chunk).unwrap_or_default()
}

/// Decode a chunk from its wire form
pub fn decode(bytes: &[u8]) -> Result<Chunk, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::MalformedChunk(e.to_string()))
}
