use super::worklet::{CaptureStats, WorkletMessage};
use crate::error::CaptureError;
use serde::Deserialize;
use tokio::sync::mpsc;

/// Configuration for audio capture
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Rate the backend expects (will resample to it)
    pub target_sample_rate: u32,
    /// Chunk duration in milliseconds (affects latency)
    pub buffer_duration_ms: u32,
    /// Chunks shorter than this are not worth sending
    pub min_chunk_bytes: usize,
    /// Queue between the audio thread and the consumer
    pub channel_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16000, // 16kHz for speech recognition
            buffer_duration_ms: 100,
            min_chunk_bytes: 320, // 10ms at 16kHz
            channel_capacity: 64,
        }
    }
}

/// Audio capture backend
///
/// Implementations:
/// - Microphone: cpal input stream (all platforms)
/// - Scripted: pre-recorded samples, for tests and file input
#[async_trait::async_trait]
pub trait CaptureBackend: Send {
    /// Start capturing audio
    ///
    /// Returns a receiver of processor output: PCM chunks plus level and debug messages
    async fn start(&mut self) -> Result<mpsc::Receiver<WorkletMessage>, CaptureError>;

    /// Stop capturing; the partially filled chunk is flushed first
    async fn stop(&mut self) -> Result<(), CaptureError>;

    /// Check if backend is currently capturing
    fn is_capturing(&self) -> bool;

    /// Counters since the last start
    fn stats(&self) -> CaptureStats;

    /// Get backend name for logging
    fn name(&self) -> &str;
}
