//! Microphone capture pipeline
//!
//! Native-rate input is downmixed, block-average resampled to the target rate,
//! buffered into fixed-duration chunks and encoded as 16-bit PCM.

mod backend;
mod buffer;
mod mic;
pub mod resample;
mod scripted;
mod wav;
mod worklet;

pub use backend::{CaptureBackend, CaptureConfig};
pub use buffer::ChunkBuffer;
pub use mic::MicrophoneBackend;
pub use scripted::ScriptedBackend;
pub use wav::PcmWavWriter;
pub use worklet::{
    CaptureCounters, CaptureProcessor, CaptureStats, WorkletCommand, WorkletConfig, WorkletMessage,
    LEVEL_INTERVAL,
};
