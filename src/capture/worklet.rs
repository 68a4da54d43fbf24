use super::buffer::ChunkBuffer;
use super::resample::{downmix, downmix_interleaved, peak, resample};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Report the input level every this many callbacks
pub const LEVEL_INTERVAL: u64 = 100;

/// Processor configuration carried by the init command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkletConfig {
    pub native_sample_rate: u32,
    pub target_sample_rate: u32,
    pub buffer_duration_ms: u32,
}

impl Default for WorkletConfig {
    fn default() -> Self {
        Self {
            native_sample_rate: 48_000,
            target_sample_rate: 16_000,
            buffer_duration_ms: 100,
        }
    }
}

/// Control messages into the processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkletCommand {
    Init { config: WorkletConfig },
    Stop,
}

/// Messages out of the processor. Debug and level messages are JSON with a
/// `type` field; PCM chunks travel as raw bytes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkletMessage {
    Debug {
        message: String,
    },
    /// Peak amplitude since the previous report
    Level {
        value: f32,
    },
    #[serde(skip_serializing)]
    Pcm {
        data: Vec<u8>,
    },
}

/// Capture counters, shared with whoever started the capture
#[derive(Debug, Default)]
pub struct CaptureCounters {
    chunks_emitted: AtomicU64,
    chunks_dropped_short: AtomicU64,
    chunks_dropped_backpressure: AtomicU64,
    callbacks: AtomicU64,
}

impl CaptureCounters {
    pub fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            chunks_emitted: self.chunks_emitted.load(Ordering::Relaxed),
            chunks_dropped_short: self.chunks_dropped_short.load(Ordering::Relaxed),
            chunks_dropped_backpressure: self.chunks_dropped_backpressure.load(Ordering::Relaxed),
            callbacks: self.callbacks.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time capture statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStats {
    pub chunks_emitted: u64,
    pub chunks_dropped_short: u64,
    pub chunks_dropped_backpressure: u64,
    pub callbacks: u64,
}

/// Real-time capture processor: downmix, resample, buffer, encode.
///
/// Runs on the audio side and never blocks: output goes out with `try_send`,
/// and a full queue drops the message and counts it.
pub struct CaptureProcessor {
    config: Option<WorkletConfig>,
    buffer: Option<ChunkBuffer>,
    min_chunk_bytes: usize,
    output: mpsc::Sender<WorkletMessage>,
    counters: Arc<CaptureCounters>,
    level_peak: f32,
}

impl CaptureProcessor {
    pub fn new(output: mpsc::Sender<WorkletMessage>, min_chunk_bytes: usize) -> Self {
        Self {
            config: None,
            buffer: None,
            min_chunk_bytes,
            output,
            counters: Arc::new(CaptureCounters::default()),
            level_peak: 0.0,
        }
    }

    pub fn counters(&self) -> Arc<CaptureCounters> {
        self.counters.clone()
    }

    pub fn is_active(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn handle_command(&mut self, command: WorkletCommand) {
        match command {
            WorkletCommand::Init { config } => self.init(config),
            WorkletCommand::Stop => {
                if let Some(mut buffer) = self.buffer.take() {
                    if let Some(bytes) = buffer.flush() {
                        self.emit(bytes);
                    }
                }
                self.config = None;
                self.debug("capture stopped".to_string());
            }
        }
    }

    fn init(&mut self, config: WorkletConfig) {
        let reset = match (&self.config, &self.buffer) {
            (Some(current), Some(_)) => {
                current.buffer_duration_ms != config.buffer_duration_ms
                    || current.target_sample_rate != config.target_sample_rate
            }
            _ => true,
        };

        // A new chunk size discards whatever was partially buffered
        if reset {
            self.buffer = Some(ChunkBuffer::new(config.target_sample_rate, config.buffer_duration_ms));
        }
        self.config = Some(config);

        self.debug(format!(
            "capture initialized: {} Hz -> {} Hz, {} ms chunks",
            config.native_sample_rate, config.target_sample_rate, config.buffer_duration_ms
        ));
    }

    /// One callback worth of planar input
    pub fn process(&mut self, channels: &[&[f32]]) {
        if self.is_active() {
            let mono = downmix(channels);
            self.process_mono(&mono);
        }
    }

    /// One callback worth of interleaved input
    pub fn process_interleaved(&mut self, samples: &[f32], channels: usize) {
        if self.is_active() {
            let mono = downmix_interleaved(samples, channels);
            self.process_mono(&mono);
        }
    }

    fn process_mono(&mut self, mono: &[f32]) {
        let (Some(config), Some(buffer)) = (self.config, self.buffer.as_mut()) else {
            return;
        };

        let resampled = resample(mono, config.native_sample_rate, config.target_sample_rate);
        let chunks = buffer.push(&resampled);
        for bytes in chunks {
            self.emit(bytes);
        }

        self.level_peak = self.level_peak.max(peak(mono));
        let callbacks = self.counters.callbacks.fetch_add(1, Ordering::Relaxed) + 1;
        if callbacks % LEVEL_INTERVAL == 0 {
            let level = std::mem::take(&mut self.level_peak);
            // Metering is best effort
            let _ = self.output.try_send(WorkletMessage::Level { value: level });
        }
    }

    fn emit(&self, bytes: Vec<u8>) {
        if bytes.len() < self.min_chunk_bytes {
            self.counters.chunks_dropped_short.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self.output.try_send(WorkletMessage::Pcm { data: bytes }) {
            Ok(()) => {
                self.counters.chunks_emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.counters.chunks_dropped_backpressure.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn debug(&self, message: String) {
        let _ = self.output.try_send(WorkletMessage::Debug { message });
    }
}
