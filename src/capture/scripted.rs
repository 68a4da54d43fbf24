use super::backend::{CaptureBackend, CaptureConfig};
use super::worklet::{CaptureCounters, CaptureProcessor, CaptureStats, WorkletCommand, WorkletConfig, WorkletMessage};
use crate::error::CaptureError;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Callback size in milliseconds, like an audio device delivering 10 ms buffers
const CALLBACK_MS: u64 = 10;

/// Replays pre-recorded interleaved samples through the capture processor
/// at real-time pace.
pub struct ScriptedBackend {
    config: CaptureConfig,
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
    channels: usize,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    counters: Arc<CaptureCounters>,
}

impl ScriptedBackend {
    pub fn new(config: CaptureConfig, samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            config,
            samples: Arc::new(samples),
            sample_rate,
            channels: channels.max(1) as usize,
            cancel: CancellationToken::new(),
            task: None,
            counters: Arc::new(CaptureCounters::default()),
        }
    }

    /// Load a WAV file
    pub fn from_wav(config: CaptureConfig, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = hound::WavReader::open(path)
            .with_context(|| format!("Failed to open WAV file: {:?}", path))?;
        let spec = reader.spec();

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<Result<_, _>>()
                .context("Failed to read WAV samples")?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1) as u32)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|s| s as f32 / scale))
                    .collect::<Result<_, _>>()
                    .context("Failed to read WAV samples")?
            }
        };

        Ok(Self::new(config, samples, spec.sample_rate, spec.channels))
    }

    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() / self.channels;
        Duration::from_secs_f64(frames as f64 / self.sample_rate.max(1) as f64)
    }
}

#[async_trait::async_trait]
impl CaptureBackend for ScriptedBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<WorkletMessage>, CaptureError> {
        if self.is_capturing() {
            return Err(CaptureError::Device("capture already running".to_string()));
        }

        let (output_tx, output_rx) = mpsc::channel(self.config.channel_capacity);
        let mut processor = CaptureProcessor::new(output_tx, self.config.min_chunk_bytes);
        processor.handle_command(WorkletCommand::Init {
            config: WorkletConfig {
                native_sample_rate: self.sample_rate,
                target_sample_rate: self.config.target_sample_rate,
                buffer_duration_ms: self.config.buffer_duration_ms,
            },
        });
        self.counters = processor.counters();

        self.cancel = CancellationToken::new();
        let cancel = self.cancel.clone();
        let samples = self.samples.clone();
        let block = (self.sample_rate as u64 * CALLBACK_MS / 1000).max(1) as usize * self.channels;
        let channels = self.channels;

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(CALLBACK_MS));
            for callback in samples.chunks(block) {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => processor.process_interleaved(callback, channels),
                }
            }
            processor.handle_command(WorkletCommand::Stop);
            debug!("Scripted capture finished");
        }));

        Ok(output_rx)
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.await.map_err(|e| CaptureError::Device(e.to_string()))?;
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
