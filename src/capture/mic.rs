// Microphone capture
//
// The cpal callback only pushes raw interleaved samples into a lock-free ring.
// A processing thread drains the ring and runs the capture processor.

use super::backend::{CaptureBackend, CaptureConfig};
use super::worklet::{CaptureCounters, CaptureProcessor, CaptureStats, WorkletCommand, WorkletConfig, WorkletMessage};
use crate::error::CaptureError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

/// Seconds of audio the ring can hold before callbacks are dropped
const RING_SECONDS: usize = 2;

/// Samples drained per processing step, per channel
const DRAIN_FRAMES: usize = 480;

/// Microphone capture through the default cpal input device
pub struct MicrophoneBackend {
    config: CaptureConfig,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    counters: Arc<CaptureCounters>,
}

impl MicrophoneBackend {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            counters: Arc::new(CaptureCounters::default()),
        }
    }
}

fn permission_denied(err: impl std::fmt::Display) -> CaptureError {
    CaptureError::MicrophonePermissionDenied(err.to_string())
}

/// Build the input stream; the callback drops whole buffers when the ring is full
fn build_input_stream(
    device: &cpal::Device,
    config: &cpal::SupportedStreamConfig,
    mut producer: HeapProd<f32>,
    running: Arc<AtomicBool>,
) -> Result<Stream, CaptureError> {
    let err_fn = |err| error!("Microphone stream error: {}", err);
    let stream_config: cpal::StreamConfig = config.clone().into();

    let stream = match config.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if running.load(Ordering::Relaxed) && producer.vacant_len() >= data.len() {
                    producer.push_slice(data);
                }
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                if running.load(Ordering::Relaxed) && producer.vacant_len() >= data.len() {
                    for &sample in data {
                        let _ = producer.try_push(sample as f32 / 32768.0);
                    }
                }
            },
            err_fn,
            None,
        ),
        SampleFormat::I32 => device.build_input_stream(
            &stream_config,
            move |data: &[i32], _: &cpal::InputCallbackInfo| {
                if running.load(Ordering::Relaxed) && producer.vacant_len() >= data.len() {
                    for &sample in data {
                        let _ = producer.try_push(sample as f32 / 2147483648.0);
                    }
                }
            },
            err_fn,
            None,
        ),
        format => {
            return Err(CaptureError::Device(format!("unsupported sample format: {:?}", format)));
        }
    };

    stream.map_err(permission_denied)
}

/// Drain the ring in whole frames until capture stops
fn process_loop(
    mut consumer: HeapCons<f32>,
    mut processor: CaptureProcessor,
    channels: usize,
    running: Arc<AtomicBool>,
) {
    let mut scratch = vec![0.0f32; DRAIN_FRAMES * channels];

    while running.load(Ordering::SeqCst) {
        let available = consumer.occupied_len() / channels * channels;
        if available == 0 {
            std::thread::sleep(Duration::from_millis(5));
            continue;
        }
        let take = available.min(scratch.len());
        let n = consumer.pop_slice(&mut scratch[..take]);
        processor.process_interleaved(&scratch[..n], channels);
    }

    // Whatever is still queued belongs to the last chunk
    let n = consumer.pop_slice(&mut scratch);
    if n > 0 {
        processor.process_interleaved(&scratch[..n], channels);
    }
    processor.handle_command(WorkletCommand::Stop);
}

/// Open the device and run capture on this thread until `running` clears
fn run_capture(
    config: CaptureConfig,
    output: mpsc::Sender<WorkletMessage>,
    counters_tx: oneshot::Sender<Result<Arc<CaptureCounters>, CaptureError>>,
    running: Arc<AtomicBool>,
) {
    let host = cpal::default_host();
    let Some(device) = host.default_input_device() else {
        let _ = counters_tx.send(Err(permission_denied("no input device available")));
        return;
    };

    let supported = match device.default_input_config() {
        Ok(supported) => supported,
        Err(e) => {
            let _ = counters_tx.send(Err(permission_denied(e)));
            return;
        }
    };

    let native_rate = supported.sample_rate().0;
    let channels = supported.channels().max(1) as usize;

    info!(
        "Microphone: {}, {} Hz, {} channels, {:?}",
        device.name().unwrap_or_default(),
        native_rate,
        channels,
        supported.sample_format()
    );

    let ring = HeapRb::<f32>::new(native_rate as usize * channels * RING_SECONDS);
    let (producer, consumer) = ring.split();

    let stream = match build_input_stream(&device, &supported, producer, running.clone()) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = counters_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = counters_tx.send(Err(permission_denied(e)));
        return;
    }

    let mut processor = CaptureProcessor::new(output, config.min_chunk_bytes);
    processor.handle_command(WorkletCommand::Init {
        config: WorkletConfig {
            native_sample_rate: native_rate,
            target_sample_rate: config.target_sample_rate,
            buffer_duration_ms: config.buffer_duration_ms,
        },
    });

    if counters_tx.send(Ok(processor.counters())).is_err() {
        warn!("Capture starter went away");
        running.store(false, Ordering::SeqCst);
    }

    process_loop(consumer, processor, channels, running);
    drop(stream);
    info!("Microphone capture stopped");
}

#[async_trait::async_trait]
impl CaptureBackend for MicrophoneBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<WorkletMessage>, CaptureError> {
        if self.is_capturing() {
            return Err(CaptureError::Device("capture already running".to_string()));
        }

        let (output_tx, output_rx) = mpsc::channel(self.config.channel_capacity);
        let (counters_tx, counters_rx) = oneshot::channel();

        self.running.store(true, Ordering::SeqCst);
        let config = self.config.clone();
        let running = self.running.clone();

        // cpal streams are not Send on every platform; keep the device on its own thread
        let thread = std::thread::Builder::new()
            .name("microphone".to_string())
            .spawn(move || run_capture(config, output_tx, counters_tx, running))
            .map_err(|e| CaptureError::Device(e.to_string()))?;

        match counters_rx.await {
            Ok(Ok(counters)) => {
                self.counters = counters;
                self.thread = Some(thread);
                Ok(output_rx)
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                Err(CaptureError::Device("capture thread exited".to_string()))
            }
        }
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        self.running.store(false, Ordering::SeqCst);

        if let Some(thread) = self.thread.take() {
            tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|e| CaptureError::Device(e.to_string()))?
                .map_err(|_| CaptureError::Device("capture thread panicked".to_string()))?;
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }

    fn name(&self) -> &str {
        "microphone"
    }
}

impl Drop for MicrophoneBackend {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
