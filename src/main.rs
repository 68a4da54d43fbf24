use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use recall_stream::answer::{AnswerParseState, AnswerSink, AnswerStreamParser, MemoryCitation};
use recall_stream::capture::{CaptureBackend, MicrophoneBackend, PcmWavWriter, ScriptedBackend, WorkletMessage};
use recall_stream::client::{ClientSessionManager, HttpTransport, SessionStatus, Transport, WsTransport};
use recall_stream::config::BackendKind;
use recall_stream::upstream::{spawn_echo_backend, MemoryConnector, NatsConnector, UpstreamConnector};
use recall_stream::{create_router, AppState, Config, SessionKind};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "recall-stream", version, about = "Streaming voice and text sessions")]
struct Cli {
    /// Config file, extension optional
    #[arg(long, default_value = "config/recall-stream")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum TransportKind {
    Ws,
    Http,
}

#[derive(Subcommand)]
enum Command {
    /// Run the session bridge server
    Serve,

    /// Ask a question and print the answer as it streams
    Ask {
        text: String,

        #[arg(long, default_value = "http://127.0.0.1:3000")]
        server: String,

        #[arg(long, value_enum, default_value_t = TransportKind::Ws)]
        transport: TransportKind,
    },

    /// Record from the microphone into a memory session
    Record {
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        server: String,

        #[arg(long, value_enum, default_value_t = TransportKind::Ws)]
        transport: TransportKind,

        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        seconds: Option<u64>,

        /// Also write the sent audio to this WAV file
        #[arg(long)]
        wav: Option<PathBuf>,

        /// Stream a WAV file instead of the microphone
        #[arg(long)]
        input: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    match cli.command {
        Command::Serve => serve(cfg).await,
        Command::Ask { text, server, transport } => ask(cfg, &server, transport, text).await,
        Command::Record {
            server,
            transport,
            seconds,
            wav,
            input,
        } => record(cfg, &server, transport, seconds, wav, input).await,
    }
}

async fn serve(cfg: Config) -> Result<()> {
    let capacity = cfg.stream.channel_capacity;

    let connector: Arc<dyn UpstreamConnector> = match cfg.upstream.backend {
        BackendKind::Nats => Arc::new(
            NatsConnector::connect(&cfg.upstream.nats_url, cfg.upstream.prefix.clone(), capacity).await?,
        ),
        BackendKind::Echo => {
            let (connector, peers) = MemoryConnector::new(capacity);
            spawn_echo_backend(peers);
            Arc::new(connector)
        }
    };

    info!("{} using {} backend", cfg.service.name, connector.name());

    let app = create_router(AppState::new(connector, capacity));
    let addr = cfg.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("Server error")
}

fn build_transport(cfg: &Config, server: &str, kind: TransportKind) -> Result<Arc<dyn Transport>> {
    let client = cfg.stream.client();
    let transport: Arc<dyn Transport> = match kind {
        TransportKind::Http => Arc::new(HttpTransport::new(server, client.channel_capacity)?),
        TransportKind::Ws => {
            // http -> ws, https -> wss
            let socket_base = server.replacen("http", "ws", 1);
            Arc::new(WsTransport::new(&socket_base, client.channel_capacity, client.grace_close)?)
        }
    };
    Ok(transport)
}

/// Prints the answer to the terminal as it grows
#[derive(Default)]
struct TerminalSink {
    printed_thinking: usize,
    printed_answer: usize,
}

impl AnswerSink for TerminalSink {
    fn memory(&mut self, citation: &MemoryCitation) {
        println!("[memory {} ({:.2})] {}", citation.id, citation.score, citation.text);
    }

    fn update(&mut self, state: &AnswerParseState) {
        let mut out = std::io::stdout();
        if state.thinking_text.len() > self.printed_thinking {
            let _ = write!(out, "{}", &state.thinking_text[self.printed_thinking..]);
            self.printed_thinking = state.thinking_text.len();
        }
        if state.answer_text.len() > self.printed_answer {
            let _ = write!(out, "{}", &state.answer_text[self.printed_answer..]);
            self.printed_answer = state.answer_text.len();
        }
        let _ = out.flush();
    }

    fn complete(&mut self, state: &AnswerParseState) {
        self.update(state);
        println!();
        if let Some(seconds) = state.thinking_elapsed_seconds {
            println!("(thought for {:.1}s)", seconds);
        }
    }
}

async fn ask(cfg: Config, server: &str, transport: TransportKind, text: String) -> Result<()> {
    let client = cfg.stream.client();
    let capacity = client.channel_capacity;
    let manager = ClientSessionManager::new(build_transport(&cfg, server, transport)?, client);

    let (chunks_tx, mut chunks_rx) = mpsc::channel(capacity);
    let (status_tx, mut status_rx) = mpsc::channel(capacity);

    manager
        .start_recording_session(SessionKind::Question, chunks_tx, status_tx)
        .await?;

    if !manager.send_text_data(text).await || !manager.send_final_marker().await {
        manager.end_session().await;
        bail!("Session closed before the question was sent");
    }

    let mut parser = AnswerStreamParser::new()
        .with_sink_factory(|| Box::new(TerminalSink::default()) as Box<dyn AnswerSink>);

    loop {
        tokio::select! {
            biased;

            chunk = chunks_rx.recv() => match chunk {
                Some(chunk) => {
                    parser.push(&chunk);
                    if parser.state().is_complete {
                        break;
                    }
                }
                None => break,
            },

            status = status_rx.recv() => match status {
                Some(SessionStatus::Error(e)) => error!("{}", e),
                Some(SessionStatus::Ended { .. }) | None => {
                    // Drain what arrived before the close
                    while let Ok(chunk) = chunks_rx.try_recv() {
                        parser.push(&chunk);
                    }
                    parser.mark_complete();
                    break;
                }
                Some(status) => debug!("{:?}", status),
            },
        }
    }

    manager.end_session().await;

    if !parser.transcript().is_empty() {
        info!("Transcript: {}", parser.transcript());
    }
    if !parser.state().is_complete {
        warn!("Answer incomplete");
    }
    Ok(())
}

async fn record(
    cfg: Config,
    server: &str,
    transport: TransportKind,
    seconds: Option<u64>,
    wav: Option<PathBuf>,
    input: Option<PathBuf>,
) -> Result<()> {
    let client = cfg.stream.client();
    let capacity = client.channel_capacity;
    let capture_cfg = cfg.audio.capture(capacity);

    let mut backend: Box<dyn CaptureBackend> = match input {
        Some(path) => Box::new(ScriptedBackend::from_wav(capture_cfg, path)?),
        None => Box::new(MicrophoneBackend::new(capture_cfg)),
    };

    // No microphone, no session
    let mut messages = backend.start().await?;
    info!("Capturing from {}", backend.name());

    let manager = ClientSessionManager::new(build_transport(&cfg, server, transport)?, client);
    let (chunks_tx, mut chunks_rx) = mpsc::channel(capacity);
    let (status_tx, mut status_rx) = mpsc::channel(capacity);

    if let Err(e) = manager
        .start_recording_session(SessionKind::Memory, chunks_tx, status_tx)
        .await
    {
        let _ = backend.stop().await;
        return Err(e.into());
    }

    let mut wav = wav
        .map(|path| PcmWavWriter::create(path, cfg.audio.target_sample_rate))
        .transpose()?;
    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));

    loop {
        let time_up = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = time_up => break,

            message = messages.recv() => match message {
                Some(WorkletMessage::Pcm { data }) => {
                    if let Some(wav) = wav.as_mut() {
                        wav.write_chunk(&data)?;
                    }
                    if !manager.send_audio_data(data).await {
                        warn!("Session is no longer connected");
                        break;
                    }
                }
                Some(WorkletMessage::Level { value }) => debug!("Input level {:.3}", value),
                Some(WorkletMessage::Debug { message }) => debug!("Capture: {}", message),
                None => break,
            },

            chunk = chunks_rx.recv() => match chunk {
                Some(chunk) => {
                    if let Some(text) = chunk.text_data() {
                        print!("{}", text);
                        let _ = std::io::stdout().flush();
                    }
                }
                None => {
                    warn!("Session ended");
                    break;
                }
            },

            Some(status) = status_rx.recv() => {
                if let SessionStatus::Error(e) = status {
                    error!("{}", e);
                }
            }
        }
    }

    backend.stop().await?;

    // Tail of the recording flushed by stop
    while let Ok(message) = messages.try_recv() {
        if let WorkletMessage::Pcm { data } = message {
            if let Some(wav) = wav.as_mut() {
                wav.write_chunk(&data)?;
            }
            manager.send_audio_data(data).await;
        }
    }

    if manager.send_final_marker().await {
        // Give the backend a moment to deliver the last transcript
        while let Ok(Some(chunk)) = timeout(Duration::from_secs(2), chunks_rx.recv()).await {
            if let Some(text) = chunk.text_data() {
                print!("{}", text);
            }
            if chunk.is_final() {
                break;
            }
        }
        println!();
    }

    manager.end_session().await;
    info!("Capture stats: {:?}", backend.stats());

    if let Some(wav) = wav {
        wav.finish()?;
    }
    Ok(())
}
