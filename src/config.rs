use crate::capture::CaptureConfig;
use crate::client::ClientConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub upstream: UpstreamConfig,
    pub stream: StreamConfig,
    pub audio: AudioConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Backend reached over NATS
    Nats,
    /// In-process echo backend for development
    Echo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub backend: BackendKind,
    pub nats_url: String,
    /// Subject prefix, e.g. `recall.stream`
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub connect_timeout_secs: u64,
    pub answer_timeout_secs: u64,
    pub grace_close_secs: u64,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    pub target_sample_rate: u32,
    pub buffer_duration_ms: u32,
    pub min_chunk_bytes: usize,
}

impl StreamConfig {
    pub fn client(&self) -> ClientConfig {
        ClientConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            answer_timeout: Duration::from_secs(self.answer_timeout_secs),
            grace_close: Duration::from_secs(self.grace_close_secs),
            channel_capacity: self.channel_capacity,
        }
    }
}

impl AudioConfig {
    pub fn capture(&self, channel_capacity: usize) -> CaptureConfig {
        CaptureConfig {
            target_sample_rate: self.target_sample_rate,
            buffer_duration_ms: self.buffer_duration_ms,
            min_chunk_bytes: self.min_chunk_bytes,
            channel_capacity,
        }
    }
}

impl Config {
    /// Load defaults, then the optional file at `path` (extension optional),
    /// then `RECALL__SECTION__KEY` environment overrides
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .set_default("service.name", "recall-stream")?
            .set_default("service.http.bind", "127.0.0.1")?
            .set_default("service.http.port", 3000)?
            .set_default("upstream.backend", "echo")?
            .set_default("upstream.nats_url", "nats://localhost:4222")?
            .set_default("upstream.prefix", "recall.stream")?
            .set_default("stream.connect_timeout_secs", 10)?
            .set_default("stream.answer_timeout_secs", 30)?
            .set_default("stream.grace_close_secs", 5)?
            .set_default("stream.channel_capacity", 64)?
            .set_default("audio.target_sample_rate", 16000)?
            .set_default("audio.buffer_duration_ms", 100)?
            .set_default("audio.min_chunk_bytes", 320)?
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("RECALL").separator("__"))
            .build()
            .with_context(|| format!("Failed to load config from {}", path))?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.service.http.bind, self.service.http.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing");
        let cfg = Config::load(path.to_str().unwrap()).unwrap();

        assert_eq!(cfg.upstream.backend, BackendKind::Echo);
        assert_eq!(cfg.stream.client().connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.stream.client().answer_timeout, Duration::from_secs(30));
        assert_eq!(cfg.audio.target_sample_rate, 16000);
        assert_eq!(cfg.bind_addr(), "127.0.0.1:3000");
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recall.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[upstream]\nbackend = \"nats\"\nprefix = \"test.stream\"\n\n[stream]\nanswer_timeout_secs = 45\n"
        )
        .unwrap();

        let cfg = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.upstream.backend, BackendKind::Nats);
        assert_eq!(cfg.upstream.prefix, "test.stream");
        assert_eq!(cfg.stream.answer_timeout_secs, 45);
        assert_eq!(cfg.stream.connect_timeout_secs, 10);
    }
}
