use super::messages::ControlMessage;
use crate::protocol::{self, Chunk};
use anyhow::{Context, Result};
use async_nats::Client;
use tracing::{debug, info};

/// Shared NATS connection; cheap to clone, every session stream rides on it
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
}

impl NatsClient {
    /// Connect to NATS server
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        Ok(Self { client })
    }

    /// Publish a codec-encoded chunk
    pub async fn publish_chunk(&self, subject: &str, chunk: &Chunk) -> Result<()> {
        let payload = protocol::encode(chunk);
        let bytes = payload.len();

        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .context("Failed to publish chunk")?;

        debug!(
            "Published chunk to {} (bytes={}, final={})",
            subject,
            bytes,
            chunk.is_final()
        );

        Ok(())
    }

    /// Publish a stream control message
    pub async fn publish_control(&self, subject: &str, message: &ControlMessage) -> Result<()> {
        let payload = serde_json::to_vec(message)?;

        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .context("Failed to publish control message")?;

        debug!("Published {:?} to {}", message, subject);

        Ok(())
    }

    pub async fn subscribe(&self, subject: &str) -> Result<async_nats::Subscriber> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .with_context(|| format!("Failed to subscribe to {}", subject))?;

        debug!("Subscribed to {}", subject);

        Ok(subscriber)
    }
}
