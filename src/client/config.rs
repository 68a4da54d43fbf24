use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeouts and queue sizes for client sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// How long to wait for the bridge's `connected` acknowledgment
    /// Default: 10 seconds
    pub connect_timeout: Duration,

    /// How long to wait for the final answer chunk after a final marker
    /// Default: 30 seconds
    pub answer_timeout: Duration,

    /// Socket transport: close this long after a final chunk if the server has not
    /// Default: 5 seconds
    pub grace_close: Duration,

    /// Capacity of per-session event and chunk queues
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            answer_timeout: Duration::from_secs(30),
            grace_close: Duration::from_secs(5),
            channel_capacity: 64,
        }
    }
}
