use super::local::frame_event;
use super::transport::{OpenRequest, Transport, TransportEvent, TransportLink, TransportSession};
use crate::error::ClientError;
use crate::protocol::{Chunk, Payload, RelayRequest, ServerFrame};
use futures::StreamExt;
use reqwest::header::ACCEPT;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

fn transport_error(err: impl std::fmt::Display) -> ClientError {
    ClientError::Transport(err.to_string())
}

/// Incremental server-sent events decoder.
///
/// Bytes may arrive split anywhere; complete events are separated by a blank
/// line. Only `data:` fields are kept, joined with newlines.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning the data of every completed event
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let text = String::from_utf8_lossy(&block[..end]);

            let data: Vec<&str> = text
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|value| value.strip_prefix(' ').unwrap_or(value))
                .collect();

            // Comment-only blocks are keep-alives
            if !data.is_empty() {
                events.push(data.join("\n"));
            }
        }
        events
    }
}

/// HTTP transport: server-sent events down, one POST per chunk up
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    stream_url: Url,
    capacity: usize,
}

impl HttpTransport {
    pub fn new(base_url: &str, capacity: usize) -> Result<Self, ClientError> {
        let base = Url::parse(base_url).map_err(transport_error)?;
        let stream_url = base.join("stream").map_err(transport_error)?;

        Ok(Self {
            client: reqwest::Client::new(),
            stream_url,
            capacity,
        })
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn open(&self, request: OpenRequest) -> Result<TransportSession, ClientError> {
        let mut url = self.stream_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("sessionId", &request.session_id)
                .append_pair("type", request.kind.as_str());
            if let Some(memory_id) = &request.memory_id {
                query.append_pair("memoryId", memory_id);
            }
        }

        let response = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Transport(format!("{}: {}", status, body)));
        }

        let (events_tx, events_rx) = mpsc::channel(self.capacity);
        let cancel = CancellationToken::new();

        let reader_cancel = cancel.clone();
        let session_id = request.session_id.clone();
        let mut body = response.bytes_stream();
        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();

            'read: loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    next = body.next() => match next {
                        Some(Ok(bytes)) => {
                            for data in decoder.push(&bytes) {
                                let frame = match serde_json::from_str::<ServerFrame>(&data) {
                                    Ok(frame) => frame,
                                    Err(e) => {
                                        warn!(session_id = %session_id, "Dropping unparseable event: {}", e);
                                        continue;
                                    }
                                };
                                if events_tx.send(frame_event(frame)).await.is_err() {
                                    break 'read;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!(session_id = %session_id, "Event stream failed: {}", e);
                            break;
                        }
                        None => break,
                    },
                }
            }

            let _ = events_tx.send(TransportEvent::Closed).await;
            debug!(session_id = %session_id, "Event stream closed");
        });

        Ok(TransportSession {
            link: Box::new(HttpLink {
                client: self.client.clone(),
                stream_url: self.stream_url.clone(),
                session_id: request.session_id,
                cancel,
                closed: AtomicBool::new(false),
            }),
            events: events_rx,
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}

struct HttpLink {
    client: reqwest::Client,
    stream_url: Url,
    session_id: String,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl HttpLink {
    fn relay_request(&self, chunk: Chunk) -> RelayRequest {
        let final_marker = chunk.is_final();
        let mut request = RelayRequest {
            session_id: self.session_id.clone(),
            final_marker,
            ..Default::default()
        };
        match chunk.payload {
            Payload::Audio(bytes) => request.audio_data = Some(bytes),
            Payload::Text(text) => request.text_data = Some(text),
            Payload::Empty => {}
        }
        request
    }
}

#[async_trait::async_trait]
impl TransportLink for HttpLink {
    async fn send(&self, chunk: Chunk) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }

        let response = self
            .client
            .post(self.stream_url.clone())
            .json(&self.relay_request(chunk))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ClientError::Transport(format!("{}: {}", status, body)))
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let result = self
            .client
            .delete(self.stream_url.clone())
            .query(&[("sessionId", self.session_id.as_str()), ("force", "true")])
            .send()
            .await;
        if let Err(e) = result {
            debug!(session_id = %self.session_id, "Failed to end session: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_handles_split_events() {
        let mut decoder = SseDecoder::new();

        assert!(decoder.push(b"data: {\"type\":\"conn").is_empty());
        let events = decoder.push(b"ected\",\"sessionId\":\"s1\"}\r\n\r\ndata: second\n");
        assert_eq!(events, vec![r#"{"type":"connected","sessionId":"s1"}"#.to_string()]);

        assert_eq!(decoder.push(b"\n"), vec!["second".to_string()]);
    }

    #[test]
    fn test_decoder_returns_every_coalesced_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: one\n\ndata: two\n\ndata: thr");
        assert_eq!(events, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(decoder.push(b"ee\n\n"), vec!["three".to_string()]);
    }

    #[test]
    fn test_decoder_skips_keep_alive_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b":\n\ndata: x\n\n");
        assert_eq!(events, vec!["x".to_string()]);
    }

    #[test]
    fn test_decoder_joins_multiline_data() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"event: message\ndata: a\ndata: b\n\n");
        assert_eq!(events, vec!["a\nb".to_string()]);
    }

    #[test]
    fn test_final_marker_relay_request() {
        let link = HttpLink {
            client: reqwest::Client::new(),
            stream_url: Url::parse("http://localhost:3000/stream").unwrap(),
            session_id: "s1".to_string(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        };
        let meta = crate::protocol::ChunkMetadata::new("s1", "", crate::protocol::ChunkType::Question);

        let request = link.relay_request(Chunk::final_marker(meta));
        assert!(request.final_marker);
        assert!(request.audio_data.is_none());
        assert!(request.text_data.is_none());

        let request = link.relay_request(Chunk::audio(vec![1, 2]));
        assert!(!request.final_marker);
        assert_eq!(request.audio_data, Some(vec![1, 2]));
    }
}
