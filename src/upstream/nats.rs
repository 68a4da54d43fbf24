use super::{StreamOpen, UpstreamConnector, UpstreamEvent, UpstreamStream};
use crate::nats::{ControlMessage, NatsClient, SessionSubjects};
use crate::protocol::{self, Chunk};
use anyhow::Result;
use chrono::Utc;
use futures::stream::{Stream, StreamExt};
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Opens backend streams as NATS subject pairs over one shared connection
pub struct NatsConnector {
    client: NatsClient,
    prefix: String,
    capacity: usize,
}

impl NatsConnector {
    pub async fn connect(url: &str, prefix: impl Into<String>, capacity: usize) -> Result<Self> {
        Ok(Self {
            client: NatsClient::connect(url).await?,
            prefix: prefix.into(),
            capacity: capacity.max(1),
        })
    }
}

#[async_trait::async_trait]
impl UpstreamConnector for NatsConnector {
    async fn open(&self, open: StreamOpen) -> Result<UpstreamStream> {
        let subjects = SessionSubjects::new(&self.prefix, &open.session_id);

        // Subscribe before announcing the stream so no output is missed
        let mut outbound = self.client.subscribe(&subjects.outbound).await?;
        let mut control = self.client.subscribe(&subjects.outbound_control).await?;

        self.client
            .publish_control(
                &subjects.inbound_control,
                &ControlMessage::Open {
                    session_id: open.session_id.clone(),
                    kind: open.kind,
                    memory_id: open.memory_id.clone(),
                    timestamp: Utc::now().to_rfc3339(),
                },
            )
            .await?;

        let (sink, mut sink_rx) = mpsc::channel::<Chunk>(self.capacity);
        let (events_tx, events) = mpsc::channel(self.capacity);

        // Writer: chunks out, then end-of-input once the write half is dropped
        let client = self.client.clone();
        let write_subjects = subjects.clone();
        let session_id = open.session_id.clone();
        tokio::spawn(async move {
            while let Some(chunk) = sink_rx.recv().await {
                if let Err(e) = client.publish_chunk(&write_subjects.inbound, &chunk).await {
                    error!(session_id = %session_id, "Failed to publish chunk: {}", e);
                }
            }

            if let Err(e) = client
                .publish_control(&write_subjects.inbound_control, &ControlMessage::EndInput)
                .await
            {
                error!(session_id = %session_id, "Failed to publish end of input: {}", e);
            }
        });

        // Reader: backend output until the backend ends or the read half is dropped
        let session_id = open.session_id;
        tokio::spawn(async move {
            {
                let mut payloads = (&mut outbound).map(|msg| msg.payload);
                let mut control_payloads = (&mut control).map(|msg| msg.payload);
                forward_backend_output(&session_id, &mut payloads, &mut control_payloads, &events_tx).await;
            }

            let _ = outbound.unsubscribe().await;
            let _ = control.unsubscribe().await;
            info!(session_id = %session_id, "Backend stream reader stopped");
        });

        Ok(UpstreamStream { sink, events })
    }

    fn name(&self) -> &str {
        "nats"
    }
}

fn output_event(session_id: &str, payload: &[u8]) -> Option<UpstreamEvent> {
    match protocol::decode(payload) {
        Ok(chunk) => Some(UpstreamEvent::Message(chunk)),
        Err(e) => {
            warn!(session_id = %session_id, "Dropping backend chunk: {}", e);
            None
        }
    }
}

fn control_event(session_id: &str, payload: &[u8]) -> Option<UpstreamEvent> {
    match serde_json::from_slice::<ControlMessage>(payload) {
        Ok(ControlMessage::End) => Some(UpstreamEvent::End),
        Ok(ControlMessage::Error { message }) => Some(UpstreamEvent::Error(message)),
        Ok(other) => {
            warn!(session_id = %session_id, "Unexpected control message {:?}", other);
            None
        }
        Err(e) => {
            warn!(session_id = %session_id, "Failed to parse control message: {}", e);
            None
        }
    }
}

/// Merge the data and control subjects of one stream into its events.
///
/// Data is polled first, and data already delivered when the backend ends is
/// forwarded before `End`, so the final answer never trails the end.
async fn forward_backend_output<O, C, P>(
    session_id: &str,
    outbound: &mut O,
    control: &mut C,
    events_tx: &mpsc::Sender<UpstreamEvent>,
) where
    O: Stream<Item = P> + Unpin,
    C: Stream<Item = P> + Unpin,
    P: AsRef<[u8]>,
{
    loop {
        let event = tokio::select! {
            biased;

            _ = events_tx.closed() => return,

            msg = outbound.next() => match msg {
                Some(payload) => match output_event(session_id, payload.as_ref()) {
                    Some(event) => event,
                    None => continue,
                },
                None => {
                    let _ = events_tx.send(UpstreamEvent::End).await;
                    return;
                }
            },

            msg = control.next() => match msg {
                Some(payload) => match control_event(session_id, payload.as_ref()) {
                    Some(event) => event,
                    None => continue,
                },
                None => UpstreamEvent::End,
            },
        };

        if event == UpstreamEvent::End {
            while let Some(Some(payload)) = outbound.next().now_or_never() {
                if let Some(event) = output_event(session_id, payload.as_ref()) {
                    if events_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            let _ = events_tx.send(UpstreamEvent::End).await;
            return;
        }

        if events_tx.send(event).await.is_err() {
            return;
        }
    }
}
