//! WebSocket client binding.
//!
//! One text frame carries one envelope. A writer task owns the socket sink
//! and is fed through a channel; a reader task routes acks to the
//! coordinator, acknowledges inbound `requires_ack` frames and forwards the
//! rest to [`WsClient::next_envelope`]. Inbound envelopes beyond
//! `INBOUND_CAPACITY` unread ones are dropped so the reader never stalls.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::ack::{AckCoordinator, DeliveryOutcome, FrameSink};
use crate::circuit::CircuitBreaker;
use crate::config::AsapConfig;
use crate::envelope::{AckStatus, Envelope};
use crate::errors::{AsapError, AsapResult};

const OUTBOUND_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 256;

/// Queues envelopes for the writer task.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Message>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_frame(&self, envelope: &Envelope) -> AsapResult<()> {
        let text = serde_json::to_string(envelope)?;
        self.tx
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| AsapError::ChannelClosed("websocket writer stopped".to_string()))
    }
}

pub struct WsClient {
    url: String,
    coordinator: Arc<AckCoordinator>,
    outbound: mpsc::Sender<Message>,
    inbound: mpsc::Receiver<Envelope>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl WsClient {
    pub async fn connect(url: &str, config: &AsapConfig) -> AsapResult<Self> {
        let breaker = CircuitBreaker::from_config(url, &config.circuit);
        Self::connect_with_breaker(url, config, breaker).await
    }

    /// Connect while sharing `breaker` with another client to the same peer.
    pub async fn connect_with_breaker(
        url: &str,
        config: &AsapConfig,
        breaker: Arc<CircuitBreaker>,
    ) -> AsapResult<Self> {
        let (socket, _) = connect_async(url).await.map_err(|err| {
            AsapError::ChannelClosed(format!("websocket connect to {url} failed: {err}"))
        })?;
        info!(url, "websocket connected");

        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Envelope>(INBOUND_CAPACITY);

        let coordinator = Arc::new(AckCoordinator::new(
            Arc::new(ChannelSink { tx: out_tx.clone() }),
            breaker,
            &config.ack,
        ));

        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = sink.send(message).await {
                    debug!(error = %err, "websocket write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader_coordinator = coordinator.clone();
        let ack_tx = out_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(error = %err, "websocket read failed");
                        break;
                    }
                };

                let envelope: Envelope = match serde_json::from_str(&text) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(error = %err, "dropping malformed frame");
                        continue;
                    }
                };

                match reader_coordinator.handle_frame(&envelope) {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(envelope_id = %envelope.id(), error = %err, "bad ack payload");
                        continue;
                    }
                }

                if envelope.requires_ack() {
                    let ack = envelope.ack(AckStatus::Received, None);
                    if let Ok(text) = serde_json::to_string(&ack) {
                        let _ = ack_tx.send(Message::Text(text.into())).await;
                    }
                }
                // acks for our own sends must keep flowing even when the
                // caller never drains next_envelope
                match in_tx.try_send(envelope) {
                    Ok(()) => {}
                    Err(TrySendError::Full(envelope)) => {
                        warn!(envelope_id = %envelope.id(), "inbound queue full, dropping envelope");
                    }
                    Err(TrySendError::Closed(_)) => debug!("inbound receiver dropped"),
                }
            }
            reader_coordinator.fail_all("websocket closed");
        });

        Ok(Self {
            url: url.to_string(),
            coordinator,
            outbound: out_tx,
            inbound: in_rx,
            writer: Some(writer),
            reader: Some(reader),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn coordinator(&self) -> &Arc<AckCoordinator> {
        &self.coordinator
    }

    /// Send `envelope`, waiting for the peer's ack when it requires one.
    pub async fn send(&self, envelope: &Envelope) -> AsapResult<DeliveryOutcome> {
        self.coordinator.send(envelope).await
    }

    /// Next non-ack envelope from the peer, or `None` once the socket closes.
    pub async fn next_envelope(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }

    pub async fn cancel_task(
        &self,
        sender: &str,
        recipient: &str,
        task_id: &str,
        reason: Option<&str>,
    ) -> AsapResult<DeliveryOutcome> {
        let cancel = Envelope::task_cancel(sender, recipient, task_id, reason);
        self.send(&cancel).await
    }

    /// Send a close frame and wait for the writer to flush it.
    pub async fn close(mut self) -> AsapResult<()> {
        self.outbound
            .send(Message::Close(None))
            .await
            .map_err(|_| AsapError::ChannelClosed("websocket writer stopped".to_string()))?;
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        Ok(())
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        for handle in [self.writer.take(), self.reader.take()].into_iter().flatten() {
            handle.abort();
        }
        self.coordinator.fail_all("client dropped");
    }
}
