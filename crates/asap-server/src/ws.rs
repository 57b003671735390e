//! WebSocket binding: one envelope per text frame, selective acknowledgments.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Extension, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use asap_core::envelope::{AckStatus, Envelope, PayloadType};

use crate::state::AppState;

const OUTBOUND_BUFFER: usize = 64;

/// GET /asap/ws
pub async fn ws_handler(Extension(state): Extension<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Envelope>(OUTBOUND_BUFFER);

    let send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(err) => {
                    warn!(envelope_id = %envelope.id(), error = %err, "failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    info!("websocket peer connected");

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let text = text.to_string();
                let envelope = match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(error = %err, "dropping malformed frame");
                        continue;
                    }
                };
                if handle_envelope(&state, &tx, envelope).await.is_err() {
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                debug!("ignoring binary frame");
            }
            Ok(Message::Ping(_)) => {
                // answered by axum
            }
            Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!("websocket peer closed connection");
                break;
            }
            Err(err) => {
                warn!(error = %err, "websocket error");
                break;
            }
        }
    }

    drop(tx);
    let _ = send_task.await;
}

/// Process one inbound envelope. `Err` means the writer is gone.
async fn handle_envelope(
    state: &AppState,
    tx: &mpsc::Sender<Envelope>,
    envelope: Envelope,
) -> Result<(), mpsc::error::SendError<Envelope>> {
    if envelope.payload_type() == PayloadType::Ack {
        debug!(envelope_id = %envelope.id(), "ack from peer");
        return Ok(());
    }

    // Retransmissions are acknowledged again but never reprocessed.
    if envelope.requires_ack() && !state.first_delivery(envelope.id()).await {
        debug!(envelope_id = %envelope.id(), "duplicate frame, re-acknowledging");
        return tx.send(envelope.ack(AckStatus::Received, None)).await;
    }

    match state.process(&envelope).await {
        Ok(reply) => {
            if envelope.requires_ack() {
                tx.send(envelope.ack(AckStatus::Processed, None)).await?;
            }
            tx.send(reply).await
        }
        Err(err) => {
            warn!(
                envelope_id = %envelope.id(),
                code = err.code(),
                error = %err,
                "envelope rejected"
            );
            if envelope.requires_ack() {
                tx.send(envelope.ack(AckStatus::Rejected, Some(err.to_string())))
                    .await?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asap_core::config::AsapConfig;
    use serde_json::json;

    #[tokio::test]
    async fn retransmission_is_not_reprocessed() {
        let state = AppState::new(AsapConfig::default(), None);
        let (tx, mut rx) = mpsc::channel(8);
        let request = Envelope::builder("client", "server", PayloadType::TaskRequest, json!({}))
            .with_fresh_nonce()
            .build();

        handle_envelope(&state, &tx, request.clone()).await.unwrap();
        let ack = rx.recv().await.unwrap().ack_payload().unwrap();
        assert_eq!(ack.status, AckStatus::Processed);
        assert_eq!(
            rx.recv().await.unwrap().payload_type(),
            PayloadType::TaskResponse
        );

        handle_envelope(&state, &tx, request).await.unwrap();
        let ack = rx.recv().await.unwrap().ack_payload().unwrap();
        assert_eq!(ack.status, AckStatus::Received);
        assert!(rx.try_recv().is_err());
        assert_eq!(state.tasks().len(), 1);
    }

    #[tokio::test]
    async fn rejected_envelopes_are_nacked() {
        let state = AppState::new(AsapConfig::default(), None);
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = Envelope::task_cancel("client", "server", "missing", None);

        handle_envelope(&state, &tx, cancel).await.unwrap();
        let ack = rx.recv().await.unwrap().ack_payload().unwrap();
        assert_eq!(ack.status, AckStatus::Rejected);
        assert!(ack.error.unwrap().contains("not found"));
    }
}
