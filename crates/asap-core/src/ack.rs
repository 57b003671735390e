//! Selective acknowledgment for duplex transports.
//!
//! Every envelope with `requires_ack` is tracked in a pending table until the
//! peer answers with an `ack` payload naming its id. Timeouts retransmit the
//! identical envelope; once the retry budget is spent the entry is dropped
//! and the failure is charged to the circuit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::circuit::CircuitBreaker;
use crate::config::AckConfig;
use crate::envelope::{AckPayload, Envelope, PayloadType};
use crate::errors::{AsapError, AsapResult};

/// Outbound half of a duplex connection.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, envelope: &Envelope) -> AsapResult<()>;
}

pub struct PendingAck {
    pub envelope: Envelope,
    /// Retransmissions so far.
    pub attempts: u32,
    pub deadline: Instant,
    waiter: oneshot::Sender<AckPayload>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Written to the sink; no acknowledgment expected.
    Sent,
    Acknowledged(AckPayload),
}

pub struct AckCoordinator {
    sink: Arc<dyn FrameSink>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
    max_retries: u32,
    pending: Mutex<HashMap<String, PendingAck>>,
}

/// Removes the pending entry if the waiting future is dropped early.
struct PendingGuard<'a> {
    coordinator: &'a AckCoordinator,
    envelope_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.lock().remove(self.envelope_id);
    }
}

impl AckCoordinator {
    pub fn new(sink: Arc<dyn FrameSink>, breaker: Arc<CircuitBreaker>, config: &AckConfig) -> Self {
        Self {
            sink,
            breaker,
            timeout: config.timeout(),
            max_retries: config.max_retries,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingAck>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_pending(&self, envelope_id: &str) -> bool {
        self.lock().contains_key(envelope_id)
    }

    /// Send `envelope`, waiting for its acknowledgment when one is required.
    pub async fn send(&self, envelope: &Envelope) -> AsapResult<DeliveryOutcome> {
        if !envelope.requires_ack() {
            self.sink.send_frame(envelope).await?;
            return Ok(DeliveryOutcome::Sent);
        }

        let permit = self.breaker.try_acquire()?;
        let envelope_id = envelope.id();
        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.lock();
            if pending.contains_key(envelope_id) {
                return Err(AsapError::DuplicatePending {
                    envelope_id: envelope_id.to_string(),
                });
            }
            pending.insert(
                envelope_id.to_string(),
                PendingAck {
                    envelope: envelope.clone(),
                    attempts: 0,
                    deadline: Instant::now() + self.timeout,
                    waiter: tx,
                },
            );
        }
        let _guard = PendingGuard {
            coordinator: self,
            envelope_id,
        };

        if let Err(err) = self.sink.send_frame(envelope).await {
            permit.failure();
            return Err(err);
        }
        debug!(envelope_id, payload_type = %envelope.payload_type(), "awaiting ack");

        let mut deadline = Instant::now() + self.timeout;
        loop {
            match timeout_at(deadline, &mut rx).await {
                Ok(Ok(ack)) => {
                    permit.success();
                    return Ok(DeliveryOutcome::Acknowledged(ack));
                }
                Ok(Err(_)) => {
                    permit.failure();
                    return Err(AsapError::ChannelClosed(format!(
                        "connection closed before {envelope_id} was acknowledged"
                    )));
                }
                Err(_) => {}
            }

            let retransmit = {
                let mut pending = self.lock();
                let Some(entry) = pending.get_mut(envelope_id) else {
                    // acked while the timer fired; the waiter already has it
                    continue;
                };
                if entry.attempts >= self.max_retries {
                    let attempts = entry.attempts + 1;
                    pending.remove(envelope_id);
                    drop(pending);
                    warn!(envelope_id, attempts, "ack timeout, giving up");
                    permit.failure();
                    return Err(AsapError::AckTimeoutExceeded {
                        envelope_id: envelope_id.to_string(),
                        attempts,
                    });
                }
                entry.attempts += 1;
                entry.deadline = Instant::now() + self.timeout;
                deadline = entry.deadline;
                entry.attempts
            };

            info!(envelope_id, attempt = retransmit, "ack timeout, retransmitting");
            if let Err(err) = self.sink.send_frame(envelope).await {
                permit.failure();
                return Err(err);
            }
        }
    }

    /// Run [`send`](Self::send) on a background task.
    pub fn dispatch(self: &Arc<Self>, envelope: Envelope) -> JoinHandle<AsapResult<DeliveryOutcome>> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.send(&envelope).await })
    }

    /// Resolve the pending entry named by `ack`. Returns `false` for unknown ids.
    pub fn handle_ack(&self, ack: AckPayload) -> bool {
        let entry = self.lock().remove(&ack.original_envelope_id);
        match entry {
            Some(entry) => {
                debug!(
                    envelope_id = %ack.original_envelope_id,
                    status = ?ack.status,
                    retransmissions = entry.attempts,
                    "ack received"
                );
                let _ = entry.waiter.send(ack);
                true
            }
            None => {
                debug!(envelope_id = %ack.original_envelope_id, "ack for unknown envelope");
                false
            }
        }
    }

    /// Consume `envelope` if it is an acknowledgment.
    pub fn handle_frame(&self, envelope: &Envelope) -> AsapResult<bool> {
        if envelope.payload_type() != PayloadType::Ack {
            return Ok(false);
        }
        self.handle_ack(envelope.ack_payload()?);
        Ok(true)
    }

    /// Drop every pending entry; their senders observe `ChannelClosed`.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        if !drained.is_empty() {
            warn!(count = drained.len(), reason, "failing pending acks");
        }
        drained.len()
    }
}
