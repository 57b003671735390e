//! Replay defense: timestamp freshness plus single-use nonces.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ReplayConfig;
use crate::envelope::Envelope;
use crate::errors::{AsapError, AsapResult};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Storage for consumed nonces.
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Record `nonce` for `ttl` in one atomic step.
    ///
    /// Returns `false` when the nonce is already present and unexpired.
    async fn check_and_mark(&self, nonce: &str, ttl: Duration) -> bool;

    /// Drop expired entries, returning how many were removed.
    async fn purge_expired(&self) -> usize;
}

#[derive(Default)]
struct NonceTable {
    entries: HashMap<String, Instant>,
    last_sweep: Option<Instant>,
}

impl NonceTable {
    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expiry| *expiry > now);
        self.last_sweep = Some(now);
        before - self.entries.len()
    }
}

/// In-process nonce store with lazy expiry.
#[derive(Default)]
pub struct InMemoryNonceStore {
    table: Mutex<NonceTable>,
}

impl InMemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table
            .lock()
            .map(|table| table.entries.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl NonceStore for InMemoryNonceStore {
    async fn check_and_mark(&self, nonce: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut table = match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if table
            .last_sweep
            .map_or(true, |last| now.duration_since(last) >= SWEEP_INTERVAL)
        {
            let removed = table.sweep(now);
            if removed > 0 {
                debug!(removed, "swept expired nonces");
            }
        }

        match table.entries.get(nonce) {
            Some(expiry) if *expiry > now => false,
            _ => {
                table.entries.insert(nonce.to_string(), now + ttl);
                true
            }
        }
    }

    async fn purge_expired(&self) -> usize {
        let mut table = match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        table.sweep(Instant::now())
    }
}

/// Reject envelopes older than the max age or too far in the future.
pub fn validate_timestamp(
    envelope: &Envelope,
    config: &ReplayConfig,
    now: DateTime<Utc>,
) -> AsapResult<()> {
    let age = now.signed_duration_since(envelope.timestamp());
    let max_age = chrono::Duration::seconds(config.max_envelope_age_secs as i64);
    if age > max_age {
        return Err(AsapError::ExpiredEnvelope {
            envelope_id: envelope.id().to_string(),
            age_secs: age.num_seconds(),
            max_age_secs: config.max_envelope_age_secs,
        });
    }

    let ahead = -age;
    let tolerance = chrono::Duration::seconds(config.future_tolerance_secs as i64);
    if ahead > tolerance {
        return Err(AsapError::FutureEnvelope {
            envelope_id: envelope.id().to_string(),
            ahead_secs: ahead.num_seconds(),
            tolerance_secs: config.future_tolerance_secs,
        });
    }
    Ok(())
}

/// Gate run on every inbound envelope before it reaches a handler.
#[derive(Clone)]
pub struct ReplayGuard {
    config: ReplayConfig,
    store: Arc<dyn NonceStore>,
}

impl ReplayGuard {
    pub fn new(config: ReplayConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryNonceStore::new()))
    }

    pub fn with_store(config: ReplayConfig, store: Arc<dyn NonceStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    pub async fn check(&self, envelope: &Envelope) -> AsapResult<()> {
        self.check_at(envelope, Utc::now()).await
    }

    pub async fn check_at(&self, envelope: &Envelope, now: DateTime<Utc>) -> AsapResult<()> {
        validate_timestamp(envelope, &self.config, now)?;
        if self.config.nonce_validation {
            self.check_nonce(envelope).await?;
        }
        Ok(())
    }

    async fn check_nonce(&self, envelope: &Envelope) -> AsapResult<()> {
        let invalid = |reason: &str| AsapError::InvalidNonce {
            envelope_id: envelope.id().to_string(),
            reason: reason.to_string(),
        };

        let nonce = match envelope.nonce() {
            None if self.config.require_nonce => return Err(invalid("nonce is required")),
            None => return Ok(()),
            Some(Value::String(nonce)) if nonce.trim().is_empty() => {
                return Err(invalid("nonce must not be empty"))
            }
            Some(Value::String(nonce)) => nonce,
            Some(_) => return Err(invalid("nonce must be a string")),
        };

        if self
            .store
            .check_and_mark(nonce, self.config.nonce_ttl())
            .await
        {
            Ok(())
        } else {
            warn!(
                envelope_id = %envelope.id(),
                sender = %envelope.sender(),
                "replayed nonce rejected"
            );
            Err(AsapError::ReplayedNonce {
                envelope_id: envelope.id().to_string(),
                nonce: nonce.clone(),
            })
        }
    }
}

/// Periodically purge `store` until `shutdown` flips to true.
pub fn spawn_sweeper(
    store: Arc<dyn NonceStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = store.purge_expired().await;
                    if removed > 0 {
                        debug!(removed, "nonce sweeper purged entries");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("nonce sweeper stopping");
                        break;
                    }
                }
            }
        }
    })
}
