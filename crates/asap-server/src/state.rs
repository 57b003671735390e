use std::sync::Arc;

use asap_core::config::AsapConfig;
use asap_core::envelope::Envelope;
use asap_core::errors::AsapResult;
use asap_core::replay::{InMemoryNonceStore, NonceStore, ReplayGuard};
use asap_core::webhook::WebhookManager;
use tracing::{debug, warn};

use crate::handlers::HandlerRegistry;
use crate::tasks::TaskStore;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AsapConfig,
    guard: ReplayGuard,
    nonces: Arc<InMemoryNonceStore>,
    delivered: Arc<InMemoryNonceStore>,
    tasks: TaskStore,
    handlers: HandlerRegistry,
    webhooks: Option<WebhookManager>,
}

impl AppState {
    pub fn new(config: AsapConfig, webhooks: Option<WebhookManager>) -> Self {
        Self::with_handlers(config, webhooks, HandlerRegistry::with_defaults())
    }

    pub fn with_handlers(
        config: AsapConfig,
        webhooks: Option<WebhookManager>,
        handlers: HandlerRegistry,
    ) -> Self {
        let nonces = Arc::new(InMemoryNonceStore::new());
        let guard = ReplayGuard::with_store(config.replay.clone(), nonces.clone());
        Self {
            inner: Arc::new(AppStateInner {
                config,
                guard,
                nonces,
                delivered: Arc::new(InMemoryNonceStore::new()),
                tasks: TaskStore::new(),
                handlers,
                webhooks,
            }),
        }
    }

    pub fn config(&self) -> &AsapConfig {
        &self.inner.config
    }

    pub fn identity(&self) -> &str {
        &self.inner.config.server.identity
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.inner.tasks
    }

    pub fn webhooks(&self) -> Option<&WebhookManager> {
        self.inner.webhooks.as_ref()
    }

    /// Nonce store behind the replay guard, exposed for the sweeper.
    pub fn nonce_store(&self) -> Arc<dyn NonceStore> {
        self.inner.nonces.clone()
    }

    pub fn delivered_store(&self) -> Arc<dyn NonceStore> {
        self.inner.delivered.clone()
    }

    /// Record `envelope_id` as delivered over a duplex transport. Returns
    /// `false` if it was already seen, i.e. this is a retransmission.
    pub async fn first_delivery(&self, envelope_id: &str) -> bool {
        self.inner
            .delivered
            .check_and_mark(envelope_id, self.inner.config.replay.nonce_ttl())
            .await
    }

    /// Replay guard, then the handler for the envelope's payload type.
    pub async fn process(&self, envelope: &Envelope) -> AsapResult<Envelope> {
        if let Err(err) = self.inner.guard.check(envelope).await {
            warn!(
                envelope_id = %envelope.id(),
                sender = %envelope.sender(),
                code = err.code(),
                "envelope rejected by replay guard"
            );
            return Err(err);
        }
        debug!(
            envelope_id = %envelope.id(),
            payload_type = %envelope.payload_type(),
            "dispatching envelope"
        );
        self.inner.handlers.dispatch(self, envelope).await
    }
}
