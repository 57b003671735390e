//! Outbound HTTP client with bounded retries, circuit breaking and an
//! optional health gate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::redirect::Policy as RedirectPolicy;
use reqwest::Client;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::circuit::CircuitBreaker;
use crate::config::{AsapConfig, RetryConfig};
use crate::envelope::Envelope;
use crate::errors::{AsapError, AsapResult};
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::retry::{cap_retry_after, compute_backoff, parse_retry_after};

pub const RPC_PATH: &str = "asap";
pub const HEALTH_PATH: &str = ".well-known/asap/health";

/// Failure of a single transport attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Connect(_) | TransportError::Timeout(_))
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub retry_after: Option<String>,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable target, also used as the circuit name.
    fn target(&self) -> &str;

    async fn post(&self, body: Vec<u8>) -> Result<TransportResponse, TransportError>;
}

fn join_base(base_url: &str, path: &str) -> AsapResult<Url> {
    let joined = format!("{}/{}", base_url.trim_end_matches('/'), path);
    Url::parse(&joined).map_err(|err| AsapError::Config(format!("invalid url '{joined}': {err}")))
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_builder() || err.is_redirect() {
        TransportError::Request(err.to_string())
    } else {
        TransportError::Connect(err.to_string())
    }
}

/// JSON-RPC over HTTP POST to `<base>/asap`.
pub struct HttpTransport {
    client: Client,
    endpoint: Url,
    target: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, config: &RetryConfig) -> AsapResult<Self> {
        let endpoint = join_base(base_url, RPC_PATH)?;
        let client = Client::builder()
            .redirect(RedirectPolicy::none())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| AsapError::Internal(format!("http client error: {e}")))?;
        Ok(Self {
            client,
            target: base_url.trim_end_matches('/').to_string(),
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn target(&self) -> &str {
        &self.target
    }

    async fn post(&self, body: Vec<u8>) -> Result<TransportResponse, TransportError> {
        let resp = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await.map_err(classify)?.to_vec();
        Ok(TransportResponse {
            status,
            retry_after,
            body,
        })
    }
}

#[async_trait]
pub trait HealthGate: Send + Sync {
    async fn is_healthy(&self) -> bool;
}

/// Polls `<base>/.well-known/asap/health`, caching the verdict for `ttl`.
///
/// Connection failures and 5xx answers mark the endpoint dead; any other
/// response means something is listening.
pub struct HttpHealthGate {
    client: Client,
    url: Url,
    ttl: Duration,
    cached: Mutex<Option<(Instant, bool)>>,
}

impl HttpHealthGate {
    pub fn new(base_url: &str, config: &RetryConfig) -> AsapResult<Self> {
        let client = Client::builder()
            .redirect(RedirectPolicy::none())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| AsapError::Internal(format!("http client error: {e}")))?;
        Ok(Self {
            client,
            url: join_base(base_url, HEALTH_PATH)?,
            ttl: Duration::from_secs(config.health_ttl_secs),
            cached: Mutex::new(None),
        })
    }

    fn cached(&self) -> Option<bool> {
        let cached = self.cached.lock().ok()?;
        match *cached {
            Some((at, healthy)) if at.elapsed() < self.ttl => Some(healthy),
            _ => None,
        }
    }
}

#[async_trait]
impl HealthGate for HttpHealthGate {
    async fn is_healthy(&self) -> bool {
        if let Some(healthy) = self.cached() {
            return healthy;
        }
        let healthy = match self.client.get(self.url.clone()).send().await {
            Ok(resp) => !resp.status().is_server_error(),
            Err(err) => {
                debug!(url = %self.url, error = %err, "health probe failed");
                false
            }
        };
        if let Ok(mut cached) = self.cached.lock() {
            *cached = Some((Instant::now(), healthy));
        }
        healthy
    }
}

pub struct ResilientClient {
    transport: Arc<dyn Transport>,
    breaker: Arc<CircuitBreaker>,
    health: Option<Arc<dyn HealthGate>>,
    config: RetryConfig,
}

impl ResilientClient {
    pub fn new(transport: Arc<dyn Transport>, config: &AsapConfig) -> Self {
        let breaker = CircuitBreaker::from_config(transport.target(), &config.circuit);
        Self {
            transport,
            breaker,
            health: None,
            config: config.retry.clone(),
        }
    }

    /// HTTP client for the agent at `base_url`, health gate included.
    pub fn http(base_url: &str, config: &AsapConfig) -> AsapResult<Self> {
        let transport = Arc::new(HttpTransport::new(base_url, &config.retry)?);
        let gate = Arc::new(HttpHealthGate::new(base_url, &config.retry)?);
        Ok(Self::new(transport, config).with_health_gate(gate))
    }

    /// Share a breaker with another transport to the same peer.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_health_gate(mut self, gate: Arc<dyn HealthGate>) -> Self {
        self.health = Some(gate);
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Deliver `envelope` and return the peer's JSON-RPC response.
    ///
    /// The circuit records one outcome per call. Connection-level failures,
    /// 5xx answers and garbled bodies count against it; any well-formed
    /// JSON-RPC response, error responses included, counts as success.
    pub async fn send(&self, envelope: &Envelope) -> AsapResult<JsonRpcResponse> {
        if let Some(gate) = &self.health {
            if !gate.is_healthy().await {
                return Err(AsapError::EndpointUnhealthy {
                    target: self.transport.target().to_string(),
                });
            }
        }

        let permit = self.breaker.try_acquire()?;
        let body = serde_json::to_vec(&JsonRpcRequest::from_envelope(envelope))?;
        let outcome = self.send_with_retries(envelope, body).await;

        match &outcome {
            Ok(_) => permit.success(),
            Err(AsapError::RemoteStatus { status, .. }) if *status < 500 => permit.success(),
            Err(AsapError::RemoteStatus { .. })
            | Err(AsapError::TransportExhausted { .. })
            | Err(AsapError::InvalidResponse { .. }) => permit.failure(),
            // local failures say nothing about the peer
            Err(_) => drop(permit),
        }
        outcome
    }

    async fn send_with_retries(
        &self,
        envelope: &Envelope,
        body: Vec<u8>,
    ) -> AsapResult<JsonRpcResponse> {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut delay: Option<Duration> = None;
        let mut last_cause = String::from("no attempt made");

        for attempt in 0..max_attempts {
            if let Some(delay) = delay.take() {
                debug!(
                    envelope_id = %envelope.id(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "backing off before retry"
                );
                sleep(delay).await;
            }

            match self.transport.post(body.clone()).await {
                Ok(resp) if resp.status == 429 || resp.status == 503 => {
                    last_cause = format!("HTTP {}", resp.status);
                    let directed = resp
                        .retry_after
                        .as_deref()
                        .and_then(|value| parse_retry_after(value, Utc::now()))
                        .map(|d| cap_retry_after(&self.config, d));
                    warn!(
                        envelope_id = %envelope.id(),
                        target = %self.transport.target(),
                        attempt,
                        status = resp.status,
                        "peer asked to slow down"
                    );
                    delay = Some(directed.unwrap_or_else(|| compute_backoff(&self.config, attempt)));
                }
                Ok(resp) => return decode_response(envelope, resp),
                Err(err) => {
                    let err = attempt_error(envelope, err);
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    warn!(
                        envelope_id = %envelope.id(),
                        target = %self.transport.target(),
                        attempt,
                        error = %err,
                        "transient transport failure"
                    );
                    last_cause = err.to_string();
                    delay = Some(compute_backoff(&self.config, attempt));
                }
            }
        }

        info!(
            envelope_id = %envelope.id(),
            target = %self.transport.target(),
            attempts = max_attempts,
            "retry budget exhausted"
        );
        Err(AsapError::TransportExhausted {
            envelope_id: envelope.id().to_string(),
            attempts: max_attempts,
            cause: last_cause,
        })
    }

    /// Send `task.cancel` for `task_id` through the same retrying path.
    pub async fn cancel_task(
        &self,
        sender: &str,
        recipient: &str,
        task_id: &str,
        reason: Option<&str>,
    ) -> AsapResult<JsonRpcResponse> {
        let cancel = Envelope::task_cancel(sender, recipient, task_id, reason);
        self.send(&cancel).await
    }
}

/// Lift a single failed attempt into the runtime error taxonomy.
fn attempt_error(envelope: &Envelope, err: TransportError) -> AsapError {
    if err.is_transient() {
        AsapError::TransientTransport {
            envelope_id: envelope.id().to_string(),
            cause: err.to_string(),
        }
    } else {
        AsapError::Internal(format!("request for {} failed: {err}", envelope.id()))
    }
}

fn decode_response(envelope: &Envelope, resp: TransportResponse) -> AsapResult<JsonRpcResponse> {
    let parsed = serde_json::from_slice::<JsonRpcResponse>(&resp.body)
        .ok()
        .filter(JsonRpcResponse::is_well_formed);

    match parsed {
        Some(response) => Ok(response),
        None if (200..300).contains(&resp.status) => Err(AsapError::InvalidResponse {
            envelope_id: envelope.id().to_string(),
            reason: "body is not a well-formed JSON-RPC response".to_string(),
        }),
        None => Err(AsapError::RemoteStatus {
            envelope_id: envelope.id().to_string(),
            status: resp.status,
            body: String::from_utf8_lossy(&resp.body).chars().take(512).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitState;
    use crate::envelope::PayloadType;
    use crate::jsonrpc::{JsonRpcError, INVALID_PARAMS};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
        calls: AtomicUsize,
        call_times: Mutex<Vec<Instant>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<TransportResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                call_times: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn target(&self) -> &str {
            "http://agent-b.test"
        }

        async fn post(&self, _body: Vec<u8>) -> Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.call_times.lock().unwrap().push(Instant::now());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Connect("script exhausted".into())))
        }
    }

    struct DeadGate;

    #[async_trait]
    impl HealthGate for DeadGate {
        async fn is_healthy(&self) -> bool {
            false
        }
    }

    fn envelope() -> Envelope {
        Envelope::builder("a", "b", PayloadType::TaskRequest, json!({})).build()
    }

    fn ok_body(env: &Envelope) -> TransportResponse {
        let reply = env.reply(PayloadType::TaskResponse, json!({})).build();
        TransportResponse {
            status: 200,
            retry_after: None,
            body: serde_json::to_vec(&JsonRpcResponse::success(json!(1), &reply)).unwrap(),
        }
    }

    fn status(code: u16, retry_after: Option<&str>) -> TransportResponse {
        TransportResponse {
            status: code,
            retry_after: retry_after.map(str::to_string),
            body: Vec::new(),
        }
    }

    fn config() -> AsapConfig {
        let mut config = AsapConfig::default();
        config.retry.jitter_ratio = 0.0;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_retried_until_success() {
        let env = envelope();
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Timeout("slow".into())),
            Err(TransportError::Connect("refused".into())),
            Ok(ok_body(&env)),
        ]);
        let client = ResilientClient::new(transport.clone(), &config());

        let resp = client.send(&env).await.expect("third attempt succeeds");
        assert!(resp.result.is_some());
        assert_eq!(transport.calls(), 3);
        assert_eq!(client.breaker().consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempts_and_cause() {
        let transport = ScriptedTransport::new(Vec::new());
        let client = ResilientClient::new(transport.clone(), &config());

        match client.send(&envelope()).await {
            Err(AsapError::TransportExhausted {
                attempts, cause, ..
            }) => {
                assert_eq!(attempts, 4);
                assert!(cause.contains("script exhausted"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(transport.calls(), 4);
        assert_eq!(client.breaker().consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_header_sets_the_delay() {
        let env = envelope();
        let transport =
            ScriptedTransport::new(vec![Ok(status(429, Some("5"))), Ok(ok_body(&env))]);
        let client = ResilientClient::new(transport.clone(), &config());

        client.send(&env).await.unwrap();
        let times = transport.call_times.lock().unwrap().clone();
        assert_eq!(times.len(), 2);
        assert_eq!(times[1] - times[0], Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_retry_after_is_capped() {
        let env = envelope();
        let transport =
            ScriptedTransport::new(vec![Ok(status(503, Some("1e30"))), Ok(ok_body(&env))]);
        let client = ResilientClient::new(transport.clone(), &config());

        client.send(&env).await.unwrap();
        let times = transport.call_times.lock().unwrap().clone();
        assert_eq!(times[1] - times[0], Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn request_errors_fail_without_retry() {
        let transport =
            ScriptedTransport::new(vec![Err(TransportError::Request("bad header".into()))]);
        let client = ResilientClient::new(transport.clone(), &config());

        let err = client.send(&envelope()).await.unwrap_err();
        assert!(matches!(err, AsapError::Internal(_)));
        assert_eq!(transport.calls(), 1);
        assert_eq!(client.breaker().consecutive_failures(), 0);
    }

    #[test]
    fn attempt_errors_are_classified() {
        let env = envelope();
        let timeout = attempt_error(&env, TransportError::Timeout("slow".into()));
        assert!(timeout.is_retryable());
        assert_eq!(timeout.code(), "asap:transport/transient");
        assert!(timeout.to_string().contains("slow"));
        assert!(!attempt_error(&env, TransportError::Request("x".into())).is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_fails_fast_without_calling_transport() {
        let transport = ScriptedTransport::new(Vec::new());
        let mut cfg = config();
        cfg.retry.max_retries = 0;
        cfg.circuit.failure_threshold = 2;
        let client = ResilientClient::new(transport.clone(), &cfg);

        for _ in 0..2 {
            assert!(client.send(&envelope()).await.is_err());
        }
        assert_eq!(client.breaker().state(), CircuitState::Open);
        let calls_before = transport.calls();

        assert!(matches!(
            client.send(&envelope()).await,
            Err(AsapError::CircuitOpen { .. })
        ));
        assert_eq!(transport.calls(), calls_before);
    }

    #[tokio::test(start_paused = true)]
    async fn well_formed_error_response_counts_as_success() {
        let body = serde_json::to_vec(&JsonRpcResponse::failure(
            json!(1),
            JsonRpcError::new(INVALID_PARAMS, "stale", Some("asap:protocol/envelope_expired")),
        ))
        .unwrap();
        let mut script = Vec::new();
        for _ in 0..10 {
            script.push(Ok(TransportResponse {
                status: 200,
                retry_after: None,
                body: body.clone(),
            }));
        }
        let transport = ScriptedTransport::new(script);
        let mut cfg = config();
        cfg.circuit.failure_threshold = 2;
        let client = ResilientClient::new(transport.clone(), &cfg);

        for _ in 0..5 {
            let resp = client.send(&envelope()).await.unwrap();
            assert!(resp.error.is_some());
        }
        assert_eq!(client.breaker().state(), CircuitState::Closed);
        assert_eq!(transport.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried_and_do_not_trip_the_circuit() {
        let transport = ScriptedTransport::new(vec![Ok(status(404, None))]);
        let client = ResilientClient::new(transport.clone(), &config());

        assert!(matches!(
            client.send(&envelope()).await,
            Err(AsapError::RemoteStatus { status: 404, .. })
        ));
        assert_eq!(transport.calls(), 1);
        assert_eq!(client.breaker().consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_count_against_the_circuit() {
        let transport = ScriptedTransport::new(vec![Ok(status(500, None))]);
        let client = ResilientClient::new(transport.clone(), &config());

        assert!(matches!(
            client.send(&envelope()).await,
            Err(AsapError::RemoteStatus { status: 500, .. })
        ));
        assert_eq!(client.breaker().consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_endpoint_short_circuits() {
        let transport = ScriptedTransport::new(Vec::new());
        let client = ResilientClient::new(transport.clone(), &config())
            .with_health_gate(Arc::new(DeadGate));

        assert!(matches!(
            client.send(&envelope()).await,
            Err(AsapError::EndpointUnhealthy { .. })
        ));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_task_sends_a_cancel_envelope() {
        let env = envelope();
        let transport = ScriptedTransport::new(vec![Ok(ok_body(&env))]);
        let client = ResilientClient::new(transport.clone(), &config());
        client
            .cancel_task("a", "b", "task-1", Some("stop"))
            .await
            .unwrap();
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn endpoint_paths() {
        let transport = HttpTransport::new("http://127.0.0.1:8000/", &RetryConfig::default())
            .expect("valid base");
        assert_eq!(transport.endpoint().as_str(), "http://127.0.0.1:8000/asap");
        assert!(HttpTransport::new("not a url", &RetryConfig::default()).is_err());
    }
}
