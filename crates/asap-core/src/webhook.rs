//! Outbound webhook delivery.
//!
//! Callback URLs are validated against SSRF targets before a job exists.
//! Jobs are signed with HMAC-SHA256, retried over a fixed backoff ladder and
//! dead-lettered exactly once when the attempt budget runs out. Each target
//! host is rate limited independently.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use reqwest::redirect::Policy as RedirectPolicy;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use tokio::net::lookup_host;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use url::{Host, Url};
use uuid::Uuid;

use crate::client::TransportError;
use crate::config::{RateLimit, WebhookConfig};
use crate::errors::{AsapError, AsapResult};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-ASAP-Signature";
pub const WEBHOOK_ID_HEADER: &str = "X-ASAP-Webhook-Id";
pub const ATTEMPT_HEADER: &str = "X-ASAP-Delivery-Attempt";
const SIGNATURE_PREFIX: &str = "sha256=";

/// `sha256=<hex>` signature of `body` under `secret`.
pub fn sign_payload(secret: &[u8], body: &[u8]) -> AsapResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| AsapError::Internal(format!("hmac key error: {e}")))?;
    mac.update(body);
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Constant-time check of a `sha256=<hex>` header value.
pub fn verify_signature(secret: &[u8], body: &[u8], header: &str) -> bool {
    let Some(provided) = header.trim().strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(provided) = hex::decode(provided) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

/// Loopback, private, link-local, unspecified, broadcast, CGNAT and
/// unique-local addresses. IPv4-mapped IPv6 addresses are judged as IPv4.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // 100.64.0.0/10
                || (o[0] == 100 && (o[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_blocked_ip(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7
                || (first & 0xfe00) == 0xfc00
                // fe80::/10
                || (first & 0xffc0) == 0xfe80
        }
    }
}

#[derive(Debug, Clone)]
pub struct UrlValidator {
    allow_insecure_http: bool,
    allowed_hosts: Vec<String>,
}

impl UrlValidator {
    pub fn new(allow_insecure_http: bool, allowed_hosts: &[String]) -> Self {
        Self {
            allow_insecure_http,
            allowed_hosts: allowed_hosts
                .iter()
                .map(|host| host.trim().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &WebhookConfig) -> Self {
        Self::new(config.allow_insecure_http, &config.allowed_hosts)
    }

    /// Parse `raw` and reject anything that could reach internal services.
    ///
    /// Domain names are resolved and every returned address must pass.
    pub async fn validate(&self, raw: &str) -> AsapResult<Url> {
        let reject = |reason: String| AsapError::WebhookValidation {
            url: raw.to_string(),
            reason,
        };

        let url = Url::parse(raw).map_err(|e| reject(format!("unparseable url: {e}")))?;
        match url.scheme() {
            "https" => {}
            "http" if self.allow_insecure_http => {}
            "http" => return Err(reject("https is required".to_string())),
            other => return Err(reject(format!("unsupported scheme '{other}'"))),
        }

        let host = url
            .host()
            .ok_or_else(|| reject("missing host".to_string()))?;
        let host_key = match &host {
            Host::Domain(domain) => domain.to_ascii_lowercase(),
            Host::Ipv4(ip) => ip.to_string(),
            Host::Ipv6(ip) => ip.to_string(),
        };
        if self.allowed_hosts.iter().any(|allowed| allowed == &host_key) {
            debug!(host = %host_key, "webhook host allowlisted");
            return Ok(url);
        }

        match host {
            Host::Ipv4(ip) => self.check_ip(IpAddr::V4(ip)).map_err(reject)?,
            Host::Ipv6(ip) => self.check_ip(IpAddr::V6(ip)).map_err(reject)?,
            Host::Domain(domain) => {
                let domain = domain.trim_end_matches('.').to_ascii_lowercase();
                if domain == "localhost" || domain.ends_with(".localhost") {
                    return Err(reject("localhost is not allowed".to_string()));
                }
                let port = url.port_or_known_default().unwrap_or(443);
                let addrs: Vec<_> = lookup_host((domain.as_str(), port))
                    .await
                    .map_err(|e| reject(format!("could not resolve host: {e}")))?
                    .collect();
                if addrs.is_empty() {
                    return Err(reject("host resolved to no addresses".to_string()));
                }
                for addr in addrs {
                    self.check_ip(addr.ip()).map_err(reject)?;
                }
            }
        }
        Ok(url)
    }

    fn check_ip(&self, ip: IpAddr) -> Result<(), String> {
        if is_blocked_ip(ip) {
            Err(format!("address {ip} is private or reserved"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Pending,
    Retrying,
    DeadLettered,
}

#[derive(Clone, Debug, Serialize)]
pub struct WebhookJob {
    pub id: String,
    pub url: Url,
    pub payload: Value,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub status: WebhookStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WebhookJob {
    fn new(url: Url, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            url,
            payload,
            attempts: 0,
            next_attempt_at: now,
            status: WebhookStatus::Pending,
            last_error: None,
            created_at: now,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct DeadLetter {
    pub job: WebhookJob,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait WebhookSender: Send + Sync {
    /// POST `body` and return the HTTP status.
    async fn post(
        &self,
        url: &Url,
        headers: &[(&'static str, String)],
        body: Vec<u8>,
    ) -> Result<u16, TransportError>;
}

pub struct HttpWebhookSender {
    client: Client,
}

impl HttpWebhookSender {
    pub fn new(config: &WebhookConfig) -> AsapResult<Self> {
        let client = Client::builder()
            .redirect(RedirectPolicy::none())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| AsapError::Internal(format!("http client error: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn post(
        &self,
        url: &Url,
        headers: &[(&'static str, String)],
        body: Vec<u8>,
    ) -> Result<u16, TransportError> {
        let mut req = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        for (name, value) in headers {
            req = req.header(*name, value.as_str());
        }
        let resp = req.send().await.map_err(|err| {
            if err.is_timeout() {
                TransportError::Timeout(err.to_string())
            } else {
                TransportError::Connect(err.to_string())
            }
        })?;
        Ok(resp.status().as_u16())
    }
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn push(&self, letter: DeadLetter);
    async fn list(&self) -> Vec<DeadLetter>;
}

#[derive(Default)]
pub struct InMemoryDeadLetters {
    letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    fn letters(&self) -> MutexGuard<'_, Vec<DeadLetter>> {
        match self.letters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetters {
    async fn push(&self, letter: DeadLetter) {
        self.letters().push(letter);
    }

    async fn list(&self) -> Vec<DeadLetter> {
        self.letters().clone()
    }
}

struct Histories {
    by_key: HashMap<String, VecDeque<Instant>>,
    swept_at: Instant,
}

/// Sliding-window limiter keyed by target; every configured window applies.
///
/// Targets idle for longer than the widest window are forgotten.
pub struct RateLimiter {
    limits: Vec<RateLimit>,
    longest: Duration,
    events: Mutex<Histories>,
}

impl RateLimiter {
    pub fn new(limits: &[RateLimit]) -> Self {
        let limits: Vec<RateLimit> = limits
            .iter()
            .copied()
            .filter(|limit| limit.max_events > 0)
            .collect();
        let longest = limits
            .iter()
            .map(RateLimit::window)
            .max()
            .unwrap_or_default();
        Self {
            limits,
            longest,
            events: Mutex::new(Histories {
                by_key: HashMap::new(),
                swept_at: Instant::now(),
            }),
        }
    }

    fn histories(&self) -> MutexGuard<'_, Histories> {
        match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of targets with events still inside a window.
    pub fn tracked_targets(&self) -> usize {
        self.histories().by_key.len()
    }

    /// Record an event for `key` if every window has room, otherwise return
    /// how long to wait.
    pub fn check(&self, key: &str) -> Option<Duration> {
        if self.limits.is_empty() {
            return None;
        }
        let now = Instant::now();
        let longest = self.longest;
        let mut events = self.histories();
        if now.duration_since(events.swept_at) >= longest {
            events
                .by_key
                .retain(|_, history| history.back().is_some_and(|at| now.duration_since(*at) < longest));
            events.swept_at = now;
        }
        let history = events.by_key.entry(key.to_string()).or_default();

        while history
            .front()
            .is_some_and(|at| now.duration_since(*at) >= longest)
        {
            history.pop_front();
        }

        let mut wait = Duration::ZERO;
        for limit in &self.limits {
            let window = limit.window();
            let in_window = history
                .iter()
                .rev()
                .take_while(|at| now.duration_since(**at) < window)
                .count();
            let max = limit.max_events as usize;
            if in_window >= max {
                // the oldest event that must age out before one more fits
                let index = history.len() - in_window + (in_window - max);
                let until = history[index] + window;
                wait = wait.max(until.saturating_duration_since(now));
            }
        }

        if wait.is_zero() {
            history.push_back(now);
            None
        } else {
            Some(wait)
        }
    }

    pub async fn acquire(&self, key: &str) {
        while let Some(wait) = self.check(key) {
            sleep(wait).await;
        }
    }
}

struct ManagerInner {
    config: WebhookConfig,
    validator: UrlValidator,
    sender: Arc<dyn WebhookSender>,
    dead_letters: Arc<dyn DeadLetterStore>,
    limiter: RateLimiter,
    secret: Vec<u8>,
    jobs: Mutex<HashMap<String, WebhookJob>>,
    queue_tx: mpsc::Sender<String>,
    queue_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

#[derive(Clone)]
pub struct WebhookManager {
    inner: Arc<ManagerInner>,
}

impl WebhookManager {
    /// Fails without a non-empty `secret`: every delivery is signed.
    pub fn new(
        config: WebhookConfig,
        sender: Arc<dyn WebhookSender>,
        dead_letters: Arc<dyn DeadLetterStore>,
    ) -> AsapResult<Self> {
        let secret = match config.secret.as_deref() {
            Some(secret) if !secret.is_empty() => secret.as_bytes().to_vec(),
            _ => {
                return Err(AsapError::Config(
                    "webhook.secret is required to sign deliveries".into(),
                ))
            }
        };
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        Ok(Self {
            inner: Arc::new(ManagerInner {
                validator: UrlValidator::from_config(&config),
                limiter: RateLimiter::new(config.rate_limit.limits()),
                secret,
                config,
                sender,
                dead_letters,
                jobs: Mutex::new(HashMap::new()),
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
            }),
        })
    }

    /// Manager with the reqwest sender and an in-memory dead-letter store.
    pub fn http(config: WebhookConfig) -> AsapResult<Self> {
        let sender = Arc::new(HttpWebhookSender::new(&config)?);
        Self::new(config, sender, Arc::new(InMemoryDeadLetters::new()))
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, WebhookJob>> {
        match self.inner.jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn update_job(&self, job_id: &str, f: impl FnOnce(&mut WebhookJob)) {
        if let Some(job) = self.jobs().get_mut(job_id) {
            f(job);
        }
    }

    /// A job still queued or retrying. Delivered and dead-lettered jobs are
    /// evicted; the latter survive in the dead-letter store.
    pub fn status(&self, job_id: &str) -> Option<WebhookJob> {
        self.jobs().get(job_id).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.jobs().len()
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    pub fn dead_letters(&self) -> &Arc<dyn DeadLetterStore> {
        &self.inner.dead_letters
    }

    /// Check a callback URL up front, e.g. when a task registers it.
    pub async fn validate_url(&self, url: &str) -> AsapResult<Url> {
        self.inner.validator.validate(url).await
    }

    /// Validate `url` and queue `payload` for delivery. Invalid URLs never
    /// produce a job.
    pub async fn deliver(&self, url: &str, payload: Value) -> AsapResult<String> {
        let url = self.inner.validator.validate(url).await.map_err(|err| {
            warn!(url, error = %err, "webhook url rejected");
            err
        })?;
        let job = WebhookJob::new(url, payload);
        let job_id = job.id.clone();
        self.jobs().insert(job_id.clone(), job);

        if let Err(err) = self.inner.queue_tx.try_send(job_id.clone()) {
            let reason = match err {
                TrySendError::Full(_) => "queue_full",
                TrySendError::Closed(_) => "interrupted",
            };
            return Err(self.dead_letter(&job_id, 0, reason).await);
        }
        debug!(job_id = %job_id, "webhook queued");
        Ok(job_id)
    }

    /// Drive a single job to delivery or dead letter.
    pub async fn run_job(&self, job_id: &str, mut shutdown: watch::Receiver<bool>) -> AsapResult<()> {
        let Some(job) = self.status(job_id) else {
            return Err(AsapError::Internal(format!("unknown webhook job {job_id}")));
        };
        let body = serde_json::to_vec(&job.payload)?;
        let target = job.url.host_str().unwrap_or_default().to_string();
        let max_attempts = self.inner.config.max_attempts.max(1);
        let mut attempt = job.attempts;

        loop {
            attempt += 1;
            self.update_job(job_id, |job| {
                job.attempts = attempt;
                if attempt > 1 {
                    job.status = WebhookStatus::Retrying;
                }
            });

            tokio::select! {
                _ = self.inner.limiter.acquire(&target) => {}
                _ = wait_for_shutdown(&mut shutdown) => {
                    return Err(self.dead_letter(job_id, attempt - 1, "interrupted").await);
                }
            }

            let headers = [
                (WEBHOOK_ID_HEADER, job_id.to_string()),
                (ATTEMPT_HEADER, attempt.to_string()),
                (SIGNATURE_HEADER, sign_payload(&self.inner.secret, &body)?),
            ];

            let error = match self.inner.sender.post(&job.url, &headers, body.clone()).await {
                Ok(status) if (200..300).contains(&status) => {
                    info!(job_id, target = %target, attempt, status, "webhook delivered");
                    self.jobs().remove(job_id);
                    return Ok(());
                }
                Ok(status) => format!("HTTP {status}"),
                Err(err) => err.to_string(),
            };
            warn!(job_id, target = %target, attempt, error = %error, "webhook attempt failed");
            self.update_job(job_id, |job| job.last_error = Some(error.clone()));

            if attempt >= max_attempts {
                return Err(self.dead_letter(job_id, attempt, &error).await);
            }

            let delay = self.inner.config.delay_after(attempt);
            let next = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.update_job(job_id, |job| job.next_attempt_at = next);

            tokio::select! {
                _ = sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => {
                    return Err(self.dead_letter(job_id, attempt, "interrupted").await);
                }
            }
        }
    }

    /// Move `job_id` to the dead-letter store and return the error to surface.
    async fn dead_letter(&self, job_id: &str, attempts: u32, reason: &str) -> AsapError {
        let Some(mut job) = self.jobs().remove(job_id) else {
            return AsapError::Internal(format!("unknown webhook job {job_id}"));
        };
        job.status = WebhookStatus::DeadLettered;
        warn!(job_id, url = %job.url, attempts, reason, "webhook dead-lettered");
        let url = job.url.to_string();
        self.inner
            .dead_letters
            .push(DeadLetter {
                job,
                reason: reason.to_string(),
                failed_at: Utc::now(),
            })
            .await;
        AsapError::WebhookDeliveryExhausted {
            job_id: job_id.to_string(),
            url,
            attempts,
            last_error: reason.to_string(),
        }
    }

    /// Consume the queue until `shutdown` flips to true, running jobs
    /// concurrently. Jobs still queued at shutdown are dead-lettered as
    /// interrupted. Returns once every in-flight job has settled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let receiver = self.inner.queue_rx.lock().ok().and_then(|mut rx| rx.take());
        let Some(mut queue) = receiver else {
            warn!("webhook worker already running");
            return;
        };
        info!("webhook worker started");

        let mut running = JoinSet::new();
        loop {
            tokio::select! {
                next = queue.recv() => {
                    let Some(job_id) = next else { break };
                    let manager = self.clone();
                    let job_shutdown = shutdown.clone();
                    running.spawn(async move {
                        let _ = manager.run_job(&job_id, job_shutdown).await;
                    });
                }
                Some(_) = running.join_next(), if !running.is_empty() => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        queue.close();
        let mut interrupted = 0usize;
        while let Ok(job_id) = queue.try_recv() {
            let _ = self.dead_letter(&job_id, 0, "interrupted").await;
            interrupted += 1;
        }
        if interrupted > 0 {
            warn!(interrupted, "queued webhooks dead-lettered at shutdown");
        }

        while running.join_next().await.is_some() {}
        info!("webhook worker stopped");
    }

    pub fn spawn_worker(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.run(shutdown).await })
    }
}

/// Resolves once shutdown is requested. A dropped sender never resolves.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
