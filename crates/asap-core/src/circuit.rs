//! Per-target circuit breaker.
//!
//! `Closed` counts consecutive failures and opens at the threshold. `Open`
//! fails fast until the cooldown elapses, then admits a single probe in
//! `HalfOpen`. The probe's outcome closes or re-opens the circuit.
//!
//! Every transition to `Open` starts a new epoch. A permit only settles the
//! epoch it was issued in, so a slow call admitted before the circuit
//! opened cannot close it behind the cooldown.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitConfig;
use crate::errors::{AsapError, AsapResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    epoch: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                epoch: 0,
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &CircuitConfig) -> Arc<Self> {
        Arc::new(Self::new(name, config.failure_threshold, config.cooldown()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current state, with `Open` reported as `HalfOpen` once the cooldown
    /// has elapsed.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened)) if opened.elapsed() >= self.cooldown => {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Ask permission to make a call.
    ///
    /// Fails with [`AsapError::CircuitOpen`] while open, or while a half-open
    /// probe is already outstanding.
    pub fn try_acquire(self: &Arc<Self>) -> AsapResult<CallPermit> {
        let mut inner = self.lock();
        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed < self.cooldown {
                    return Err(self.open_error(self.cooldown - elapsed));
                }
                info!(circuit = %self.name, "circuit half-open, admitting probe");
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(self.open_error(Duration::ZERO));
                }
                inner.probe_in_flight = true;
                true
            }
        };
        Ok(CallPermit {
            breaker: Arc::clone(self),
            epoch: inner.epoch,
            probe,
            settled: false,
        })
    }

    fn open_error(&self, retry_in: Duration) -> AsapError {
        AsapError::CircuitOpen {
            target: self.name.clone(),
            retry_in_ms: retry_in.as_millis() as u64,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        self.close(&mut inner);
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        self.trip(&mut inner);
    }

    fn settle(&self, epoch: u64, success: bool) {
        let mut inner = self.lock();
        if epoch != inner.epoch {
            debug!(
                circuit = %self.name,
                success,
                "ignoring outcome of a call admitted before the circuit opened"
            );
            return;
        }
        if success {
            self.close(&mut inner);
        } else {
            self.trip(&mut inner);
        }
    }

    fn close(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Closed {
            info!(circuit = %self.name, "circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    fn trip(&self, inner: &mut Inner) {
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let reopen = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.threshold,
            // already open: keep the original cooldown start
            CircuitState::Open => false,
        };
        if reopen {
            warn!(
                circuit = %self.name,
                failures = inner.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.epoch = inner.epoch.wrapping_add(1);
        }
        inner.probe_in_flight = false;
    }

    fn release_probe(&self, epoch: u64) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.epoch == epoch {
            inner.probe_in_flight = false;
        }
    }
}

/// Permission for a single call. Settle it with [`CallPermit::success`] or
/// [`CallPermit::failure`]; dropping it unsettled frees the probe slot
/// without recording anything.
#[must_use]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    epoch: u64,
    probe: bool,
    settled: bool,
}

impl CallPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle(self.epoch, true);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.settle(self.epoch, false);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe(self.epoch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new("agent-b", 3, Duration::from_secs(60)))
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_fails_fast() {
        let breaker = breaker();
        for _ in 0..2 {
            breaker.try_acquire().unwrap().failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        match breaker.try_acquire() {
            Err(AsapError::CircuitOpen { target, retry_in_ms }) => {
                assert_eq!(target, "agent-b");
                assert!(retry_in_ms > 0);
            }
            other => panic!("expected CircuitOpen, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count() {
        let breaker = breaker();
        breaker.try_acquire().unwrap().failure();
        breaker.try_acquire().unwrap().failure();
        breaker.try_acquire().unwrap().success();
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_one_probe_after_cooldown() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let probe = breaker.try_acquire().expect("probe admitted");
        assert!(probe.is_probe());
        assert!(matches!(
            breaker.try_acquire(),
            Err(AsapError::CircuitOpen { .. })
        ));

        probe.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_with_fresh_cooldown() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.try_acquire().is_err());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_probe_frees_the_slot() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn outcome_from_before_the_open_is_ignored() {
        let breaker = Arc::new(CircuitBreaker::new("agent-b", 2, Duration::from_secs(60)));
        let slow = breaker.try_acquire().unwrap();
        breaker.try_acquire().unwrap().failure();
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        slow.success();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(61)).await;
        let probe = breaker.try_acquire().unwrap();
        assert!(probe.is_probe());
        probe.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn late_failure_does_not_count_against_a_reclosed_circuit() {
        let breaker = Arc::new(CircuitBreaker::new("agent-b", 2, Duration::from_secs(60)));
        let slow = breaker.try_acquire().unwrap();
        breaker.record_failure();
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(61)).await;
        breaker.try_acquire().unwrap().success();

        slow.failure();
        assert_eq!(breaker.consecutive_failures(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
