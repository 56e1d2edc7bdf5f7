use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{BreakerConfig, RetryConfig};
use crate::metrics::GatewayMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    requests: u64,
    successes: u64,
    failures: u64,
    consecutive_failures: u64,
}

struct BreakerInner {
    state: BreakerState,
    counts: Counts,
    generation: u64,
    interval_started: Instant,
    opened_at: Option<Instant>,
    half_open_inflight: u32,
    half_open_successes: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("circuit open, retry after {retry_after:?}")]
pub struct CircuitOpenError {
    pub retry_after: Duration,
}

/// Per-backend circuit breaker: closed -> open -> half-open -> closed.
///
/// Closed-state counters reset on interval rollover; the breaker trips when
/// `requests >= min_requests` and the failure ratio meets the threshold.
/// While open, calls short-circuit until the timeout elapses, then a bounded
/// number of half-open probes decide between reopening and closing.
pub struct CircuitBreaker {
    key: String,
    config: BreakerConfig,
    metrics: Option<Arc<GatewayMetrics>>,
    inner: Mutex<BreakerInner>,
}

/// Outcome slot handed to the caller. Exactly one of `success`/`failure`
/// should be reported; dropping the permit unreported (cancellation) undoes
/// the admission so half-open slots are never leaked.
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    consumed: bool,
}

impl<'a> Permit<'a> {
    pub fn success(mut self) {
        self.consumed = true;
        self.breaker.on_success(self.generation);
    }

    pub fn failure(mut self) {
        self.consumed = true;
        self.breaker.on_failure(self.generation);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.consumed {
            self.breaker.on_cancel(self.generation);
        }
    }
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            metrics: None,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                counts: Counts::default(),
                generation: 0,
                interval_started: Instant::now(),
                opened_at: None,
                half_open_inflight: 0,
                half_open_successes: 0,
            }),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn note_transition(&self, state: BreakerState) {
        if let Some(metrics) = &self.metrics {
            metrics.record_breaker_transition(state.as_str());
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        self.roll(&mut inner);
        inner.state
    }

    /// Admit or reject a call. The returned permit must be resolved with the
    /// call's outcome.
    pub fn acquire(&self) -> Result<Permit<'_>, CircuitOpenError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        self.roll(&mut inner);
        match inner.state {
            BreakerState::Closed => {
                inner.counts.requests += 1;
                Ok(Permit { breaker: self, generation: inner.generation, consumed: false })
            }
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                let timeout = Duration::from_secs(self.config.timeout_secs);
                Err(CircuitOpenError { retry_after: timeout.saturating_sub(elapsed) })
            }
            BreakerState::HalfOpen => {
                if inner.half_open_inflight >= self.config.half_open_max {
                    Err(CircuitOpenError {
                        retry_after: Duration::from_secs(self.config.timeout_secs),
                    })
                } else {
                    inner.half_open_inflight += 1;
                    inner.counts.requests += 1;
                    Ok(Permit { breaker: self, generation: inner.generation, consumed: false })
                }
            }
        }
    }

    /// Interval rollover and open->half-open promotion.
    fn roll(&self, inner: &mut BreakerInner) {
        match inner.state {
            BreakerState::Closed => {
                if inner.interval_started.elapsed()
                    >= Duration::from_secs(self.config.interval_secs)
                {
                    inner.counts = Counts::default();
                    inner.interval_started = Instant::now();
                    inner.generation += 1;
                }
            }
            BreakerState::Open => {
                let expired = inner
                    .opened_at
                    .map(|at| at.elapsed() >= Duration::from_secs(self.config.timeout_secs))
                    .unwrap_or(true);
                if expired {
                    debug!(key = %self.key, "breaker half-open");
                    inner.state = BreakerState::HalfOpen;
                    inner.generation += 1;
                    inner.counts = Counts::default();
                    inner.half_open_inflight = 0;
                    inner.half_open_successes = 0;
                    self.note_transition(BreakerState::HalfOpen);
                }
            }
            BreakerState::HalfOpen => {}
        }
    }

    fn on_success(&self, generation: u64) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        if inner.generation != generation {
            return;
        }
        inner.counts.successes += 1;
        inner.counts.consecutive_failures = 0;
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.half_open_successes {
                debug!(key = %self.key, "breaker closed");
                inner.state = BreakerState::Closed;
                inner.counts = Counts::default();
                inner.interval_started = Instant::now();
                inner.opened_at = None;
                inner.generation += 1;
                self.note_transition(BreakerState::Closed);
            }
        }
    }

    fn on_failure(&self, generation: u64) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        if inner.generation != generation {
            return;
        }
        inner.counts.failures += 1;
        inner.counts.consecutive_failures += 1;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                self.trip(&mut inner);
            }
            BreakerState::Closed => {
                let counts = inner.counts;
                if counts.requests >= self.config.min_requests
                    && counts.failures as f64 / counts.requests as f64
                        >= self.config.failure_ratio
                {
                    self.trip(&mut inner);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn on_cancel(&self, generation: u64) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        if inner.generation != generation {
            return;
        }
        inner.counts.requests = inner.counts.requests.saturating_sub(1);
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        warn!(key = %self.key, "breaker open");
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.generation += 1;
        inner.half_open_inflight = 0;
        inner.half_open_successes = 0;
        self.note_transition(BreakerState::Open);
    }
}

/// Lazily-created breaker per backend key.
#[derive(Clone)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    metrics: Option<Arc<GatewayMetrics>>,
    breakers: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self { config, metrics: None, breakers: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut guard = self.breakers.lock().expect("mutex poisoned");
        guard
            .entry(key.to_string())
            .or_insert_with(|| {
                let mut breaker = CircuitBreaker::new(key, self.config);
                if let Some(metrics) = &self.metrics {
                    breaker = breaker.with_metrics(metrics.clone());
                }
                Arc::new(breaker)
            })
            .clone()
    }
}

/// Errors a retry layer can act on.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("deadline expired before a successful attempt")]
    DeadlineExpired,
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial: Duration,
    pub multiplier: f64,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial: Duration::from_millis(config.initial_ms),
            multiplier: 2.0,
            cap: Duration::from_millis(config.cap_ms),
        }
    }

    /// Deterministic exponential base for attempt N (0-based).
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let backoff = self.initial.mul_f64(factor);
        backoff.min(self.cap)
    }

    /// Base backoff with +/-50% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        let jitter = 0.5 + rand::random::<f64>();
        base.mul_f64(jitter).min(self.cap)
    }
}

/// Run `op` up to `max_attempts` times, sleeping the jittered backoff between
/// retryable failures. Sleeps never run past the deadline.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    deadline: Instant,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Retryable,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        if Instant::now() >= deadline {
            return Err(RetryError::DeadlineExpired);
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < policy.max_attempts => {
                let backoff = policy.backoff(attempt);
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(RetryError::DeadlineExpired);
                }
                tokio::time::sleep(backoff.min(remaining)).await;
                attempt += 1;
            }
            Err(err) => return Err(RetryError::Inner(err)),
        }
    }
}
