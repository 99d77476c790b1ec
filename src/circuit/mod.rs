//! Failure isolation with circuit breakers.
//!
//! A [`CircuitBreaker`] counts failures of one protected call path. Once the
//! count reaches the threshold the circuit is open and calls are refused until
//! more than the reset timeout has passed since the last failure. The first caller after
//! that closes the circuit again (clearing the counter) and the next recorded
//! outcome is the trial: a failure reopens immediately, a success keeps it
//! closed. The clock is checked lazily on each call; there is no timer task.
//!
//! Successes never decrement the counter while the circuit is closed.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    Response, StatusCode,
    config::ConfigError,
    context::Context,
    middleware::{BoxFuture, Middleware, Next},
    ratelimit::retry_after_secs,
};

pub const METRIC_CIRCUIT_REJECTED: &str = "rttp_shield_circuit_rejected_total";

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_RESET_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_BREAKERS: usize = 10_000;

/// Which circuit a request belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitKey {
    /// One circuit for the whole origin.
    #[default]
    Global,
    /// One circuit per request path. Paths are client-controlled, so the
    /// registry is bounded by [`CircuitBreakerConfig::max_breakers`].
    Path,
}

impl CircuitKey {
    fn name<'a>(&self, ctx: &'a Context) -> &'a str {
        match self {
            CircuitKey::Global => "global",
            CircuitKey::Path => ctx.request().path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit refuses calls after the last failure (ms).
    pub reset_timeout_ms: u64,
    pub key: CircuitKey,
    /// Upper bound on tracked circuits. Only matters for [`CircuitKey::Path`],
    /// where every distinct request path gets its own breaker.
    pub max_breakers: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout_ms: DEFAULT_RESET_TIMEOUT_MS,
            key: CircuitKey::default(),
            max_breakers: DEFAULT_MAX_BREAKERS,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.failure_threshold",
                "must be greater than zero",
            ));
        }
        if self.reset_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.reset_timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.max_breakers == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.max_breakers",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Returned by [`CircuitBreaker::try_acquire`] while the circuit is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("circuit open, retry in {retry_after:?}")]
pub struct CircuitOpen {
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

#[derive(Debug, Default)]
struct BreakerState {
    failures: u32,
    last_failure: Option<Instant>,
    // Set on open -> closed; cleared by the next recorded outcome.
    probing: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    reset_timeout: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            threshold,
            reset_timeout,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Admits a call unless the circuit is open.
    ///
    /// If the reset timeout has elapsed the circuit closes here and the call is
    /// admitted as the trial.
    pub fn try_acquire(&self) -> Result<(), CircuitOpen> {
        let mut state = self.state.lock();
        if state.failures < self.threshold {
            return Ok(());
        }

        if let Some(at) = state.last_failure {
            let since_failure = at.elapsed();
            if since_failure <= self.reset_timeout {
                return Err(CircuitOpen {
                    retry_after: self.reset_timeout - since_failure,
                });
            }
        }

        state.failures = 0;
        state.last_failure = None;
        state.probing = true;
        info!(threshold = self.threshold, "circuit closed after reset timeout, probing");
        Ok(())
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.last_failure = Some(Instant::now());

        if state.probing {
            state.probing = false;
            state.failures = self.threshold;
            warn!(threshold = self.threshold, "trial call failed, circuit reopened");
            return;
        }

        state.failures = state.failures.saturating_add(1);
        if state.failures == self.threshold {
            warn!(threshold = self.threshold, "circuit opened after reaching failure threshold");
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.probing {
            state.probing = false;
            info!("trial call succeeded, circuit stays closed");
        }
    }

    /// Current state, evaluated against the clock without changing it.
    pub fn state(&self) -> CircuitState {
        let state = self.state.lock();
        let open = state.failures >= self.threshold
            && state
                .last_failure
                .is_some_and(|at| at.elapsed() <= self.reset_timeout);
        if open { CircuitState::Open } else { CircuitState::Closed }
    }

    pub fn failures(&self) -> u32 {
        self.state.lock().failures
    }

    // No failures and no pending trial: indistinguishable from a new breaker.
    fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.failures == 0 && !state.probing
    }
}

/// One breaker per circuit name, created on first use.
///
/// The registry holds at most `capacity` named breakers. When a new name
/// arrives at capacity, idle breakers (no failures, no pending trial) are
/// dropped first; if every slot still carries state, the name shares a single
/// overflow breaker instead of getting its own.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    overflow: Arc<CircuitBreaker>,
    capacity: usize,
    threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreakerRegistry {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            overflow: Arc::new(CircuitBreaker::new(threshold, reset_timeout)),
            capacity: DEFAULT_MAX_BREAKERS,
            threshold,
            reset_timeout,
        }
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(config.failure_threshold, config.reset_timeout())
            .with_capacity(config.max_breakers)
    }

    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(name) {
            return Arc::clone(breaker.value());
        }

        if self.breakers.len() >= self.capacity {
            self.breakers.retain(|_, breaker| !breaker.is_idle());
            if self.breakers.len() >= self.capacity {
                debug!(
                    circuit = name,
                    capacity = self.capacity,
                    "breaker registry full, using overflow circuit"
                );
                return Arc::clone(&self.overflow);
            }
        }

        let entry = self
            .breakers
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.threshold, self.reset_timeout)));
        Arc::clone(entry.value())
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

/// Refuses calls with `503 Service Unavailable` while the request's circuit is
/// open; otherwise calls the rest of the chain and records `5xx` answers as
/// failures.
#[derive(Clone)]
pub struct CircuitBreakerMiddleware {
    registry: Arc<CircuitBreakerRegistry>,
    key: CircuitKey,
}

impl CircuitBreakerMiddleware {
    pub fn new(registry: Arc<CircuitBreakerRegistry>, key: CircuitKey) -> Self {
        Self { registry, key }
    }
}

impl Middleware for CircuitBreakerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture {
        let breaker = self.registry.breaker(self.key.name(&ctx));

        Box::pin(async move {
            if let Err(open) = breaker.try_acquire() {
                debug!(path = %ctx.request().path(), "circuit open, rejecting request");
                counter!(METRIC_CIRCUIT_REJECTED).increment(1);
                return Response::error(
                    StatusCode::ServiceUnavailable,
                    "Service temporarily unavailable",
                )
                .header("Retry-After", retry_after_secs(open.retry_after).to_string());
            }

            let response = next.run(ctx).await;
            if response.status().is_server_error() {
                breaker.record_failure();
            } else {
                breaker.record_success();
            }
            response
        })
    }
}
