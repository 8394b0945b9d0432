//! Three-state circuit breaker: Closed → Open → Half-Open.
//!
//! State transitions:
//! - `Closed` → `Open`:      failure count reaches `failure_threshold`
//! - `Open` → `Half-Open`:   `reset_timeout` has elapsed, on the next `allow()`
//! - `Half-Open` → `Closed`: the trial request succeeds
//! - `Half-Open` → `Open`:   the trial request fails (timer restarted)
//!
//! The breaker never calls the network; callers report outcomes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// All requests rejected until `reset_timeout` elapses.
    Open,
    /// One trial request allowed to test provider health.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening.
    pub failure_threshold: u32,
    /// How long to stay open before allowing a trial request.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

struct CircuitInner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Thread-safe circuit breaker.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitInner>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in `Closed` state.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                trial_in_flight: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reset_due(&self, inner: &CircuitInner) -> bool {
        inner
            .opened_at
            .map(|at| at.elapsed() >= self.config.reset_timeout)
            .unwrap_or(true)
    }

    /// Current state as last recorded. Does not advance Open → Half-Open.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures counted while closed.
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Whether `allow()` would currently let a request through, without
    /// claiming the half-open trial.
    pub fn would_allow(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.reset_due(&inner),
            CircuitState::HalfOpen => !inner.trial_in_flight,
        }
    }

    /// Ask to send a request. While half-open, exactly one caller gets `true`
    /// until an outcome is reported.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.reset_due(&inner) {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!("Circuit breaker → half-open");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful request.
    pub fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                tracing::info!("Circuit breaker → closed");
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            // A late success from a call admitted before the breaker opened.
            CircuitState::Open => {}
        }
    }

    /// Record a failed request.
    pub fn on_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(failures = inner.failure_count, "Circuit breaker → open");
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                tracing::warn!("Circuit breaker trial failed → open");
            }
            CircuitState::Open => {}
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .finish()
    }
}
