//! Retry with exponential backoff behind a circuit breaker.
//!
//! Transient provider failures (network, timeout) are retried locally;
//! repeated failures open the breaker so a struggling backend is not
//! hammered. A half-open probe closes it again on the first success.

use crate::error::{Error, Result};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Backoff policy for transient errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the first try
    pub max_retries: u32,
    /// Delay before the first retry; doubles per attempt
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker guarding an external backend.
pub struct CircuitBreaker {
    state: Mutex<Breaker>,
    failure_threshold: u32,
    cooldown: Duration,
}

struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    /// Create a breaker that opens after `failure_threshold` consecutive
    /// failures and probes again after `cooldown`.
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(Breaker {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            failure_threshold,
            cooldown,
        }
    }

    /// Whether a call may proceed right now.
    pub fn allow(&self) -> bool {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match guard.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let expired = guard
                    .opened_at
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if expired {
                    debug!("Circuit breaker half-open, allowing probe");
                    guard.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.state = BreakerState::Closed;
        guard.consecutive_failures = 0;
        guard.opened_at = None;
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.consecutive_failures += 1;
        if guard.state == BreakerState::HalfOpen
            || guard.consecutive_failures >= self.failure_threshold
        {
            if guard.state != BreakerState::Open {
                warn!(
                    failures = guard.consecutive_failures,
                    "Circuit breaker opened"
                );
            }
            guard.state = BreakerState::Open;
            guard.opened_at = Some(Instant::now());
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

/// Run `op` with backoff on transient errors, respecting the breaker.
///
/// Non-transient errors (validation, rate limit, API) surface
/// immediately; the rate-limit retry-after loop belongs to the caller.
pub async fn with_backoff<T, F, Fut>(
    breaker: &CircuitBreaker,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        if !breaker.allow() {
            return Err(Error::Provider("circuit breaker open".to_string()));
        }
        match op().await {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                breaker.record_failure();
                let delay = policy.base_delay * 2u32.pow(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying after transient error");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    breaker.record_failure();
                }
                return Err(e);
            }
        }
    }
}
