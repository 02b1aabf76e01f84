//! Resilience layer - retry with backoff and per-endpoint circuit breakers.
//!
//! The breaker is consulted before every attempt. While open it rejects
//! immediately without touching the network; once the recovery timeout has
//! elapsed it admits exactly one trial call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mockable::Clock;
use tokio::time::Instant;

use super::errors::GatewayError;
use crate::config::{CircuitBreakerConfig, RetryConfig};

/// Shared time source.
pub type SharedClock = Arc<dyn Clock + Send + Sync>;

// ─── Retry Policy ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Backoff before retry number `retry` (0-based): `base × 2^retry`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

// ─── Circuit Breaker ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { opened_at: DateTime<Utc> },
    /// The single trial call is in flight.
    HalfOpen,
}

/// Per-endpoint circuit breaker.
pub struct CircuitBreaker {
    endpoint: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    clock: SharedClock,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(endpoint: &str, config: &CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: Duration::from_secs(config.recovery_timeout_secs),
            clock,
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Ask to send one request. Rejected with `CircuitOpen` while open or
    /// while a half-open trial call is already in flight.
    pub fn acquire(&self) -> Result<BreakerPermit<'_>, GatewayError> {
        let mut state = self.lock();
        match *state {
            BreakerState::Closed { .. } => Ok(BreakerPermit::new(self)),
            BreakerState::Open { opened_at } => {
                let elapsed = (self.clock.utc() - opened_at).to_std().unwrap_or_default();
                if elapsed >= self.recovery_timeout {
                    *state = BreakerState::HalfOpen;
                    tracing::info!(endpoint = %self.endpoint, "circuit half-open, admitting trial call");
                    Ok(BreakerPermit::new(self))
                } else {
                    Err(self.open_error(self.recovery_timeout - elapsed))
                }
            }
            BreakerState::HalfOpen => Err(self.open_error(Duration::ZERO)),
        }
    }

    /// Short state name for logs and diagnostics.
    pub fn state_name(&self) -> &'static str {
        match *self.lock() {
            BreakerState::Closed { .. } => "closed",
            BreakerState::Open { .. } => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn on_success(&self) {
        let mut state = self.lock();
        if *state == BreakerState::HalfOpen {
            tracing::info!(endpoint = %self.endpoint, "trial call succeeded, circuit closed");
        }
        *state = BreakerState::Closed {
            consecutive_failures: 0,
        };
    }

    fn on_transient_failure(&self) {
        let mut state = self.lock();
        let now = self.clock.utc();
        *state = match *state {
            BreakerState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.failure_threshold {
                    tracing::warn!(endpoint = %self.endpoint, failures, "circuit opened");
                    BreakerState::Open { opened_at: now }
                } else {
                    BreakerState::Closed {
                        consecutive_failures: failures,
                    }
                }
            }
            BreakerState::HalfOpen => {
                tracing::warn!(endpoint = %self.endpoint, "trial call failed, circuit re-opened");
                BreakerState::Open { opened_at: now }
            }
            open @ BreakerState::Open { .. } => open,
        };
    }

    /// A permit dropped without an outcome (cancelled request).
    fn on_abandoned(&self) {
        let mut state = self.lock();
        if *state == BreakerState::HalfOpen {
            *state = BreakerState::Open {
                opened_at: self.clock.utc(),
            };
        }
    }

    fn open_error(&self, retry_in: Duration) -> GatewayError {
        GatewayError::CircuitOpen {
            endpoint: self.endpoint.clone(),
            retry_in_ms: retry_in.as_millis() as u64,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Permission to send one request. Settle it with the outcome.
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            settled: false,
        }
    }

    /// Record the outcome. Only transient errors count as breaker failures;
    /// a permanent error still proves the endpoint answered.
    pub fn settle<T>(mut self, outcome: &Result<T, GatewayError>) {
        self.settled = true;
        match outcome {
            Err(e) if e.is_transient() => self.breaker.on_transient_failure(),
            _ => self.breaker.on_success(),
        }
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandoned();
        }
    }
}

// ─── Breaker Registry ────────────────────────────────────────────────────────

/// Process-shared breakers keyed by endpoint URL.
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    clock: SharedClock,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// The breaker for `endpoint`, created on first use.
    pub fn get(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(breakers.entry(endpoint.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(endpoint, &self.config, Arc::clone(&self.clock)))
        }))
    }
}

// ─── Retry Driver ────────────────────────────────────────────────────────────

/// Shortest attempt worth starting once backoff has eaten into the budget.
const MIN_ATTEMPT_WINDOW: Duration = Duration::from_millis(100);

/// Run `op` under the breaker, retrying transient failures with backoff.
///
/// Each attempt acquires its own breaker permit, so a circuit that opens
/// mid-retry stops the loop with `CircuitOpen` instead of another request.
///
/// The whole loop, attempts and backoff together, fits inside `budget`. `op`
/// is handed the time left and must not run longer; the driver also cuts
/// it off there. No retry starts unless its backoff plus
/// [`MIN_ATTEMPT_WINDOW`] still fits.
pub async fn run_with_resilience<T, F, Fut>(
    policy: &RetryPolicy,
    breaker: &CircuitBreaker,
    budget: Duration,
    mut op: F,
) -> Result<T, GatewayError>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let deadline = Instant::now() + budget;
    let mut attempt = 0u32;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let permit = breaker.acquire()?;
        let outcome = match tokio::time::timeout(remaining, op(remaining)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(GatewayError::Timeout {
                endpoint: breaker.endpoint().to_string(),
                timeout_ms: remaining.as_millis() as u64,
            }),
        };
        permit.settle(&outcome);

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        attempt += 1;
        if !err.is_transient() || attempt >= policy.max_attempts {
            return Err(err);
        }

        let delay = policy
            .delay_for(attempt - 1)
            .max(err.retry_after().unwrap_or_default());
        let left = deadline.saturating_duration_since(Instant::now());
        if delay.saturating_add(MIN_ATTEMPT_WINDOW) > left {
            tracing::warn!(
                endpoint = %breaker.endpoint(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                budget_left_ms = left.as_millis() as u64,
                error = %err,
                "call budget exhausted, not retrying"
            );
            return Err(err);
        }
        tracing::warn!(
            endpoint = %breaker.endpoint(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient backend error, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(clock: Arc<ManualClock>, threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "http://backend/v1/chat/completions",
            &CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout_secs: 30,
            },
            clock,
        )
    }

    const BUDGET: Duration = Duration::from_secs(10);

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn server_error() -> GatewayError {
        GatewayError::ServerError {
            status: 503,
            body: "busy".into(),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock, 10);
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = run_with_resilience(&fast_policy(3), &breaker, BUDGET, move |_| async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(server_error())
            } else {
                Ok("ok")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.state_name(), "closed");
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock, 10);
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), _> = run_with_resilience(&fast_policy(5), &breaker, BUDGET, move |_| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::ClientError {
                status: 400,
                body: "bad".into(),
            })
        })
        .await;

        assert!(matches!(result, Err(GatewayError::ClientError { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_makes_zero_network_attempts() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(Arc::clone(&clock), 2);
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let failing = move |_: Duration| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(server_error())
        };

        // Two transient failures open the circuit.
        let _ = run_with_resilience(&fast_policy(2), &breaker, BUDGET, failing).await;
        assert_eq!(breaker.state_name(), "open");
        let before = calls.load(Ordering::SeqCst);

        for _ in 0..5 {
            let result = run_with_resilience(&fast_policy(3), &breaker, BUDGET, failing).await;
            assert!(matches!(result, Err(GatewayError::CircuitOpen { .. })));
        }
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn test_hung_attempt_is_cut_at_budget() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock, 10);
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let started = std::time::Instant::now();

        let result: Result<(), _> = run_with_resilience(
            &fast_policy(5),
            &breaker,
            Duration::from_millis(300),
            move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::pending().await
            },
        )
        .await;

        assert!(matches!(result, Err(GatewayError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_no_retry_when_backoff_exceeds_budget() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock, 10);
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(1),
        };
        let started = std::time::Instant::now();

        let result: Result<(), _> =
            run_with_resilience(&policy, &breaker, Duration::from_millis(300), move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(server_error())
            })
            .await;

        assert!(matches!(result, Err(GatewayError::ServerError { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_attempts_see_shrinking_budget() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock, 10);
        let seen = Mutex::new(Vec::new());
        let seen_ref = &seen;

        let _: Result<(), _> =
            run_with_resilience(&fast_policy(3), &breaker, Duration::from_secs(5), move |left| async move {
                seen_ref.lock().unwrap().push(left);
                Err(server_error())
            })
            .await;

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|left| *left <= Duration::from_secs(5)));
        assert!(seen.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_half_open_admits_exactly_one_trial() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(Arc::clone(&clock), 1);

        breaker.acquire().unwrap().settle::<()>(&Err(server_error()));
        assert_eq!(breaker.state_name(), "open");

        clock.advance(Duration::from_secs(31));
        let trial = breaker.acquire().unwrap();
        assert_eq!(breaker.state_name(), "half_open");
        assert!(matches!(
            breaker.acquire().err(),
            Some(GatewayError::CircuitOpen { .. })
        ));

        trial.settle(&Ok::<(), GatewayError>(()));
        assert_eq!(breaker.state_name(), "closed");
        assert!(breaker.acquire().is_ok());
    }

    #[test]
    fn test_failed_trial_reopens() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(Arc::clone(&clock), 1);

        breaker.acquire().unwrap().settle::<()>(&Err(server_error()));
        clock.advance(Duration::from_secs(30));
        breaker.acquire().unwrap().settle::<()>(&Err(server_error()));

        assert_eq!(breaker.state_name(), "open");
        clock.advance(Duration::from_secs(10));
        assert!(breaker.acquire().is_err());
    }

    #[test]
    fn test_abandoned_trial_reopens() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(Arc::clone(&clock), 1);

        breaker.acquire().unwrap().settle::<()>(&Err(server_error()));
        clock.advance(Duration::from_secs(31));
        drop(breaker.acquire().unwrap());
        assert_eq!(breaker.state_name(), "open");
    }

    #[test]
    fn test_non_transient_errors_do_not_trip() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock, 2);
        for _ in 0..5 {
            breaker.acquire().unwrap().settle::<()>(&Err(GatewayError::Decode {
                reason: "x".into(),
            }));
        }
        assert_eq!(breaker.state_name(), "closed");
    }

    #[test]
    fn test_registry_shares_breaker_per_endpoint() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig::default(), Arc::new(ManualClock::new()));
        let a = registry.get("http://x/chat/completions");
        let b = registry.get("http://x/chat/completions");
        let c = registry.get("http://x/responses");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
