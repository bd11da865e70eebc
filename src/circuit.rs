// =============================================================================
// Circuit Breaker — fault isolation for broker calls
// =============================================================================
//
// State machine:
//   CLOSED    -> OPEN       after `failure_threshold` consecutive-ish failures
//   OPEN      -> HALF_OPEN  once `current_timeout` has elapsed
//   HALF_OPEN -> CLOSED     after `success_threshold` successes
//   HALF_OPEN -> OPEN       on any failure
//
// After three half-open failures in aggregate the open timeout doubles
// (capped at five minutes) so a degraded upstream is not hammered by tight
// retry loops.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::EngineError;

/// Maximum open timeout after repeated half-open failures.
const MAX_OPEN_TIMEOUT: Duration = Duration::from_secs(300);
/// Half-open failures tolerated before the timeout starts doubling.
const HALF_OPEN_FAILURE_GRACE: u32 = 3;

/// Breaker state visible to callers and the status API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Static configuration for one breaker.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub base_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            base_timeout: Duration::from_secs(60),
        }
    }
}

struct Inner {
    state: BreakerState,
    failures: u32,
    consecutive_successes: u32,
    last_failure_time: Option<Instant>,
    current_timeout: Duration,
    consecutive_half_open_failures: u32,
}

/// Serialisable snapshot for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failures: u32,
    pub current_timeout_ms: u64,
}

/// A single named circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                consecutive_successes: 0,
                last_failure_time: None,
                current_timeout: config.base_timeout,
                consecutive_half_open_failures: 0,
            }),
        }
    }

    /// Run `f` unless the breaker denies the call, and count the outcome.
    ///
    /// While OPEN and inside the timeout window the call fails fast with
    /// [`EngineError::CircuitOpen`] without invoking `f` at all.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        self.check_permit()?;

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Deny or allow one call. An OPEN breaker whose timeout has elapsed
    /// transitions to HALF_OPEN and allows the probe through.
    pub fn check_permit(&self) -> Result<(), EngineError> {
        let mut s = self.inner.lock();
        match s.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let last = s
                    .last_failure_time
                    .expect("OPEN breaker always has a failure time");
                let elapsed = last.elapsed();
                if elapsed >= s.current_timeout {
                    s.state = BreakerState::HalfOpen;
                    s.consecutive_successes = 0;
                    info!(breaker = %self.name, "breaker half-open — probing");
                    Ok(())
                } else {
                    let retry_in = s.current_timeout - elapsed;
                    Err(EngineError::CircuitOpen {
                        breaker: self.name.clone(),
                        retry_in,
                    })
                }
            }
        }
    }

    /// Count a successful call.
    pub fn record_success(&self) {
        let mut s = self.inner.lock();
        match s.state {
            BreakerState::Closed => {
                s.failures = 0;
            }
            BreakerState::HalfOpen => {
                s.consecutive_successes += 1;
                if s.consecutive_successes >= self.config.success_threshold {
                    s.state = BreakerState::Closed;
                    s.failures = 0;
                    s.consecutive_half_open_failures = 0;
                    s.current_timeout = self.config.base_timeout;
                    info!(breaker = %self.name, "breaker closed");
                }
            }
            BreakerState::Open => {
                // A success can only be recorded for a permitted call, which
                // would have moved the breaker to HALF_OPEN first.
                debug!(breaker = %self.name, "success recorded while OPEN — ignoring");
            }
        }
    }

    /// Count a failed call.
    pub fn record_failure(&self) {
        let mut s = self.inner.lock();
        match s.state {
            BreakerState::Closed => {
                s.failures += 1;
                if s.failures >= self.config.failure_threshold {
                    s.state = BreakerState::Open;
                    s.last_failure_time = Some(Instant::now());
                    warn!(
                        breaker = %self.name,
                        failures = s.failures,
                        timeout_ms = s.current_timeout.as_millis() as u64,
                        "breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                s.state = BreakerState::Open;
                s.last_failure_time = Some(Instant::now());
                s.consecutive_successes = 0;
                s.consecutive_half_open_failures += 1;
                if s.consecutive_half_open_failures >= HALF_OPEN_FAILURE_GRACE {
                    let doubled = s.current_timeout * 2;
                    s.current_timeout = doubled.min(MAX_OPEN_TIMEOUT);
                }
                warn!(
                    breaker = %self.name,
                    half_open_failures = s.consecutive_half_open_failures,
                    timeout_ms = s.current_timeout.as_millis() as u64,
                    "breaker re-opened from half-open"
                );
            }
            BreakerState::Open => {
                s.last_failure_time = Some(Instant::now());
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let s = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: s.state,
            failures: s.failures,
            current_timeout_ms: s.current_timeout.as_millis() as u64,
        }
    }

    #[cfg(test)]
    fn current_timeout(&self) -> Duration {
        self.inner.lock().current_timeout
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &s.state)
            .field("failures", &s.failures)
            .finish()
    }
}

// =============================================================================
// Registry
// =============================================================================

pub const BREAKER_ORDERS: &str = "broker:orders";
pub const BREAKER_MARKET_DATA: &str = "broker:marketData";
pub const BREAKER_AUTH: &str = "broker:auth";

/// Process-wide registry dispensing breakers by name.
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Create a registry pre-seeded with the three broker breakers.
    ///
    /// Orders probe after 60 s, market data after 30 s; auth failures are
    /// expensive to retry and wait 120 s.
    pub fn new() -> Self {
        let registry = Self {
            breakers: RwLock::new(HashMap::new()),
        };
        registry.get_or_create(
            BREAKER_ORDERS,
            BreakerConfig {
                failure_threshold: 5,
                success_threshold: 2,
                base_timeout: Duration::from_secs(60),
            },
        );
        registry.get_or_create(
            BREAKER_MARKET_DATA,
            BreakerConfig {
                failure_threshold: 5,
                success_threshold: 2,
                base_timeout: Duration::from_secs(30),
            },
        );
        registry.get_or_create(
            BREAKER_AUTH,
            BreakerConfig {
                failure_threshold: 3,
                success_threshold: 1,
                base_timeout: Duration::from_secs(120),
            },
        );
        registry
    }

    /// Fetch a breaker by name, creating it with `config` if absent.
    pub fn get_or_create(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.read().get(name) {
            return b.clone();
        }
        let mut map = self.breakers.write();
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    /// Fetch a pre-registered breaker by name.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.read().values().map(|b| b.snapshot()).collect()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(base_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                base_timeout: Duration::from_millis(base_ms),
            },
        )
    }

    async fn failing_call(b: &CircuitBreaker) -> Result<(), EngineError> {
        b.execute(|| async { Err::<(), _>(EngineError::broker("Timeout", Some(503), "boom")) })
            .await
            .map(|_: ()| ())
    }

    async fn ok_call(b: &CircuitBreaker) -> Result<(), EngineError> {
        b.execute(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn closed_resets_failures_on_success() {
        let b = breaker(1_000);
        let _ = failing_call(&b).await;
        let _ = failing_call(&b).await;
        ok_call(&b).await.unwrap();
        // Two more failures must not open it — counter was reset.
        let _ = failing_call(&b).await;
        let _ = failing_call(&b).await;
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fails_fast() {
        let b = breaker(60_000);
        for _ in 0..3 {
            let _ = failing_call(&b).await;
        }
        assert_eq!(b.state(), BreakerState::Open);

        // Denied call: the closure must never run.
        let mut invoked = false;
        let result = b
            .execute(|| {
                invoked = true;
                async { Ok::<(), EngineError>(()) }
            })
            .await;
        assert!(matches!(result, Err(EngineError::CircuitOpen { .. })));
        assert!(!invoked, "OPEN breaker must not invoke its argument");
    }

    #[tokio::test]
    async fn open_error_carries_retry_window() {
        let b = breaker(60_000);
        for _ in 0..3 {
            let _ = failing_call(&b).await;
        }
        match ok_call(&b).await {
            Err(EngineError::CircuitOpen { retry_in, .. }) => {
                assert!(retry_in <= Duration::from_secs(60));
                assert!(retry_in > Duration::from_secs(55));
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let b = breaker(50);
        for _ in 0..3 {
            let _ = failing_call(&b).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        ok_call(&b).await.unwrap();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        ok_call(&b).await.unwrap();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    /// Re-open keeps the base timeout until three half-open failures
    /// accumulate, then the timeout doubles.
    #[tokio::test]
    async fn reopen_doubles_timeout_after_three_half_open_failures() {
        let base = Duration::from_millis(50);
        let b = breaker(50);

        for _ in 0..3 {
            let _ = failing_call(&b).await;
        }
        assert_eq!(b.state(), BreakerState::Open);

        // First half-open probe succeeds, then a failure re-opens; the
        // timeout stays at the base value.
        tokio::time::sleep(Duration::from_millis(80)).await;
        ok_call(&b).await.unwrap();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        let _ = failing_call(&b).await;
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.current_timeout(), base);

        // Two more half-open failures: the third doubles the timeout.
        for _ in 0..2 {
            tokio::time::sleep(Duration::from_millis(120)).await;
            let _ = failing_call(&b).await;
            assert_eq!(b.state(), BreakerState::Open);
        }
        assert_eq!(b.current_timeout(), base * 2);
    }

    #[tokio::test]
    async fn full_close_resets_timeout_to_base() {
        let b = breaker(50);
        for _ in 0..3 {
            let _ = failing_call(&b).await;
        }
        // Accumulate three half-open failures to double the timeout.
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(120)).await;
            let _ = failing_call(&b).await;
        }
        assert_eq!(b.current_timeout(), Duration::from_millis(100));

        // Recover: wait out the doubled window, then close fully.
        tokio::time::sleep(Duration::from_millis(150)).await;
        ok_call(&b).await.unwrap();
        ok_call(&b).await.unwrap();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.current_timeout(), Duration::from_millis(50));
    }

    #[test]
    fn registry_seeds_three_broker_breakers() {
        let registry = BreakerRegistry::new();
        assert!(registry.get(BREAKER_ORDERS).is_some());
        assert!(registry.get(BREAKER_MARKET_DATA).is_some());
        assert!(registry.get(BREAKER_AUTH).is_some());
        assert!(registry.get("broker:unknown").is_none());
    }

    #[test]
    fn registry_returns_same_instance_per_name() {
        let registry = BreakerRegistry::new();
        let a = registry.get_or_create("custom", BreakerConfig::default());
        let b = registry.get_or_create("custom", BreakerConfig::default());
        assert!(Arc::ptr_eq(&a, &b));
    }
}
