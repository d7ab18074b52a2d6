//! Retry logic for model RPC initiation.
//!
//! Exponential backoff with jitter around transient initiation errors.
//! Validation and access errors abort immediately; everything the error
//! taxonomy classes as transient gets up to three attempts.

use std::time::Duration;

use rand::Rng;

use crate::error::{is_retryable_message, BridgeError, BridgeResult};
use crate::rpc::breaker::CircuitBreaker;

/// Backoff parameters for RPC initiation.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            multiplier: 2.0,
            max_ms: 30_000,
            jitter: 0.1,
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given retry (1-based), jittered.
    fn delay(&self, attempt: u32) -> Duration {
        let base = (self.initial_ms as f64 * self.multiplier.powi(attempt as i32 - 1))
            .min(self.max_ms as f64);
        let spread = rand::rng().random_range(-self.jitter..=self.jitter);
        Duration::from_millis((base * (1.0 + spread)).max(0.0) as u64)
    }
}

fn is_retryable(error: &BridgeError) -> bool {
    error.is_retryable() || is_retryable_message(&error.to_string())
}

/// Executes an RPC initiation with retry and circuit-breaker gating.
///
/// # Arguments
/// * `action` - Action name for logging
/// * `operation` - Closure that performs one initiation attempt
pub async fn with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    breaker: &CircuitBreaker,
    action: &str,
    mut operation: F,
) -> BridgeResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = BridgeResult<T>>,
{
    let mut last_error = None;

    for attempt in 1..=policy.max_attempts {
        if !breaker.allow() {
            log::warn!("[Rpc] Circuit open, refusing {}", action);
            return Err(last_error
                .unwrap_or_else(|| BridgeError::RpcInternal("circuit breaker open".into())));
        }

        if attempt > 1 {
            let delay = policy.delay(attempt - 1);
            log::info!(
                "[Rpc] Retrying {} (attempt {}/{}) after {:?}",
                action,
                attempt,
                policy.max_attempts,
                delay
            );
            tokio::time::sleep(delay).await;
        }

        match operation().await {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(err) if is_retryable(&err) => {
                log::warn!("[Rpc] {} transient error: {}", action, err);
                breaker.record_failure();
                last_error = Some(err);
            }
            Err(err) => {
                breaker.record_failure();
                return Err(err);
            }
        }
    }

    Err(last_error.expect("retry loop should have set last_error"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy {
            initial_ms: 10,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_up_to_three_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let breaker = CircuitBreaker::new();

        let result: BridgeResult<()> =
            with_backoff(&fast_policy(), &breaker, "connect", move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(BridgeError::RpcTimeout(5000))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_errors_abort_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let breaker = CircuitBreaker::new();

        let result: BridgeResult<()> =
            with_backoff(&fast_policy(), &breaker, "connect", move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(BridgeError::RpcValidation("bad request".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(BridgeError::RpcValidation(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let breaker = CircuitBreaker::new();

        let result = with_backoff(&fast_policy(), &breaker, "connect", move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BridgeError::RpcThrottled("busy".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.expect("third attempt succeeds"), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_delays_grow_exponentially() {
        let breaker = CircuitBreaker::new();
        let started = Instant::now();

        let result: BridgeResult<()> = with_backoff(
            &BackoffPolicy::default(),
            &breaker,
            "connect",
            || async { Err(BridgeError::RpcTimeout(1)) },
        )
        .await;

        assert!(result.is_err());
        // Two delays: ~1000ms and ~2000ms, each jittered ±10%.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(2700), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(3300), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_refuses_attempts() {
        let breaker = CircuitBreaker::new();
        for _ in 0..5 {
            breaker.record_failure();
        }
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result: BridgeResult<()> =
            with_backoff(&fast_policy(), &breaker, "connect", move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 0, "never reached the RPC");
    }
}
