//! Circuit breaker guarding model RPC initiation.
//!
//! Five consecutive failures open the circuit; after sixty seconds a
//! half-open probe is allowed, and two consecutive successes close it
//! again. The breaker only guards initiation, not an established stream.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Failures required to open the circuit.
const FAILURE_THRESHOLD: u32 = 5;

/// Time the circuit stays open before probing.
const OPEN_DURATION: Duration = Duration::from_secs(60);

/// Successes required in half-open state to close.
const CLOSE_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

/// Shared breaker state for one upstream.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
        }
    }

    /// Whether a new attempt may proceed. Transitions Open → HalfOpen
    /// once the open window has elapsed.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed { .. } | BreakerState::HalfOpen { .. } => true,
            BreakerState::Open { since } => {
                if since.elapsed() >= OPEN_DURATION {
                    log::info!("[Breaker] Half-open probe window");
                    *state = BreakerState::HalfOpen { successes: 0 };
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a successful initiation.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed { .. } => *state = BreakerState::Closed { failures: 0 },
            BreakerState::HalfOpen { successes } => {
                let successes = successes + 1;
                if successes >= CLOSE_THRESHOLD {
                    log::info!("[Breaker] Closed after successful probes");
                    *state = BreakerState::Closed { failures: 0 };
                } else {
                    *state = BreakerState::HalfOpen { successes };
                }
            }
            BreakerState::Open { .. } => {}
        }
    }

    /// Records a failed initiation.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= FAILURE_THRESHOLD {
                    log::warn!("[Breaker] Open after {} consecutive failures", failures);
                    *state = BreakerState::Open {
                        since: Instant::now(),
                    };
                } else {
                    *state = BreakerState::Closed { failures };
                }
            }
            BreakerState::HalfOpen { .. } => {
                log::warn!("[Breaker] Probe failed, reopening");
                *state = BreakerState::Open {
                    since: Instant::now(),
                };
            }
            BreakerState::Open { .. } => {}
        }
    }

    /// Whether the circuit currently refuses attempts.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock(), BreakerState::Open { .. })
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
