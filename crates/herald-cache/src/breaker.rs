//! Circuit breaker for the cache backend.
//!
//! After K consecutive failures the breaker opens for W seconds: reads
//! short-circuit to "not present", writes are dropped best-effort. The
//! system then runs against the durable store directly.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

pub struct CircuitBreaker {
    threshold: u32,
    open_for: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_for: Duration) -> Self {
        Self {
            threshold,
            open_for,
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                open_until: None,
            }),
        }
    }

    /// True while the breaker is open. Past the deadline the breaker
    /// half-opens: the next call is allowed through as a probe.
    pub fn is_open(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                // Half-open: let one probe through; failures re-open.
                state.open_until = None;
                false
            }
            None => false,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        if state.consecutive_failures > 0 {
            info!("cache breaker: backend recovered");
        }
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold && state.open_until.is_none() {
            state.open_until = Some(Instant::now() + self.open_for);
            warn!(
                failures = state.consecutive_failures,
                open_secs = self.open_for.as_secs(),
                "cache breaker opened"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
    }

    #[test]
    fn half_opens_after_window() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(1));
        breaker.record_failure();
        assert!(breaker.is_open());
        std::thread::sleep(Duration::from_millis(5));
        // Window elapsed: probe allowed.
        assert!(!breaker.is_open());
        // Probe failure re-opens immediately (threshold already exceeded).
        breaker.record_failure();
        assert!(breaker.is_open());
    }
}
