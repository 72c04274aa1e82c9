//! Session-wide circuit breaker on consecutive task failures.

use std::sync::Mutex;

use crate::clog_warn;

#[derive(Debug)]
struct BreakerState {
    consecutive: u32,
    tripped: bool,
}

/// Trips after `threshold` consecutive task aborts across the session.
///
/// Any passing task resets the count.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self::restore(threshold, 0)
    }

    /// A breaker that has already counted `consecutive` failures, as when a
    /// session is rebuilt from its log.
    pub fn restore(threshold: u32, consecutive: u32) -> Self {
        let threshold = threshold.max(1);
        Self {
            threshold,
            state: Mutex::new(BreakerState {
                consecutive,
                tripped: consecutive >= threshold,
            }),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn record_success(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.consecutive = 0;
        }
    }

    /// Count a failure. Returns true only on the failure that trips the breaker.
    pub fn record_failure(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        state.consecutive += 1;
        if !state.tripped && state.consecutive >= self.threshold {
            state.tripped = true;
            clog_warn!(
                "Circuit breaker tripped after {} consecutive failures",
                state.consecutive
            );
            return true;
        }
        false
    }

    pub fn is_tripped(&self) -> bool {
        self.state.lock().map(|s| s.tripped).unwrap_or(true)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().map(|s| s.consecutive).unwrap_or(0)
    }

    /// Close the breaker. Called when an operator resumes the session.
    pub fn reset(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.consecutive = 0;
            state.tripped = false;
        }
    }
}
