//! A small per-resolver circuit breaker (§5): opens after 5 consecutive
//! failures within a 30s window, moves to half-open after 60s, and closes
//! again on the first successful probe.

use std::sync::Mutex;
use std::time::{Duration, Instant};

const FAILURE_THRESHOLD: u32 = 5;
const FAILURE_WINDOW: Duration = Duration::from_secs(30);
const OPEN_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfProbe,
}

struct Inner {
    consecutive_failures: u32,
    first_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    half_probe_in_flight: bool,
}

pub struct CircuitBreaker {
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { consecutive_failures: 0, first_failure_at: None, opened_at: None, half_probe_in_flight: false }) }
    }

    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock().expect("circuit breaker lock poisoned");
        match inner.opened_at {
            None => CircuitState::Closed,
            Some(opened_at) if opened_at.elapsed() >= OPEN_COOLDOWN => CircuitState::HalfProbe,
            Some(_) => CircuitState::Open,
        }
    }

    /// Whether a call may proceed. A half-open breaker admits exactly one
    /// in-flight probe at a time.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        match inner.opened_at {
            None => true,
            Some(opened_at) if opened_at.elapsed() >= OPEN_COOLDOWN => {
                if inner.half_probe_in_flight {
                    false
                } else {
                    inner.half_probe_in_flight = true;
                    true
                }
            },
            Some(_) => false,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        inner.consecutive_failures = 0;
        inner.first_failure_at = None;
        inner.opened_at = None;
        inner.half_probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        inner.half_probe_in_flight = false;

        if inner.opened_at.is_some() {
            // A failed half-open probe re-opens the breaker for another cooldown.
            inner.opened_at = Some(Instant::now());
            return;
        }

        let now = Instant::now();
        match inner.first_failure_at {
            Some(first) if now.duration_since(first) <= FAILURE_WINDOW => inner.consecutive_failures += 1,
            _ => {
                inner.first_failure_at = Some(now);
                inner.consecutive_failures = 1;
            },
        }

        if inner.consecutive_failures >= FAILURE_THRESHOLD {
            inner.opened_at = Some(now);
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new();
        for _ in 0..FAILURE_THRESHOLD {
            assert!(breaker.allow());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        for _ in 0..(FAILURE_THRESHOLD - 1) {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
