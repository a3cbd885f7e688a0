//! Process-wide circuit breaker for the vault endpoint.
//!
//! The breaker counts consecutive backend failures. At the threshold it
//! opens and rejects calls without touching the network until the cool-down
//! elapses, then lets a single probe through (half-open). A successful probe
//! closes it; a failed probe re-opens it for another cool-down.
//!
//! One [`CircuitBreaker`] is owned by the engine and shared by every query
//! through an `Arc`, so tests get fresh state simply by building a new one.

use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen { probing: bool },
}

/// Outcome of asking the breaker for permission to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Allowed,
    Rejected { retry_in: Duration },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner::Closed { failures: 0 }),
        }
    }

    /// Ask to make one call. Transitions Open → HalfOpen once the cool-down
    /// has elapsed; only one probe is admitted while half-open.
    pub fn acquire(&self) -> Permit {
        let mut inner = self.lock();
        match *inner {
            Inner::Closed { .. } => Permit::Allowed,
            Inner::Open { until } => {
                let now = Instant::now();
                if now >= until {
                    *inner = Inner::HalfOpen { probing: true };
                    tracing::info!("circuit half-open, probing backend");
                    Permit::Allowed
                } else {
                    Permit::Rejected {
                        retry_in: until - now,
                    }
                }
            }
            Inner::HalfOpen { probing: true } => Permit::Rejected {
                retry_in: Duration::ZERO,
            },
            Inner::HalfOpen { probing: false } => {
                *inner = Inner::HalfOpen { probing: true };
                Permit::Allowed
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if matches!(*inner, Inner::HalfOpen { .. }) {
            tracing::info!("circuit closed after successful probe");
        }
        *inner = Inner::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let next = match *inner {
            Inner::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.threshold {
                    tracing::warn!(
                        failures,
                        cooldown_ms = self.cooldown.as_millis() as u64,
                        "circuit opened"
                    );
                    Inner::Open {
                        until: Instant::now() + self.cooldown,
                    }
                } else {
                    Inner::Closed { failures }
                }
            }
            Inner::HalfOpen { .. } => {
                tracing::warn!("probe failed, circuit re-opened");
                Inner::Open {
                    until: Instant::now() + self.cooldown,
                }
            }
            Inner::Open { until } => Inner::Open { until },
        };
        *inner = next;
    }

    /// Give back a probe slot without recording an outcome (e.g. the call
    /// was cancelled before the backend answered).
    pub fn release_probe(&self) {
        let mut inner = self.lock();
        if let Inner::HalfOpen { probing: true } = *inner {
            *inner = Inner::HalfOpen { probing: false };
        }
    }

    pub fn state(&self) -> CircuitState {
        match *self.lock() {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { until } if Instant::now() >= until => CircuitState::HalfOpen,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        match *self.lock() {
            Inner::Closed { failures } => failures,
            _ => self.threshold,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock still holds a valid state machine.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_at_threshold() {
        let cb = CircuitBreaker::new(2, Duration::from_secs(60));
        assert_eq!(cb.acquire(), Permit::Allowed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.acquire(), Permit::Rejected { .. }));
    }

    #[test]
    fn test_success_resets_count() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_single_probe() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(0));
        cb.record_failure();
        assert_eq!(cb.acquire(), Permit::Allowed);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(matches!(cb.acquire(), Permit::Rejected { .. }));
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failed_probe_reopens() {
        let cb = CircuitBreaker::new(1, Duration::from_secs(60));
        cb.record_failure();
        {
            // Force the cool-down to have elapsed.
            let mut inner = cb.lock();
            *inner = Inner::Open {
                until: Instant::now(),
            };
        }
        assert_eq!(cb.acquire(), Permit::Allowed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_release_probe_allows_another() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(0));
        cb.record_failure();
        assert_eq!(cb.acquire(), Permit::Allowed);
        cb.release_probe();
        assert_eq!(cb.acquire(), Permit::Allowed);
    }
}
