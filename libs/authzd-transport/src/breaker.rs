//! Per-endpoint circuit breaker.
//!
//! Opens after a configured number of consecutive failures inside a time
//! window, rejects calls while open, and half-opens after a cooldown to
//! let one probe through. A success in half-open closes the breaker; a
//! failure reopens it.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,

    /// Failures older than this no longer count as consecutive.
    pub failure_window: Duration,

    /// How long the breaker stays open before half-opening.
    pub open_for: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(10),
            open_for: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    first_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
}

/// Thread-safe circuit breaker; one per backend endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                first_failure_at: None,
                opened_at: None,
            }),
        }
    }

    /// Whether a call may proceed right now. Transitions open -> half-open
    /// once the cooldown has elapsed.
    #[must_use]
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map_or(Duration::MAX, |at| at.elapsed());
                if elapsed >= self.cfg.open_for {
                    inner.state = BreakerState::HalfOpen;
                    tracing::info!("circuit breaker half-open, allowing a probe");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            tracing::info!("circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.first_failure_at = None;
        inner.opened_at = None;
    }

    pub fn on_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.state == BreakerState::HalfOpen {
            // The probe failed; go straight back to open.
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            tracing::warn!("circuit breaker reopened after failed probe");
            return;
        }

        // Restart the streak when the previous failures fell out of the
        // window.
        let windowed = inner
            .first_failure_at
            .is_some_and(|at| now.duration_since(at) <= self.cfg.failure_window);
        if windowed {
            inner.consecutive_failures += 1;
        } else {
            inner.consecutive_failures = 1;
            inner.first_failure_at = Some(now);
        }

        if inner.state == BreakerState::Closed
            && inner.consecutive_failures >= self.cfg.failure_threshold
        {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            tracing::warn!(
                failures = inner.consecutive_failures,
                "circuit breaker opened"
            );
        }
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            failure_window: Duration::from_secs(10),
            open_for: Duration::from_millis(20),
        })
    }

    #[test]
    fn opens_after_threshold() {
        let breaker = fast_breaker();
        assert!(breaker.allow());
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn success_resets_the_streak() {
        let breaker = fast_breaker();
        breaker.on_failure();
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_opens_after_cooldown_and_closes_on_success() {
        let breaker = fast_breaker();
        for _ in 0..3 {
            breaker.on_failure();
        }
        assert!(!breaker.allow());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.allow());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.on_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let breaker = fast_breaker();
        for _ in 0..3 {
            breaker.on_failure();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.allow());
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }
}
