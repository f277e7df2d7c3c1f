// ABOUTME: Circuit breaker guarding the inbound bridge path against a failing engine.
// ABOUTME: Counts consecutive failures; exposes closed/open/half-open derived on read.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker tuning knobs
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures required to trip the breaker
    pub threshold: u32,
    /// How long the breaker stays open before allowing a probe request
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: Duration::from_secs(15),
        }
    }
}

/// Derived breaker state, computed on read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Consecutive-failure circuit breaker shared across inbound requests.
///
/// State is interior-mutable so callers hold an `Arc` and record outcomes
/// through `&self`. The open/half-open distinction is never stored; it is
/// derived from the failure count and the trip timestamp on every read.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    failures: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            failures: AtomicU32::new(0),
            opened_at: Mutex::new(None),
        }
    }

    /// A success from any state closes the breaker.
    pub fn record_success(&self) {
        self.failures.store(0, Ordering::SeqCst);
        *self.opened_at.lock().unwrap() = None;
    }

    /// Record a failure. Reaching the threshold trips the breaker; every
    /// further failure while tripped re-stamps the trip time, restarting the
    /// cooldown (a failed half-open probe re-opens with a fresh window).
    pub fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.config.threshold {
            *self.opened_at.lock().unwrap() = Some(Instant::now());
        }
    }

    pub fn state(&self) -> BreakerState {
        if self.failures.load(Ordering::SeqCst) < self.config.threshold {
            return BreakerState::Closed;
        }
        let opened_at = self.opened_at.lock().unwrap();
        match *opened_at {
            Some(tripped) if tripped.elapsed() < self.config.cooldown => BreakerState::Open,
            _ => BreakerState::HalfOpen,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == BreakerState::HalfOpen
    }

    /// Current consecutive-failure count
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            threshold,
            cooldown,
        })
    }

    #[test]
    fn test_starts_closed() {
        let b = breaker(5, Duration::from_secs(15));
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failures(), 0);
    }

    #[test]
    fn test_stays_closed_below_threshold() {
        let b = breaker(5, Duration::from_secs(15));
        for _ in 0..4 {
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failures(), 4);
    }

    #[test]
    fn test_opens_at_threshold() {
        let b = breaker(5, Duration::from_secs(15));
        for _ in 0..5 {
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.is_open());
    }

    #[test]
    fn test_half_open_after_cooldown() {
        let b = breaker(3, Duration::from_millis(20));
        for _ in 0..3 {
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.is_half_open());
    }

    #[test]
    fn test_failure_while_half_open_reopens() {
        let b = breaker(3, Duration::from_millis(20));
        for _ in 0..3 {
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(b.state(), BreakerState::HalfOpen);

        // The failed probe restarts the cooldown
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn test_success_closes_from_any_state() {
        let b = breaker(3, Duration::from_secs(60));
        for _ in 0..3 {
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Open);

        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failures(), 0);
    }

    #[test]
    fn test_further_failures_restamp_cooldown() {
        let b = breaker(2, Duration::from_millis(40));
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(25));
        // Another failure while open restarts the window
        b.record_failure();
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(b.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }
}
