// Failure-rate tripwire with automatic cooldown and hot reconfiguration

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::harvester::errors::ErrorKind;

struct BreakerState {
    threshold: u32,
    cooldown: Duration,
    failures: u32,
    cooldown_until: Option<Instant>,
}

/// Circuit breaker: Closed while failures accumulate, Open once cumulative
/// trippable failures reach the threshold, Closed again automatically when
/// the cooldown elapses. There is no half-open probe state; a cold restart
/// after cooldown is accepted instead of gradual probing.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState {
                threshold: threshold.max(1),
                cooldown,
                failures: 0,
                cooldown_until: None,
            }),
        }
    }

    /// Record one observation. No-op while cooling down (prevents
    /// flapping). A success decrements the failure count by one instead of
    /// resetting it, so one lucky request among many failures does not
    /// erase the evidence. Only trippable kinds accumulate; a trip sets the
    /// cooldown deadline and resets the counter.
    pub fn record(&self, ok: bool, kind: Option<ErrorKind>) {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(until) = s.cooldown_until {
            if Instant::now() < until {
                return;
            }
        }
        if ok {
            s.failures = s.failures.saturating_sub(1);
            return;
        }
        if kind.map_or(false, |k| k.is_trippable()) {
            s.failures += 1;
            if s.failures >= s.threshold {
                s.cooldown_until = Some(Instant::now() + s.cooldown);
                s.failures = 0;
                tracing::warn!(
                    target: "harvester::breaker",
                    cooldown_secs = s.cooldown.as_secs_f64(),
                    "breaker tripped, entering cooldown"
                );
            }
        }
    }

    /// Whether new work must wait out the cooldown.
    pub fn should_cooldown(&self) -> bool {
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.cooldown_until.map_or(false, |u| Instant::now() < u)
    }

    /// Remaining cooldown, zero when closed.
    pub fn remaining(&self) -> Duration {
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.cooldown_until
            .map(|u| u.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Hot reconfiguration without losing accumulated state. The
    /// orchestrator may tighten or relax sensitivity mid-run based on
    /// observed batch error rates.
    pub fn update_config(&self, threshold: Option<u32>, cooldown: Option<Duration>) {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(t) = threshold {
            s.threshold = t.max(1);
        }
        if let Some(c) = cooldown {
            s.cooldown = c;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trippable() -> Option<ErrorKind> {
        Some(ErrorKind::RateLimited)
    }

    #[test]
    fn test_trips_after_threshold() {
        let b = CircuitBreaker::new(3, Duration::from_secs(60));
        b.record(false, trippable());
        b.record(false, trippable());
        assert!(!b.should_cooldown());
        b.record(false, trippable());
        assert!(b.should_cooldown());
        assert!(b.remaining() > Duration::from_secs(50));
    }

    #[test]
    fn test_non_trippable_kinds_ignored() {
        let b = CircuitBreaker::new(1, Duration::from_secs(60));
        b.record(false, Some(ErrorKind::Private));
        b.record(false, Some(ErrorKind::Other));
        b.record(false, None);
        assert!(!b.should_cooldown());
    }

    #[test]
    fn test_success_decrements_instead_of_reset() {
        let b = CircuitBreaker::new(3, Duration::from_secs(60));
        b.record(false, trippable());
        b.record(false, trippable());
        b.record(true, None);
        // Two failures minus one success leaves one accumulated failure,
        // so two more are needed to trip.
        b.record(false, trippable());
        assert!(!b.should_cooldown());
        b.record(false, trippable());
        assert!(b.should_cooldown());
    }

    #[test]
    fn test_cooldown_elapses_without_intervention() {
        let b = CircuitBreaker::new(1, Duration::from_millis(30));
        b.record(false, trippable());
        assert!(b.should_cooldown());
        std::thread::sleep(Duration::from_millis(50));
        assert!(!b.should_cooldown());
        assert_eq!(b.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_record_is_noop_during_cooldown() {
        let b = CircuitBreaker::new(1, Duration::from_millis(40));
        b.record(false, trippable());
        assert!(b.should_cooldown());
        // Ignored while open; after cooldown the counter starts from zero.
        b.record(false, trippable());
        std::thread::sleep(Duration::from_millis(60));
        assert!(!b.should_cooldown());
    }

    #[test]
    fn test_hot_reconfig_keeps_accumulated_state() {
        let b = CircuitBreaker::new(10, Duration::from_secs(60));
        b.record(false, trippable());
        b.record(false, trippable());
        b.update_config(Some(3), None);
        b.record(false, trippable());
        assert!(b.should_cooldown());
    }
}
