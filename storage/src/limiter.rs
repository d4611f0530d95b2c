//! Log rate limiting.
//!
//! Repeated hardware or on-disk faults can emit the same warning thousands of
//! times per second. A [`RateLimiter`] lets the first few occurrences through,
//! then throttles to one per interval while counting what was suppressed.

/// Minimum-interval gate.
#[derive(Debug, Clone, Copy)]
pub struct Cooldown {
    /// Minimum milliseconds between armed triggers.
    interval_ms: u64,
    /// Next tick at which arming is allowed.
    next_allowed: u64,
}

impl Cooldown {
    /// Create a cooldown with the given interval in milliseconds.
    pub const fn new(interval_ms: u64) -> Self {
        Cooldown {
            interval_ms,
            next_allowed: 0,
        }
    }

    /// Try to arm the cooldown at time `now` (milliseconds).
    ///
    /// Returns `true` and re-arms when the interval has elapsed.
    pub fn try_arm(&mut self, now: u64) -> bool {
        if now < self.next_allowed {
            return false;
        }

        self.next_allowed = now.saturating_add(self.interval_ms);
        true
    }

    /// Reset so the next `try_arm` succeeds immediately.
    pub fn reset(&mut self) {
        self.next_allowed = 0;
    }
}

/// Budgeted rate limiter.
///
/// The first `immediate_budget` events always trigger; later events trigger at
/// most once per interval. Suppressed events are counted and the count is
/// handed back with the next triggered event.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiter {
    immediate_budget: u32,
    immediate_count: u32,
    suppressed_count: u32,
    cooldown: Cooldown,
}

impl RateLimiter {
    /// Create a limiter with an immediate budget and an interval in ms.
    pub const fn new(immediate_budget: u32, interval_ms: u64) -> Self {
        RateLimiter {
            immediate_budget,
            immediate_count: 0,
            suppressed_count: 0,
            cooldown: Cooldown::new(interval_ms),
        }
    }

    /// Reset counters while preserving the configuration.
    pub fn reset(&mut self) {
        self.immediate_count = 0;
        self.suppressed_count = 0;
        self.cooldown.reset();
    }

    /// Decide whether the caller may emit this event at time `now` (ms).
    ///
    /// Returns `(trigger, suppressed_since_last_trigger)`.
    pub fn should_trigger(&mut self, now: u64) -> (bool, u32) {
        let trigger = if self.immediate_count < self.immediate_budget {
            self.immediate_count += 1;
            true
        } else {
            self.cooldown.try_arm(now)
        };

        if trigger {
            let suppressed = self.suppressed_count;
            self.suppressed_count = 0;
            (true, suppressed)
        } else {
            self.suppressed_count += 1;
            (false, 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_arms_once_per_interval() {
        let mut cooldown = Cooldown::new(100);

        assert!(cooldown.try_arm(0));
        assert!(!cooldown.try_arm(50));
        assert!(!cooldown.try_arm(99));
        assert!(cooldown.try_arm(100));
        assert!(!cooldown.try_arm(150));
    }

    #[test]
    fn limiter_honors_immediate_budget() {
        let mut limiter = RateLimiter::new(3, 1000);

        assert_eq!(limiter.should_trigger(0), (true, 0));
        assert_eq!(limiter.should_trigger(0), (true, 0));
        assert_eq!(limiter.should_trigger(0), (true, 0));
        // Budget exhausted; the first post-budget event arms the cooldown and
        // still passes, then the interval gates everything after it.
        assert_eq!(limiter.should_trigger(0), (true, 0));
        assert_eq!(limiter.should_trigger(500), (false, 0));
        assert_eq!(limiter.should_trigger(999), (false, 0));
        assert_eq!(limiter.should_trigger(1000), (true, 2));
    }

    #[test]
    fn limiter_reports_suppressed_count() {
        let mut limiter = RateLimiter::new(1, 100);

        assert_eq!(limiter.should_trigger(0), (true, 0));
        // Cooldown arms here and blocks until t=100.
        assert_eq!(limiter.should_trigger(0), (true, 0));
        assert_eq!(limiter.should_trigger(10), (false, 0));
        assert_eq!(limiter.should_trigger(20), (false, 0));
        let (trigger, suppressed) = limiter.should_trigger(150);
        assert!(trigger);
        assert_eq!(suppressed, 2);
    }

    #[test]
    fn limiter_reset_restores_budget() {
        let mut limiter = RateLimiter::new(1, 1000);

        assert_eq!(limiter.should_trigger(0), (true, 0));
        limiter.reset();
        assert_eq!(limiter.should_trigger(1), (true, 0));
    }
}
