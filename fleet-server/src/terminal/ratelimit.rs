//! Per-session token buckets.
//!
//! Every inbound operator action bound for an agent costs one token. The
//! bucket holds 100 steady tokens plus a 20-token burst allowance and
//! refills at 100 tokens per elapsed second, floored to whole tokens.

use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

pub const BUCKET_CAPACITY: u32 = 120;
pub const INITIAL_TOKENS: u32 = 100;
pub const REFILL_PER_SECOND: u32 = 100;

#[derive(Debug)]
pub struct RateBucket {
    tokens: u32,
    last_refill: Instant,
    exceeded_count: u64,
}

impl RateBucket {
    fn new(now: Instant) -> Self {
        Self {
            tokens: INITIAL_TOKENS,
            last_refill: now,
            exceeded_count: 0,
        }
    }

    /// Refill from elapsed time, then try to take one token. Returns the
    /// running excess count alongside the verdict so callers can decide
    /// when to warn.
    fn try_consume(&mut self, now: Instant) -> Consumption {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let refill = (elapsed.as_secs_f64() * f64::from(REFILL_PER_SECOND)).floor() as u32;
        if refill > 0 {
            self.tokens = (self.tokens + refill).min(BUCKET_CAPACITY);
            self.last_refill = now;
        }

        if self.tokens > 0 {
            self.tokens -= 1;
            Consumption {
                allowed: true,
                exceeded_count: self.exceeded_count,
            }
        } else {
            self.exceeded_count += 1;
            Consumption {
                allowed: false,
                exceeded_count: self.exceeded_count,
            }
        }
    }

    pub fn tokens_available(&self) -> u32 {
        self.tokens
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Consumption {
    pub allowed: bool,
    pub exceeded_count: u64,
}

/// Bucket registry, one bucket per live terminal session.
#[derive(Default)]
pub struct RateLimiter {
    buckets: DashMap<String, Mutex<RateBucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, session_id: &str) {
        self.buckets
            .insert(session_id.to_string(), Mutex::new(RateBucket::new(Instant::now())));
    }

    pub fn remove(&self, session_id: &str) {
        self.buckets.remove(session_id);
    }

    /// Consume one token for the session. Unknown sessions are denied.
    pub fn consume(&self, session_id: &str) -> Consumption {
        self.consume_at(session_id, Instant::now())
    }

    pub(crate) fn consume_at(&self, session_id: &str, now: Instant) -> Consumption {
        match self.buckets.get(session_id) {
            Some(bucket) => bucket.lock().try_consume(now),
            None => Consumption {
                allowed: false,
                exceeded_count: 0,
            },
        }
    }

    #[cfg(test)]
    pub(crate) fn tokens_available(&self, session_id: &str) -> Option<u32> {
        self.buckets
            .get(session_id)
            .map(|b| b.lock().tokens_available())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn hundred_and_first_consumption_is_denied() {
        let limiter = RateLimiter::new();
        limiter.create("s1");
        let t0 = Instant::now();

        for _ in 0..INITIAL_TOKENS {
            assert!(limiter.consume_at("s1", t0).allowed);
        }
        let denied = limiter.consume_at("s1", t0);
        assert!(!denied.allowed);
        assert_eq!(denied.exceeded_count, 1);
    }

    #[test]
    fn one_second_refills_to_steady_rate() {
        let limiter = RateLimiter::new();
        limiter.create("s1");
        let t0 = Instant::now();

        for _ in 0..INITIAL_TOKENS {
            limiter.consume_at("s1", t0);
        }
        assert!(!limiter.consume_at("s1", t0).allowed);
        assert!(limiter.consume_at("s1", t0 + Duration::from_secs(1)).allowed);
    }

    #[test]
    fn sub_token_elapsed_time_accumulates() {
        let limiter = RateLimiter::new();
        limiter.create("s1");
        let t0 = Instant::now();
        for _ in 0..INITIAL_TOKENS {
            limiter.consume_at("s1", t0);
        }

        // 5ms is less than one token's worth; the refill clock must not
        // advance, so repeated short waits eventually add up.
        assert!(!limiter.consume_at("s1", t0 + Duration::from_millis(5)).allowed);
        assert!(limiter.consume_at("s1", t0 + Duration::from_millis(10)).allowed);
    }

    #[test]
    fn capacity_is_bounded_at_steady_plus_burst() {
        let limiter = RateLimiter::new();
        limiter.create("s1");
        let t0 = Instant::now();

        // A long idle period cannot overfill past 120.
        assert!(limiter.consume_at("s1", t0 + Duration::from_secs(3600)).allowed);
        assert_eq!(limiter.tokens_available("s1").unwrap(), BUCKET_CAPACITY - 1);
    }

    #[test]
    fn tokens_never_exceed_bounds() {
        let limiter = RateLimiter::new();
        limiter.create("s1");
        let t0 = Instant::now();
        for step in 0..200u64 {
            limiter.consume_at("s1", t0 + Duration::from_millis(step * 7));
            let tokens = limiter.tokens_available("s1").unwrap();
            assert!(tokens <= BUCKET_CAPACITY);
        }
    }

    #[test]
    fn unknown_session_is_denied() {
        let limiter = RateLimiter::new();
        assert!(!limiter.consume("ghost").allowed);
    }

    #[test]
    fn removal_destroys_the_bucket() {
        let limiter = RateLimiter::new();
        limiter.create("s1");
        limiter.remove("s1");
        assert!(!limiter.consume("s1").allowed);
    }
}
