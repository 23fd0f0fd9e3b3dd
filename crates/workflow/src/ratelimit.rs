//! Token-bucket rate limiting.
//!
//! One global bucket caps total network throughput; per-server buckets cap
//! backup throughput. Consumers CAS tokens out of the bucket and sleep in
//! coarse 500 ms steps when starved. Refill is lazy: the first consumer to
//! observe an elapsed period CAS-advances the refill timestamp and adds
//! `rate × elapsed / period` tokens up to the burst cap.

use pgharbor_core::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Coarse sleep between starvation retries.
const STARVATION_SLEEP: Duration = Duration::from_millis(500);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A token bucket. A rate of zero disables limiting entirely.
#[derive(Debug)]
pub struct TokenBucket {
    /// Maximum tokens the bucket can hold.
    burst: u64,
    /// Tokens added per period.
    rate: u64,
    /// Refill period in milliseconds.
    period_ms: u64,
    tokens: AtomicI64,
    last_refill: AtomicU64,
}

impl TokenBucket {
    /// A bucket refilling `rate` tokens per second with the given burst.
    ///
    /// A zero `burst` defaults to one period's worth of tokens.
    pub fn new(rate: u64, burst: u64) -> TokenBucket {
        let burst = if burst == 0 { rate } else { burst };
        TokenBucket {
            burst,
            rate,
            period_ms: 1000,
            tokens: AtomicI64::new(burst as i64),
            last_refill: AtomicU64::new(now_millis()),
        }
    }

    /// Override the refill period (tests use short periods).
    pub fn with_period(mut self, period: Duration) -> TokenBucket {
        self.period_ms = period.as_millis().max(1) as u64;
        self
    }

    /// A bucket that never limits.
    pub fn unlimited() -> TokenBucket {
        TokenBucket::new(0, 0)
    }

    /// Whether this bucket limits at all.
    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Tokens currently available.
    pub fn available(&self) -> i64 {
        self.tokens.load(Ordering::Acquire)
    }

    /// Lazily refill for any fully elapsed periods.
    fn refill(&self) {
        let now = now_millis();
        let last = self.last_refill.load(Ordering::Acquire);
        let elapsed = now.saturating_sub(last);
        if elapsed < self.period_ms {
            return;
        }
        // Only the CAS winner adds tokens for this window.
        if self
            .last_refill
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let add = (self.rate as u128 * elapsed as u128 / self.period_ms as u128) as i64;
        let prev = self.tokens.fetch_add(add, Ordering::AcqRel);
        // Clamp to burst; a concurrent consume between the add and the
        // clamp only ever lowers the value, which is safe.
        if prev + add > self.burst as i64 {
            self.tokens.store(self.burst as i64, Ordering::Release);
        }
    }

    /// Try to take `n` tokens without waiting.
    pub fn try_consume(&self, n: u64) -> bool {
        if self.is_unlimited() {
            return true;
        }
        let n = n.min(self.burst) as i64;
        self.refill();
        let mut current = self.tokens.load(Ordering::Acquire);
        loop {
            if current < n {
                return false;
            }
            match self.tokens.compare_exchange(
                current,
                current - n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Take `n` tokens, sleeping in 500 ms steps while starved.
    ///
    /// Observes `stop` between retries and returns `canceled` when set.
    pub fn consume(&self, n: u64, stop: &AtomicBool) -> Result<()> {
        loop {
            if self.try_consume(n) {
                return Ok(());
            }
            if stop.load(Ordering::Acquire) {
                return Err(Error::Canceled);
            }
            std::thread::sleep(STARVATION_SLEEP);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_blocks() {
        let bucket = TokenBucket::unlimited();
        assert!(bucket.try_consume(u64::MAX));
        assert!(bucket.is_unlimited());
    }

    #[test]
    fn test_burst_drains_then_starves() {
        let bucket = TokenBucket::new(1000, 100);
        assert!(bucket.try_consume(60));
        assert!(bucket.try_consume(40));
        assert!(!bucket.try_consume(1));
    }

    #[test]
    fn test_oversized_requests_clamp_to_burst() {
        let bucket = TokenBucket::new(1000, 100);
        // A request larger than the burst can still be served (clamped),
        // otherwise it could never succeed.
        assert!(bucket.try_consume(10_000));
        assert!(!bucket.try_consume(1));
    }

    #[test]
    fn test_refill_after_period() {
        let bucket = TokenBucket::new(50, 50).with_period(Duration::from_millis(20));
        assert!(bucket.try_consume(50));
        assert!(!bucket.try_consume(1));

        std::thread::sleep(Duration::from_millis(50));
        assert!(bucket.try_consume(1), "bucket should have refilled");
    }

    #[test]
    fn test_refill_clamps_at_burst() {
        let bucket = TokenBucket::new(1_000_000, 10).with_period(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(40));
        bucket.refill();
        assert!(bucket.available() <= 10);
    }

    #[test]
    fn test_consume_observes_stop() {
        let bucket = TokenBucket::new(10, 10).with_period(Duration::from_secs(3600));
        assert!(bucket.try_consume(10));

        let stop = AtomicBool::new(true);
        let err = bucket.consume(1, &stop).unwrap_err();
        assert_eq!(err.code(), "canceled");
    }

    #[test]
    fn test_throughput_bound() {
        // Over a short window, total consumption cannot exceed
        // rate * elapsed + burst.
        let bucket = TokenBucket::new(100, 20).with_period(Duration::from_millis(10));
        let start = std::time::Instant::now();
        let mut consumed = 0u64;
        while start.elapsed() < Duration::from_millis(100) {
            if bucket.try_consume(5) {
                consumed += 5;
            }
        }
        let elapsed_periods = start.elapsed().as_millis() as u64 / 10 + 2;
        assert!(consumed <= 100 * elapsed_periods + 20);
    }
}
