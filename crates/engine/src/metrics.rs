//! Metrics cache.
//!
//! The rendered metrics body is cached in a single shared buffer guarded by
//! a spin latch: readers and the single writer CAS the latch, hold it only
//! for the copy or the swap, and retry after a short sleep when contended.
//! Writers build the full body outside the latch and only then publish it
//! together with the new validity deadline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Sleep between latch acquisition attempts.
const LATCH_RETRY: Duration = Duration::from_millis(1);

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Log-level counters incremented by the logging facade.
#[derive(Debug, Default)]
pub struct LogCounters {
    /// info-level lines
    pub info: AtomicU64,
    /// warn-level lines
    pub warn: AtomicU64,
    /// error-level lines
    pub error: AtomicU64,
    /// fatal-level lines
    pub fatal: AtomicU64,
}

/// Cached metrics body under a spin latch.
#[derive(Debug)]
pub struct MetricsCache {
    latch: AtomicBool,
    /// Unix time the cached body expires; 0 means invalid.
    valid_until: AtomicU64,
    /// Validity window in seconds; 0 disables caching.
    max_age: u64,
    /// Size cap in bytes; 0 means unbounded.
    max_size: u64,
    body: parking_lot::Mutex<Vec<u8>>,
}

impl MetricsCache {
    /// A cache with the configured validity window and size cap.
    pub fn new(max_age: u64, max_size: u64) -> MetricsCache {
        MetricsCache {
            latch: AtomicBool::new(false),
            valid_until: AtomicU64::new(0),
            max_age,
            max_size,
            body: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Whether caching is configured at all.
    pub fn is_configured(&self) -> bool {
        self.max_age > 0
    }

    fn acquire(&self) {
        while self
            .latch
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            std::thread::sleep(LATCH_RETRY);
        }
    }

    fn release(&self) {
        self.latch.store(false, Ordering::Release);
    }

    /// Return the cached body when still valid.
    pub fn get(&self) -> Option<Vec<u8>> {
        if !self.is_configured() {
            return None;
        }
        self.acquire();
        let result = if self.valid_until.load(Ordering::Acquire) > unix_now() {
            Some(self.body.lock().clone())
        } else {
            None
        };
        self.release();
        result
    }

    /// Publish a freshly rendered body.
    ///
    /// The body must be complete before the call; oversized bodies are not
    /// cached. The validity deadline is swapped only after the buffer.
    pub fn put(&self, body: Vec<u8>) {
        if !self.is_configured() {
            return;
        }
        if self.max_size > 0 && body.len() as u64 > self.max_size {
            return;
        }
        self.acquire();
        *self.body.lock() = body;
        self.valid_until
            .store(unix_now() + self.max_age, Ordering::Release);
        self.release();
    }

    /// Drop the cached body.
    pub fn invalidate(&self) {
        self.acquire();
        self.valid_until.store(0, Ordering::Release);
        self.body.lock().clear();
        self.release();
    }

    /// Size of the cached body in bytes.
    pub fn size(&self) -> usize {
        self.acquire();
        let size = self.body.lock().len();
        self.release();
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_cache_returns_nothing() {
        let cache = MetricsCache::new(0, 0);
        cache.put(b"body".to_vec());
        assert!(cache.get().is_none());
        assert!(!cache.is_configured());
    }

    #[test]
    fn test_put_then_get_within_validity() {
        let cache = MetricsCache::new(60, 0);
        cache.put(b"metrics body".to_vec());
        assert_eq!(cache.get().unwrap(), b"metrics body");
        assert_eq!(cache.size(), 12);
    }

    #[test]
    fn test_invalidate_clears() {
        let cache = MetricsCache::new(60, 0);
        cache.put(b"body".to_vec());
        cache.invalidate();
        assert!(cache.get().is_none());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_size_cap_rejects_oversized_bodies() {
        let cache = MetricsCache::new(60, 8);
        cache.put(vec![0; 100]);
        assert!(cache.get().is_none());

        cache.put(vec![0; 8]);
        assert!(cache.get().is_some());
    }

    #[test]
    fn test_concurrent_access_makes_progress() {
        use std::sync::Arc;
        let cache = Arc::new(MetricsCache::new(60, 0));
        let mut handles = Vec::new();
        for i in 0..8 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    if i % 2 == 0 {
                        cache.put(vec![i as u8; 64]);
                    } else {
                        let _ = cache.get();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.size(), 64);
    }
}
