//! Bounded nonce cache for replay detection.
//!
//! The control plane stamps every command with a random nonce; a nonce
//! seen twice within the retention window is a replay. The cache is
//! bounded both by entry count (LRU eviction) and by age (lazy TTL
//! expiry), so memory stays flat no matter how long the agent runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default maximum number of retained nonces.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Default nonce retention window.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct CacheInner {
    /// Nonce to first-seen instant.
    seen: HashMap<String, Instant>,
    /// Insertion order for LRU eviction and TTL sweeps.
    order: VecDeque<String>,
}

/// Thread-safe replay cache. All operations are O(1) amortised.
pub struct NonceCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    ttl: Duration,
}

impl Default for NonceCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl NonceCache {
    /// Create a cache with explicit bounds.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity,
            ttl,
        }
    }

    /// Record a nonce. Returns `true` if it was fresh, `false` if it was
    /// already present (a replay). Expired entries are swept before the
    /// check.
    #[must_use]
    pub fn observe(&self, nonce: &str) -> bool {
        let now = Instant::now();
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Lazy TTL sweep from the oldest end.
        while let Some(front) = inner.order.front() {
            let expired = inner
                .seen
                .get(front)
                .is_none_or(|first_seen| now.duration_since(*first_seen) >= self.ttl);
            if !expired {
                break;
            }
            let Some(front) = inner.order.pop_front() else {
                break;
            };
            inner.seen.remove(&front);
        }

        if inner.seen.contains_key(nonce) {
            return false;
        }

        inner.seen.insert(nonce.to_string(), now);
        inner.order.push_back(nonce.to_string());

        // LRU eviction on capacity.
        while inner.seen.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.seen.remove(&oldest);
        }

        true
    }

    /// Number of nonces currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .seen
            .len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
