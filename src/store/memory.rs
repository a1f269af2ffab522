//! In-process counter stores.
//!
//! Window state lives in a `DashMap` scoped to the running process, so
//! quotas are per instance, not global. The per-key entry lock makes
//! each read-modify-write atomic: two concurrent increments on the same
//! key serialize instead of racing.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Admission, CounterStore, StoreError};
use crate::clock::{Clock, SystemClock};

/// Fixed-window state for one key.
#[derive(Debug, Clone, Copy)]
struct FixedWindow {
    count: u32,
    reset_at_ms: u64,
}

/// Fixed-window counting over process memory.
///
/// Permits up to `2 * max` requests across a window boundary. That edge
/// burst is an accepted property of the algorithm, not a bug.
pub struct FixedWindowStore {
    windows: DashMap<String, FixedWindow>,
    clock: Arc<dyn Clock>,
}

impl FixedWindowStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }
}

impl Default for FixedWindowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for FixedWindowStore {
    async fn incr(&self, key: &str, window_ms: u64, max: u32) -> Result<Admission, StoreError> {
        let now = self.clock.now_ms();
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert(FixedWindow {
                count: 0,
                reset_at_ms: now + window_ms,
            });

        if now > entry.reset_at_ms {
            entry.count = 1;
            entry.reset_at_ms = now + window_ms;
        } else {
            entry.count = entry.count.saturating_add(1);
        }

        Ok(Admission {
            admitted: entry.count <= max,
            current: entry.count,
            reset_at_ms: entry.reset_at_ms,
        })
    }

    async fn reset_key(&self, key: &str) -> Result<(), StoreError> {
        self.windows.remove(key);
        Ok(())
    }
}

/// Sliding-window counting over process memory.
///
/// Keeps an ordered log of request timestamps per key. Exact, at
/// `O(window size)` memory per key.
pub struct SlidingWindowStore {
    windows: DashMap<String, Vec<u64>>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }
}

impl Default for SlidingWindowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for SlidingWindowStore {
    async fn incr(&self, key: &str, window_ms: u64, max: u32) -> Result<Admission, StoreError> {
        let now = self.clock.now_ms();
        let window_start = now.saturating_sub(window_ms);

        let mut entry = self.windows.entry(key.to_string()).or_default();
        entry.retain(|&ts| ts > window_start);
        entry.push(now);

        let current = entry.len() as u32;
        let oldest = entry.first().copied().unwrap_or(now);

        Ok(Admission {
            admitted: current <= max,
            current,
            reset_at_ms: oldest + window_ms,
        })
    }

    async fn reset_key(&self, key: &str) -> Result<(), StoreError> {
        self.windows.remove(key);
        Ok(())
    }
}

/// Token-bucket state for one key.
#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    last_refill_ms: u64,
}

/// Token-bucket counting over process memory.
///
/// Capacity `max`, refilled at `max` tokens per window. Admission stays
/// smooth at a sustained rate instead of bursting at window edges.
pub struct TokenBucketStore {
    buckets: DashMap<String, TokenBucket>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            clock,
        }
    }
}

impl Default for TokenBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for TokenBucketStore {
    async fn incr(&self, key: &str, window_ms: u64, max: u32) -> Result<Admission, StoreError> {
        let now = self.clock.now_ms();
        let mut entry = self.buckets.entry(key.to_string()).or_insert(TokenBucket {
            tokens: max as f64,
            last_refill_ms: now,
        });

        let elapsed = now.saturating_sub(entry.last_refill_ms);
        if elapsed > 0 && window_ms > 0 {
            let refill = (elapsed as u128 * max as u128 / window_ms as u128) as f64;
            // The refill anchor only advances when tokens were actually
            // granted, so fractional progress is never discarded.
            if refill > 0.0 {
                entry.tokens = (entry.tokens + refill).min(max as f64);
                entry.last_refill_ms = now;
            }
        }

        let admitted = entry.tokens >= 1.0;
        if admitted {
            entry.tokens -= 1.0;
        }

        let consumed = (max as f64 - entry.tokens).round() as u32;
        let current = if admitted {
            consumed
        } else {
            consumed.saturating_add(1)
        };

        // Estimate when the next token becomes available.
        let reset_at_ms = if max == 0 {
            now + window_ms
        } else if entry.tokens >= max as f64 {
            now
        } else {
            entry.last_refill_ms + window_ms.div_ceil(max as u64)
        };

        Ok(Admission {
            admitted,
            current,
            reset_at_ms,
        })
    }

    async fn reset_key(&self, key: &str) -> Result<(), StoreError> {
        self.buckets.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn fixed(clock: Arc<ManualClock>) -> FixedWindowStore {
        FixedWindowStore::with_clock(clock)
    }

    fn sliding(clock: Arc<ManualClock>) -> SlidingWindowStore {
        SlidingWindowStore::with_clock(clock)
    }

    fn bucket(clock: Arc<ManualClock>) -> TokenBucketStore {
        TokenBucketStore::with_clock(clock)
    }

    #[tokio::test]
    async fn test_fixed_window_admits_up_to_max() {
        let clock = Arc::new(ManualClock::new(0));
        let store = fixed(clock);

        for i in 1..=5 {
            let a = store.incr("k", 1_000, 5).await.unwrap();
            assert!(a.admitted);
            assert_eq!(a.current, i);
        }

        let a = store.incr("k", 1_000, 5).await.unwrap();
        assert!(!a.admitted);
        assert_eq!(a.current, 6);
    }

    #[tokio::test]
    async fn test_fixed_window_rejections_keep_counting() {
        let clock = Arc::new(ManualClock::new(0));
        let store = fixed(clock);

        for _ in 0..3 {
            store.incr("k", 1_000, 2).await.unwrap();
        }
        let a = store.incr("k", 1_000, 2).await.unwrap();
        assert!(!a.admitted);
        assert_eq!(a.current, 4);
    }

    #[tokio::test]
    async fn test_fixed_window_resets_after_expiry() {
        let clock = Arc::new(ManualClock::new(0));
        let store = fixed(clock.clone());

        let a = store.incr("k", 1_000, 5).await.unwrap();
        assert_eq!(a.reset_at_ms, 1_000);

        clock.set(1_001);
        let a = store.incr("k", 1_000, 5).await.unwrap();
        assert!(a.admitted);
        assert_eq!(a.current, 1);
        assert_eq!(a.reset_at_ms, 2_001);
    }

    #[tokio::test]
    async fn test_fixed_window_zero_max_always_rejects() {
        let clock = Arc::new(ManualClock::new(0));
        let store = fixed(clock);

        let a = store.incr("k", 1_000, 0).await.unwrap();
        assert!(!a.admitted);
    }

    #[tokio::test]
    async fn test_sliding_window_expires_old_timestamps() {
        let clock = Arc::new(ManualClock::new(0));
        let store = sliding(clock.clone());

        assert!(store.incr("k", 1_000, 2).await.unwrap().admitted);
        assert!(store.incr("k", 1_000, 2).await.unwrap().admitted);
        assert!(!store.incr("k", 1_000, 2).await.unwrap().admitted);

        clock.set(1_001);
        let a = store.incr("k", 1_000, 2).await.unwrap();
        assert!(a.admitted);
        assert_eq!(a.current, 1);
    }

    #[tokio::test]
    async fn test_sliding_window_reset_tracks_oldest() {
        let clock = Arc::new(ManualClock::new(100));
        let store = sliding(clock.clone());

        let a = store.incr("k", 1_000, 5).await.unwrap();
        assert_eq!(a.reset_at_ms, 1_100);

        clock.set(400);
        let a = store.incr("k", 1_000, 5).await.unwrap();
        // Oldest retained timestamp is still t=100.
        assert_eq!(a.reset_at_ms, 1_100);
    }

    #[tokio::test]
    async fn test_sliding_window_keys_are_independent() {
        let clock = Arc::new(ManualClock::new(0));
        let store = sliding(clock);

        assert!(store.incr("a", 1_000, 1).await.unwrap().admitted);
        assert!(!store.incr("a", 1_000, 1).await.unwrap().admitted);
        assert!(store.incr("b", 1_000, 1).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn test_token_bucket_drains_then_refills() {
        let clock = Arc::new(ManualClock::new(0));
        let store = bucket(clock.clone());

        for _ in 0..5 {
            assert!(store.incr("k", 1_000, 5).await.unwrap().admitted);
        }
        assert!(!store.incr("k", 1_000, 5).await.unwrap().admitted);

        // One fifth of the window refills exactly one token.
        clock.advance(200);
        assert!(store.incr("k", 1_000, 5).await.unwrap().admitted);
        assert!(!store.incr("k", 1_000, 5).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn test_token_bucket_refill_caps_at_max() {
        let clock = Arc::new(ManualClock::new(0));
        let store = bucket(clock.clone());

        for _ in 0..3 {
            store.incr("k", 1_000, 3).await.unwrap();
        }

        // Far more than one window elapses; the bucket holds `max`.
        clock.advance(10_000);
        for _ in 0..3 {
            assert!(store.incr("k", 1_000, 3).await.unwrap().admitted);
        }
        assert!(!store.incr("k", 1_000, 3).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn test_token_bucket_subthreshold_elapse_keeps_anchor() {
        let clock = Arc::new(ManualClock::new(0));
        let store = bucket(clock.clone());

        for _ in 0..5 {
            store.incr("k", 1_000, 5).await.unwrap();
        }

        // 100ms grants no whole token, and must not reset the anchor;
        // two such steps still add up to one token at t=200.
        clock.advance(100);
        assert!(!store.incr("k", 1_000, 5).await.unwrap().admitted);
        clock.advance(100);
        assert!(store.incr("k", 1_000, 5).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn test_token_bucket_zero_max_always_rejects() {
        let clock = Arc::new(ManualClock::new(0));
        let store = bucket(clock);

        let a = store.incr("k", 1_000, 0).await.unwrap();
        assert!(!a.admitted);
    }

    #[tokio::test]
    async fn test_reset_key_behaves_as_fresh() {
        let clock = Arc::new(ManualClock::new(0));
        let store = sliding(clock);

        assert!(store.incr("k", 1_000, 1).await.unwrap().admitted);
        assert!(!store.incr("k", 1_000, 1).await.unwrap().admitted);

        store.reset_key("k").await.unwrap();
        let a = store.incr("k", 1_000, 1).await.unwrap();
        assert!(a.admitted);
        assert_eq!(a.current, 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_never_race() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(fixed(clock));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.incr("k", 60_000, 10).await.unwrap()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().admitted {
                admitted += 1;
            }
        }
        // Exactly `max` admissions; a read-modify-write race would admit
        // more.
        assert_eq!(admitted, 10);
    }
}
