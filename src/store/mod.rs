//! Counter store abstraction backing the admission algorithms.
//!
//! Each store pairs one counting algorithm with one storage backend
//! behind a single `incr` capability, so the engine never switches on an
//! algorithm enum at the call site. A custom store satisfying the trait
//! may be substituted entirely, e.g. a deterministic clock-controlled
//! fake for tests.

mod memory;
mod redis;

pub use self::redis::RedisSlidingWindowStore;
pub use memory::{FixedWindowStore, SlidingWindowStore, TokenBucketStore};

use async_trait::async_trait;
use thiserror::Error;

/// Outcome of a single increment-and-check against one counter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Whether the request is within the limit.
    pub admitted: bool,
    /// Requests counted against the key in the current window.
    pub current: u32,
    /// When the window resets or the next slot opens, in epoch
    /// milliseconds.
    pub reset_at_ms: u64,
}

/// Errors surfaced by counter store backends.
///
/// Store failures are recoverable: the engine routes them through the
/// configured fail-open/fail-closed policy instead of propagating them
/// to the client as-is.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend could not be reached or the operation failed.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Trait for counter store implementations.
///
/// `incr` must be atomic per key under concurrent invocation: two
/// concurrent calls for the same key must never both observe the same
/// pre-increment count.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count one request against `key` and decide admission for a window
    /// of `window_ms` milliseconds with limit `max`.
    async fn incr(&self, key: &str, window_ms: u64, max: u32) -> Result<Admission, StoreError>;

    /// Forget all state for `key`. The next increment behaves as on a
    /// fresh key.
    async fn reset_key(&self, key: &str) -> Result<(), StoreError>;
}
