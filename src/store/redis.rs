//! Redis-backed sliding-window store.
//!
//! Backs the sliding-window algorithm with a Redis sorted set so that
//! concurrent processes observe one globally consistent window. The
//! add/trim/count/expire sequence runs as a single `MULTI`/`EXEC`
//! pipeline in one round trip, so the same-key race that the in-process
//! stores prevent with an entry lock cannot occur across processes
//! either.

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::debug;

use super::{Admission, CounterStore, StoreError};
use crate::clock::{Clock, SystemClock};

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Sliding-window counting over a shared Redis sorted set.
///
/// The only store suitable for horizontally scaled deployments. Entries
/// expire at the backend after one window length, so idle keys cost
/// nothing.
pub struct RedisSlidingWindowStore {
    conn: ConnectionManager,
    clock: Arc<dyn Clock>,
}

impl RedisSlidingWindowStore {
    /// Connect to Redis and return a store ready for use.
    ///
    /// `ConnectionManager` multiplexes one connection and reconnects
    /// automatically, so no pool management is needed.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        debug!(url = %url, "Connected to Redis counter store");
        Ok(Self::with_connection(conn))
    }

    /// Wrap an existing connection.
    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            clock: Arc::new(SystemClock),
        }
    }
}

/// Members are `{timestamp}-{nonce}` so that simultaneous requests from
/// different processes never collide in the set.
fn window_member(now_ms: u64) -> String {
    format!("{}-{}", now_ms, rand::random::<u32>())
}

/// Recover the oldest retained timestamp from a ZRANGE reply.
fn oldest_member_ms(members: &[String], fallback_ms: u64) -> u64 {
    members
        .first()
        .and_then(|member| member.split('-').next())
        .and_then(|ts| ts.parse::<u64>().ok())
        .unwrap_or(fallback_ms)
}

#[async_trait]
impl CounterStore for RedisSlidingWindowStore {
    async fn incr(&self, key: &str, window_ms: u64, max: u32) -> Result<Admission, StoreError> {
        let now = self.clock.now_ms();
        let window_start = now.saturating_sub(window_ms);
        let member = window_member(now);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(key, &member, now)
            .ignore()
            .zrembyscore(key, 0, window_start)
            .ignore()
            .zcard(key)
            .zrange(key, 0, 0)
            .pexpire(key, window_ms as i64)
            .ignore();

        let mut conn = self.conn.clone();
        let (current, oldest): (u32, Vec<String>) = pipe.query_async(&mut conn).await?;

        Ok(Admission {
            admitted: current <= max,
            current,
            reset_at_ms: oldest_member_ms(&oldest, now) + window_ms,
        })
    }

    async fn reset_key(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_member_parses_timestamp() {
        let members = vec!["1700000000123-42".to_string()];
        assert_eq!(oldest_member_ms(&members, 0), 1_700_000_000_123);
    }

    #[test]
    fn test_oldest_member_falls_back_on_empty_reply() {
        assert_eq!(oldest_member_ms(&[], 555), 555);
    }

    #[test]
    fn test_oldest_member_falls_back_on_garbage() {
        let members = vec!["not-a-timestamp".to_string()];
        assert_eq!(oldest_member_ms(&members, 555), 555);
    }

    #[test]
    fn test_window_members_are_unique() {
        let a = window_member(1_000);
        let b = window_member(1_000);
        assert!(a.starts_with("1000-"));
        assert_ne!(a, b);
    }
}
