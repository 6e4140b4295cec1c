use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

pub type KvResult<T> = Result<T, KvError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum KvError {
    #[error("kv backend unavailable: {0}")]
    Unavailable(String),
    #[error("kv protocol error: {0}")]
    Protocol(String),
}

/// Result of an atomic credit decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceOutcome {
    pub balance: i64,
    /// True when the decrement would have gone negative and was clamped.
    pub clamped: bool,
}

/// A pub/sub message observed on the store.
#[derive(Debug, Clone)]
pub struct KvMessage {
    pub channel: String,
    pub payload: String,
}

/// Operations every backend must provide.
///
/// Values are strings; callers own (de)serialization. Sliding windows are
/// sorted sets of `(timestamp, weight)` entries; `window_add` appends,
/// trims entries older than the window, and returns the weighted sum of
/// what remains.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn ping(&self) -> KvResult<()>;

    async fn get(&self, key: &str) -> KvResult<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()>;
    /// Set-if-absent with TTL; returns true when this caller won.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool>;
    async fn del(&self, key: &str) -> KvResult<()>;
    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<()>;

    async fn hash_get_all(&self, key: &str) -> KvResult<HashMap<String, String>>;
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> KvResult<()>;
    /// Atomic per-field increment inside a hash. Returns the new value.
    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> KvResult<i64>;

    /// Atomic increment; negative deltas decrement. Returns the new value.
    async fn incr(&self, key: &str, delta: i64) -> KvResult<i64>;

    async fn window_add(
        &self,
        key: &str,
        now_ms: i64,
        weight: i64,
        window_ms: i64,
    ) -> KvResult<i64>;
    async fn window_sum(&self, key: &str, now_ms: i64, window_ms: i64) -> KvResult<i64>;

    /// `balance = max(0, balance - amount)` as one atomic operation.
    async fn balance_decrement(&self, key: &str, amount: i64) -> KvResult<BalanceOutcome>;

    async fn scan_prefix(&self, prefix: &str) -> KvResult<Vec<String>>;

    async fn publish(&self, channel: &str, payload: &str) -> KvResult<()>;
}

/// Encode a window member as `{ts}-{unique}:{weight}` so the weighted sum
/// can be recovered from member strings alone.
pub(crate) fn window_member(now_ms: i64, weight: i64) -> String {
    format!("{now_ms}-{}:{weight}", uuid::Uuid::new_v4().simple())
}

pub(crate) fn window_member_weight(member: &str) -> i64 {
    member
        .rsplit_once(':')
        .and_then(|(_, w)| w.parse::<i64>().ok())
        .unwrap_or(0)
}
