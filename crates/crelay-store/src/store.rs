use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::warn;

use crate::keys;
use crate::kv::{BalanceOutcome, KvError, KvMessage, KvResult, KvStore};
use crate::memory::MemoryKv;
use crate::redis_kv::RedisKv;

const EVENTS_CAPACITY: usize = 1024;

/// Per-operation fallback: try the remote backend, answer from the
/// in-process one when it errors with `Unavailable`, latching `degraded`.
/// Protocol errors are the caller's bug and propagate as-is.
macro_rules! with_fallback {
    ($self:ident, $method:ident ( $($arg:expr),* )) => {{
        if let Some(primary) = &$self.inner.primary {
            match primary.$method($($arg),*).await {
                Ok(value) => {
                    $self.mark_healthy();
                    return Ok(value);
                }
                Err(KvError::Unavailable(message)) => $self.mark_degraded(&message),
                Err(err) => return Err(err),
            }
        }
        $self.inner.fallback.$method($($arg),*).await
    }};
}

/// The storage facade every component talks to.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    primary: Option<RedisKv>,
    fallback: MemoryKv,
    degraded: AtomicBool,
    events: broadcast::Sender<KvMessage>,
}

impl Store {
    /// In-process storage only; used in tests and single-node setups.
    pub fn memory_only() -> Self {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                primary: None,
                fallback: MemoryKv::new(events.clone()),
                degraded: AtomicBool::new(false),
                events,
            }),
        }
    }

    /// Connect to the remote backend when a URL is configured. A failed
    /// initial connection starts the process in degraded (memory) mode
    /// rather than refusing to boot.
    pub async fn connect(kv_url: Option<&str>) -> Self {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        let primary = match kv_url {
            Some(url) => match RedisKv::connect(url).await {
                Ok(redis) => {
                    redis.spawn_subscriber(keys::CHANNEL_PATTERN.to_string(), events.clone());
                    Some(redis)
                }
                Err(err) => {
                    warn!(event = "kv.connect_failed", error = %err);
                    None
                }
            },
            None => None,
        };
        let degraded = kv_url.is_some() && primary.is_none();
        Self {
            inner: Arc::new(StoreInner {
                primary,
                fallback: MemoryKv::new(events.clone()),
                degraded: AtomicBool::new(degraded),
                events,
            }),
        }
    }

    /// False while operations are being answered by the fallback.
    pub fn is_healthy(&self) -> bool {
        !self.inner.degraded.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KvMessage> {
        self.inner.events.subscribe()
    }

    fn mark_healthy(&self) {
        self.inner.degraded.store(false, Ordering::Relaxed);
    }

    fn mark_degraded(&self, message: &str) {
        if !self.inner.degraded.swap(true, Ordering::Relaxed) {
            warn!(event = "kv.degraded", error = %message);
        }
    }

    pub async fn ping(&self) -> KvResult<()> {
        if let Some(primary) = &self.inner.primary {
            match primary.ping().await {
                Ok(()) => {
                    self.mark_healthy();
                    Ok(())
                }
                Err(err) => {
                    self.mark_degraded(&err.to_string());
                    Err(err)
                }
            }
        } else {
            self.inner.fallback.ping().await
        }
    }

    pub async fn get(&self, key: &str) -> KvResult<Option<String>> {
        with_fallback!(self, get(key))
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        with_fallback!(self, set(key, value, ttl))
    }

    pub async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        with_fallback!(self, set_nx(key, value, ttl))
    }

    pub async fn del(&self, key: &str) -> KvResult<()> {
        with_fallback!(self, del(key))
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> KvResult<()> {
        with_fallback!(self, expire(key, ttl))
    }

    pub async fn hash_get_all(&self, key: &str) -> KvResult<HashMap<String, String>> {
        with_fallback!(self, hash_get_all(key))
    }

    pub async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> KvResult<()> {
        with_fallback!(self, hash_set(key, fields))
    }

    pub async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> KvResult<i64> {
        with_fallback!(self, hash_incr(key, field, delta))
    }

    pub async fn incr(&self, key: &str, delta: i64) -> KvResult<i64> {
        with_fallback!(self, incr(key, delta))
    }

    pub async fn window_add(
        &self,
        key: &str,
        now_ms: i64,
        weight: i64,
        window_ms: i64,
    ) -> KvResult<i64> {
        with_fallback!(self, window_add(key, now_ms, weight, window_ms))
    }

    pub async fn window_sum(&self, key: &str, now_ms: i64, window_ms: i64) -> KvResult<i64> {
        with_fallback!(self, window_sum(key, now_ms, window_ms))
    }

    pub async fn balance_decrement(&self, key: &str, amount: i64) -> KvResult<BalanceOutcome> {
        with_fallback!(self, balance_decrement(key, amount))
    }

    pub async fn scan_prefix(&self, prefix: &str) -> KvResult<Vec<String>> {
        with_fallback!(self, scan_prefix(prefix))
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> KvResult<()> {
        with_fallback!(self, publish(channel, payload))
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("remote", &self.inner.primary.is_some())
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_only_store_is_healthy_and_round_trips() {
        let store = Store::memory_only();
        assert!(store.is_healthy());
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        store.del("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let store = Store::memory_only();
        let mut rx = store.subscribe();
        store.publish("crelay.accounts", "acct-1").await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "crelay.accounts");
        assert_eq!(msg.payload, "acct-1");
    }
}
