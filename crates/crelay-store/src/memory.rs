use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;

use crate::kv::{
    BalanceOutcome, KvMessage, KvResult, KvStore, window_member, window_member_weight,
};

/// In-process backend with the same observable semantics as the Redis one.
///
/// Used directly in tests and as the degraded-mode fallback. Expiry is
/// lazy: entries are dropped when touched past their deadline.
pub struct MemoryKv {
    inner: Mutex<Inner>,
    events: broadcast::Sender<KvMessage>,
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, Entry>,
    hashes: HashMap<String, HashMap<String, String>>,
    windows: HashMap<String, Vec<(i64, String)>>,
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.is_none_or(|at| at > Instant::now())
    }
}

impl MemoryKv {
    pub fn new(events: broadcast::Sender<KvMessage>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }
}

impl Inner {
    fn get_live(&mut self, key: &str) -> Option<&Entry> {
        if self.strings.get(key).is_some_and(|entry| !entry.live()) {
            self.strings.remove(key);
        }
        self.strings.get(key)
    }

    fn trim_window(&mut self, key: &str, cutoff_ms: i64) -> &mut Vec<(i64, String)> {
        let entries = self.windows.entry(key.to_string()).or_default();
        entries.retain(|(ts, _)| *ts > cutoff_ms);
        entries
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn ping(&self) -> KvResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.get_live(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let mut inner = self.inner.lock().await;
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        let mut inner = self.inner.lock().await;
        if inner.get_live(key).is_some() {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> KvResult<()> {
        let mut inner = self.inner.lock().await;
        inner.strings.remove(key);
        inner.hashes.remove(key);
        inner.windows.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.strings.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> KvResult<HashMap<String, String>> {
        let inner = self.inner.lock().await;
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> KvResult<()> {
        let mut inner = self.inner.lock().await;
        let map = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            map.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> KvResult<i64> {
        let mut inner = self.inner.lock().await;
        let map = inner.hashes.entry(key.to_string()).or_default();
        let next = map
            .get(field)
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(0)
            + delta;
        map.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn incr(&self, key: &str, delta: i64) -> KvResult<i64> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .get_live(key)
            .and_then(|entry| entry.value.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + delta;
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn window_add(
        &self,
        key: &str,
        now_ms: i64,
        weight: i64,
        window_ms: i64,
    ) -> KvResult<i64> {
        let mut inner = self.inner.lock().await;
        let entries = inner.trim_window(key, now_ms - window_ms);
        entries.push((now_ms, window_member(now_ms, weight)));
        Ok(entries
            .iter()
            .map(|(_, member)| window_member_weight(member))
            .sum())
    }

    async fn window_sum(&self, key: &str, now_ms: i64, window_ms: i64) -> KvResult<i64> {
        let mut inner = self.inner.lock().await;
        let entries = inner.trim_window(key, now_ms - window_ms);
        Ok(entries
            .iter()
            .map(|(_, member)| window_member_weight(member))
            .sum())
    }

    async fn balance_decrement(&self, key: &str, amount: i64) -> KvResult<BalanceOutcome> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .get_live(key)
            .and_then(|entry| entry.value.parse::<i64>().ok())
            .unwrap_or(0);
        let raw = current - amount;
        let clamped = raw < 0;
        let balance = raw.max(0);
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: balance.to_string(),
                expires_at: None,
            },
        );
        Ok(BalanceOutcome { balance, clamped })
    }

    async fn scan_prefix(&self, prefix: &str) -> KvResult<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner
            .strings
            .retain(|_, entry| entry.expires_at.is_none_or(|at| at > now));
        let mut out: Vec<String> = inner
            .strings
            .keys()
            .chain(inner.hashes.keys())
            .chain(inner.windows.keys())
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    async fn publish(&self, channel: &str, payload: &str) -> KvResult<()> {
        let _ = self.events.send(KvMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }
}

impl std::fmt::Debug for MemoryKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKv").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv() -> MemoryKv {
        let (tx, _) = broadcast::channel(8);
        MemoryKv::new(tx)
    }

    #[tokio::test]
    async fn set_nx_wins_once_until_expiry() {
        let kv = kv();
        assert!(kv.set_nx("lock", "a", Duration::from_millis(30)).await.unwrap());
        assert!(!kv.set_nx("lock", "b", Duration::from_millis(30)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(kv.set_nx("lock", "c", Duration::from_millis(30)).await.unwrap());
    }

    #[tokio::test]
    async fn window_sums_weights_and_trims() {
        let kv = kv();
        assert_eq!(kv.window_add("w", 1_000, 3, 500).await.unwrap(), 3);
        assert_eq!(kv.window_add("w", 1_200, 4, 500).await.unwrap(), 7);
        // First entry (ts=1000) falls outside the (1600-500, 1600] window.
        assert_eq!(kv.window_add("w", 1_600, 1, 500).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn balance_clamps_at_zero() {
        let kv = kv();
        kv.set("bal", "10", None).await.unwrap();
        let first = kv.balance_decrement("bal", 4).await.unwrap();
        assert_eq!(first, BalanceOutcome { balance: 6, clamped: false });
        let second = kv.balance_decrement("bal", 100).await.unwrap();
        assert_eq!(second, BalanceOutcome { balance: 0, clamped: true });
    }

    #[tokio::test]
    async fn incr_round_trips_through_get() {
        let kv = kv();
        assert_eq!(kv.incr("n", 2).await.unwrap(), 2);
        assert_eq!(kv.incr("n", -1).await.unwrap(), 1);
        assert_eq!(kv.get("n").await.unwrap().as_deref(), Some("1"));
    }
}
