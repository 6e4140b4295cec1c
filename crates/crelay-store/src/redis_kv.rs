use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::broadcast;
use tracing::warn;

use crate::kv::{
    BalanceOutcome, KvError, KvMessage, KvResult, KvStore, window_member, window_member_weight,
};

const SCAN_BATCH: usize = 200;

/// `balance = max(0, balance - amount)` server-side, so concurrent commits
/// can never drive a balance negative.
const BALANCE_DECREMENT_SCRIPT: &str = r#"
local balance = tonumber(redis.call('GET', KEYS[1]) or '0')
local amount = tonumber(ARGV[1])
local next = balance - amount
local clamped = 0
if next < 0 then
  next = 0
  clamped = 1
end
redis.call('SET', KEYS[1], next)
return {next, clamped}
"#;

pub struct RedisKv {
    manager: ConnectionManager,
    client: redis::Client,
}

impl RedisKv {
    pub async fn connect(url: &str) -> KvResult<Self> {
        let client = redis::Client::open(url).map_err(protocol)?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(unavailable)?;
        Ok(Self { manager, client })
    }

    /// Forward pub/sub traffic matching `pattern` into the local broadcast
    /// channel. Reconnects with a fixed delay; subscribers only ever see a
    /// gap, never an error.
    pub fn spawn_subscriber(&self, pattern: String, events: broadcast::Sender<KvMessage>) {
        let client = self.client.clone();
        tokio::spawn(async move {
            loop {
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(err) => {
                        warn!(event = "kv.pubsub_connect_failed", error = %err);
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        continue;
                    }
                };
                if let Err(err) = pubsub.psubscribe(&pattern).await {
                    warn!(event = "kv.pubsub_subscribe_failed", error = %err);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
                let mut stream = pubsub.on_message();
                while let Some(msg) = stream.next().await {
                    let channel = msg.get_channel_name().to_string();
                    let Ok(payload) = msg.get_payload::<String>() else {
                        continue;
                    };
                    let _ = events.send(KvMessage { channel, payload });
                }
                warn!(event = "kv.pubsub_stream_ended");
            }
        });
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn unavailable(err: redis::RedisError) -> KvError {
    KvError::Unavailable(err.to_string())
}

fn protocol(err: redis::RedisError) -> KvError {
    KvError::Protocol(err.to_string())
}

fn map_err(err: redis::RedisError) -> KvError {
    if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
        unavailable(err)
    } else {
        protocol(err)
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn ping(&self) -> KvResult<()> {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        cmd.query_async::<()>(&mut conn).await.map_err(map_err)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> KvResult<()> {
        let mut conn = self.conn();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<()> {
        let mut conn = self.conn();
        redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn hash_get_all(&self, key: &str) -> KvResult<HashMap<String, String>> {
        let mut conn = self.conn();
        redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> KvResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        cmd.query_async::<()>(&mut conn).await.map_err(map_err)
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> KvResult<i64> {
        let mut conn = self.conn();
        redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn incr(&self, key: &str, delta: i64) -> KvResult<i64> {
        let mut conn = self.conn();
        redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn window_add(
        &self,
        key: &str,
        now_ms: i64,
        weight: i64,
        window_ms: i64,
    ) -> KvResult<i64> {
        let member = window_member(now_ms, weight);
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(now_ms - window_ms)
            .ignore()
            .cmd("ZADD")
            .arg(key)
            .arg(now_ms)
            .arg(&member)
            .ignore()
            .cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(window_ms)
            .ignore();
        let (members,): (Vec<String>,) = pipe.query_async(&mut conn).await.map_err(map_err)?;
        Ok(members.iter().map(|m| window_member_weight(m)).sum())
    }

    async fn window_sum(&self, key: &str, now_ms: i64, window_ms: i64) -> KvResult<i64> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(now_ms - window_ms)
            .ignore()
            .cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(-1);
        let (members,): (Vec<String>,) = pipe.query_async(&mut conn).await.map_err(map_err)?;
        Ok(members.iter().map(|m| window_member_weight(m)).sum())
    }

    async fn balance_decrement(&self, key: &str, amount: i64) -> KvResult<BalanceOutcome> {
        let mut conn = self.conn();
        let script = redis::Script::new(BALANCE_DECREMENT_SCRIPT);
        let (balance, clamped): (i64, i64) = script
            .key(key)
            .arg(amount)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(BalanceOutcome {
            balance,
            clamped: clamped == 1,
        })
    }

    async fn scan_prefix(&self, prefix: &str) -> KvResult<Vec<String>> {
        let mut conn = self.conn();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut out = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            out.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        out.sort();
        out.dedup();
        Ok(out)
    }

    async fn publish(&self, channel: &str, payload: &str) -> KvResult<()> {
        let mut conn = self.conn();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_err)
    }
}

impl std::fmt::Debug for RedisKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKv").finish_non_exhaustive()
    }
}
