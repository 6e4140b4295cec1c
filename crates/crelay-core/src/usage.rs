use std::time::Duration;

use crelay_protocol::UsageCounts;
use crelay_store::{Store, keys};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::account::Provider;
use crate::pattern::matches;
use crate::time_util::date_of_ms;

const QUEUE_CAPACITY: usize = 4096;
const DAILY_COST_TTL: Duration = Duration::from_secs(48 * 3600);

/// Append-only per-request usage event. Committed exactly once per
/// request, on success, error, and client cancel alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub api_key_id: String,
    pub account_id: Option<String>,
    pub provider: Option<Provider>,
    pub model: String,
    pub endpoint: String,
    pub status_code: u16,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub cost_micros: i64,
    pub started_at_ms: i64,
    pub duration_ms: i64,
    pub client_disconnect: bool,
    /// Window the token counters charge into, copied from the key's
    /// quota so accounting does not re-read the key record.
    pub rl_window_seconds: i64,
}

impl UsageRecord {
    pub fn total_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }

    pub fn apply_counts(&mut self, counts: &UsageCounts) {
        self.input_tokens = counts.input_tokens;
        self.output_tokens = counts.output_tokens;
        self.cache_creation_tokens = counts.cache_creation_tokens;
        self.cache_read_tokens = counts.cache_read_tokens;
        if let Some(model) = &counts.model {
            self.model = model.clone();
        }
    }
}

/// One pricing row; first matching (provider, pattern) wins.
#[derive(Debug, Clone)]
pub struct PriceRule {
    pub provider: Provider,
    pub model_pattern: &'static str,
    pub input_micros_per_mtok: i64,
    pub output_micros_per_mtok: i64,
    pub cache_creation_micros_per_mtok: i64,
    pub cache_read_micros_per_mtok: i64,
}

/// Cost table in micro-dollars per million tokens. Configurable at
/// bootstrap; nothing downstream hardwires a conversion factor.
#[derive(Debug, Clone)]
pub struct PricingTable {
    rules: Vec<PriceRule>,
}

impl PricingTable {
    pub fn new(rules: Vec<PriceRule>) -> Self {
        Self { rules }
    }

    pub fn default_table() -> Self {
        use Provider::*;
        let mut rules = Vec::new();
        for provider in [ClaudeOauth, ClaudeConsole] {
            rules.extend([
                PriceRule {
                    provider,
                    model_pattern: "claude-3-5-haiku*",
                    input_micros_per_mtok: 800_000,
                    output_micros_per_mtok: 4_000_000,
                    cache_creation_micros_per_mtok: 1_000_000,
                    cache_read_micros_per_mtok: 80_000,
                },
                PriceRule {
                    provider,
                    model_pattern: "claude-3-opus*",
                    input_micros_per_mtok: 15_000_000,
                    output_micros_per_mtok: 75_000_000,
                    cache_creation_micros_per_mtok: 18_750_000,
                    cache_read_micros_per_mtok: 1_500_000,
                },
                PriceRule {
                    provider,
                    model_pattern: "claude-*",
                    input_micros_per_mtok: 3_000_000,
                    output_micros_per_mtok: 15_000_000,
                    cache_creation_micros_per_mtok: 3_750_000,
                    cache_read_micros_per_mtok: 300_000,
                },
            ]);
        }
        rules.push(PriceRule {
            provider: Bedrock,
            model_pattern: "*",
            input_micros_per_mtok: 3_000_000,
            output_micros_per_mtok: 15_000_000,
            cache_creation_micros_per_mtok: 3_750_000,
            cache_read_micros_per_mtok: 300_000,
        });
        rules.push(PriceRule {
            provider: Gemini,
            model_pattern: "*",
            input_micros_per_mtok: 100_000,
            output_micros_per_mtok: 400_000,
            cache_creation_micros_per_mtok: 0,
            cache_read_micros_per_mtok: 25_000,
        });
        Self { rules }
    }

    pub fn cost_micros(&self, provider: Provider, model: &str, counts: &UsageCounts) -> i64 {
        let Some(rule) = self
            .rules
            .iter()
            .find(|rule| rule.provider == provider && matches(rule.model_pattern, model))
        else {
            return 0;
        };
        counts.input_tokens * rule.input_micros_per_mtok / 1_000_000
            + counts.output_tokens * rule.output_micros_per_mtok / 1_000_000
            + counts.cache_creation_tokens * rule.cache_creation_micros_per_mtok / 1_000_000
            + counts.cache_read_tokens * rule.cache_read_micros_per_mtok / 1_000_000
    }
}

/// One day's aggregate for (date, key, model), as served by the usage
/// endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyRollup {
    pub date: String,
    pub model: String,
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub total_tokens: i64,
    pub cost_micros: i64,
}

pub async fn daily_rollups(
    store: &Store,
    date: &str,
    key_id: &str,
) -> Result<Vec<DailyRollup>, crelay_store::KvError> {
    let prefix = keys::daily_usage_prefix(date, key_id);
    let rollup_keys = store.scan_prefix(&prefix).await?;
    let mut out = Vec::with_capacity(rollup_keys.len());
    for key in rollup_keys {
        let model = key.trim_start_matches(&prefix).to_string();
        let fields = store.hash_get_all(&key).await?;
        if fields.is_empty() {
            continue;
        }
        let field = |name: &str| {
            fields
                .get(name)
                .and_then(|raw| raw.parse::<i64>().ok())
                .unwrap_or(0)
        };
        out.push(DailyRollup {
            date: date.to_string(),
            model,
            requests: field("requests"),
            input_tokens: field("input_tokens"),
            output_tokens: field("output_tokens"),
            cache_creation_tokens: field("cache_creation_tokens"),
            cache_read_tokens: field("cache_read_tokens"),
            total_tokens: field("total_tokens"),
            cost_micros: field("cost_micros"),
        });
    }
    Ok(out)
}

/// Cloneable handle the relay commits records through.
#[derive(Clone)]
pub struct AccountingSink {
    tx: mpsc::Sender<UsageRecord>,
}

impl AccountingSink {
    /// Bounded queue with backpressure: commit blocks rather than drops
    /// when the writer falls behind.
    pub async fn commit(&self, record: UsageRecord) {
        if self.tx.send(record).await.is_err() {
            warn!(event = "accounting.queue_closed");
        }
    }
}

/// Background writer turning usage records into rollups, cost counters,
/// credit decrements and the raw event feed.
pub struct AccountingBus {
    sink: AccountingSink,
    handle: JoinHandle<()>,
}

impl AccountingBus {
    pub fn spawn(store: Store) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let handle = tokio::spawn(writer(store, rx));
        Self {
            sink: AccountingSink { tx },
            handle,
        }
    }

    pub fn sink(&self) -> AccountingSink {
        self.sink.clone()
    }

    /// Drop the sender side and wait for the writer to drain the queue.
    /// Records accepted before shutdown are flushed or the timeout
    /// elapses — they are not silently discarded.
    pub async fn shutdown(self, timeout: Duration) {
        let AccountingBus { sink, handle } = self;
        drop(sink);
        if tokio::time::timeout(timeout, handle).await.is_err() {
            warn!(event = "accounting.drain_timeout");
        }
    }
}

async fn writer(store: Store, mut rx: mpsc::Receiver<UsageRecord>) {
    while let Some(record) = rx.recv().await {
        if let Err(err) = write_record(&store, &record).await {
            warn!(
                event = "accounting.write_failed",
                request_id = %record.request_id,
                error = %err
            );
        }
    }
}

async fn write_record(store: &Store, record: &UsageRecord) -> Result<(), crelay_store::KvError> {
    let date = date_of_ms(record.started_at_ms);
    let rollup_key = keys::daily_usage(&date, &record.api_key_id, &record.model);

    // Monotonic counters only; a rollup is never rewritten.
    store.hash_incr(&rollup_key, "requests", 1).await?;
    store
        .hash_incr(&rollup_key, "input_tokens", record.input_tokens)
        .await?;
    store
        .hash_incr(&rollup_key, "output_tokens", record.output_tokens)
        .await?;
    store
        .hash_incr(
            &rollup_key,
            "cache_creation_tokens",
            record.cache_creation_tokens,
        )
        .await?;
    store
        .hash_incr(&rollup_key, "cache_read_tokens", record.cache_read_tokens)
        .await?;
    store
        .hash_incr(&rollup_key, "total_tokens", record.total_tokens())
        .await?;
    store
        .hash_incr(&rollup_key, "cost_micros", record.cost_micros)
        .await?;

    if record.cost_micros > 0 {
        let cost_key = keys::daily_cost(&date, &record.api_key_id);
        store.incr(&cost_key, record.cost_micros).await?;
        store.expire(&cost_key, DAILY_COST_TTL).await?;

        // Credit balances are opt-in: only keys with a credits entry
        // get decremented.
        let credits_key = keys::credits(&record.api_key_id);
        if store.get(&credits_key).await?.is_some() {
            let outcome = store
                .balance_decrement(&credits_key, record.cost_micros)
                .await?;
            if outcome.clamped {
                warn!(event = "accounting.overdrawn", api_key_id = %record.api_key_id);
                store
                    .hash_set(
                        &keys::api_key(&record.api_key_id),
                        &[("overdrawn".to_string(), "true".to_string())],
                    )
                    .await?;
            }
        }
    }

    let total = record.total_tokens();
    if total > 0 {
        let window_ms = record.rl_window_seconds.max(1) * 1_000;
        store
            .window_add(
                &keys::rl_tokens(&record.api_key_id),
                record.started_at_ms + record.duration_ms,
                total,
                window_ms,
            )
            .await?;
    }

    if let Ok(raw) = serde_json::to_string(record) {
        let _ = store.publish(keys::USAGE_CHANNEL, &raw).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_util::now_ms;

    fn record(cost_micros: i64) -> UsageRecord {
        UsageRecord {
            request_id: "r1".to_string(),
            api_key_id: "k1".to_string(),
            account_id: Some("a1".to_string()),
            provider: Some(Provider::ClaudeOauth),
            model: "claude-3-5-sonnet".to_string(),
            endpoint: "/api/v1/messages".to_string(),
            status_code: 200,
            input_tokens: 10,
            output_tokens: 20,
            cache_creation_tokens: 1,
            cache_read_tokens: 2,
            cost_micros,
            started_at_ms: now_ms(),
            duration_ms: 42,
            client_disconnect: false,
            rl_window_seconds: 60,
        }
    }

    #[test]
    fn totals_sum_all_four_dimensions() {
        assert_eq!(record(0).total_tokens(), 33);
    }

    #[test]
    fn pricing_first_match_wins() {
        let table = PricingTable::default_table();
        let counts = UsageCounts {
            input_tokens: 1_000_000,
            output_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            model: None,
        };
        // Haiku matches its specific row, not the claude-* catch-all.
        assert_eq!(
            table.cost_micros(Provider::ClaudeOauth, "claude-3-5-haiku", &counts),
            800_000
        );
        assert_eq!(
            table.cost_micros(Provider::ClaudeOauth, "claude-3-5-sonnet", &counts),
            3_000_000
        );
        assert_eq!(table.cost_micros(Provider::Gemini, "gemini-2.0-flash", &counts), 100_000);
    }

    #[tokio::test]
    async fn rollup_accumulates_monotonically() {
        let store = Store::memory_only();
        let bus = AccountingBus::spawn(store.clone());
        let sink = bus.sink();
        sink.commit(record(1_000)).await;
        sink.commit(record(2_000)).await;
        drop(sink);
        bus.shutdown(Duration::from_secs(2)).await;

        let date = date_of_ms(now_ms());
        let rollup = store
            .hash_get_all(&keys::daily_usage(&date, "k1", "claude-3-5-sonnet"))
            .await
            .unwrap();
        assert_eq!(rollup.get("requests").unwrap(), "2");
        assert_eq!(rollup.get("input_tokens").unwrap(), "20");
        assert_eq!(rollup.get("total_tokens").unwrap(), "66");
        assert_eq!(rollup.get("cost_micros").unwrap(), "3000");

        let cost = store
            .get(&keys::daily_cost(&date, "k1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cost, "3000");
    }

    #[tokio::test]
    async fn credits_clamp_flags_overdrawn() {
        let store = Store::memory_only();
        store.set(&keys::credits("k1"), "1500", None).await.unwrap();
        let bus = AccountingBus::spawn(store.clone());
        bus.sink().commit(record(1_000)).await;
        bus.sink().commit(record(1_000)).await;
        bus.shutdown(Duration::from_secs(2)).await;

        assert_eq!(
            store.get(&keys::credits("k1")).await.unwrap().unwrap(),
            "0"
        );
        let key_fields = store.hash_get_all(&keys::api_key("k1")).await.unwrap();
        assert_eq!(key_fields.get("overdrawn").unwrap(), "true");
    }
}
