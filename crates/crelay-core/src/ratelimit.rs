use std::time::Duration;

use crelay_store::{KvError, Store, keys};
use tokio::time::MissedTickBehavior;
use tracing::warn;

use crate::apikey::ApiKeyRecord;
use crate::time_util::{date_of_ms, now_ms};

/// Inflight counters expire on their own a little past the request
/// budget, so a crashed worker cannot pin an account forever.
const INFLIGHT_TTL_SLACK: Duration = Duration::from_secs(30);
const REAPER_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Throttle { retry_after_secs: u64 },
}

/// Sliding-window admission per key plus inflight accounting per key
/// and per account.
pub struct RateLimiter {
    store: Store,
    inflight_ttl: Duration,
}

impl RateLimiter {
    pub fn new(store: Store, request_timeout: Duration) -> Self {
        Self {
            store,
            inflight_ttl: request_timeout + INFLIGHT_TTL_SLACK,
        }
    }

    /// Evaluate every quota dimension for one request. The request
    /// window is charged here; the token window is charged at commit
    /// time by accounting.
    pub async fn check(&self, key: &ApiKeyRecord) -> Result<Admission, KvError> {
        let now = now_ms();
        let quotas = &key.quotas;
        let window_ms = quotas.window_seconds.max(1) * 1_000;
        let retry_after = quotas.window_seconds.clamp(1, 3_600) as u64;

        if let Some(limit) = key.daily_cost_limit_micros {
            if limit == 0 {
                return Ok(Admission::Throttle {
                    retry_after_secs: retry_after,
                });
            }
            let date = date_of_ms(now);
            let spent = self
                .store
                .get(&keys::daily_cost(&date, &key.id))
                .await?
                .and_then(|raw| raw.parse::<i64>().ok())
                .unwrap_or(0);
            if spent >= limit {
                return Ok(Admission::Throttle {
                    retry_after_secs: retry_after,
                });
            }
        }

        if quotas.max_concurrent > 0 {
            let inflight = self
                .store
                .get(&keys::inflight_key(&key.id))
                .await?
                .and_then(|raw| raw.parse::<i64>().ok())
                .unwrap_or(0);
            if inflight >= quotas.max_concurrent {
                return Ok(Admission::Throttle {
                    retry_after_secs: 1,
                });
            }
        }

        if quotas.requests_per_window > 0 {
            let total = self
                .store
                .window_add(&keys::rl_requests(&key.id), now, 1, window_ms)
                .await?;
            if total > quotas.requests_per_window {
                return Ok(Admission::Throttle {
                    retry_after_secs: retry_after,
                });
            }
        }

        if quotas.tokens_per_window > 0 {
            let total = self
                .store
                .window_sum(&keys::rl_tokens(&key.id), now, window_ms)
                .await?;
            if total >= quotas.tokens_per_window {
                return Ok(Admission::Throttle {
                    retry_after_secs: retry_after,
                });
            }
        }

        Ok(Admission::Allow)
    }

    pub async fn key_inflight_acquire(&self, key_id: &str) -> Result<(), KvError> {
        let key = keys::inflight_key(key_id);
        self.store.incr(&key, 1).await?;
        self.store.expire(&key, self.inflight_ttl).await
    }

    pub async fn key_inflight_release(&self, key_id: &str) -> Result<(), KvError> {
        let key = keys::inflight_key(key_id);
        let value = self.store.incr(&key, -1).await?;
        if value < 0 {
            self.store.set(&key, "0", Some(self.inflight_ttl)).await?;
        }
        Ok(())
    }

    /// Increment-then-check: backing off when the increment would exceed
    /// the account cap. Returns whether the slot was taken.
    pub async fn account_inflight_acquire(
        &self,
        account_id: &str,
        max_concurrent: i64,
    ) -> Result<bool, KvError> {
        let key = keys::inflight_account(account_id);
        let next = self.store.incr(&key, 1).await?;
        self.store.expire(&key, self.inflight_ttl).await?;
        if max_concurrent > 0 && next > max_concurrent {
            self.store.incr(&key, -1).await?;
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn account_inflight_release(&self, account_id: &str) -> Result<(), KvError> {
        let key = keys::inflight_account(account_id);
        let value = self.store.incr(&key, -1).await?;
        if value < 0 {
            self.store.set(&key, "0", Some(self.inflight_ttl)).await?;
        }
        Ok(())
    }

    pub async fn account_inflight(&self, account_id: &str) -> Result<i64, KvError> {
        Ok(self
            .store
            .get(&keys::inflight_account(account_id))
            .await?
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(0))
    }

    /// Background task clamping counters that went negative through
    /// lost decrements or expiry races.
    pub fn spawn_reaper(&self) {
        let store = self.store.clone();
        let ttl = self.inflight_ttl;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAPER_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let counters = match store.scan_prefix("inflight").await {
                    Ok(counters) => counters,
                    Err(err) => {
                        warn!(event = "ratelimit.reaper_scan_failed", error = %err);
                        continue;
                    }
                };
                for counter in counters {
                    let negative = store
                        .get(&counter)
                        .await
                        .ok()
                        .flatten()
                        .and_then(|raw| raw.parse::<i64>().ok())
                        .is_some_and(|value| value < 0);
                    if negative {
                        warn!(event = "ratelimit.reaper_clamped", key = %counter);
                        let _ = store.set(&counter, "0", Some(ttl)).await;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apikey::KeyQuotas;

    fn key_with(quotas: KeyQuotas, daily_limit: Option<i64>) -> ApiKeyRecord {
        ApiKeyRecord {
            id: "k1".to_string(),
            hash: String::new(),
            display_name: String::new(),
            owner_ref: None,
            quotas,
            daily_cost_limit_micros: daily_limit,
            allowed_model_patterns: Vec::new(),
            dedicated_account: None,
            group_binding: None,
            state: crate::apikey::KeyState::Active,
            overdrawn: false,
            created_at_ms: 0,
            last_used_at_ms: 0,
            expires_at_ms: None,
        }
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(Store::memory_only(), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn request_window_throttles_after_limit() {
        let limiter = limiter();
        let key = key_with(
            KeyQuotas {
                requests_per_window: 2,
                window_seconds: 60,
                ..Default::default()
            },
            None,
        );
        assert_eq!(limiter.check(&key).await.unwrap(), Admission::Allow);
        assert_eq!(limiter.check(&key).await.unwrap(), Admission::Allow);
        assert!(matches!(
            limiter.check(&key).await.unwrap(),
            Admission::Throttle { .. }
        ));
    }

    #[tokio::test]
    async fn zero_daily_cost_limit_blocks_everything() {
        let limiter = limiter();
        let key = key_with(KeyQuotas::default(), Some(0));
        assert!(matches!(
            limiter.check(&key).await.unwrap(),
            Admission::Throttle { .. }
        ));
    }

    #[tokio::test]
    async fn concurrency_cap_admits_up_to_max() {
        let limiter = limiter();
        assert!(limiter.account_inflight_acquire("a", 2).await.unwrap());
        assert!(limiter.account_inflight_acquire("a", 2).await.unwrap());
        assert!(!limiter.account_inflight_acquire("a", 2).await.unwrap());
        limiter.account_inflight_release("a").await.unwrap();
        assert!(limiter.account_inflight_acquire("a", 2).await.unwrap());
        assert_eq!(limiter.account_inflight("a").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn release_clamps_at_zero() {
        let limiter = limiter();
        limiter.account_inflight_release("ghost").await.unwrap();
        assert_eq!(limiter.account_inflight("ghost").await.unwrap(), 0);
    }
}
