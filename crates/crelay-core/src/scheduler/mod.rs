mod cooldown;
mod directory;
mod sticky;

pub use cooldown::CooldownQueue;
pub use directory::AccountDirectory;
pub use sticky::{SESSION_TTL, StickySessions, fingerprint_request};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crelay_store::Store;
use tracing::{debug, warn};

use crate::account::{
    AccountGroup, AccountId, AccountRepo, AccountView, ProviderFamily, SelectionPolicy,
};
use crate::apikey::ApiKeyRecord;
use crate::breaker::{BreakerRegistry, BreakerState};
use crate::events::{Event, EventHub, OperationalEvent};
use crate::ratelimit::RateLimiter;
use crate::time_util::now_ms;

/// A slot taken against one account. The holder must hand the lease
/// back through [`Scheduler::release`] on every exit path.
#[derive(Debug)]
pub struct Lease {
    pub account: AccountView,
    /// Sticky fingerprint that bound this selection, when one applied.
    pub session: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoAccountAvailable {
    pub retry_after_secs: u64,
}

/// The unified account scheduler: dedicated binding, then group
/// binding, then sticky session, then the shared pool.
pub struct Scheduler {
    directory: Arc<AccountDirectory>,
    repo: Arc<AccountRepo>,
    sticky: StickySessions,
    limiter: Arc<RateLimiter>,
    breakers: Arc<BreakerRegistry>,
    cooldowns: Arc<CooldownQueue>,
    store: Store,
    events: EventHub,
    /// Last selection instant per account, so equal-priority pools
    /// rotate even between directory refreshes.
    recent: RwLock<HashMap<AccountId, i64>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: Arc<AccountDirectory>,
        repo: Arc<AccountRepo>,
        limiter: Arc<RateLimiter>,
        breakers: Arc<BreakerRegistry>,
        cooldowns: Arc<CooldownQueue>,
        store: Store,
        events: EventHub,
    ) -> Self {
        Self {
            directory,
            repo,
            sticky: StickySessions::new(store.clone()),
            limiter,
            breakers,
            cooldowns,
            store,
            events,
            recent: RwLock::new(HashMap::new()),
        }
    }

    pub async fn select(
        &self,
        key: &ApiKeyRecord,
        family: ProviderFamily,
        model: &str,
        fingerprint: Option<&str>,
        exclude: &HashSet<String>,
    ) -> Result<Lease, NoAccountAvailable> {
        let now = now_ms();
        let accounts = self.directory.accounts();
        let group = self.load_bound_group(key).await;

        let candidates: Vec<&AccountView> = accounts
            .iter()
            .filter(|account| {
                family.members().contains(&account.provider)
                    && account.supports_model(model)
                    && !exclude.contains(&account.id)
                    && permitted_for_key(key, account, group.as_ref())
            })
            .collect();

        // 1. Dedicated binding. Checked against the full directory, not
        // the stage-2..4 candidate pool: the binding wins when its
        // account is usable and falls through entirely when it is not.
        if let Some(dedicated) = &key.dedicated_account
            && !exclude.contains(dedicated)
            && let Some(account) = accounts.iter().find(|a| &a.id == dedicated)
            && family.members().contains(&account.provider)
            && account.supports_model(model)
            && self.eligible(account, now)
            && let Some(lease) = self.try_acquire(account, None).await
        {
            return Ok(lease);
        }

        // 2. Group binding, by the group's own policy.
        if let Some(group) = &group {
            let mut members: Vec<&AccountView> = candidates
                .iter()
                .copied()
                .filter(|a| group.member_ids.contains(&a.id) && self.eligible(a, now))
                .collect();
            if !members.is_empty() {
                self.order_by_policy(group, &mut members).await;
                for account in members {
                    if let Some(lease) = self.try_acquire(account, None).await {
                        return Ok(lease);
                    }
                }
            }
        }

        // 3. Sticky session, when the mapped account is still usable and
        // still inside this key's permitted pool.
        if let Some(fp) = fingerprint
            && let Some(target) = self.sticky.get(fp).await
            && let Some(account) = candidates.iter().find(|a| a.id == target)
            && self.eligible(account, now)
            && let Some(lease) = self.try_acquire(account, Some(fp)).await
        {
            return Ok(lease);
        }

        // 4. Shared pool ordered by (priority, inflight, last used),
        // account id as the deterministic tie-break.
        let mut pool: Vec<&AccountView> = candidates
            .iter()
            .copied()
            .filter(|a| self.eligible(a, now))
            .collect();
        let mut keyed: Vec<(i32, i64, i64, &AccountView)> = Vec::with_capacity(pool.len());
        for account in pool.drain(..) {
            let inflight = self
                .limiter
                .account_inflight(&account.id)
                .await
                .unwrap_or(0);
            let last_used = self.last_used(account);
            keyed.push((account.priority, inflight, last_used, account));
        }
        keyed.sort_by(|a, b| {
            (a.0, a.1, a.2, &a.3.id).cmp(&(b.0, b.1, b.2, &b.3.id))
        });
        for (_, _, _, account) in keyed {
            if let Some(lease) = self.try_acquire(account, fingerprint).await {
                return Ok(lease);
            }
        }

        debug!(event = "scheduler.no_account", model = %model, key_id = %key.id);
        Err(NoAccountAvailable {
            retry_after_secs: retry_after_hint(&candidates, now),
        })
    }

    pub async fn release(&self, lease: &Lease) {
        if let Err(err) = self
            .limiter
            .account_inflight_release(&lease.account.id)
            .await
        {
            warn!(event = "scheduler.release_failed", account_id = %lease.account.id, error = %err);
        }
    }

    /// Record an upstream 429: cooldown until the given deadline and
    /// schedule recovery.
    pub async fn account_rate_limited(&self, account_id: &str, until_ms: i64) {
        if let Err(err) = self.repo.mark_rate_limited(account_id, until_ms).await {
            warn!(event = "scheduler.mark_rate_limited_failed", account_id = %account_id, error = %err);
        }
        self.cooldowns.push(until_ms, account_id.to_string()).await;
        self.events
            .emit(Event::Operational(OperationalEvent::CooldownStart {
                account_id: account_id.to_string(),
                reason: "rate_limited".to_string(),
                until_ms,
            }))
            .await;
    }

    /// Record an error burst: park the account until the deadline. Used
    /// when an account's breaker opens, so the unavailability is
    /// persisted and visible beyond this process.
    pub async fn account_cooldown(&self, account_id: &str, until_ms: i64) {
        if let Err(err) = self.repo.mark_cooldown(account_id, until_ms).await {
            warn!(event = "scheduler.mark_cooldown_failed", account_id = %account_id, error = %err);
        }
        // Observability mirror only; admission reads the in-process
        // breaker, never this key.
        let ttl = std::time::Duration::from_millis((until_ms - now_ms()).max(1_000) as u64);
        let _ = self
            .store
            .set(&crelay_store::keys::breaker(account_id), "open", Some(ttl))
            .await;
        self.cooldowns.push(until_ms, account_id.to_string()).await;
        self.events
            .emit(Event::Operational(OperationalEvent::CooldownStart {
                account_id: account_id.to_string(),
                reason: "error_burst".to_string(),
                until_ms,
            }))
            .await;
    }

    fn last_used(&self, account: &AccountView) -> i64 {
        self.recent
            .read()
            .ok()
            .and_then(|recent| recent.get(&account.id).copied())
            .unwrap_or(account.last_used_at_ms)
            .max(account.last_used_at_ms)
    }

    fn eligible(&self, account: &AccountView, now: i64) -> bool {
        account.usable(now) && self.breakers.breaker(&account.id).state() != BreakerState::Open
    }

    async fn try_acquire(&self, account: &AccountView, fingerprint: Option<&str>) -> Option<Lease> {
        // Half-open breakers admit one probe here; losing the race means
        // trying the next candidate, not failing the request.
        if !self.breakers.admit(&account.id) {
            return None;
        }
        match self
            .limiter
            .account_inflight_acquire(&account.id, account.max_concurrent)
            .await
        {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                warn!(event = "scheduler.inflight_failed", account_id = %account.id, error = %err);
                return None;
            }
        }
        if let Err(err) = self.repo.touch(&account.id).await {
            warn!(event = "scheduler.touch_failed", account_id = %account.id, error = %err);
        }
        if let Ok(mut recent) = self.recent.write() {
            recent.insert(account.id.clone(), now_ms());
        }
        let session = match fingerprint {
            Some(fp) => {
                self.sticky.put(fp, &account.id).await;
                Some(fp.to_string())
            }
            None => None,
        };
        Some(Lease {
            account: account.clone(),
            session,
        })
    }

    async fn load_bound_group(&self, key: &ApiKeyRecord) -> Option<AccountGroup> {
        let group_id = key.group_binding.as_ref()?;
        match self.repo.get_group(group_id).await {
            Ok(group) => group,
            Err(err) => {
                warn!(event = "scheduler.group_load_failed", group_id = %group_id, error = %err);
                None
            }
        }
    }

    async fn order_by_policy(&self, group: &AccountGroup, members: &mut Vec<&AccountView>) {
        match group.policy {
            SelectionPolicy::Priority => {
                members.sort_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)));
            }
            SelectionPolicy::RoundRobin => {
                members.sort_by(|a, b| a.id.cmp(&b.id));
                let cursor = self
                    .store
                    .incr(&crelay_store::keys::group_cursor(&group.id), 1)
                    .await
                    .unwrap_or(0);
                if !members.is_empty() {
                    let offset = (cursor as usize) % members.len();
                    members.rotate_left(offset);
                }
            }
            SelectionPolicy::LeastLoaded => {
                let mut keyed = Vec::with_capacity(members.len());
                for account in members.drain(..) {
                    let inflight = self
                        .limiter
                        .account_inflight(&account.id)
                        .await
                        .unwrap_or(0);
                    keyed.push((inflight, account));
                }
                keyed.sort_by(|a, b| (a.0, &a.1.id).cmp(&(b.0, &b.1.id)));
                members.extend(keyed.into_iter().map(|(_, account)| account));
            }
        }
    }
}

/// Pool boundary for the group, sticky, and shared-pool stages: a group
/// binding narrows the pool to the group's members. The dedicated
/// binding is handled in stage 1 only — it wins when usable, and an
/// unusable dedicated account must not shrink the later stages' pool.
fn permitted_for_key(
    key: &ApiKeyRecord,
    account: &AccountView,
    group: Option<&AccountGroup>,
) -> bool {
    if key.group_binding.is_some() {
        return group.is_some_and(|g| g.member_ids.contains(&account.id));
    }
    true
}

/// `retry-after` hint: the smallest remaining cooldown among the
/// candidates, clamped to [1, 60] seconds.
fn retry_after_hint(candidates: &[&AccountView], now: i64) -> u64 {
    candidates
        .iter()
        .filter(|a| a.cooldown_until_ms > now)
        .map(|a| ((a.cooldown_until_ms - now) / 1_000).clamp(1, 60) as u64)
        .min()
        .unwrap_or(1)
}
