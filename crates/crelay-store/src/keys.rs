//! Logical key layout. Every persisted key is built here so the shape of
//! the keyspace stays in one place.

/// Pattern covering every pub/sub channel this process cares about.
pub const CHANNEL_PATTERN: &str = "crelay.*";

/// Snapshot invalidation for account metadata.
pub const ACCOUNTS_CHANNEL: &str = "crelay.accounts";
/// Snapshot invalidation for API keys.
pub const KEYS_CHANNEL: &str = "crelay.keys";
/// Raw usage events for downstream consumers.
pub const USAGE_CHANNEL: &str = "crelay.usage";

pub const API_KEY_PREFIX: &str = "apikey:";
pub const ACCOUNT_PREFIX: &str = "account:";
pub const GROUP_PREFIX: &str = "account_group:";

pub fn api_key(id: &str) -> String {
    format!("apikey:{id}")
}

pub fn api_key_hash(hash_hex: &str) -> String {
    format!("apikey_hash:{hash_hex}")
}

pub fn account(id: &str) -> String {
    format!("account:{id}")
}

pub fn account_group(id: &str) -> String {
    format!("account_group:{id}")
}

pub fn session(fingerprint: &str) -> String {
    format!("session:{fingerprint}")
}

pub fn inflight_account(account_id: &str) -> String {
    format!("inflight:{account_id}")
}

pub fn inflight_key(key_id: &str) -> String {
    format!("inflight_key:{key_id}")
}

pub fn rl_requests(key_id: &str) -> String {
    format!("rl:{key_id}:req")
}

pub fn rl_tokens(key_id: &str) -> String {
    format!("rl:{key_id}:tok")
}

pub fn credits(key_id: &str) -> String {
    format!("credits:{key_id}")
}

/// `date` is `YYYY-MM-DD`.
pub fn daily_usage(date: &str, key_id: &str, model: &str) -> String {
    format!("usage:daily:{date}:{key_id}:{model}")
}

pub fn daily_usage_prefix(date: &str, key_id: &str) -> String {
    format!("usage:daily:{date}:{key_id}:")
}

/// Per-key total cost for one day, across models.
pub fn daily_cost(date: &str, key_id: &str) -> String {
    format!("usage:daily_cost:{date}:{key_id}")
}

/// Round-robin cursor for a group.
pub fn group_cursor(group_id: &str) -> String {
    format!("group_rr:{group_id}")
}

pub fn breaker(account_id: &str) -> String {
    format!("breaker:{account_id}")
}

pub fn refresh_lock(account_id: &str) -> String {
    format!("oauth_refresh:{account_id}")
}
