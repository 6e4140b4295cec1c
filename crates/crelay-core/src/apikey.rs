use std::collections::HashMap;
use std::sync::Arc;

use crelay_common::crypto::{constant_time_eq, generate_secret, sha256_hex};
use crelay_store::{KvError, Store, keys};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::time_util::now_ms;

const TOUCH_QUEUE_CAPACITY: usize = 1024;
const KEY_BODY_MIN: usize = 17;
const KEY_BODY_MAX: usize = 253;

#[derive(Debug, thiserror::Error)]
pub enum KeyServiceError {
    #[error("invalid quota: {0}")]
    InvalidQuota(&'static str),
    #[error("store error: {0}")]
    Store(#[from] KvError),
}

/// Why a presented key was rejected. Deliberately coarse: clients learn
/// nothing about which stage failed beyond what the status code implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    Missing,
    Invalid,
    Disabled,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyQuotas {
    /// 0 = unlimited for the window dimensions.
    pub tokens_per_window: i64,
    pub requests_per_window: i64,
    pub window_seconds: i64,
    /// 0 = unlimited concurrency.
    pub max_concurrent: i64,
}

impl Default for KeyQuotas {
    fn default() -> Self {
        Self {
            tokens_per_window: 0,
            requests_per_window: 0,
            window_seconds: 60,
            max_concurrent: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyState {
    Active,
    Disabled,
    Expired,
}

impl KeyState {
    fn as_str(&self) -> &'static str {
        match self {
            KeyState::Active => "active",
            KeyState::Disabled => "disabled",
            KeyState::Expired => "expired",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(KeyState::Active),
            "disabled" => Some(KeyState::Disabled),
            "expired" => Some(KeyState::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    /// SHA-256 of the plaintext, lowercase 64-hex. The plaintext itself
    /// is never stored.
    pub hash: String,
    pub display_name: String,
    pub owner_ref: Option<String>,
    pub quotas: KeyQuotas,
    /// None = unlimited. Some(0) blocks every request.
    pub daily_cost_limit_micros: Option<i64>,
    /// Empty = any model the selected account supports.
    pub allowed_model_patterns: Vec<String>,
    pub dedicated_account: Option<String>,
    pub group_binding: Option<String>,
    pub state: KeyState,
    pub overdrawn: bool,
    pub created_at_ms: i64,
    pub last_used_at_ms: i64,
    pub expires_at_ms: Option<i64>,
}

impl ApiKeyRecord {
    pub fn model_allowed(&self, model: &str) -> bool {
        self.allowed_model_patterns.is_empty()
            || crate::pattern::matches_any(
                self.allowed_model_patterns.iter().map(|p| p.as_str()),
                model,
            )
    }
}

#[derive(Debug, Clone, Default)]
pub struct IssueKeySpec {
    pub display_name: String,
    pub owner_ref: Option<String>,
    pub quotas: KeyQuotas,
    pub daily_cost_limit_micros: Option<i64>,
    pub allowed_model_patterns: Vec<String>,
    pub dedicated_account: Option<String>,
    pub group_binding: Option<String>,
    pub expires_at_ms: Option<i64>,
    /// "cr_" unless the caller wants the sk_/pk_ namespace.
    pub prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub record: ApiKeyRecord,
    /// Returned exactly once; only the hash persists.
    pub plaintext: String,
}

/// Defense against log/URL injection: keys must look like keys before
/// any store lookup happens.
pub fn plaintext_format_valid(candidate: &str) -> bool {
    let Some(body) = candidate
        .strip_prefix("sk_")
        .or_else(|| candidate.strip_prefix("cr_"))
        .or_else(|| candidate.strip_prefix("pk_"))
    else {
        return false;
    };
    (KEY_BODY_MIN..=KEY_BODY_MAX).contains(&body.len())
        && body
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Issues, validates and meters self-issued API keys.
pub struct ApiKeyService {
    store: Store,
    touch_tx: mpsc::Sender<String>,
}

impl ApiKeyService {
    pub fn new(store: Store) -> Arc<Self> {
        let (touch_tx, touch_rx) = mpsc::channel(TOUCH_QUEUE_CAPACITY);
        let service = Arc::new(Self { store, touch_tx });
        service.clone().spawn_touch_writer(touch_rx);
        service
    }

    pub async fn issue(&self, spec: IssueKeySpec) -> Result<IssuedKey, KeyServiceError> {
        if spec.quotas.tokens_per_window < 0 || spec.quotas.requests_per_window < 0 {
            return Err(KeyServiceError::InvalidQuota("window quota negative"));
        }
        if spec.quotas.window_seconds <= 0 {
            return Err(KeyServiceError::InvalidQuota("window_seconds must be positive"));
        }
        if spec.quotas.max_concurrent < 0 {
            return Err(KeyServiceError::InvalidQuota("max_concurrent negative"));
        }
        if spec.daily_cost_limit_micros.is_some_and(|limit| limit < 0) {
            return Err(KeyServiceError::InvalidQuota("daily_cost_limit negative"));
        }

        let prefix = spec.prefix.as_deref().unwrap_or("cr_");
        let plaintext = generate_secret(prefix);
        debug_assert!(plaintext_format_valid(&plaintext));
        let hash = sha256_hex(plaintext.as_bytes());
        let record = ApiKeyRecord {
            id: Uuid::new_v4().to_string(),
            hash: hash.clone(),
            display_name: spec.display_name,
            owner_ref: spec.owner_ref,
            quotas: spec.quotas,
            daily_cost_limit_micros: spec.daily_cost_limit_micros,
            allowed_model_patterns: spec.allowed_model_patterns,
            dedicated_account: spec.dedicated_account,
            group_binding: spec.group_binding,
            state: KeyState::Active,
            overdrawn: false,
            created_at_ms: now_ms(),
            last_used_at_ms: 0,
            expires_at_ms: spec.expires_at_ms,
        };

        self.store
            .hash_set(&keys::api_key(&record.id), &record_fields(&record))
            .await?;
        // Index write last: the key becomes usable once this lands.
        self.store
            .set(&keys::api_key_hash(&hash), &record.id, None)
            .await?;
        let _ = self.store.publish(keys::KEYS_CHANNEL, &record.id).await;

        Ok(IssuedKey { record, plaintext })
    }

    pub async fn validate(&self, plaintext: &str) -> Result<ApiKeyRecord, AuthFailure> {
        if plaintext.is_empty() {
            return Err(AuthFailure::Missing);
        }
        if !plaintext_format_valid(plaintext) {
            return Err(AuthFailure::Invalid);
        }
        let computed = sha256_hex(plaintext.as_bytes());
        let id = match self.store.get(&keys::api_key_hash(&computed)).await {
            Ok(Some(id)) => id,
            Ok(None) => return Err(AuthFailure::Invalid),
            Err(err) => {
                warn!(event = "apikey.lookup_failed", error = %err);
                return Err(AuthFailure::Invalid);
            }
        };
        let record = match self.get(&id).await {
            Ok(Some(record)) => record,
            _ => return Err(AuthFailure::Invalid),
        };
        if !constant_time_eq(record.hash.as_bytes(), computed.as_bytes()) {
            return Err(AuthFailure::Invalid);
        }
        match record.state {
            KeyState::Disabled => return Err(AuthFailure::Disabled),
            KeyState::Expired => return Err(AuthFailure::Expired),
            KeyState::Active => {}
        }
        if record.expires_at_ms.is_some_and(|at| at <= now_ms()) {
            // Lazily flip the state so listings agree with behavior.
            let _ = self
                .store
                .hash_set(
                    &keys::api_key(&id),
                    &[("state".to_string(), KeyState::Expired.as_str().to_string())],
                )
                .await;
            return Err(AuthFailure::Expired);
        }

        // Fire-and-forget; dropped under backpressure rather than
        // blocking the request.
        let _ = self.touch_tx.try_send(record.id.clone());
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ApiKeyRecord>, KeyServiceError> {
        let fields = self.store.hash_get_all(&keys::api_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(record_from_fields(id, &fields))
    }

    pub async fn revoke(&self, id: &str) -> Result<(), KeyServiceError> {
        if let Some(record) = self.get(id).await? {
            self.store.del(&keys::api_key_hash(&record.hash)).await?;
        }
        self.store.del(&keys::api_key(id)).await?;
        let _ = self.store.publish(keys::KEYS_CHANNEL, id).await;
        Ok(())
    }

    pub async fn set_state(&self, id: &str, state: KeyState) -> Result<(), KeyServiceError> {
        self.store
            .hash_set(
                &keys::api_key(id),
                &[("state".to_string(), state.as_str().to_string())],
            )
            .await?;
        let _ = self.store.publish(keys::KEYS_CHANNEL, id).await;
        Ok(())
    }

    fn spawn_touch_writer(self: Arc<Self>, mut rx: mpsc::Receiver<String>) {
        tokio::spawn(async move {
            while let Some(key_id) = rx.recv().await {
                let fields = [("last_used_at_ms".to_string(), now_ms().to_string())];
                if let Err(err) = self.store.hash_set(&keys::api_key(&key_id), &fields).await {
                    warn!(event = "apikey.touch_failed", key_id = %key_id, error = %err);
                }
            }
        });
    }
}

fn record_fields(record: &ApiKeyRecord) -> Vec<(String, String)> {
    let mut fields = vec![
        ("hash".to_string(), record.hash.clone()),
        ("display_name".to_string(), record.display_name.clone()),
        (
            "quotas".to_string(),
            serde_json::to_string(&record.quotas).unwrap_or_default(),
        ),
        ("state".to_string(), record.state.as_str().to_string()),
        ("overdrawn".to_string(), record.overdrawn.to_string()),
        ("created_at_ms".to_string(), record.created_at_ms.to_string()),
        (
            "last_used_at_ms".to_string(),
            record.last_used_at_ms.to_string(),
        ),
    ];
    if let Some(owner) = &record.owner_ref {
        fields.push(("owner_ref".to_string(), owner.clone()));
    }
    if let Some(limit) = record.daily_cost_limit_micros {
        fields.push(("daily_cost_limit_micros".to_string(), limit.to_string()));
    }
    if !record.allowed_model_patterns.is_empty() {
        fields.push((
            "allowed_model_patterns".to_string(),
            serde_json::to_string(&record.allowed_model_patterns).unwrap_or_default(),
        ));
    }
    if let Some(account) = &record.dedicated_account {
        fields.push(("dedicated_account".to_string(), account.clone()));
    }
    if let Some(group) = &record.group_binding {
        fields.push(("group_binding".to_string(), group.clone()));
    }
    if let Some(expires) = record.expires_at_ms {
        fields.push(("expires_at_ms".to_string(), expires.to_string()));
    }
    fields
}

fn record_from_fields(id: &str, fields: &HashMap<String, String>) -> Option<ApiKeyRecord> {
    let hash = fields.get("hash")?.clone();
    Some(ApiKeyRecord {
        id: id.to_string(),
        hash,
        display_name: fields.get("display_name").cloned().unwrap_or_default(),
        owner_ref: fields.get("owner_ref").cloned(),
        quotas: fields
            .get("quotas")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default(),
        daily_cost_limit_micros: fields
            .get("daily_cost_limit_micros")
            .and_then(|raw| raw.parse().ok()),
        allowed_model_patterns: fields
            .get("allowed_model_patterns")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default(),
        dedicated_account: fields.get("dedicated_account").cloned(),
        group_binding: fields.get("group_binding").cloned(),
        state: fields
            .get("state")
            .and_then(|raw| KeyState::parse(raw))
            .unwrap_or(KeyState::Active),
        overdrawn: fields
            .get("overdrawn")
            .is_some_and(|raw| raw == "true"),
        created_at_ms: fields
            .get("created_at_ms")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0),
        last_used_at_ms: fields
            .get("last_used_at_ms")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0),
        expires_at_ms: fields.get("expires_at_ms").and_then(|raw| raw.parse().ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Arc<ApiKeyService> {
        ApiKeyService::new(Store::memory_only())
    }

    #[tokio::test]
    async fn issue_validate_revoke_cycle() {
        let service = service();
        let issued = service
            .issue(IssueKeySpec {
                display_name: "ci".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(issued.plaintext.starts_with("cr_"));
        assert!(plaintext_format_valid(&issued.plaintext));

        let validated = service.validate(&issued.plaintext).await.unwrap();
        assert_eq!(validated.id, issued.record.id);

        service.revoke(&issued.record.id).await.unwrap();
        assert_eq!(
            service.validate(&issued.plaintext).await.unwrap_err(),
            AuthFailure::Invalid
        );
        assert!(service.get(&issued.record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wrong_plaintext_is_rejected() {
        let service = service();
        let issued = service
            .issue(IssueKeySpec::default())
            .await
            .unwrap();
        let mut other = issued.plaintext.clone();
        other.pop();
        other.push(if issued.plaintext.ends_with('A') { 'B' } else { 'A' });
        assert_eq!(
            service.validate(&other).await.unwrap_err(),
            AuthFailure::Invalid
        );
    }

    #[tokio::test]
    async fn disabled_and_expired_states_surface() {
        let service = service();
        let issued = service.issue(IssueKeySpec::default()).await.unwrap();
        service
            .set_state(&issued.record.id, KeyState::Disabled)
            .await
            .unwrap();
        assert_eq!(
            service.validate(&issued.plaintext).await.unwrap_err(),
            AuthFailure::Disabled
        );

        let expiring = service
            .issue(IssueKeySpec {
                expires_at_ms: Some(now_ms() - 1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            service.validate(&expiring.plaintext).await.unwrap_err(),
            AuthFailure::Expired
        );
    }

    #[tokio::test]
    async fn negative_quotas_are_refused() {
        let service = service();
        let err = service
            .issue(IssueKeySpec {
                quotas: KeyQuotas {
                    requests_per_window: -1,
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KeyServiceError::InvalidQuota(_)));
    }

    #[test]
    fn format_guard_accepts_issued_shapes_only() {
        assert!(plaintext_format_valid("cr_abcdefghijklmnopq"));
        assert!(plaintext_format_valid(&generate_secret("sk_")));
        assert!(!plaintext_format_valid("cr_short"));
        assert!(!plaintext_format_valid("xx_abcdefghijklmnopq"));
        assert!(!plaintext_format_valid("cr_abcdefghijklmnop!"));
        assert!(!plaintext_format_valid(&format!("cr_{}", "a".repeat(254))));
    }
}
