use std::collections::HashMap;
use std::sync::Arc;

use crelay_common::TokenCipher;
use crelay_store::{KvError, Store, keys};
use tracing::warn;
use uuid::Uuid;

use super::model::{
    AccountGroup, AccountId, AccountStatus, AccountView, CredentialMaterial, OutboundProxy,
    Provider,
};
use crate::time_util::now_ms;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("store error: {0}")]
    Store(#[from] KvError),
    #[error("corrupt account record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

pub struct NewAccount {
    pub provider: Provider,
    pub name: Option<String>,
    pub material: CredentialMaterial,
    pub proxy: Option<OutboundProxy>,
    pub priority: i32,
    pub group_id: Option<String>,
    pub max_concurrent: i64,
    pub model_patterns: Vec<String>,
}

/// CRUD over upstream accounts. Envelope contents are opaque here; the
/// repo seals on write and hands the sealed string to the OAuth manager,
/// which is the only component holding the open path for account
/// credentials.
pub struct AccountRepo {
    store: Store,
    cipher: Arc<TokenCipher>,
}

impl AccountRepo {
    pub fn new(store: Store, cipher: Arc<TokenCipher>) -> Self {
        Self { store, cipher }
    }

    pub async fn create(&self, new: NewAccount) -> Result<AccountView, RepoError> {
        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        let sealed = self.seal_material(&new.material);
        let mut fields = vec![
            ("provider".to_string(), new.provider.as_str().to_string()),
            ("envelope".to_string(), sealed),
            ("priority".to_string(), new.priority.to_string()),
            ("status".to_string(), AccountStatus::Active.as_str().to_string()),
            ("cooldown_until_ms".to_string(), "0".to_string()),
            ("max_concurrent".to_string(), new.max_concurrent.to_string()),
            ("created_at_ms".to_string(), now.to_string()),
            ("last_used_at_ms".to_string(), "0".to_string()),
        ];
        if let Some(name) = &new.name {
            fields.push(("name".to_string(), name.clone()));
        }
        if let Some(group) = &new.group_id {
            fields.push(("group_id".to_string(), group.clone()));
        }
        if let Some(proxy) = &new.proxy {
            fields.push((
                "proxy".to_string(),
                serde_json::to_string(proxy).unwrap_or_default(),
            ));
        }
        if !new.model_patterns.is_empty() {
            fields.push((
                "model_patterns".to_string(),
                serde_json::to_string(&new.model_patterns).unwrap_or_default(),
            ));
        }
        self.store.hash_set(&keys::account(&id), &fields).await?;
        self.invalidate(&id).await;
        self.get(&id).await?.ok_or_else(|| RepoError::Corrupt {
            id,
            reason: "vanished after create".to_string(),
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<AccountView>, RepoError> {
        let fields = self.store.hash_get_all(&keys::account(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(view_from_fields(id, &fields)?))
    }

    pub async fn list(&self) -> Result<Vec<AccountView>, RepoError> {
        let account_keys = self.store.scan_prefix(keys::ACCOUNT_PREFIX).await?;
        let mut out = Vec::with_capacity(account_keys.len());
        for key in account_keys {
            let id = key.trim_start_matches(keys::ACCOUNT_PREFIX).to_string();
            let fields = self.store.hash_get_all(&key).await?;
            if fields.is_empty() {
                continue;
            }
            match view_from_fields(&id, &fields) {
                Ok(view) => out.push(view),
                Err(err) => warn!(event = "account.corrupt", account_id = %id, error = %err),
            }
        }
        Ok(out)
    }

    pub async fn delete(&self, id: &str) -> Result<(), RepoError> {
        self.store.del(&keys::account(id)).await?;
        self.invalidate(id).await;
        Ok(())
    }

    /// The sealed credential envelope, for the OAuth manager only.
    pub async fn sealed_envelope(&self, id: &str) -> Result<Option<String>, RepoError> {
        let fields = self.store.hash_get_all(&keys::account(id)).await?;
        Ok(fields.get("envelope").cloned())
    }

    /// Persist rotated credentials. Write-then-swap: the full envelope is
    /// replaced in one field write, so readers see old or new, never a mix.
    pub async fn store_material(
        &self,
        id: &str,
        material: &CredentialMaterial,
    ) -> Result<(), RepoError> {
        let sealed = self.seal_material(material);
        self.store
            .hash_set(&keys::account(id), &[("envelope".to_string(), sealed)])
            .await?;
        Ok(())
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: AccountStatus,
        last_error: Option<&str>,
    ) -> Result<(), RepoError> {
        let mut fields = vec![("status".to_string(), status.as_str().to_string())];
        if let Some(err) = last_error {
            fields.push(("last_error".to_string(), err.to_string()));
        }
        self.store.hash_set(&keys::account(id), &fields).await?;
        self.invalidate(id).await;
        Ok(())
    }

    pub async fn mark_rate_limited(&self, id: &str, until_ms: i64) -> Result<(), RepoError> {
        self.store
            .hash_set(
                &keys::account(id),
                &[
                    (
                        "status".to_string(),
                        AccountStatus::RateLimited.as_str().to_string(),
                    ),
                    ("cooldown_until_ms".to_string(), until_ms.to_string()),
                ],
            )
            .await?;
        self.invalidate(id).await;
        Ok(())
    }

    pub async fn mark_cooldown(&self, id: &str, until_ms: i64) -> Result<(), RepoError> {
        self.store
            .hash_set(
                &keys::account(id),
                &[
                    (
                        "status".to_string(),
                        AccountStatus::Cooldown.as_str().to_string(),
                    ),
                    ("cooldown_until_ms".to_string(), until_ms.to_string()),
                ],
            )
            .await?;
        self.invalidate(id).await;
        Ok(())
    }

    /// Flip a rate-limited/cooldown account back to active once its
    /// deadline passed. No-op if an admin disabled it meanwhile.
    pub async fn clear_cooldown(&self, id: &str) -> Result<bool, RepoError> {
        let Some(view) = self.get(id).await? else {
            return Ok(false);
        };
        if !matches!(
            view.status,
            AccountStatus::RateLimited | AccountStatus::Cooldown
        ) {
            return Ok(false);
        }
        if view.cooldown_until_ms > now_ms() {
            return Ok(false);
        }
        self.store
            .hash_set(
                &keys::account(id),
                &[
                    (
                        "status".to_string(),
                        AccountStatus::Active.as_str().to_string(),
                    ),
                    ("cooldown_until_ms".to_string(), "0".to_string()),
                ],
            )
            .await?;
        self.invalidate(id).await;
        Ok(true)
    }

    pub async fn touch(&self, id: &str) -> Result<(), RepoError> {
        self.store
            .hash_set(
                &keys::account(id),
                &[("last_used_at_ms".to_string(), now_ms().to_string())],
            )
            .await?;
        Ok(())
    }

    pub async fn get_group(&self, id: &str) -> Result<Option<AccountGroup>, RepoError> {
        let Some(raw) = self.store.get(&keys::account_group(id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(group) => Ok(Some(group)),
            Err(err) => Err(RepoError::Corrupt {
                id: id.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    pub async fn put_group(&self, group: &AccountGroup) -> Result<(), RepoError> {
        let raw = serde_json::to_string(group).map_err(|err| RepoError::Corrupt {
            id: group.id.clone(),
            reason: err.to_string(),
        })?;
        self.store
            .set(&keys::account_group(&group.id), &raw, None)
            .await?;
        self.invalidate(&group.id).await;
        Ok(())
    }

    fn seal_material(&self, material: &CredentialMaterial) -> String {
        let plaintext = serde_json::to_vec(material).unwrap_or_default();
        self.cipher.seal(&plaintext)
    }

    async fn invalidate(&self, id: &str) {
        if let Err(err) = self.store.publish(keys::ACCOUNTS_CHANNEL, id).await {
            warn!(event = "account.invalidate_failed", account_id = %id, error = %err);
        }
    }
}

fn view_from_fields(id: &str, fields: &HashMap<String, String>) -> Result<AccountView, RepoError> {
    let provider = fields
        .get("provider")
        .and_then(|value| Provider::parse(value))
        .ok_or_else(|| RepoError::Corrupt {
            id: id.to_string(),
            reason: "missing or unknown provider".to_string(),
        })?;
    let status = fields
        .get("status")
        .and_then(|value| AccountStatus::parse(value))
        .unwrap_or(AccountStatus::Active);
    let proxy = fields
        .get("proxy")
        .and_then(|raw| serde_json::from_str(raw).ok());
    let model_patterns: Vec<String> = fields
        .get("model_patterns")
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();

    Ok(AccountView {
        id: id.to_string(),
        provider,
        name: fields.get("name").cloned(),
        priority: parse_or(fields, "priority", 100),
        group_id: fields.get("group_id").cloned(),
        status,
        cooldown_until_ms: parse_or(fields, "cooldown_until_ms", 0),
        proxy,
        max_concurrent: parse_or(fields, "max_concurrent", 10),
        model_patterns,
        last_error: fields.get("last_error").cloned(),
        last_used_at_ms: parse_or(fields, "last_used_at_ms", 0),
    })
}

fn parse_or<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str, default: T) -> T {
    fields
        .get(name)
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> AccountRepo {
        let cipher = Arc::new(TokenCipher::from_encoded(&"cd".repeat(32)).unwrap());
        AccountRepo::new(Store::memory_only(), cipher)
    }

    fn oauth_material(expires_at_ms: i64) -> CredentialMaterial {
        CredentialMaterial::Oauth {
            access_token: "at-1".to_string(),
            refresh_token: "rt-1".to_string(),
            expires_at_ms,
            scopes: vec!["user:inference".to_string()],
            token_type: "Bearer".to_string(),
        }
    }

    #[tokio::test]
    async fn create_then_list_round_trips_metadata() {
        let repo = repo();
        let view = repo
            .create(NewAccount {
                provider: Provider::ClaudeOauth,
                name: Some("primary".to_string()),
                material: oauth_material(0),
                proxy: None,
                priority: 5,
                group_id: None,
                max_concurrent: 3,
                model_patterns: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(view.status, AccountStatus::Active);
        assert_eq!(view.priority, 5);

        let all = repo.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, view.id);
        assert_eq!(all[0].max_concurrent, 3);
    }

    #[tokio::test]
    async fn views_never_expose_the_envelope() {
        let repo = repo();
        let view = repo
            .create(NewAccount {
                provider: Provider::ClaudeOauth,
                name: None,
                material: oauth_material(0),
                proxy: None,
                priority: 1,
                group_id: None,
                max_concurrent: 1,
                model_patterns: Vec::new(),
            })
            .await
            .unwrap();
        let as_json = serde_json::to_string(&view).unwrap();
        assert!(!as_json.contains("at-1"));
        assert!(!as_json.contains("envelope"));
        // The sealed form exists, and is not plaintext.
        let sealed = repo.sealed_envelope(&view.id).await.unwrap().unwrap();
        assert!(sealed.starts_with("v1:"));
        assert!(!sealed.contains("at-1"));
    }

    #[tokio::test]
    async fn rate_limit_and_recovery_cycle() {
        let repo = repo();
        let view = repo
            .create(NewAccount {
                provider: Provider::ClaudeOauth,
                name: None,
                material: oauth_material(0),
                proxy: None,
                priority: 1,
                group_id: None,
                max_concurrent: 1,
                model_patterns: Vec::new(),
            })
            .await
            .unwrap();

        repo.mark_rate_limited(&view.id, now_ms() - 1).await.unwrap();
        let limited = repo.get(&view.id).await.unwrap().unwrap();
        assert_eq!(limited.status, AccountStatus::RateLimited);

        assert!(repo.clear_cooldown(&view.id).await.unwrap());
        let active = repo.get(&view.id).await.unwrap().unwrap();
        assert_eq!(active.status, AccountStatus::Active);
        assert_eq!(active.cooldown_until_ms, 0);
    }
}
