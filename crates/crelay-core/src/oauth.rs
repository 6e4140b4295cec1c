use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crelay_common::TokenCipher;
use crelay_store::{Store, keys};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::account::{AccountId, AccountRepo, AccountStatus, AccountView, CredentialMaterial};
use crate::events::{Event, EventHub, OperationalEvent};
use crate::metrics::Metrics;
use crate::time_util::now_ms;
use crate::upstream::{UpstreamBody, UpstreamClient, UpstreamRequest};

/// A token expiring at exactly `now + skew` counts as stale.
pub const STALENESS_SKEW_MS: i64 = 10_000;

const REFRESH_LOCK_TTL: Duration = Duration::from_secs(30);
/// How long a waiter polls for another holder's refresh to land.
const LOCK_WAIT_STEPS_MS: [u64; 5] = [200, 400, 800, 1600, 2000];

/// Public OAuth client id used for Claude refresh grants.
pub const DEFAULT_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenError {
    #[error("account {0} is unauthorized upstream")]
    Unauthorized(AccountId),
    #[error("account {0} has no usable credential")]
    MissingCredential(AccountId),
    #[error("transient refresh failure: {0}")]
    Transient(String),
}

pub fn is_stale(expires_at_ms: i64, now: i64) -> bool {
    expires_at_ms <= now + STALENESS_SKEW_MS
}

/// Maintains a usable access token per account: detects expiry,
/// serializes refreshes, persists rotated credentials. The only
/// component that opens credential envelopes.
pub struct OAuthManager {
    repo: Arc<AccountRepo>,
    store: Store,
    cipher: Arc<TokenCipher>,
    client: Arc<dyn UpstreamClient>,
    token_url: String,
    client_id: String,
    default_proxy: Option<String>,
    locks: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
    events: EventHub,
    metrics: Arc<Metrics>,
}

impl OAuthManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<AccountRepo>,
        store: Store,
        cipher: Arc<TokenCipher>,
        client: Arc<dyn UpstreamClient>,
        token_url: String,
        default_proxy: Option<String>,
        events: EventHub,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            repo,
            store,
            cipher,
            client,
            token_url,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            default_proxy,
            locks: Mutex::new(HashMap::new()),
            events,
            metrics,
        }
    }

    /// A credential usable right now: static keys come back as-is, OAuth
    /// tokens are refreshed when within the staleness skew of expiry.
    pub async fn access_token(&self, account: &AccountView) -> Result<String, TokenError> {
        self.token_inner(account, false).await
    }

    /// Force a refresh regardless of recorded expiry; used after an
    /// upstream 401 invalidated the current token.
    pub async fn force_refresh(&self, account: &AccountView) -> Result<String, TokenError> {
        self.token_inner(account, true).await
    }

    async fn token_inner(&self, account: &AccountView, force: bool) -> Result<String, TokenError> {
        match self.load_material(&account.id).await? {
            CredentialMaterial::ApiKey { key } => {
                if force {
                    // A static key rejected upstream cannot be rotated here.
                    self.mark_unauthorized(&account.id, "static key rejected upstream")
                        .await;
                    return Err(TokenError::Unauthorized(account.id.clone()));
                }
                Ok(key)
            }
            CredentialMaterial::Oauth {
                access_token,
                expires_at_ms,
                ..
            } => {
                if !force && !is_stale(expires_at_ms, now_ms()) {
                    return Ok(access_token);
                }
                self.refresh_serialized(account, force).await
            }
        }
    }

    /// At most one refresh in flight per account id: an in-process mutex
    /// serializes local callers, a store-level set-if-absent fences other
    /// processes. Waiters re-read the envelope instead of refreshing.
    async fn refresh_serialized(
        &self,
        account: &AccountView,
        force: bool,
    ) -> Result<String, TokenError> {
        let lock = self.account_lock(&account.id).await;
        let _guard = lock.lock().await;

        // Double-check after the lock: a sibling may have refreshed while
        // this caller waited.
        let refresh_token = match self.load_material(&account.id).await? {
            CredentialMaterial::Oauth {
                access_token,
                refresh_token,
                expires_at_ms,
                ..
            } => {
                if !force && !is_stale(expires_at_ms, now_ms()) {
                    return Ok(access_token);
                }
                refresh_token
            }
            CredentialMaterial::ApiKey { key } => return Ok(key),
        };

        let lock_key = keys::refresh_lock(&account.id);
        let holder = Uuid::new_v4().to_string();
        let acquired = self
            .store
            .set_nx(&lock_key, &holder, REFRESH_LOCK_TTL)
            .await
            .map_err(|err| TokenError::Transient(err.to_string()))?;
        if !acquired {
            return self.wait_for_refresh(account).await;
        }

        let result = self.refresh_once(account, &refresh_token).await;
        if let Err(err) = self.store.del(&lock_key).await {
            warn!(event = "oauth.lock_release_failed", account_id = %account.id, error = %err);
        }
        result
    }

    async fn wait_for_refresh(&self, account: &AccountView) -> Result<String, TokenError> {
        for delay_ms in LOCK_WAIT_STEPS_MS {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let CredentialMaterial::Oauth {
                access_token,
                expires_at_ms,
                ..
            } = self.load_material(&account.id).await?
                && !is_stale(expires_at_ms, now_ms())
            {
                return Ok(access_token);
            }
        }
        Err(TokenError::Transient(
            "refresh held elsewhere and did not complete in time".to_string(),
        ))
    }

    async fn refresh_once(
        &self,
        account: &AccountView,
        refresh_token: &str,
    ) -> Result<String, TokenError> {
        let payload = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": self.client_id,
        });
        let proxy = account
            .proxy
            .as_ref()
            .map(|p| p.to_url())
            .or_else(|| self.default_proxy.clone());
        let request = UpstreamRequest {
            method: http::Method::POST,
            url: self.token_url.clone(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Some(Bytes::from(payload.to_string())),
            proxy,
            want_stream: false,
        };

        let response = match self.client.send(request).await {
            Ok(response) => response,
            Err(err) => {
                self.metrics
                    .refresh_failures
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Err(TokenError::Transient(err.to_string()));
            }
        };

        let body = match response.body {
            UpstreamBody::Bytes(bytes) => bytes,
            UpstreamBody::Stream(_) => Bytes::new(),
        };

        if !(200..300).contains(&response.status) {
            let text = String::from_utf8_lossy(&body);
            if text.contains("invalid_grant") {
                self.mark_unauthorized(&account.id, "invalid_grant").await;
                self.metrics
                    .refresh_failures
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Err(TokenError::Unauthorized(account.id.clone()));
            }
            self.metrics
                .refresh_failures
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Err(TokenError::Transient(format!(
                "refresh endpoint returned {}: {text}",
                response.status
            )));
        }

        let parsed: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|err| TokenError::Transient(format!("bad refresh response: {err}")))?;
        let access_token = parsed
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                TokenError::Transient("refresh response missing access_token".to_string())
            })?
            .to_string();
        let new_refresh = parsed
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .unwrap_or(refresh_token)
            .to_string();
        let expires_in = parsed
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .unwrap_or(3600);
        let expires_at_ms = now_ms() + expires_in * 1_000;
        let scopes = parsed
            .get("scope")
            .and_then(|v| v.as_str())
            .map(|s| s.split_whitespace().map(|p| p.to_string()).collect())
            .unwrap_or_default();
        let token_type = parsed
            .get("token_type")
            .and_then(|v| v.as_str())
            .unwrap_or("Bearer")
            .to_string();

        let material = CredentialMaterial::Oauth {
            access_token: access_token.clone(),
            refresh_token: new_refresh,
            expires_at_ms,
            scopes,
            token_type,
        };
        // Persist before releasing the lock so waiters read the rotated
        // envelope, never a half-applied one.
        self.repo
            .store_material(&account.id, &material)
            .await
            .map_err(|err| TokenError::Transient(err.to_string()))?;

        self.metrics
            .token_refreshes
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!(event = "oauth.refreshed", account_id = %account.id, expires_at_ms);
        self.events
            .emit(Event::Operational(OperationalEvent::TokenRefreshed {
                account_id: account.id.clone(),
                expires_at_ms,
            }))
            .await;

        Ok(access_token)
    }

    async fn mark_unauthorized(&self, account_id: &str, reason: &str) {
        warn!(event = "oauth.unauthorized", account_id = %account_id, reason = %reason);
        if let Err(err) = self
            .repo
            .set_status(account_id, AccountStatus::Unauthorized, Some(reason))
            .await
        {
            warn!(event = "oauth.mark_unauthorized_failed", account_id = %account_id, error = %err);
        }
        self.events
            .emit(Event::Operational(OperationalEvent::AccountUnauthorized {
                account_id: account_id.to_string(),
            }))
            .await;
    }

    async fn load_material(&self, account_id: &str) -> Result<CredentialMaterial, TokenError> {
        let sealed = self
            .repo
            .sealed_envelope(account_id)
            .await
            .map_err(|err| TokenError::Transient(err.to_string()))?
            .ok_or_else(|| TokenError::MissingCredential(account_id.to_string()))?;
        let plaintext = self
            .cipher
            .open(&sealed)
            .map_err(|_| TokenError::MissingCredential(account_id.to_string()))?;
        serde_json::from_slice(&plaintext)
            .map_err(|_| TokenError::MissingCredential(account_id.to_string()))
    }

    async fn account_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
