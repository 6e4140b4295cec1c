use serde::{Deserialize, Serialize};

use crate::pattern::matches_any;

pub type AccountId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    ClaudeOauth,
    ClaudeConsole,
    Gemini,
    Bedrock,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::ClaudeOauth => "claude-oauth",
            Provider::ClaudeConsole => "claude-console",
            Provider::Gemini => "gemini",
            Provider::Bedrock => "bedrock",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "claude-oauth" => Some(Provider::ClaudeOauth),
            "claude-console" => Some(Provider::ClaudeConsole),
            "gemini" => Some(Provider::Gemini),
            "bedrock" => Some(Provider::Bedrock),
            _ => None,
        }
    }

    /// Models this provider accepts when an account carries no explicit
    /// allow-list.
    pub fn default_model_patterns(&self) -> &'static [&'static str] {
        match self {
            Provider::ClaudeOauth | Provider::ClaudeConsole => &["claude-*"],
            Provider::Gemini => &["gemini-*"],
            Provider::Bedrock => &["anthropic.*", "us.anthropic.*"],
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoint namespaces map to a family; the scheduler then narrows by
/// which member provider actually accepts the requested model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    Claude,
    Gemini,
}

impl ProviderFamily {
    pub fn members(&self) -> &'static [Provider] {
        match self {
            ProviderFamily::Claude => &[
                Provider::ClaudeOauth,
                Provider::ClaudeConsole,
                Provider::Bedrock,
            ],
            ProviderFamily::Gemini => &[Provider::Gemini],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountStatus {
    Active,
    RateLimited,
    Cooldown,
    Disabled,
    Unauthorized,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::RateLimited => "rate-limited",
            AccountStatus::Cooldown => "cooldown",
            AccountStatus::Disabled => "disabled",
            AccountStatus::Unauthorized => "unauthorized",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(AccountStatus::Active),
            "rate-limited" => Some(AccountStatus::RateLimited),
            "cooldown" => Some(AccountStatus::Cooldown),
            "disabled" => Some(AccountStatus::Disabled),
            "unauthorized" => Some(AccountStatus::Unauthorized),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Http,
    Https,
    Socks5,
}

/// Per-account outbound proxy. Rendered as a URL for the HTTP client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundProxy {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl OutboundProxy {
    pub fn to_url(&self) -> String {
        let scheme = match self.scheme {
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
            ProxyScheme::Socks5 => "socks5",
        };
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                format!("{scheme}://{user}:{pass}@{}:{}", self.host, self.port)
            }
            (Some(user), None) => format!("{scheme}://{user}@{}:{}", self.host, self.port),
            _ => format!("{scheme}://{}:{}", self.host, self.port),
        }
    }
}

/// The decrypted credential payload. Lives inside the sealed envelope;
/// only the OAuth manager ever holds one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialMaterial {
    Oauth {
        access_token: String,
        refresh_token: String,
        expires_at_ms: i64,
        #[serde(default)]
        scopes: Vec<String>,
        #[serde(default = "default_token_type")]
        token_type: String,
    },
    ApiKey {
        key: String,
    },
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Read-only projection of an account: everything the scheduler and
/// relay need, minus the encrypted envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountView {
    pub id: AccountId,
    pub provider: Provider,
    pub name: Option<String>,
    pub priority: i32,
    pub group_id: Option<String>,
    pub status: AccountStatus,
    pub cooldown_until_ms: i64,
    pub proxy: Option<OutboundProxy>,
    pub max_concurrent: i64,
    /// Empty means the provider's defaults apply.
    pub model_patterns: Vec<String>,
    pub last_error: Option<String>,
    pub last_used_at_ms: i64,
}

impl AccountView {
    pub fn supports_model(&self, model: &str) -> bool {
        if self.model_patterns.is_empty() {
            matches_any(
                self.provider
                    .default_model_patterns()
                    .iter()
                    .map(|p| *p),
                model,
            )
        } else {
            matches_any(self.model_patterns.iter().map(|p| p.as_str()), model)
        }
    }

    /// Usable = selectable right now: active, or rate-limited with an
    /// elapsed cooldown. Breaker state is layered on by the scheduler.
    pub fn usable(&self, now_ms: i64) -> bool {
        match self.status {
            AccountStatus::Active => true,
            AccountStatus::RateLimited | AccountStatus::Cooldown => self.cooldown_until_ms <= now_ms,
            AccountStatus::Disabled | AccountStatus::Unauthorized => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    Priority,
    RoundRobin,
    LeastLoaded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountGroup {
    pub id: String,
    pub name: String,
    pub member_ids: Vec<AccountId>,
    pub policy: SelectionPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(provider: Provider) -> AccountView {
        AccountView {
            id: "a1".to_string(),
            provider,
            name: None,
            priority: 10,
            group_id: None,
            status: AccountStatus::Active,
            cooldown_until_ms: 0,
            proxy: None,
            max_concurrent: 5,
            model_patterns: Vec::new(),
            last_error: None,
            last_used_at_ms: 0,
        }
    }

    #[test]
    fn default_patterns_gate_models_by_provider() {
        assert!(view(Provider::ClaudeOauth).supports_model("claude-3-5-sonnet"));
        assert!(!view(Provider::ClaudeOauth).supports_model("gemini-2.0-flash"));
        assert!(view(Provider::Gemini).supports_model("gemini-2.0-flash"));
        assert!(view(Provider::Bedrock).supports_model("anthropic.claude-3-5-sonnet-v2:0"));
    }

    #[test]
    fn explicit_patterns_override_defaults() {
        let mut v = view(Provider::ClaudeOauth);
        v.model_patterns = vec!["claude-3-5-*".to_string()];
        assert!(v.supports_model("claude-3-5-haiku"));
        assert!(!v.supports_model("claude-3-opus"));
    }

    #[test]
    fn cooldown_boundary_is_inclusive() {
        let mut v = view(Provider::ClaudeOauth);
        v.status = AccountStatus::RateLimited;
        v.cooldown_until_ms = 1_000;
        assert!(!v.usable(999));
        // cooldownUntil == now transitions the account back into the pool.
        assert!(v.usable(1_000));
    }

    #[test]
    fn proxy_urls_include_auth_when_present() {
        let proxy = OutboundProxy {
            scheme: ProxyScheme::Socks5,
            host: "10.0.0.1".to_string(),
            port: 1080,
            username: Some("u".to_string()),
            password: Some("p".to_string()),
        };
        assert_eq!(proxy.to_url(), "socks5://u:p@10.0.0.1:1080");
    }
}
