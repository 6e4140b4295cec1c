use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Base URLs for the upstream providers this relay can front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoints {
    pub claude_oauth: String,
    pub claude_console: String,
    pub gemini: String,
    pub bedrock: String,
    /// OAuth token endpoint used for refresh grants.
    pub claude_token_url: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            claude_oauth: "https://api.anthropic.com".to_string(),
            claude_console: "https://api.anthropic.com".to_string(),
            gemini: "https://generativelanguage.googleapis.com".to_string(),
            bedrock: "https://bedrock-runtime.us-east-1.amazonaws.com".to_string(),
            claude_token_url: "https://console.anthropic.com/v1/oauth/token".to_string(),
        }
    }
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > defaults. The encryption key is required; the
/// process refuses to start without it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Remote KV URL (`redis://...`). Absent means in-process storage only.
    pub kv_url: Option<String>,
    /// Symmetric key for token envelopes, hex or base64, 32 bytes decoded.
    pub encryption_key: String,
    /// Default outbound proxy for accounts without their own.
    pub proxy: Option<String>,
    pub endpoints: ProviderEndpoints,
    /// `anthropic-version` injected on Claude upstream calls.
    pub anthropic_version: String,
    /// Optional `anthropic-beta` injected on Claude upstream calls.
    pub anthropic_beta: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
    /// Cap on concurrently served downstream requests.
    pub max_connections: usize,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub kv_url: Option<String>,
    pub encryption_key: Option<String>,
    pub proxy: Option<String>,
    pub endpoints: Option<ProviderEndpoints>,
    pub anthropic_version: Option<String>,
    pub anthropic_beta: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub stream_idle_timeout_secs: Option<u64>,
    pub max_connections: Option<usize>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.kv_url.is_some() {
            self.kv_url = other.kv_url;
        }
        if other.encryption_key.is_some() {
            self.encryption_key = other.encryption_key;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.endpoints.is_some() {
            self.endpoints = other.endpoints;
        }
        if other.anthropic_version.is_some() {
            self.anthropic_version = other.anthropic_version;
        }
        if other.anthropic_beta.is_some() {
            self.anthropic_beta = other.anthropic_beta;
        }
        if other.connect_timeout_secs.is_some() {
            self.connect_timeout_secs = other.connect_timeout_secs;
        }
        if other.request_timeout_secs.is_some() {
            self.request_timeout_secs = other.request_timeout_secs;
        }
        if other.stream_idle_timeout_secs.is_some() {
            self.stream_idle_timeout_secs = other.stream_idle_timeout_secs;
        }
        if other.max_connections.is_some() {
            self.max_connections = other.max_connections;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8742),
            kv_url: self.kv_url,
            encryption_key: self
                .encryption_key
                .ok_or(GlobalConfigError::MissingField("encryption_key"))?,
            proxy: self.proxy,
            endpoints: self.endpoints.unwrap_or_default(),
            anthropic_version: self
                .anthropic_version
                .unwrap_or_else(|| "2023-06-01".to_string()),
            anthropic_beta: self.anthropic_beta,
            connect_timeout_secs: self.connect_timeout_secs.unwrap_or(5),
            request_timeout_secs: self.request_timeout_secs.unwrap_or(300),
            stream_idle_timeout_secs: self.stream_idle_timeout_secs.unwrap_or(60),
            max_connections: self.max_connections.unwrap_or(1000),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            kv_url: value.kv_url,
            encryption_key: Some(value.encryption_key),
            proxy: value.proxy,
            endpoints: Some(value.endpoints),
            anthropic_version: Some(value.anthropic_version),
            anthropic_beta: value.anthropic_beta,
            connect_timeout_secs: Some(value.connect_timeout_secs),
            request_timeout_secs: Some(value.request_timeout_secs),
            stream_idle_timeout_secs: Some(value.stream_idle_timeout_secs),
            max_connections: Some(value.max_connections),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_keeps_base_when_other_is_empty() {
        let mut base = GlobalConfigPatch {
            host: Some("127.0.0.1".to_string()),
            encryption_key: Some("k".repeat(64)),
            ..Default::default()
        };
        base.overlay(GlobalConfigPatch::default());
        let config = base.into_config().unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8742);
        assert_eq!(config.request_timeout_secs, 300);
    }

    #[test]
    fn missing_encryption_key_is_an_error() {
        let err = GlobalConfigPatch::default().into_config().unwrap_err();
        assert!(matches!(err, GlobalConfigError::MissingField("encryption_key")));
    }
}
