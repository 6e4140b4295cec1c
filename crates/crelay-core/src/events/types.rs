use serde::{Deserialize, Serialize};

use crate::account::AccountId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Request(RequestEvent),
    Operational(OperationalEvent),
}

/// One downstream request, emitted after the response status is known
/// (for streams: after the first byte, with usage following separately).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEvent {
    pub trace_id: String,
    pub at_ms: i64,
    pub api_key_id: String,
    pub account_id: Option<AccountId>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub endpoint: String,
    pub status: u16,
    pub duration_ms: i64,
    pub is_stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationalEvent {
    CooldownStart {
        account_id: AccountId,
        reason: String,
        until_ms: i64,
    },
    CooldownEnd {
        account_id: AccountId,
    },
    TokenRefreshed {
        account_id: AccountId,
        expires_at_ms: i64,
    },
    AccountUnauthorized {
        account_id: AccountId,
    },
}

impl Event {
    pub fn to_log_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
