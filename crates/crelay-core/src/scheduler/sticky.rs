use std::time::Duration;

use crelay_common::crypto::sha256_hex;
use crelay_store::{Store, keys};
use serde_json::Value as JsonValue;
use tracing::warn;

pub const SESSION_TTL: Duration = Duration::from_secs(3600);

/// How much of each projected text contributes to the fingerprint.
const PROJECTION_PREFIX: usize = 256;

/// Stable fingerprint over a request: first system text plus the first
/// user message's leading text. Conversations that share an opening map
/// to the same account, preserving provider-side context.
pub fn fingerprint_request(body: &JsonValue) -> Option<String> {
    let mut projection = String::new();

    match body.get("system") {
        Some(JsonValue::String(text)) => push_prefix(&mut projection, text),
        Some(JsonValue::Array(parts)) => {
            if let Some(text) = parts.iter().find_map(|part| {
                part.get("text").and_then(|t| t.as_str())
            }) {
                push_prefix(&mut projection, text);
            }
        }
        _ => {}
    }
    projection.push('\u{1f}');

    let messages = body.get("messages")?.as_array()?;
    let first_user = messages
        .iter()
        .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"))?;
    match first_user.get("content") {
        Some(JsonValue::String(text)) => push_prefix(&mut projection, text),
        Some(JsonValue::Array(parts)) => {
            if let Some(text) = parts.iter().find_map(|part| {
                part.get("text").and_then(|t| t.as_str())
            }) {
                push_prefix(&mut projection, text);
            }
        }
        _ => return None,
    }

    if projection.len() <= 1 {
        return None;
    }
    Some(sha256_hex(projection.as_bytes()))
}

fn push_prefix(out: &mut String, text: &str) {
    let mut taken = 0;
    for ch in text.chars() {
        if taken >= PROJECTION_PREFIX {
            break;
        }
        out.push(ch);
        taken += 1;
    }
}

/// Fingerprint → account mapping with TTL refresh on every hit.
/// Last writer wins; per-session ordering is best-effort by design.
pub struct StickySessions {
    store: Store,
}

impl StickySessions {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn get(&self, fingerprint: &str) -> Option<String> {
        match self.store.get(&keys::session(fingerprint)).await {
            Ok(target) => target,
            Err(err) => {
                warn!(event = "sticky.get_failed", error = %err);
                None
            }
        }
    }

    pub async fn put(&self, fingerprint: &str, account_id: &str) {
        if let Err(err) = self
            .store
            .set(&keys::session(fingerprint), account_id, Some(SESSION_TTL))
            .await
        {
            warn!(event = "sticky.put_failed", error = %err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_openings_fingerprint_identically() {
        let a = json!({
            "system": "you are helpful",
            "messages": [{"role": "user", "content": "hello there"}]
        });
        let b = json!({
            "system": "you are helpful",
            "messages": [
                {"role": "user", "content": "hello there"},
                {"role": "assistant", "content": "hi"}
            ]
        });
        assert_eq!(fingerprint_request(&a), fingerprint_request(&b));
        assert!(fingerprint_request(&a).is_some());
    }

    #[test]
    fn different_user_text_changes_fingerprint() {
        let a = json!({ "messages": [{"role": "user", "content": "alpha"}] });
        let b = json!({ "messages": [{"role": "user", "content": "beta"}] });
        assert_ne!(fingerprint_request(&a), fingerprint_request(&b));
    }

    #[test]
    fn content_part_arrays_are_projected() {
        let body = json!({
            "messages": [{
                "role": "user",
                "content": [{"type": "text", "text": "from parts"}]
            }]
        });
        assert!(fingerprint_request(&body).is_some());
    }

    #[test]
    fn bodies_without_user_text_have_no_fingerprint() {
        assert!(fingerprint_request(&json!({"messages": []})).is_none());
        assert!(fingerprint_request(&json!({})).is_none());
    }
}
