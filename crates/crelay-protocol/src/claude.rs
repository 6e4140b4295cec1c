//! Usage extraction from provider responses, streaming and buffered.

use serde_json::Value as JsonValue;

use crate::sse::SseEvent;

/// Token counts reported by an upstream for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageCounts {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    /// Model echoed by the upstream, when it reports one.
    pub model: Option<String>,
}

impl UsageCounts {
    pub fn total_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens() == 0
    }
}

/// Usage from a buffered (non-streaming) Anthropic-shaped JSON body.
pub fn usage_from_body(body: &[u8]) -> Option<UsageCounts> {
    let value: JsonValue = serde_json::from_slice(body).ok()?;
    let usage = value.get("usage")?;
    let mut counts = counts_from_usage_value(usage)?;
    if counts.model.is_none() {
        counts.model = value
            .get("model")
            .and_then(|m| m.as_str())
            .map(|m| m.to_string());
    }
    Some(counts)
}

/// Usage from a buffered Gemini `generateContent` response
/// (`usageMetadata` counters mapped onto the common shape).
pub fn usage_from_gemini_body(body: &[u8]) -> Option<UsageCounts> {
    let value: JsonValue = serde_json::from_slice(body).ok()?;
    gemini_usage_from_value(&value)
}

fn gemini_usage_from_value(value: &JsonValue) -> Option<UsageCounts> {
    let usage = value.get("usageMetadata")?;
    let prompt = usage.get("promptTokenCount").and_then(JsonValue::as_i64);
    let candidates = usage
        .get("candidatesTokenCount")
        .and_then(JsonValue::as_i64);
    if prompt.is_none() && candidates.is_none() {
        return None;
    }
    Some(UsageCounts {
        input_tokens: prompt.unwrap_or(0),
        output_tokens: candidates.unwrap_or(0),
        cache_creation_tokens: 0,
        cache_read_tokens: usage
            .get("cachedContentTokenCount")
            .and_then(JsonValue::as_i64)
            .unwrap_or(0),
        model: value
            .get("modelVersion")
            .and_then(|m| m.as_str())
            .map(|m| m.to_string()),
    })
}

fn counts_from_usage_value(usage: &JsonValue) -> Option<UsageCounts> {
    let input = usage.get("input_tokens").and_then(JsonValue::as_i64);
    let output = usage.get("output_tokens").and_then(JsonValue::as_i64);
    if input.is_none() && output.is_none() {
        return None;
    }
    Some(UsageCounts {
        input_tokens: input.unwrap_or(0),
        output_tokens: output.unwrap_or(0),
        cache_creation_tokens: usage
            .get("cache_creation_input_tokens")
            .and_then(JsonValue::as_i64)
            .unwrap_or(0),
        cache_read_tokens: usage
            .get("cache_read_input_tokens")
            .and_then(JsonValue::as_i64)
            .unwrap_or(0),
        model: None,
    })
}

/// Accumulates usage across a streamed response.
///
/// Anthropic streams report input-side counts on `message_start` and
/// cumulative output counts on `message_delta`; Gemini repeats
/// `usageMetadata` in its chunks. Later values replace earlier ones
/// field-by-field, so the meter ends at the upstream's final word.
#[derive(Debug, Default)]
pub struct StreamUsageMeter {
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    cache_creation_tokens: Option<i64>,
    cache_read_tokens: Option<i64>,
    model: Option<String>,
    saw_message_stop: bool,
}

impl StreamUsageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the stream's terminator event has been observed.
    pub fn completed(&self) -> bool {
        self.saw_message_stop
    }

    pub fn observe(&mut self, event: &SseEvent) {
        if event.event.as_deref() == Some("message_stop") {
            self.saw_message_stop = true;
        }
        if event.data.is_empty() || event.data == "[DONE]" {
            return;
        }
        let Ok(value) = serde_json::from_str::<JsonValue>(&event.data) else {
            return;
        };
        if value.get("type").and_then(|t| t.as_str()) == Some("message_stop") {
            self.saw_message_stop = true;
        }

        if let Some(message) = value.get("message") {
            if let Some(model) = message.get("model").and_then(|m| m.as_str()) {
                self.model = Some(model.to_string());
            }
            if let Some(usage) = message.get("usage") {
                self.merge_usage(usage);
            }
        }
        if let Some(usage) = value.get("usage") {
            self.merge_usage(usage);
        }
        if let Some(gemini) = gemini_usage_from_value(&value) {
            self.input_tokens = Some(gemini.input_tokens);
            self.output_tokens = Some(gemini.output_tokens);
            self.cache_read_tokens = Some(gemini.cache_read_tokens);
            if gemini.model.is_some() {
                self.model = gemini.model;
            }
        }
    }

    fn merge_usage(&mut self, usage: &JsonValue) {
        if let Some(v) = usage.get("input_tokens").and_then(JsonValue::as_i64) {
            self.input_tokens = Some(v);
        }
        if let Some(v) = usage.get("output_tokens").and_then(JsonValue::as_i64) {
            self.output_tokens = Some(v);
        }
        if let Some(v) = usage
            .get("cache_creation_input_tokens")
            .and_then(JsonValue::as_i64)
        {
            self.cache_creation_tokens = Some(v);
        }
        if let Some(v) = usage
            .get("cache_read_input_tokens")
            .and_then(JsonValue::as_i64)
        {
            self.cache_read_tokens = Some(v);
        }
    }

    /// Final counts, or `None` when no usage was ever reported.
    pub fn finish(self) -> Option<UsageCounts> {
        if self.input_tokens.is_none() && self.output_tokens.is_none() {
            return None;
        }
        Some(UsageCounts {
            input_tokens: self.input_tokens.unwrap_or(0),
            output_tokens: self.output_tokens.unwrap_or(0),
            cache_creation_tokens: self.cache_creation_tokens.unwrap_or(0),
            cache_read_tokens: self.cache_read_tokens.unwrap_or(0),
            model: self.model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, data: &str) -> SseEvent {
        SseEvent {
            event: Some(name.to_string()),
            data: data.to_string(),
        }
    }

    #[test]
    fn buffered_body_usage() {
        let body = br#"{
            "model": "claude-3-5-sonnet",
            "usage": {
                "input_tokens": 10,
                "output_tokens": 25,
                "cache_creation_input_tokens": 3,
                "cache_read_input_tokens": 7
            }
        }"#;
        let counts = usage_from_body(body).unwrap();
        assert_eq!(counts.input_tokens, 10);
        assert_eq!(counts.output_tokens, 25);
        assert_eq!(counts.cache_creation_tokens, 3);
        assert_eq!(counts.cache_read_tokens, 7);
        assert_eq!(counts.total_tokens(), 45);
        assert_eq!(counts.model.as_deref(), Some("claude-3-5-sonnet"));
    }

    #[test]
    fn stream_meter_takes_last_reported_values() {
        let mut meter = StreamUsageMeter::new();
        meter.observe(&event(
            "message_start",
            r#"{"type":"message_start","message":{"model":"claude-3-5-sonnet","usage":{"input_tokens":12,"cache_read_input_tokens":4,"output_tokens":1}}}"#,
        ));
        meter.observe(&event(
            "message_delta",
            r#"{"type":"message_delta","usage":{"output_tokens":9}}"#,
        ));
        meter.observe(&event(
            "message_delta",
            r#"{"type":"message_delta","usage":{"output_tokens":31}}"#,
        ));
        meter.observe(&event("message_stop", r#"{"type":"message_stop"}"#));
        assert!(meter.completed());
        let counts = meter.finish().unwrap();
        assert_eq!(counts.input_tokens, 12);
        assert_eq!(counts.output_tokens, 31);
        assert_eq!(counts.cache_read_tokens, 4);
        assert_eq!(counts.model.as_deref(), Some("claude-3-5-sonnet"));
    }

    #[test]
    fn meter_without_usage_reports_none() {
        let mut meter = StreamUsageMeter::new();
        meter.observe(&event("ping", r#"{"type":"ping"}"#));
        assert!(meter.finish().is_none());
    }

    #[test]
    fn gemini_usage_metadata_maps_onto_counts() {
        let body = br#"{
            "modelVersion": "gemini-2.0-flash",
            "usageMetadata": {
                "promptTokenCount": 8,
                "candidatesTokenCount": 20,
                "cachedContentTokenCount": 2
            }
        }"#;
        let counts = usage_from_gemini_body(body).unwrap();
        assert_eq!(counts.input_tokens, 8);
        assert_eq!(counts.output_tokens, 20);
        assert_eq!(counts.cache_read_tokens, 2);
        assert_eq!(counts.model.as_deref(), Some("gemini-2.0-flash"));
    }
}
