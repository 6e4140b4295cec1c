//! Anthropic ↔ OpenAI envelope shim.
//!
//! Purely syntactic: role mapping, content-part conversion, usage field
//! renames, and stream-frame reshaping. No request content is invented or
//! dropped beyond what the target envelope cannot express.

use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use crate::sse::{SseEvent, encode_event};

const DEFAULT_MAX_TOKENS: u64 = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ShimError {
    #[error("invalid request body: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: Option<u64>,
    temperature: Option<f64>,
    top_p: Option<f64>,
    stream: Option<bool>,
    stop: Option<JsonValue>,
    tools: Option<Vec<JsonValue>>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: JsonValue,
    tool_calls: Option<Vec<JsonValue>>,
    tool_call_id: Option<String>,
}

/// OpenAI chat-completions request body → Anthropic messages request body.
pub fn chat_request_to_messages(body: &[u8]) -> Result<JsonValue, ShimError> {
    let request: ChatRequest =
        serde_json::from_slice(body).map_err(|err| ShimError::InvalidRequest(err.to_string()))?;

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<JsonValue> = Vec::new();

    for message in &request.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                let text = text_of(&message.content);
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "user" | "assistant" => {
                let content = content_parts(&message.content, message.tool_calls.as_deref());
                messages.push(json!({ "role": message.role, "content": content }));
            }
            "tool" => {
                let Some(tool_call_id) = &message.tool_call_id else {
                    continue;
                };
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": tool_call_id,
                        "content": text_of(&message.content),
                    }]
                }));
            }
            _ => {}
        }
    }

    if messages.is_empty() {
        return Err(ShimError::InvalidRequest(
            "no user or assistant messages".to_string(),
        ));
    }

    let mut out = json!({
        "model": request.model,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if !system_parts.is_empty() {
        out["system"] = JsonValue::String(system_parts.join("\n\n"));
    }
    if let Some(temperature) = request.temperature {
        out["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        out["top_p"] = json!(top_p);
    }
    if let Some(stream) = request.stream {
        out["stream"] = json!(stream);
    }
    if let Some(stop) = &request.stop {
        out["stop_sequences"] = match stop {
            JsonValue::String(s) => json!([s]),
            other => other.clone(),
        };
    }
    if let Some(tools) = request.tools {
        let mapped: Vec<JsonValue> = tools.into_iter().map(tool_to_anthropic).collect();
        out["tools"] = JsonValue::Array(mapped);
    }
    Ok(out)
}

/// Anthropic messages response body → OpenAI chat-completions body.
pub fn messages_response_to_chat(body: &[u8], created_at_secs: i64) -> Option<JsonValue> {
    let response: JsonValue = serde_json::from_slice(body).ok()?;
    let model = response.get("model")?.as_str().unwrap_or_default();
    let id = response
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or("msg");

    let mut text = String::new();
    let mut tool_calls: Vec<JsonValue> = Vec::new();
    if let Some(parts) = response.get("content").and_then(|c| c.as_array()) {
        for part in parts {
            match part.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                        text.push_str(t);
                    }
                }
                Some("tool_use") => {
                    tool_calls.push(json!({
                        "id": part.get("id").cloned().unwrap_or(JsonValue::Null),
                        "type": "function",
                        "function": {
                            "name": part.get("name").cloned().unwrap_or(JsonValue::Null),
                            "arguments": part
                                .get("input")
                                .map(|input| input.to_string())
                                .unwrap_or_else(|| "{}".to_string()),
                        }
                    }));
                }
                _ => {}
            }
        }
    }

    let finish_reason = finish_reason(
        response
            .get("stop_reason")
            .and_then(|r| r.as_str())
            .unwrap_or("end_turn"),
    );

    let usage = response.get("usage");
    let input = usage
        .and_then(|u| u.get("input_tokens"))
        .and_then(JsonValue::as_i64)
        .unwrap_or(0);
    let output = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(JsonValue::as_i64)
        .unwrap_or(0);

    let mut message = json!({ "role": "assistant", "content": text });
    if !tool_calls.is_empty() {
        message["tool_calls"] = JsonValue::Array(tool_calls);
    }

    Some(json!({
        "id": format!("chatcmpl-{id}"),
        "object": "chat.completion",
        "created": created_at_secs,
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": input,
            "completion_tokens": output,
            "total_tokens": input + output,
        }
    }))
}

fn finish_reason(stop_reason: &str) -> &'static str {
    match stop_reason {
        "tool_use" => "tool_calls",
        "max_tokens" => "length",
        _ => "stop",
    }
}

fn text_of(content: &JsonValue) -> String {
    match content {
        JsonValue::String(text) => text.clone(),
        JsonValue::Array(parts) => parts
            .iter()
            .filter_map(|part| {
                (part.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .then(|| part.get("text").and_then(|t| t.as_str()))
                    .flatten()
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn content_parts(content: &JsonValue, tool_calls: Option<&[JsonValue]>) -> Vec<JsonValue> {
    let mut out = Vec::new();
    match content {
        JsonValue::String(text) => {
            if !text.is_empty() {
                out.push(json!({ "type": "text", "text": text }));
            }
        }
        JsonValue::Array(parts) => {
            for part in parts {
                match part.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = part.get("text").and_then(|t| t.as_str())
                            && !text.is_empty()
                        {
                            out.push(json!({ "type": "text", "text": text }));
                        }
                    }
                    Some("image_url") => {
                        if let Some((media_type, data)) = part
                            .get("image_url")
                            .and_then(|u| u.get("url"))
                            .and_then(|u| u.as_str())
                            .and_then(data_url_parts)
                        {
                            out.push(json!({
                                "type": "image",
                                "source": {
                                    "type": "base64",
                                    "media_type": media_type,
                                    "data": data,
                                }
                            }));
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    if let Some(calls) = tool_calls {
        for call in calls {
            let arguments = call
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|a| a.as_str())
                .unwrap_or("{}");
            let input: JsonValue =
                serde_json::from_str(arguments).unwrap_or(JsonValue::Object(Default::default()));
            out.push(json!({
                "type": "tool_use",
                "id": call.get("id").cloned().unwrap_or(JsonValue::Null),
                "name": call
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .cloned()
                    .unwrap_or(JsonValue::Null),
                "input": input,
            }));
        }
    }

    if out.is_empty() {
        out.push(json!({ "type": "text", "text": "" }));
    }
    out
}

fn tool_to_anthropic(tool: JsonValue) -> JsonValue {
    let Some(function) = tool.get("function") else {
        return tool;
    };
    let mut out = serde_json::Map::new();
    out.insert(
        "name".to_string(),
        function.get("name").cloned().unwrap_or(JsonValue::Null),
    );
    if let Some(description) = function.get("description") {
        out.insert("description".to_string(), description.clone());
    }
    out.insert(
        "input_schema".to_string(),
        function
            .get("parameters")
            .cloned()
            .unwrap_or(JsonValue::Object(Default::default())),
    );
    JsonValue::Object(out)
}

fn data_url_parts(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let media_type = header.split(';').next().unwrap_or("image/png");
    Some((media_type.to_string(), data.to_string()))
}

/// Per-request translator from Anthropic stream events to OpenAI chunk
/// frames. Emits `[DONE]` after `message_stop`.
#[derive(Debug)]
pub struct ChatStreamShim {
    id: String,
    model: String,
    created: i64,
    sent_role: bool,
    finish_reason: Option<&'static str>,
}

impl ChatStreamShim {
    pub fn new(created_at_secs: i64) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: String::new(),
            created: created_at_secs,
            sent_role: false,
            finish_reason: None,
        }
    }

    /// Translate one upstream event into zero or more downstream frames.
    pub fn translate(&mut self, event: &SseEvent) -> Vec<bytes::Bytes> {
        let Ok(value) = serde_json::from_str::<JsonValue>(&event.data) else {
            return Vec::new();
        };
        match value.get("type").and_then(|t| t.as_str()) {
            Some("message_start") => {
                if let Some(model) = value
                    .get("message")
                    .and_then(|m| m.get("model"))
                    .and_then(|m| m.as_str())
                {
                    self.model = model.to_string();
                }
                self.sent_role = true;
                vec![self.chunk(json!({ "role": "assistant", "content": "" }), None)]
            }
            Some("content_block_delta") => {
                let Some(text) = value
                    .get("delta")
                    .and_then(|d| d.get("text"))
                    .and_then(|t| t.as_str())
                else {
                    return Vec::new();
                };
                let mut frames = Vec::new();
                if !self.sent_role {
                    self.sent_role = true;
                    frames.push(self.chunk(json!({ "role": "assistant", "content": "" }), None));
                }
                frames.push(self.chunk(json!({ "content": text }), None));
                frames
            }
            Some("message_delta") => {
                if let Some(stop_reason) = value
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|r| r.as_str())
                {
                    self.finish_reason = Some(finish_reason(stop_reason));
                }
                Vec::new()
            }
            Some("message_stop") => {
                let reason = self.finish_reason.unwrap_or("stop");
                vec![
                    self.chunk(json!({}), Some(reason)),
                    encode_event(None, "[DONE]"),
                ]
            }
            _ => Vec::new(),
        }
    }

    fn chunk(&self, delta: JsonValue, finish_reason: Option<&str>) -> bytes::Bytes {
        let frame = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        encode_event(None, &frame.to_string())
    }
}
