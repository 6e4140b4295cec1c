use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::Router;
use axum::body::Body;
use axum::extract::{Extension, Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{Value as JsonValue, json};
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crelay_core::{
    ApiKeyRecord, ApiKeyService, AuthFailure, ErrorKind, Metrics, ProviderFamily, RelayCall,
    RelayEngine, RelayError, RelayResponse, UpstreamBody, daily_rollups, fingerprint_request,
};
use crelay_core::time_util::{date_of_ms, now_ms, now_secs};
use crelay_protocol::openai::{ChatStreamShim, chat_request_to_messages, messages_response_to_chat};
use crelay_protocol::sse::SseParser;
use crelay_store::Store;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Catalog the `/api/v1/models` listing filters against.
const KNOWN_MODELS: &[&str] = &[
    "claude-3-5-sonnet-20241022",
    "claude-3-5-haiku-20241022",
    "claude-3-opus-20240229",
    "gemini-2.0-flash",
    "gemini-1.5-pro",
];

#[derive(Clone)]
pub struct RouterState {
    pub engine: Arc<RelayEngine>,
    pub keys: Arc<ApiKeyService>,
    pub store: Store,
    pub metrics: Arc<Metrics>,
    pub max_connections: usize,
}

#[derive(Clone)]
struct RequestTraceId(String);

pub fn router(state: RouterState) -> Router {
    let authed = Router::new()
        .route("/api/v1/messages", post(claude_messages))
        .route("/claude/v1/messages", post(claude_messages))
        .route("/openai/claude/v1/messages", post(openai_messages))
        .route("/gemini/v1beta/{*rest}", post(gemini_passthrough))
        .route("/api/v1/models", get(list_models))
        .route("/api/v1/key-info", get(key_info))
        .route("/api/v1/usage", get(usage_report))
        .layer(middleware::from_fn_with_state(state.clone(), relay_auth))
        .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state.clone());

    Router::new()
        .merge(authed)
        .merge(crate::health::router(state))
}

/// Authenticate, strip downstream credentials, and tag the request with
/// a trace id before any handler runs.
async fn relay_auth(
    State(state): State<RouterState>,
    mut request: axum::extract::Request,
    next: Next,
) -> Response {
    let trace_id = uuid::Uuid::now_v7().to_string();
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let inflight = state.metrics.inflight.fetch_add(1, Ordering::Relaxed) + 1;
    if inflight > state.max_connections as i64 {
        state.metrics.inflight.fetch_sub(1, Ordering::Relaxed);
        let err = RelayError::new(ErrorKind::NoAccountAvailable, "connection limit reached")
            .with_retry_after(1);
        return error_response(&err, &trace_id);
    }

    let presented = extract_client_key(request.headers());
    // Defense-in-depth: never forward downstream auth material.
    request.headers_mut().remove(header::AUTHORIZATION);
    request.headers_mut().remove("x-api-key");

    let outcome = match presented {
        None => Err(RelayError::new(ErrorKind::AuthMissing, "missing credential header")),
        Some(plaintext) => state.keys.validate(&plaintext).await.map_err(|failure| {
            let kind = match failure {
                AuthFailure::Missing => ErrorKind::AuthMissing,
                AuthFailure::Invalid => ErrorKind::AuthInvalid,
                AuthFailure::Disabled => ErrorKind::KeyDisabled,
                AuthFailure::Expired => ErrorKind::KeyExpired,
            };
            RelayError::new(kind, "api key rejected")
        }),
    };

    let response = match outcome {
        Ok(record) => {
            request.extensions_mut().insert(record);
            request
                .extensions_mut()
                .insert(RequestTraceId(trace_id.clone()));
            next.run(request).await
        }
        Err(err) => {
            info!(event = "auth.rejected", trace_id = %trace_id, kind = %err.kind.as_str());
            state.metrics.observe_status(err.status().as_u16());
            error_response(&err, &trace_id)
        }
    };

    state.metrics.inflight.fetch_sub(1, Ordering::Relaxed);
    response
}

fn extract_client_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let prefix = "Bearer ";
    if auth.len() > prefix.len() && auth[..prefix.len()].eq_ignore_ascii_case(prefix) {
        let token = auth[prefix.len()..].trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    None
}

// ---- Claude-native messages ----

async fn claude_messages(
    State(state): State<RouterState>,
    Extension(key): Extension<ApiKeyRecord>,
    Extension(trace): Extension<RequestTraceId>,
    body: Bytes,
) -> Response {
    let Ok(parsed) = serde_json::from_slice::<JsonValue>(&body) else {
        return error_response(&RelayError::bad_request("malformed JSON body"), &trace.0);
    };
    let Some(model) = parsed.get("model").and_then(|m| m.as_str()).map(String::from) else {
        return error_response(&RelayError::bad_request("missing model"), &trace.0);
    };
    let want_stream = parsed
        .get("stream")
        .and_then(|s| s.as_bool())
        .unwrap_or(false);
    let fingerprint = fingerprint_request(&parsed);

    let call = RelayCall {
        trace_id: trace.0.clone(),
        key,
        family: ProviderFamily::Claude,
        upstream_path: "/v1/messages".to_string(),
        client_endpoint: "/api/v1/messages".to_string(),
        model,
        body,
        want_stream,
        fingerprint,
    };
    match state.engine.handle(call).await {
        Ok(response) => relay_to_axum(response, &trace.0),
        Err(err) => error_response(&err, &trace.0),
    }
}

// ---- OpenAI-shaped messages ----

async fn openai_messages(
    State(state): State<RouterState>,
    Extension(key): Extension<ApiKeyRecord>,
    Extension(trace): Extension<RequestTraceId>,
    body: Bytes,
) -> Response {
    let translated = match chat_request_to_messages(&body) {
        Ok(translated) => translated,
        Err(err) => return error_response(&RelayError::bad_request(err.to_string()), &trace.0),
    };
    let Some(model) = translated
        .get("model")
        .and_then(|m| m.as_str())
        .map(String::from)
    else {
        return error_response(&RelayError::bad_request("missing model"), &trace.0);
    };
    let want_stream = translated
        .get("stream")
        .and_then(|s| s.as_bool())
        .unwrap_or(false);
    let fingerprint = fingerprint_request(&translated);
    let anthropic_body = Bytes::from(translated.to_string());

    let call = RelayCall {
        trace_id: trace.0.clone(),
        key,
        family: ProviderFamily::Claude,
        upstream_path: "/v1/messages".to_string(),
        client_endpoint: "/openai/claude/v1/messages".to_string(),
        model,
        body: anthropic_body,
        want_stream,
        fingerprint,
    };

    let response = match state.engine.handle(call).await {
        Ok(response) => response,
        Err(err) => return error_response(&err, &trace.0),
    };

    if !(200..300).contains(&response.status) {
        return relay_to_axum(response, &trace.0);
    }

    match response.body {
        UpstreamBody::Bytes(bytes) => {
            let Some(chat) = messages_response_to_chat(&bytes, now_secs()) else {
                let err = RelayError::new(ErrorKind::UpstreamError, "unparseable upstream body");
                return error_response(&err, &trace.0);
            };
            let mut out = Response::new(Body::from(chat.to_string()));
            *out.status_mut() = StatusCode::OK;
            out.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            copy_relay_headers(&response.headers, &mut out);
            tag_trace(&mut out, &trace.0);
            out
        }
        UpstreamBody::Stream(mut rx_up) => {
            // Translate Anthropic frames into OpenAI chunks on the fly.
            let (tx_down, rx_down) = tokio::sync::mpsc::channel::<Bytes>(32);
            let created = now_secs();
            tokio::spawn(async move {
                let mut parser = SseParser::new();
                let mut shim = ChatStreamShim::new(created);
                while let Some(chunk) = rx_up.recv().await {
                    for event in parser.push_bytes(&chunk) {
                        for frame in shim.translate(&event) {
                            if tx_down.send(frame).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                for event in parser.finish() {
                    for frame in shim.translate(&event) {
                        if tx_down.send(frame).await.is_err() {
                            return;
                        }
                    }
                }
            });

            let stream = ReceiverStream::new(rx_down).map(Ok::<_, Infallible>);
            let mut out = Response::new(Body::from_stream(stream));
            *out.status_mut() = StatusCode::OK;
            out.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
            sse_no_buffering(&mut out);
            copy_relay_headers(&response.headers, &mut out);
            tag_trace(&mut out, &trace.0);
            out
        }
    }
}

// ---- Gemini passthrough ----

async fn gemini_passthrough(
    State(state): State<RouterState>,
    Extension(key): Extension<ApiKeyRecord>,
    Extension(trace): Extension<RequestTraceId>,
    Path(rest): Path<String>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let rest = rest.trim_start_matches('/');
    let Some((model, action)) = parse_gemini_target(rest) else {
        return error_response(
            &RelayError::bad_request("expected models/{model}:{action}"),
            &trace.0,
        );
    };
    let want_stream = action == "streamGenerateContent"
        || query
            .as_deref()
            .is_some_and(|q| q.contains("alt=sse"));

    let upstream_path = match &query {
        Some(q) => format!("/v1beta/{rest}?{q}"),
        None => format!("/v1beta/{rest}"),
    };

    let call = RelayCall {
        trace_id: trace.0.clone(),
        key,
        family: ProviderFamily::Gemini,
        upstream_path,
        client_endpoint: "/gemini/v1beta".to_string(),
        model,
        body,
        want_stream,
        fingerprint: None,
    };
    match state.engine.handle(call).await {
        Ok(response) => relay_to_axum(response, &trace.0),
        Err(err) => error_response(&err, &trace.0),
    }
}

fn parse_gemini_target(rest: &str) -> Option<(String, String)> {
    let after = rest.strip_prefix("models/")?;
    let (model, action) = after.split_once(':')?;
    if model.is_empty() || action.is_empty() {
        return None;
    }
    Some((model.to_string(), action.to_string()))
}

// ---- Key-scoped listings ----

async fn list_models(Extension(key): Extension<ApiKeyRecord>) -> Response {
    let data: Vec<JsonValue> = KNOWN_MODELS
        .iter()
        .filter(|model| key.model_allowed(model))
        .map(|model| json!({ "type": "model", "id": model }))
        .collect();
    axum::Json(json!({ "data": data, "has_more": false })).into_response()
}

async fn key_info(
    State(state): State<RouterState>,
    Extension(key): Extension<ApiKeyRecord>,
) -> Response {
    let date = date_of_ms(now_ms());
    let rollups = daily_rollups(&state.store, &date, &key.id)
        .await
        .unwrap_or_default();
    let (tokens_today, cost_today): (i64, i64) = rollups
        .iter()
        .fold((0, 0), |(t, c), r| (t + r.total_tokens, c + r.cost_micros));

    axum::Json(json!({
        "id": key.id,
        "name": key.display_name,
        "state": key.state,
        "quotas": key.quotas,
        "daily_cost_limit_micros": key.daily_cost_limit_micros,
        "allowed_model_patterns": key.allowed_model_patterns,
        "overdrawn": key.overdrawn,
        "created_at_ms": key.created_at_ms,
        "expires_at_ms": key.expires_at_ms,
        "usage_today": {
            "date": date,
            "total_tokens": tokens_today,
            "cost_micros": cost_today,
        },
    }))
    .into_response()
}

#[derive(Debug, serde::Deserialize, Default)]
struct UsageQuery {
    date: Option<String>,
}

async fn usage_report(
    State(state): State<RouterState>,
    Extension(key): Extension<ApiKeyRecord>,
    RawQuery(query): RawQuery,
) -> Response {
    let params: UsageQuery = query
        .as_deref()
        .and_then(|q| serde_urlencoded::from_str(q).ok())
        .unwrap_or_default();
    let date = params.date.unwrap_or_else(|| date_of_ms(now_ms()));
    match daily_rollups(&state.store, &date, &key.id).await {
        Ok(rollups) => axum::Json(json!({ "date": date, "models": rollups })).into_response(),
        Err(err) => error_response(&RelayError::internal(err.to_string()), ""),
    }
}

// ---- Response plumbing ----

fn relay_to_axum(response: RelayResponse, trace_id: &str) -> Response {
    let is_sse = response
        .headers
        .iter()
        .any(|(name, value)| {
            name.eq_ignore_ascii_case("content-type")
                && value.to_ascii_lowercase().contains("text/event-stream")
        });

    let mut out = match response.body {
        UpstreamBody::Bytes(bytes) => Response::new(Body::from(bytes)),
        UpstreamBody::Stream(rx) => {
            let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
            Response::new(Body::from_stream(stream))
        }
    };
    *out.status_mut() =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    for (name, value) in &response.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            out.headers_mut().append(name, value);
        }
    }
    if is_sse {
        sse_no_buffering(&mut out);
    }
    tag_trace(&mut out, trace_id);
    out
}

fn error_response(err: &RelayError, trace_id: &str) -> Response {
    let mut out = Response::new(Body::from(err.body()));
    *out.status_mut() = err.status();
    out.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let Some(seconds) = err.retry_after
        && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
    {
        out.headers_mut().insert(header::RETRY_AFTER, value);
    }
    tag_trace(&mut out, trace_id);
    out
}

/// Keep intermediaries from buffering event streams.
fn sse_no_buffering(response: &mut Response) {
    response
        .headers_mut()
        .entry(header::CACHE_CONTROL)
        .or_insert(HeaderValue::from_static("no-cache"));
    response
        .headers_mut()
        .entry(HeaderName::from_static("x-accel-buffering"))
        .or_insert(HeaderValue::from_static("no"));
}

fn copy_relay_headers(headers: &[(String, String)], out: &mut Response) {
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("x-relay-account-id")
            || name.eq_ignore_ascii_case("x-relay-session")
        {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                out.headers_mut().insert(name, value);
            }
        }
    }
}

fn tag_trace(response: &mut Response, trace_id: &str) {
    if trace_id.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-relay-request-id"), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_targets_parse_model_and_action() {
        assert_eq!(
            parse_gemini_target("models/gemini-2.0-flash:generateContent"),
            Some(("gemini-2.0-flash".to_string(), "generateContent".to_string()))
        );
        assert_eq!(
            parse_gemini_target("models/gemini-2.0-flash:streamGenerateContent"),
            Some((
                "gemini-2.0-flash".to_string(),
                "streamGenerateContent".to_string()
            ))
        );
        assert!(parse_gemini_target("other/path").is_none());
        assert!(parse_gemini_target("models/no-action").is_none());
    }

    #[test]
    fn client_key_extraction_prefers_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("cr_abc"));
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer cr_other"),
        );
        assert_eq!(extract_client_key(&headers).as_deref(), Some("cr_abc"));

        let mut bearer_only = HeaderMap::new();
        bearer_only.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("bearer cr_lower"),
        );
        assert_eq!(extract_client_key(&bearer_only).as_deref(), Some("cr_lower"));
        assert_eq!(extract_client_key(&HeaderMap::new()), None);
    }
}
