use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crelay_common::TokenCipher;
use crelay_common::config::ProviderEndpoints;
use crelay_core::time_util::{date_of_ms, now_ms};
use crelay_core::{
    AccountDirectory, AccountRepo, AccountStatus, AccountingBus, ApiKeyService, BreakerRegistry,
    CooldownQueue, CredentialMaterial, EngineOptions, EventHub, HttpClientConfig,
    HttpUpstreamClient, IssueKeySpec, KeyQuotas, Metrics, NewAccount, OAuthManager, PricingTable,
    Provider, RateLimiter, RelayEngine, Scheduler,
};
use crelay_router::RouterState;
use crelay_store::{Store, keys};

const SSE_BODY: &str = concat!(
    "event: message_start\n",
    "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-3-5-sonnet\",\"usage\":{\"input_tokens\":12,\"output_tokens\":1,\"cache_creation_input_tokens\":0,\"cache_read_input_tokens\":4}}}\n",
    "\n",
    "event: content_block_delta\n",
    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n",
    "\n",
    "event: message_delta\n",
    "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":30}}\n",
    "\n",
    "event: message_stop\n",
    "data: {\"type\":\"message_stop\"}\n",
    "\n",
);

#[derive(Clone, Copy, PartialEq, Eq)]
enum UpstreamMode {
    StreamOk,
    RateLimited,
    SlowStream,
}

#[derive(Clone)]
struct UpstreamState {
    mode: UpstreamMode,
    hits: Arc<AtomicUsize>,
    last_auth: Arc<std::sync::Mutex<Option<String>>>,
}

async fn upstream_handler(
    State(state): State<UpstreamState>,
    headers: HeaderMap,
    _body: Bytes,
) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let auth = headers
        .get(header::AUTHORIZATION)
        .or_else(|| headers.get("x-api-key"))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    *state.last_auth.lock().unwrap() = auth;

    match state.mode {
        UpstreamMode::StreamOk => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/event-stream")],
            SSE_BODY,
        )
            .into_response(),
        UpstreamMode::RateLimited => (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "120")],
            "{\"type\":\"error\",\"error\":{\"type\":\"rate_limit_error\"}}",
        )
            .into_response(),
        UpstreamMode::SlowStream => {
            let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(4);
            tokio::spawn(async move {
                let start = Bytes::from_static(
                    b"event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-3-5-sonnet\",\"usage\":{\"input_tokens\":7,\"output_tokens\":1}}}\n\n",
                );
                if tx.send(start).await.is_err() {
                    return;
                }
                loop {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let ping =
                        Bytes::from_static(b"event: ping\ndata: {\"type\":\"ping\"}\n\n");
                    if tx.send(ping).await.is_err() {
                        return;
                    }
                }
            });
            let stream = ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(stream),
            )
                .into_response()
        }
    }
}

async fn spawn_upstream(mode: UpstreamMode) -> (String, UpstreamState) {
    let state = UpstreamState {
        mode,
        hits: Arc::new(AtomicUsize::new(0)),
        last_auth: Arc::new(std::sync::Mutex::new(None)),
    };
    let app = Router::new()
        .route("/v1/messages", post(upstream_handler))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

async fn token_endpoint(State(hits): State<Arc<AtomicUsize>>) -> Response {
    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
    axum::Json(serde_json::json!({
        "access_token": format!("rotated-{n}"),
        "refresh_token": format!("refresh-{n}"),
        "expires_in": 3600,
    }))
    .into_response()
}

async fn spawn_token_endpoint() -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/v1/oauth/token", post(token_endpoint))
        .with_state(hits.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/v1/oauth/token"), hits)
}

struct Stack {
    base_url: String,
    store: Store,
    repo: Arc<AccountRepo>,
    keys: Arc<ApiKeyService>,
    directory: Arc<AccountDirectory>,
    _accounting: AccountingBus,
}

async fn spawn_stack(claude_base: &str, token_url: &str) -> Stack {
    let store = Store::memory_only();
    let cipher = Arc::new(TokenCipher::from_encoded(&"ab".repeat(32)).unwrap());
    let events = EventHub::new(256);
    let metrics = Arc::new(Metrics::new());
    let repo = Arc::new(AccountRepo::new(store.clone(), cipher.clone()));
    let client = Arc::new(HttpUpstreamClient::new(HttpClientConfig {
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(10),
        stream_idle_timeout: Duration::from_secs(5),
        stream_total_timeout: Duration::from_secs(30),
    }));
    let oauth = Arc::new(OAuthManager::new(
        repo.clone(),
        store.clone(),
        cipher,
        client.clone(),
        token_url.to_string(),
        None,
        events.clone(),
        metrics.clone(),
    ));
    let limiter = Arc::new(RateLimiter::new(store.clone(), Duration::from_secs(10)));
    let breakers = Arc::new(BreakerRegistry::new());
    let directory = AccountDirectory::load(repo.clone()).await;
    directory.spawn_refresh(&store);
    let cooldowns = CooldownQueue::new();
    cooldowns
        .clone()
        .spawn_recover_task(repo.clone(), events.clone());
    let scheduler = Arc::new(Scheduler::new(
        directory.clone(),
        repo.clone(),
        limiter.clone(),
        breakers.clone(),
        cooldowns,
        store.clone(),
        events.clone(),
    ));
    let accounting = AccountingBus::spawn(store.clone());
    let engine = Arc::new(RelayEngine::new(
        EngineOptions {
            max_attempts: 3,
            backoff_base: Duration::from_millis(20),
            endpoints: ProviderEndpoints {
                claude_oauth: claude_base.to_string(),
                claude_console: claude_base.to_string(),
                gemini: claude_base.to_string(),
                bedrock: claude_base.to_string(),
                claude_token_url: token_url.to_string(),
            },
            anthropic_version: "2023-06-01".to_string(),
            anthropic_beta: None,
            default_proxy: None,
        },
        scheduler,
        oauth,
        limiter,
        breakers,
        accounting.sink(),
        Arc::new(PricingTable::default_table()),
        client,
        metrics.clone(),
        events,
    ));
    let keys_service = ApiKeyService::new(store.clone());

    let app = crelay_router::router(RouterState {
        engine,
        keys: keys_service.clone(),
        store: store.clone(),
        metrics,
        max_connections: 100,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Stack {
        base_url: format!("http://{addr}"),
        store,
        repo,
        keys: keys_service,
        directory,
        _accounting: accounting,
    }
}

async fn add_account(stack: &Stack, expires_at_ms: i64) -> String {
    let view = stack
        .repo
        .create(NewAccount {
            provider: Provider::ClaudeOauth,
            name: None,
            material: CredentialMaterial::Oauth {
                access_token: "initial-token".to_string(),
                refresh_token: "rt-0".to_string(),
                expires_at_ms,
                scopes: Vec::new(),
                token_type: "Bearer".to_string(),
            },
            proxy: None,
            priority: 1,
            group_id: None,
            max_concurrent: 10,
            model_patterns: Vec::new(),
        })
        .await
        .unwrap();
    stack.directory.reload().await;
    view.id
}

async fn issue_key(stack: &Stack) -> String {
    stack
        .keys
        .issue(IssueKeySpec {
            display_name: "e2e".to_string(),
            quotas: KeyQuotas {
                tokens_per_window: 100_000,
                requests_per_window: 0,
                window_seconds: 60,
                max_concurrent: 5,
            },
            ..Default::default()
        })
        .await
        .unwrap()
        .plaintext
}

fn messages_body() -> serde_json::Value {
    serde_json::json!({
        "model": "claude-3-5-sonnet",
        "stream": true,
        "max_tokens": 64,
        "messages": [{"role": "user", "content": "hi"}]
    })
}

async fn wait_for<F, Fut>(mut check: F, budget: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn happy_path_streaming_commits_usage() {
    let (upstream_url, upstream) = spawn_upstream(UpstreamMode::StreamOk).await;
    let (token_url, _) = spawn_token_endpoint().await;
    let stack = spawn_stack(&upstream_url, &token_url).await;
    let account_id = add_account(&stack, now_ms() + 3_600_000).await;
    let plaintext = issue_key(&stack).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/api/v1/messages", stack.base_url))
        .header("x-api-key", &plaintext)
        .json(&messages_body())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.contains("text/event-stream"));
    assert_eq!(
        response
            .headers()
            .get("x-relay-account-id")
            .and_then(|v| v.to_str().ok()),
        Some(account_id.as_str())
    );
    let body = response.text().await.unwrap();
    assert!(body.contains("event: message_delta"));
    assert!(body.contains("event: message_stop"));
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);

    // Accounting lands asynchronously after the stream closes.
    let key_record = stack.keys.validate(&plaintext).await.unwrap();
    let date = date_of_ms(now_ms());
    let rollup_key = keys::daily_usage(&date, &key_record.id, "claude-3-5-sonnet");
    let store = stack.store.clone();
    assert!(
        wait_for(
            || {
                let store = store.clone();
                let rollup_key = rollup_key.clone();
                async move {
                    store
                        .hash_get_all(&rollup_key)
                        .await
                        .map(|fields| fields.get("requests").map(String::as_str) == Some("1"))
                        .unwrap_or(false)
                }
            },
            Duration::from_secs(3),
        )
        .await
    );
    let rollup = stack.store.hash_get_all(&rollup_key).await.unwrap();
    assert_eq!(rollup.get("input_tokens").unwrap(), "12");
    assert_eq!(rollup.get("output_tokens").unwrap(), "30");
    assert_eq!(rollup.get("cache_read_tokens").unwrap(), "4");
    assert_eq!(rollup.get("total_tokens").unwrap(), "46");

    // Lease returned: the account's inflight counter is back to zero.
    let inflight = stack
        .store
        .get(&keys::inflight_account(&account_id))
        .await
        .unwrap();
    assert_eq!(inflight.as_deref(), Some("0"));
}

#[tokio::test]
async fn expired_token_refreshes_once_and_streams() {
    let (upstream_url, upstream) = spawn_upstream(UpstreamMode::StreamOk).await;
    let (token_url, refreshes) = spawn_token_endpoint().await;
    let stack = spawn_stack(&upstream_url, &token_url).await;
    add_account(&stack, now_ms() - 1_000).await;
    let plaintext = issue_key(&stack).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/api/v1/messages", stack.base_url))
        .header("x-api-key", &plaintext)
        .json(&messages_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("message_stop"));

    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(
        upstream.last_auth.lock().unwrap().as_deref(),
        Some("Bearer rotated-1")
    );

    // The rotated envelope is persisted: a second request needs no
    // further refresh.
    let again = client
        .post(format!("{}/api/v1/messages", stack.base_url))
        .header("x-api-key", &plaintext)
        .json(&messages_body())
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 200);
    let _ = again.text().await;
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalid_key_is_rejected_before_any_upstream_call() {
    let (upstream_url, upstream) = spawn_upstream(UpstreamMode::StreamOk).await;
    let (token_url, _) = spawn_token_endpoint().await;
    let stack = spawn_stack(&upstream_url, &token_url).await;
    add_account(&stack, now_ms() + 3_600_000).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/api/v1/messages", stack.base_url))
        .header("x-api-key", "cr_INVALID")
        .json(&messages_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "AuthInvalid");
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn upstream_429_passes_through_and_cools_the_account() {
    let (upstream_url, _upstream) = spawn_upstream(UpstreamMode::RateLimited).await;
    let (token_url, _) = spawn_token_endpoint().await;
    let stack = spawn_stack(&upstream_url, &token_url).await;
    let account_id = add_account(&stack, now_ms() + 3_600_000).await;
    let plaintext = issue_key(&stack).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/api/v1/messages", stack.base_url))
        .header("x-api-key", &plaintext)
        .json(&messages_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);
    assert_eq!(
        response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok()),
        Some("120")
    );

    let account = stack.repo.get(&account_id).await.unwrap().unwrap();
    assert_eq!(account.status, AccountStatus::RateLimited);
    let remaining = account.cooldown_until_ms - now_ms();
    assert!((100_000..=121_000).contains(&remaining), "cooldown {remaining}ms");

    // The only account is cooling down: next request gets 503 with a hint.
    stack.directory.reload().await;
    let next = client
        .post(format!("{}/api/v1/messages", stack.base_url))
        .header("x-api-key", &plaintext)
        .json(&messages_body())
        .send()
        .await
        .unwrap();
    assert_eq!(next.status(), 503);
    let hint: u64 = next
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap();
    assert!((1..=60).contains(&hint));
    let body: serde_json::Value = next.json().await.unwrap();
    assert_eq!(body["error"], "NoAccountAvailable");
}

#[tokio::test]
async fn identical_openings_stick_to_one_account() {
    let (upstream_url, _upstream) = spawn_upstream(UpstreamMode::StreamOk).await;
    let (token_url, _) = spawn_token_endpoint().await;
    let stack = spawn_stack(&upstream_url, &token_url).await;
    add_account(&stack, now_ms() + 3_600_000).await;
    add_account(&stack, now_ms() + 3_600_000).await;
    let plaintext = issue_key(&stack).await;

    let client = reqwest::Client::new();
    let mut seen = Vec::new();
    for _ in 0..2 {
        let response = client
            .post(format!("{}/api/v1/messages", stack.base_url))
            .header("x-api-key", &plaintext)
            .json(&messages_body())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        seen.push(
            response
                .headers()
                .get("x-relay-account-id")
                .and_then(|v| v.to_str().ok())
                .unwrap()
                .to_string(),
        );
        let _ = response.text().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert_eq!(seen[0], seen[1]);
}

#[tokio::test]
async fn client_disconnect_commits_partial_usage_and_frees_the_slot() {
    let (upstream_url, _upstream) = spawn_upstream(UpstreamMode::SlowStream).await;
    let (token_url, _) = spawn_token_endpoint().await;
    let stack = spawn_stack(&upstream_url, &token_url).await;
    let account_id = add_account(&stack, now_ms() + 3_600_000).await;
    let plaintext = issue_key(&stack).await;

    let mut usage_events = stack.store.subscribe();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/api/v1/messages", stack.base_url))
        .header("x-api-key", &plaintext)
        .json(&messages_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let mut stream = response.bytes_stream();
    let first = stream.next().await.unwrap().unwrap();
    assert!(!first.is_empty());
    // Hang up mid-stream.
    drop(stream);

    // The worker notices within the cancellation budget and gives the
    // slot back.
    let store = stack.store.clone();
    let inflight_key = keys::inflight_account(&account_id);
    assert!(
        wait_for(
            || {
                let store = store.clone();
                let inflight_key = inflight_key.clone();
                async move {
                    matches!(
                        store.get(&inflight_key).await,
                        Ok(Some(value)) if value == "0"
                    )
                }
            },
            Duration::from_secs(5),
        )
        .await
    );

    // A usage event was committed with the disconnect flag.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut found = false;
    while tokio::time::Instant::now() < deadline {
        let message = tokio::time::timeout(Duration::from_secs(1), usage_events.recv()).await;
        let Ok(Ok(message)) = message else {
            continue;
        };
        if message.channel != keys::USAGE_CHANNEL {
            continue;
        }
        let record: serde_json::Value = serde_json::from_str(&message.payload).unwrap();
        if record["client_disconnect"] == true {
            assert_eq!(record["input_tokens"], 7);
            found = true;
            break;
        }
    }
    assert!(found, "no client_disconnect usage event observed");
}
