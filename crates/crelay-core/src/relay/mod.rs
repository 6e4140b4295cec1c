use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crelay_common::config::ProviderEndpoints;
use crelay_protocol::{SseParser, StreamUsageMeter, UsageCounts, usage_from_body, usage_from_gemini_body};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::account::{AccountId, Provider, ProviderFamily};
use crate::apikey::ApiKeyRecord;
use crate::breaker::{BreakerRegistry, BreakerState};
use crate::error::{ErrorKind, RelayError};
use crate::events::{Event, EventHub, RequestEvent};
use crate::metrics::Metrics;
use crate::oauth::{OAuthManager, TokenError};
use crate::ratelimit::{Admission, RateLimiter};
use crate::scheduler::{Lease, Scheduler};
use crate::time_util::now_ms;
use crate::upstream::{
    Headers, UpstreamBody, UpstreamClient, UpstreamRequest, UpstreamResponse,
};
use crate::usage::{AccountingSink, PricingTable, UsageRecord};

/// Beta header Anthropic expects on OAuth-authenticated calls.
const OAUTH_BETA: &str = "oauth-2025-04-20";
const STREAM_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub endpoints: ProviderEndpoints,
    pub anthropic_version: String,
    pub anthropic_beta: Option<String>,
    pub default_proxy: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            endpoints: ProviderEndpoints::default(),
            anthropic_version: "2023-06-01".to_string(),
            anthropic_beta: None,
            default_proxy: None,
        }
    }
}

/// One relay invocation, already authenticated by the router.
#[derive(Debug)]
pub struct RelayCall {
    pub trace_id: String,
    pub key: ApiKeyRecord,
    pub family: ProviderFamily,
    /// Upstream path for providers that take one verbatim.
    pub upstream_path: String,
    /// Downstream endpoint, recorded in usage events.
    pub client_endpoint: String,
    pub model: String,
    pub body: Bytes,
    pub want_stream: bool,
    pub fingerprint: Option<String>,
}

#[derive(Debug)]
pub struct RelayResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

/// The request-dispatch engine: quota, account selection, token
/// freshness, the upstream dial, and usage commit — exactly once per
/// request on success, failure, and client cancel.
pub struct RelayEngine {
    options: EngineOptions,
    scheduler: Arc<Scheduler>,
    oauth: Arc<OAuthManager>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<BreakerRegistry>,
    accounting: AccountingSink,
    pricing: Arc<PricingTable>,
    client: Arc<dyn UpstreamClient>,
    metrics: Arc<Metrics>,
    events: EventHub,
}

impl RelayEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: EngineOptions,
        scheduler: Arc<Scheduler>,
        oauth: Arc<OAuthManager>,
        limiter: Arc<RateLimiter>,
        breakers: Arc<BreakerRegistry>,
        accounting: AccountingSink,
        pricing: Arc<PricingTable>,
        client: Arc<dyn UpstreamClient>,
        metrics: Arc<Metrics>,
        events: EventHub,
    ) -> Self {
        Self {
            options,
            scheduler,
            oauth,
            limiter,
            breakers,
            accounting,
            pricing,
            client,
            metrics,
            events,
        }
    }

    pub async fn handle(&self, call: RelayCall) -> Result<RelayResponse, RelayError> {
        let started_at_ms = now_ms();
        if !call.key.model_allowed(&call.model) {
            let err = RelayError::bad_request(format!(
                "model {} not allowed for this key",
                call.model
            ));
            self.commit_zero(&call, err.status().as_u16(), started_at_ms)
                .await;
            return Err(err);
        }

        match self.limiter.check(&call.key).await {
            Ok(Admission::Allow) => {}
            Ok(Admission::Throttle { retry_after_secs }) => {
                self.metrics
                    .rate_limited_hits
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let err = RelayError::new(ErrorKind::QuotaExceeded, "quota exceeded")
                    .with_retry_after(retry_after_secs);
                self.commit_zero(&call, err.status().as_u16(), started_at_ms)
                    .await;
                return Err(err);
            }
            Err(err) => return Err(RelayError::internal(err.to_string())),
        }

        if let Err(err) = self.limiter.key_inflight_acquire(&call.key.id).await {
            warn!(event = "relay.key_inflight_failed", error = %err);
        }

        let finisher = Finisher {
            limiter: self.limiter.clone(),
            scheduler: self.scheduler.clone(),
            accounting: self.accounting.clone(),
            pricing: self.pricing.clone(),
            metrics: self.metrics.clone(),
            events: self.events.clone(),
            lease: None,
            record: UsageRecord {
                request_id: call.trace_id.clone(),
                api_key_id: call.key.id.clone(),
                account_id: None,
                provider: None,
                model: call.model.clone(),
                endpoint: call.client_endpoint.clone(),
                status_code: 0,
                input_tokens: 0,
                output_tokens: 0,
                cache_creation_tokens: 0,
                cache_read_tokens: 0,
                cost_micros: 0,
                started_at_ms,
                duration_ms: 0,
                client_disconnect: false,
                rl_window_seconds: call.key.quotas.window_seconds,
            },
            trace_id: call.trace_id.clone(),
            is_stream: call.want_stream,
        };

        self.attempt_loop(call, finisher).await
    }

    /// Candidate loop: each iteration owns at most one lease and either
    /// transfers it into the response path or hands it back before the
    /// next attempt.
    async fn attempt_loop(
        &self,
        call: RelayCall,
        mut finisher: Finisher,
    ) -> Result<RelayResponse, RelayError> {
        let mut excluded: HashSet<AccountId> = HashSet::new();
        let mut auth_retried: HashSet<AccountId> = HashSet::new();
        let mut attempt: u32 = 0;

        loop {
            let lease = match self
                .scheduler
                .select(
                    &call.key,
                    call.family,
                    &call.model,
                    call.fingerprint.as_deref(),
                    &excluded,
                )
                .await
            {
                Ok(lease) => lease,
                Err(no_account) => {
                    self.metrics
                        .no_account_available
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    let err = RelayError::new(
                        ErrorKind::NoAccountAvailable,
                        "no upstream account available",
                    )
                    .with_retry_after(no_account.retry_after_secs);
                    finisher.finish(err.status().as_u16(), None, false).await;
                    return Err(err);
                }
            };
            let account = lease.account.clone();
            finisher.lease = Some(lease);
            finisher.record.account_id = Some(account.id.clone());
            finisher.record.provider = Some(account.provider);

            let token = match self.oauth.access_token(&account).await {
                Ok(token) => token,
                Err(TokenError::Transient(message)) => {
                    self.release_current(&mut finisher).await;
                    excluded.insert(account.id.clone());
                    attempt += 1;
                    if attempt >= self.options.max_attempts {
                        let err = RelayError::new(ErrorKind::UpstreamError, message);
                        finisher.finish(err.status().as_u16(), None, false).await;
                        return Err(err);
                    }
                    self.backoff(attempt).await;
                    continue;
                }
                Err(TokenError::Unauthorized(_) | TokenError::MissingCredential(_)) => {
                    self.release_current(&mut finisher).await;
                    excluded.insert(account.id.clone());
                    continue;
                }
            };

            let request = self.build_request(&call, &account.provider, account.proxy.as_ref(), &token);
            let response = match self.client.send(request).await {
                Ok(response) => response,
                Err(dial) => {
                    warn!(
                        event = "relay.dial_failed",
                        trace_id = %call.trace_id,
                        account_id = %account.id,
                        error = %dial
                    );
                    self.breakers.record(&account.id, false);
                    self.cooldown_if_broken(&account.id).await;
                    self.release_current(&mut finisher).await;
                    excluded.insert(account.id.clone());
                    attempt += 1;
                    if !dial.retryable() || attempt >= self.options.max_attempts {
                        let err = RelayError::new(ErrorKind::UpstreamError, dial.to_string());
                        finisher.finish(err.status().as_u16(), None, false).await;
                        return Err(err);
                    }
                    self.metrics
                        .upstream_retries
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    self.backoff(attempt).await;
                    continue;
                }
            };

            match response.status {
                401 => {
                    // Token invalidated upstream. Nothing has been sent
                    // downstream yet, so one forced refresh and retry of
                    // the same account is safe.
                    self.release_current(&mut finisher).await;
                    if auth_retried.insert(account.id.clone()) {
                        match self.oauth.force_refresh(&account).await {
                            Ok(_) => continue,
                            Err(_) => {
                                excluded.insert(account.id.clone());
                                continue;
                            }
                        }
                    }
                    let err = RelayError::new(
                        ErrorKind::UpstreamUnauthorized,
                        "upstream rejected credentials after refresh",
                    );
                    finisher.finish(err.status().as_u16(), None, false).await;
                    return Err(err);
                }
                429 => {
                    let retry_after_secs = response
                        .header("retry-after")
                        .and_then(|v| v.parse::<i64>().ok())
                        .unwrap_or(0)
                        .max(60);
                    let until_ms = now_ms() + retry_after_secs * 1_000;
                    self.scheduler
                        .account_rate_limited(&account.id, until_ms)
                        .await;
                    self.metrics
                        .rate_limited_hits
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    info!(
                        event = "relay.upstream_rate_limited",
                        trace_id = %call.trace_id,
                        account_id = %account.id,
                        retry_after_secs
                    );
                    // Passthrough: client sees the provider's own 429.
                    return Ok(self
                        .respond_buffered(&call, finisher, response, &account.id)
                        .await);
                }
                status if (500..600).contains(&status) => {
                    self.breakers.record(&account.id, false);
                    self.cooldown_if_broken(&account.id).await;
                    self.release_current(&mut finisher).await;
                    excluded.insert(account.id.clone());
                    attempt += 1;
                    if attempt >= self.options.max_attempts {
                        let err = RelayError::new(
                            ErrorKind::UpstreamError,
                            format!("upstream returned {status} after {attempt} attempts"),
                        );
                        finisher.finish(err.status().as_u16(), None, false).await;
                        return Err(err);
                    }
                    self.metrics
                        .upstream_retries
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    self.backoff(attempt).await;
                    continue;
                }
                _ => {
                    if (200..300).contains(&response.status) {
                        self.breakers.record(&account.id, true);
                    }
                    let streaming = matches!(response.body, UpstreamBody::Stream(_));
                    return Ok(if streaming {
                        self.respond_streaming(&call, finisher, response, &account.id)
                    } else {
                        self.respond_buffered(&call, finisher, response, &account.id)
                            .await
                    });
                }
            }
        }
    }

    async fn respond_buffered(
        &self,
        call: &RelayCall,
        finisher: Finisher,
        response: UpstreamResponse,
        account_id: &str,
    ) -> RelayResponse {
        let UpstreamBody::Bytes(bytes) = response.body else {
            // Non-stream responses always arrive buffered.
            let err = RelayError::internal("buffered body expected");
            let status = err.status().as_u16();
            finisher.finish(status, None, false).await;
            return RelayResponse {
                status,
                headers: Vec::new(),
                body: UpstreamBody::Bytes(err.body()),
            };
        };

        let counts = if (200..300).contains(&response.status) {
            match call.family {
                ProviderFamily::Claude => usage_from_body(&bytes),
                ProviderFamily::Gemini => usage_from_gemini_body(&bytes)
                    .or_else(|| usage_from_body(&bytes)),
            }
        } else {
            None
        };

        let headers = relay_headers(&response.headers, account_id, finisher.session());
        finisher.finish(response.status, counts, false).await;
        RelayResponse {
            status: response.status,
            headers,
            body: UpstreamBody::Bytes(bytes),
        }
    }

    /// Forward bytes as they arrive, watching the SSE frames for usage.
    /// The forwarding task owns the lease and commits accounting when
    /// the stream ends — normally or through client disconnect.
    fn respond_streaming(
        &self,
        call: &RelayCall,
        finisher: Finisher,
        response: UpstreamResponse,
        account_id: &str,
    ) -> RelayResponse {
        let UpstreamBody::Stream(mut rx_up) = response.body else {
            unreachable!("respond_streaming called with buffered body");
        };
        let headers = relay_headers(&response.headers, account_id, finisher.session());
        let status = response.status;
        let (tx_down, rx_down) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
        let trace_id = call.trace_id.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let mut parser = SseParser::new();
            let mut meter = StreamUsageMeter::new();
            let mut client_disconnect = false;

            while let Some(chunk) = rx_up.recv().await {
                for event in parser.push_bytes(&chunk) {
                    meter.observe(&event);
                }
                if tx_down.send(chunk).await.is_err() {
                    client_disconnect = true;
                    break;
                }
            }
            // Dropping the upstream receiver aborts the reader task.
            drop(rx_up);
            for event in parser.finish() {
                meter.observe(&event);
            }

            // Upstream died mid-stream: tell the client with a final
            // error frame before the connection closes.
            if !client_disconnect && !meter.completed() {
                let frame = crelay_protocol::sse::encode_event(
                    Some("error"),
                    r#"{"type":"error","error":{"type":"upstream_interrupted"}}"#,
                );
                let _ = tx_down.try_send(frame);
            }
            drop(tx_down);

            if client_disconnect {
                metrics
                    .client_disconnects
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                info!(event = "relay.client_disconnect", trace_id = %trace_id);
            }
            let counts = meter.finish();
            finisher.finish(status, counts, client_disconnect).await;
        });

        RelayResponse {
            status,
            headers,
            body: UpstreamBody::Stream(rx_down),
        }
    }

    fn build_request(
        &self,
        call: &RelayCall,
        provider: &Provider,
        proxy: Option<&crate::account::OutboundProxy>,
        token: &str,
    ) -> UpstreamRequest {
        let endpoints = &self.options.endpoints;
        let url = match provider {
            Provider::ClaudeOauth => {
                format!("{}{}", endpoints.claude_oauth.trim_end_matches('/'), call.upstream_path)
            }
            Provider::ClaudeConsole => {
                format!("{}{}", endpoints.claude_console.trim_end_matches('/'), call.upstream_path)
            }
            Provider::Gemini => {
                format!("{}{}", endpoints.gemini.trim_end_matches('/'), call.upstream_path)
            }
            Provider::Bedrock => {
                let action = if call.want_stream {
                    "invoke-with-response-stream"
                } else {
                    "invoke"
                };
                format!(
                    "{}/model/{}/{}",
                    endpoints.bedrock.trim_end_matches('/'),
                    call.model,
                    action
                )
            }
        };

        // Client credentials were stripped at the edge; these are the
        // only auth headers that go upstream.
        let mut headers: Headers = vec![(
            "content-type".to_string(),
            "application/json".to_string(),
        )];
        if call.want_stream {
            headers.push(("accept".to_string(), "text/event-stream".to_string()));
        } else {
            headers.push(("accept".to_string(), "application/json".to_string()));
        }
        match provider {
            Provider::ClaudeOauth => {
                headers.push(("authorization".to_string(), format!("Bearer {token}")));
                headers.push((
                    "anthropic-version".to_string(),
                    self.options.anthropic_version.clone(),
                ));
                let beta = match &self.options.anthropic_beta {
                    Some(extra) => format!("{OAUTH_BETA},{extra}"),
                    None => OAUTH_BETA.to_string(),
                };
                headers.push(("anthropic-beta".to_string(), beta));
            }
            Provider::ClaudeConsole => {
                headers.push(("x-api-key".to_string(), token.to_string()));
                headers.push((
                    "anthropic-version".to_string(),
                    self.options.anthropic_version.clone(),
                ));
                if let Some(beta) = &self.options.anthropic_beta {
                    headers.push(("anthropic-beta".to_string(), beta.clone()));
                }
            }
            Provider::Gemini => {
                headers.push(("x-goog-api-key".to_string(), token.to_string()));
            }
            Provider::Bedrock => {
                headers.push(("authorization".to_string(), format!("Bearer {token}")));
            }
        }

        UpstreamRequest {
            method: http::Method::POST,
            url,
            headers,
            body: Some(call.body.clone()),
            proxy: proxy
                .map(|p| p.to_url())
                .or_else(|| self.options.default_proxy.clone()),
            want_stream: call.want_stream,
        }
    }

    /// A breaker that just opened parks the account in persisted
    /// cooldown, so other processes stop selecting it too.
    async fn cooldown_if_broken(&self, account_id: &str) {
        if self.breakers.breaker(account_id).state() == BreakerState::Open {
            self.scheduler
                .account_cooldown(account_id, now_ms() + 30_000)
                .await;
        }
    }

    async fn release_current(&self, finisher: &mut Finisher) {
        if let Some(lease) = finisher.lease.take() {
            self.scheduler.release(&lease).await;
        }
        finisher.record.account_id = None;
        finisher.record.provider = None;
    }

    /// Failures rejected before an account was ever selected still
    /// produce a usage event, so operators can see them.
    async fn commit_zero(&self, call: &RelayCall, status: u16, started_at_ms: i64) {
        self.metrics.observe_status(status);
        self.accounting
            .commit(UsageRecord {
                request_id: call.trace_id.clone(),
                api_key_id: call.key.id.clone(),
                account_id: None,
                provider: None,
                model: call.model.clone(),
                endpoint: call.client_endpoint.clone(),
                status_code: status,
                input_tokens: 0,
                output_tokens: 0,
                cache_creation_tokens: 0,
                cache_read_tokens: 0,
                cost_micros: 0,
                started_at_ms,
                duration_ms: now_ms() - started_at_ms,
                client_disconnect: false,
                rl_window_seconds: call.key.quotas.window_seconds,
            })
            .await;
    }

    /// Exponential backoff with jitter: base * 2^(attempt-1) + 0..250ms.
    async fn backoff(&self, attempt: u32) {
        let factor = 1u32 << (attempt.saturating_sub(1)).min(4);
        let jitter = Duration::from_millis(rand::rng().random_range(0..250));
        tokio::time::sleep(self.options.backoff_base * factor + jitter).await;
    }
}

/// Everything needed to settle one request, whichever task ends up
/// holding it. `finish` releases the lease and key slot, prices the
/// usage, and commits the record — once.
struct Finisher {
    limiter: Arc<RateLimiter>,
    scheduler: Arc<Scheduler>,
    accounting: AccountingSink,
    pricing: Arc<PricingTable>,
    metrics: Arc<Metrics>,
    events: EventHub,
    lease: Option<Lease>,
    record: UsageRecord,
    trace_id: String,
    is_stream: bool,
}

impl Finisher {
    fn session(&self) -> Option<&str> {
        self.lease.as_ref().and_then(|l| l.session.as_deref())
    }

    async fn finish(mut self, status: u16, counts: Option<UsageCounts>, client_disconnect: bool) {
        if let (Some(counts), Some(provider)) = (&counts, self.record.provider) {
            self.record.cost_micros =
                self.pricing
                    .cost_micros(provider, &self.record.model, counts);
        }
        if let Some(counts) = &counts {
            self.record.apply_counts(counts);
        }
        self.record.status_code = status;
        self.record.duration_ms = now_ms() - self.record.started_at_ms;
        self.record.client_disconnect = client_disconnect;

        if let Some(lease) = &self.lease {
            self.scheduler.release(lease).await;
        }
        if let Err(err) = self.limiter.key_inflight_release(&self.record.api_key_id).await {
            warn!(event = "relay.key_release_failed", error = %err);
        }
        self.metrics.observe_status(status);
        self.events
            .emit(Event::Request(RequestEvent {
                trace_id: self.trace_id.clone(),
                at_ms: self.record.started_at_ms,
                api_key_id: self.record.api_key_id.clone(),
                account_id: self.record.account_id.clone(),
                provider: self.record.provider.map(|p| p.as_str().to_string()),
                model: Some(self.record.model.clone()),
                endpoint: self.record.endpoint.clone(),
                status,
                duration_ms: self.record.duration_ms,
                is_stream: self.is_stream,
            }))
            .await;
        self.accounting.commit(self.record).await;
    }
}

/// Upstream headers minus framing/hop-by-hop noise, plus the relay's
/// diagnostic headers.
fn relay_headers(upstream: &Headers, account_id: &str, session: Option<&str>) -> Headers {
    let mut out: Headers = upstream
        .iter()
        .filter(|(name, _)| !is_hop_by_hop_or_framing(name))
        .cloned()
        .collect();
    out.push(("x-relay-account-id".to_string(), account_id.to_string()));
    if let Some(session) = session {
        out.push(("x-relay-session".to_string(), session.to_string()));
    }
    out
}

fn is_hop_by_hop_or_framing(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_headers_scrub_framing_and_tag_account() {
        let upstream = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("content-length".to_string(), "42".to_string()),
            ("transfer-encoding".to_string(), "chunked".to_string()),
        ];
        let headers = relay_headers(&upstream, "acct-1", Some("fp-1"));
        assert!(headers.iter().any(|(k, _)| k == "content-type"));
        assert!(!headers.iter().any(|(k, _)| k == "content-length"));
        assert!(headers
            .iter()
            .any(|(k, v)| k == "x-relay-account-id" && v == "acct-1"));
        assert!(headers
            .iter()
            .any(|(k, v)| k == "x-relay-session" && v == "fp-1"));
    }
}
