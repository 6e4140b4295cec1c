use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use crelay_common::{GlobalConfig, GlobalConfigPatch, TokenCipher};
use crelay_store::Store;

use crate::account::AccountRepo;
use crate::apikey::ApiKeyService;
use crate::breaker::BreakerRegistry;
use crate::events::{EventHub, TerminalEventSink};
use crate::metrics::Metrics;
use crate::oauth::OAuthManager;
use crate::ratelimit::RateLimiter;
use crate::relay::{EngineOptions, RelayEngine};
use crate::scheduler::{AccountDirectory, CooldownQueue, Scheduler};
use crate::upstream::{HttpClientConfig, HttpUpstreamClient};
use crate::usage::{AccountingBus, PricingTable};

#[derive(Debug, Clone, Parser)]
#[command(name = "crelay", version, about = "Multi-tenant LLM relay and credential broker")]
pub struct CliArgs {
    /// Bind host.
    #[arg(long, env = "CRELAY_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "CRELAY_PORT")]
    pub port: Option<u16>,

    /// Remote KV URL (redis://...). Omit for in-process storage.
    #[arg(long, env = "CRELAY_KV_URL")]
    pub kv_url: Option<String>,

    /// Symmetric encryption key for credential envelopes (32 bytes,
    /// hex or base64). Required.
    #[arg(long, env = "CRELAY_ENCRYPTION_KEY")]
    pub encryption_key: Option<String>,

    /// Default outbound proxy for accounts without their own.
    #[arg(long, env = "CRELAY_PROXY")]
    pub proxy: Option<String>,

    #[arg(long, env = "CRELAY_ANTHROPIC_VERSION")]
    pub anthropic_version: Option<String>,

    #[arg(long, env = "CRELAY_ANTHROPIC_BETA")]
    pub anthropic_beta: Option<String>,

    #[arg(long, env = "CRELAY_CONNECT_TIMEOUT_SECS")]
    pub connect_timeout_secs: Option<u64>,

    #[arg(long, env = "CRELAY_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,

    #[arg(long, env = "CRELAY_STREAM_IDLE_TIMEOUT_SECS")]
    pub stream_idle_timeout_secs: Option<u64>,

    /// Cap on concurrently served downstream requests.
    #[arg(long, env = "CRELAY_MAX_CONNECTIONS")]
    pub max_connections: Option<usize>,

    #[arg(long, env = "CRELAY_CLAUDE_BASE_URL")]
    pub claude_base_url: Option<String>,

    #[arg(long, env = "CRELAY_CLAUDE_CONSOLE_BASE_URL")]
    pub claude_console_base_url: Option<String>,

    #[arg(long, env = "CRELAY_GEMINI_BASE_URL")]
    pub gemini_base_url: Option<String>,

    #[arg(long, env = "CRELAY_BEDROCK_BASE_URL")]
    pub bedrock_base_url: Option<String>,

    #[arg(long, env = "CRELAY_CLAUDE_TOKEN_URL")]
    pub claude_token_url: Option<String>,
}

impl CliArgs {
    fn into_patch(self) -> GlobalConfigPatch {
        let mut endpoints = crelay_common::ProviderEndpoints::default();
        if let Some(url) = self.claude_base_url {
            endpoints.claude_oauth = url;
        }
        if let Some(url) = self.claude_console_base_url {
            endpoints.claude_console = url;
        }
        if let Some(url) = self.gemini_base_url {
            endpoints.gemini = url;
        }
        if let Some(url) = self.bedrock_base_url {
            endpoints.bedrock = url;
        }
        if let Some(url) = self.claude_token_url {
            endpoints.claude_token_url = url;
        }

        GlobalConfigPatch {
            host: self.host,
            port: self.port,
            kv_url: self.kv_url,
            encryption_key: self.encryption_key,
            proxy: self.proxy,
            endpoints: Some(endpoints),
            anthropic_version: self.anthropic_version,
            anthropic_beta: self.anthropic_beta,
            connect_timeout_secs: self.connect_timeout_secs,
            request_timeout_secs: self.request_timeout_secs,
            stream_idle_timeout_secs: self.stream_idle_timeout_secs,
            max_connections: self.max_connections,
        }
    }
}

/// Everything the serving layer needs, built once in dependency order.
/// Teardown happens in reverse through [`Bootstrap::shutdown`].
pub struct Bootstrap {
    pub config: Arc<GlobalConfig>,
    pub store: Store,
    pub engine: Arc<RelayEngine>,
    pub keys: Arc<ApiKeyService>,
    pub accounts: Arc<AccountRepo>,
    pub metrics: Arc<Metrics>,
    pub events: EventHub,
    accounting: AccountingBus,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    bootstrap(CliArgs::parse()).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let config: Arc<GlobalConfig> = Arc::new(
        args.into_patch()
            .into_config()
            .context("finalize global config")?,
    );

    let store = Store::connect(config.kv_url.as_deref()).await;
    let cipher = Arc::new(
        TokenCipher::from_encoded(&config.encryption_key).context("decode encryption key")?,
    );

    let events = EventHub::new(1024);
    events.add_sink(Arc::new(TerminalEventSink::new())).await;
    let metrics = Arc::new(Metrics::new());

    let accounts = Arc::new(AccountRepo::new(store.clone(), cipher.clone()));
    let client = Arc::new(HttpUpstreamClient::new(HttpClientConfig {
        connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        request_timeout: Duration::from_secs(config.request_timeout_secs),
        stream_idle_timeout: Duration::from_secs(config.stream_idle_timeout_secs),
        stream_total_timeout: Duration::from_secs(config.request_timeout_secs * 2),
    }));

    let oauth = Arc::new(OAuthManager::new(
        accounts.clone(),
        store.clone(),
        cipher,
        client.clone(),
        config.endpoints.claude_token_url.clone(),
        config.proxy.clone(),
        events.clone(),
        metrics.clone(),
    ));

    let limiter = Arc::new(RateLimiter::new(
        store.clone(),
        Duration::from_secs(config.request_timeout_secs),
    ));
    limiter.spawn_reaper();

    let breakers = Arc::new(BreakerRegistry::new());
    let directory = AccountDirectory::load(accounts.clone()).await;
    directory.spawn_refresh(&store);
    let cooldowns = CooldownQueue::new();
    cooldowns
        .clone()
        .spawn_recover_task(accounts.clone(), events.clone());

    let scheduler = Arc::new(Scheduler::new(
        directory,
        accounts.clone(),
        limiter.clone(),
        breakers.clone(),
        cooldowns,
        store.clone(),
        events.clone(),
    ));

    let accounting = AccountingBus::spawn(store.clone());
    let pricing = Arc::new(PricingTable::default_table());

    let engine = Arc::new(RelayEngine::new(
        EngineOptions {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            endpoints: config.endpoints.clone(),
            anthropic_version: config.anthropic_version.clone(),
            anthropic_beta: config.anthropic_beta.clone(),
            default_proxy: config.proxy.clone(),
        },
        scheduler,
        oauth,
        limiter,
        breakers,
        accounting.sink(),
        pricing,
        client,
        metrics.clone(),
        events.clone(),
    ));

    let keys = ApiKeyService::new(store.clone());

    Ok(Bootstrap {
        config,
        store,
        engine,
        keys,
        accounts,
        metrics,
        events,
        accounting,
    })
}

impl Bootstrap {
    /// Drain the accounting queue before exit; in-flight usage events
    /// survive a graceful shutdown.
    pub async fn shutdown(self, timeout: Duration) {
        self.accounting.shutdown(timeout).await;
    }
}
