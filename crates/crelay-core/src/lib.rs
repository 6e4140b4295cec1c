//! The crelay request-dispatch engine.
//!
//! Composition: API-key authentication feeds the rate limiter, the
//! unified scheduler picks an upstream account, the OAuth manager keeps
//! its token fresh, and the relay engine rewrites and forwards the
//! request while accounting observes every outcome. The composition
//! root in [`bootstrap`] wires these in dependency order; no component
//! reaches for another except through the handles it was given.

pub mod account;
pub mod apikey;
pub mod bootstrap;
pub mod breaker;
pub mod error;
pub mod events;
pub mod metrics;
pub mod oauth;
pub mod pattern;
pub mod ratelimit;
pub mod relay;
pub mod scheduler;
pub mod time_util;
pub mod upstream;
pub mod usage;

pub use account::{
    AccountGroup, AccountId, AccountRepo, AccountStatus, AccountView, CredentialMaterial,
    NewAccount, OutboundProxy, Provider, ProviderFamily, ProxyScheme, SelectionPolicy,
};
pub use apikey::{
    ApiKeyRecord, ApiKeyService, AuthFailure, IssueKeySpec, IssuedKey, KeyQuotas, KeyState,
};
pub use bootstrap::{Bootstrap, CliArgs, bootstrap, bootstrap_from_env};
pub use breaker::{Breaker, BreakerRegistry, BreakerState};
pub use error::{ErrorKind, RelayError};
pub use events::{Event, EventHub, OperationalEvent, RequestEvent, TerminalEventSink};
pub use metrics::Metrics;
pub use oauth::{OAuthManager, TokenError};
pub use ratelimit::{Admission, RateLimiter};
pub use relay::{EngineOptions, RelayCall, RelayEngine, RelayResponse};
pub use scheduler::{
    AccountDirectory, CooldownQueue, Lease, NoAccountAvailable, Scheduler, fingerprint_request,
};
pub use upstream::{
    DialError, Headers, HttpClientConfig, HttpUpstreamClient, UpstreamBody, UpstreamClient,
    UpstreamRequest, UpstreamResponse,
};
pub use usage::{
    AccountingBus, AccountingSink, DailyRollup, PriceRule, PricingTable, UsageRecord,
    daily_rollups,
};
