//! HTTP surface for crelay: the client-facing proxy endpoints and the
//! health/metrics plane. All policy lives in crelay-core; this crate
//! only translates between axum and the engine.

mod health;
mod proxy;

pub use proxy::{RouterState, router};
