//! Key-value storage for crelay.
//!
//! All persisted state (keys, accounts, sessions, counters, rollups) lives
//! behind the [`KvStore`] trait. The production backend is Redis; an
//! in-process [`MemoryKv`] carries the same semantics for tests and for
//! degraded operation when the remote store is unreachable. Components talk
//! to the [`Store`] facade, never to a backend directly.

pub mod keys;
pub mod kv;
pub mod memory;
pub mod redis_kv;
pub mod store;

pub use kv::{BalanceOutcome, KvError, KvMessage, KvResult, KvStore};
pub use memory::MemoryKv;
pub use redis_kv::RedisKv;
pub use store::Store;
