//! Wire-format handling for crelay: SSE framing, provider usage
//! extraction, and the OpenAI compatibility shim.
//!
//! No HTTP client or server types appear here; everything operates on
//! bytes and JSON values so the relay engine can stay transport-agnostic.

pub mod claude;
pub mod openai;
pub mod sse;

pub use claude::{StreamUsageMeter, UsageCounts, usage_from_body, usage_from_gemini_body};
pub use sse::{SseEvent, SseParser};
