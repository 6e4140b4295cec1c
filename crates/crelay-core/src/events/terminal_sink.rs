use std::future::Future;
use std::pin::Pin;

use tracing::info;

use super::hub::EventSink;
use super::types::Event;

/// Writes every event as one JSON line through tracing, so operators get
/// the event feed wherever logs already go.
#[derive(Debug, Default)]
pub struct TerminalEventSink;

impl TerminalEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for TerminalEventSink {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match event.to_log_json() {
                Ok(line) => info!(target: "crelay::events", "{line}"),
                Err(err) => info!(target: "crelay::events", error = %err, "unserializable event"),
            }
        })
    }
}
