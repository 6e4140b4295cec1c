use bytes::Bytes;

/// One parsed server-sent event: optional `event:` name plus joined
/// `data:` lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE parser.
///
/// Raw bytes accumulate until a blank line closes a record; each
/// complete record is then decoded in a single pass. Keeping the buffer
/// as bytes (rather than decoded text) means chunk boundaries can fall
/// anywhere — mid-line, mid-field, or inside a multi-byte UTF-8
/// sequence — without the parser carrying half-decoded field state
/// between pushes. Call [`SseParser::finish`] at end of stream to
/// decode a trailing unterminated record.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        self.drain_records()
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk.as_bytes());
        self.drain_records()
    }

    /// Decode whatever is still buffered; the final record of a stream
    /// is often not followed by a blank line.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let tail = std::mem::take(&mut self.buffer);
        decode_record(&tail).into_iter().collect()
    }

    fn drain_records(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        while let Some((record_len, separator_len)) = record_boundary(&self.buffer) {
            let record: Vec<u8> = self.buffer.drain(..record_len + separator_len).collect();
            if let Some(event) = decode_record(&record[..record_len]) {
                events.push(event);
            }
        }
        events
    }
}

/// Locate the first complete record: `(record_len, separator_len)`
/// where the separator is the blank line (`\n` or `\r\n`) that closes
/// it. The record keeps its own trailing newline.
fn record_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    for (i, byte) in buffer.iter().enumerate() {
        if *byte != b'\n' {
            continue;
        }
        match buffer.get(i + 1) {
            Some(b'\n') => return Some((i + 1, 1)),
            Some(b'\r') if buffer.get(i + 2) == Some(&b'\n') => return Some((i + 1, 2)),
            _ => {}
        }
    }
    None
}

/// One pass over a complete record: comments dropped, `event:` takes
/// the last value seen, `data:` lines accumulate joined by newlines.
/// Records that decode to neither field yield nothing.
fn decode_record(record: &[u8]) -> Option<SseEvent> {
    let text = std::str::from_utf8(record).ok()?;
    let mut event: Option<String> = None;
    let mut data: Option<String> = None;

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            // One leading space after the colon is part of the framing.
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = (!value.is_empty()).then(|| value.to_string()),
            "data" => match &mut data {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            _ => {}
        }
    }

    if event.is_none() && data.is_none() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.unwrap_or_default(),
    })
}

/// Encode an event back into wire form (`event:` line optional).
pub fn encode_event(event: Option<&str>, data: &str) -> Bytes {
    let mut out = Vec::with_capacity(data.len() + 32);
    if let Some(name) = event {
        out.extend_from_slice(b"event: ");
        out.extend_from_slice(name.as_bytes());
        out.push(b'\n');
    }
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(data.as_bytes());
    out.extend_from_slice(b"\n\n");
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_events_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("event: message_de").is_empty());
        let events = parser.push_str("lta\ndata: {\"a\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_delta"));
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn boundary_split_between_chunks_still_closes_the_record() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: one\n").is_empty());
        let events = parser.push_str("\ndata: two\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "one");
        assert_eq!(events[1].data, "two");
    }

    #[test]
    fn joins_multiple_data_lines() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data: one\ndata: two\n\n");
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn skips_comment_heartbeats() {
        let mut parser = SseParser::new();
        assert!(parser.push_str(": keep-alive\n\n").is_empty());
    }

    #[test]
    fn finish_flushes_unterminated_record() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: tail").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn crlf_lines_parse_like_lf() {
        let mut parser = SseParser::new();
        let events = parser.push_str("event: ping\r\ndata: {}\r\n\r\n");
        assert_eq!(events[0].event.as_deref(), Some("ping"));
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn multibyte_utf8_split_across_chunks_survives() {
        let mut parser = SseParser::new();
        let frame = "data: héllo\n\n".as_bytes();
        // Split inside the two-byte 'é'.
        let cut = frame.iter().position(|b| *b == 0xc3).unwrap() + 1;
        assert!(parser
            .push_bytes(&Bytes::copy_from_slice(&frame[..cut]))
            .is_empty());
        let events = parser.push_bytes(&Bytes::copy_from_slice(&frame[cut..]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "héllo");
    }

    #[test]
    fn bare_field_names_parse_as_empty_values() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "");
        assert!(events[0].event.is_none());
    }

    #[test]
    fn encode_then_parse_round_trips() {
        let frame = encode_event(Some("message_stop"), "{\"type\":\"message_stop\"}");
        let mut parser = SseParser::new();
        let events = parser.push_bytes(&frame);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_stop"));
        assert_eq!(events[0].data, "{\"type\":\"message_stop\"}");
    }
}
