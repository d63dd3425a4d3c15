//! Server-sent event framing.
//!
//! The tool-agent loop parses the upstream byte stream into `{event, data}`
//! records, rewrites or drops some of them, and re-serializes the rest. The
//! parser is incremental: feed it chunks as they arrive and collect the
//! events completed so far.

use serde_json::Value;

/// One SSE record: `event: <name>\ndata: <json>\n\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// Parse one event block (no trailing blank line). Comment-only blocks
    /// and blocks without any `event:`/`data:` field yield `None`.
    pub fn parse(block: &str) -> Option<Self> {
        let mut event = None;
        let mut data_lines: Vec<&str> = Vec::new();
        let mut saw_field = false;

        for line in block.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.starts_with(':') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("event:") {
                event = Some(rest.strip_prefix(' ').unwrap_or(rest).to_string());
                saw_field = true;
            } else if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
                saw_field = true;
            }
        }

        if !saw_field {
            return None;
        }
        Some(Self {
            event,
            data: data_lines.join("\n"),
        })
    }

    /// Wire form, terminated with the blank line.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }

    /// Parse the data payload as JSON. `None` when the payload is not JSON
    /// (e.g. `[DONE]` sentinels).
    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.data).ok()
    }
}

/// Incremental SSE parser over a chunked byte stream.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event completed by it. Partial blocks
    /// stay buffered until the closing blank line arrives.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        // Normalize CRLF so block detection only has to look for "\n\n".
        // A CRLF split across chunks leaves a trailing '\r' in the buffer.
        if self.buffer.ends_with('\r') && chunk.starts_with('\n') {
            self.buffer.pop();
        }
        self.buffer.push_str(&chunk.replace("\r\n", "\n"));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 2);
            if let Some(event) = SseEvent::parse(&block) {
                events.push(event);
            }
        }
        events
    }

    /// Whatever is left after the stream ends (an unterminated block).
    pub fn remainder(&self) -> &str {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_and_data() {
        let event = SseEvent::parse("event: message_start\ndata: {\"type\":\"message_start\"}")
            .unwrap();
        assert_eq!(event.event.as_deref(), Some("message_start"));
        assert_eq!(event.data, "{\"type\":\"message_start\"}");
    }

    #[test]
    fn test_parse_data_only() {
        let event = SseEvent::parse("data: [DONE]").unwrap();
        assert!(event.event.is_none());
        assert_eq!(event.data, "[DONE]");
        assert!(event.json().is_none());
    }

    #[test]
    fn test_parse_skips_comments() {
        assert!(SseEvent::parse(": keep-alive").is_none());
        let event = SseEvent::parse(": ping\nevent: ping\ndata: {}").unwrap();
        assert_eq!(event.event.as_deref(), Some("ping"));
    }

    #[test]
    fn test_serialize_round_trip() {
        let cases = [
            SseEvent::new("content_block_delta", r#"{"index":0}"#),
            SseEvent::new("message_stop", "{}"),
            SseEvent {
                event: None,
                data: "[DONE]".to_string(),
            },
            SseEvent::new("multi", "line one\nline two"),
        ];
        for event in cases {
            let parsed = SseEvent::parse(event.serialize().trim_end_matches('\n')).unwrap();
            assert_eq!(parsed, event);
        }
    }

    #[test]
    fn test_incremental_feed_across_boundaries() {
        let mut parser = SseParser::new();
        assert!(parser.feed("event: message_st").is_empty());
        assert!(parser.feed("art\ndata: {\"a\":1}\n").is_empty());
        let events = parser.feed("\nevent: ping\ndata: {}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[1].event.as_deref(), Some("ping"));
        assert!(parser.remainder().is_empty());
    }

    #[test]
    fn test_crlf_lines() {
        let mut parser = SseParser::new();
        let events = parser.feed("event: ping\r\ndata: {}\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("ping"));
        assert_eq!(events[0].data, "{}");

        // CRLF split across a chunk boundary
        let mut parser = SseParser::new();
        assert!(parser.feed("event: ping\r").is_empty());
        let events = parser.feed("\ndata: {}\n\n");
        assert_eq!(events.len(), 1);
    }
}
