//! # Server-Sent Events Decoder
//!
//! Incremental `text/event-stream` parser. Bytes arrive in arbitrary chunks
//! from the HTTP body; complete events come out.
//!
//! ## Wire Format
//! ```text
//! id: 1700000000000\n
//! event: message\n
//! data: {"id":"a","branch":"tasks","action":"post","time":1700000000000}\n
//! \n                                  ◄── blank line dispatches the event
//! : comment lines are ignored\n
//! ```
//!
//! Lines may end in `\r\n`, `\n` or `\r`. A field name without a colon has
//! an empty value. One space after the colon is stripped. The last event id
//! sticks across events until the server replaces it.

/// One dispatched event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type. `message` unless the server named one.
    pub event: String,
    /// Data lines joined with `\n`.
    pub data: String,
    /// Last event id seen on the stream, if any.
    pub id: Option<String>,
    /// Reconnection hint in milliseconds.
    pub retry: Option<u64>,
}

/// Default event type.
pub const MESSAGE: &str = "message";

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    skip_lf: bool,
    bom_checked: bool,
    event: Option<String>,
    data: String,
    last_id: Option<String>,
    retry: Option<u64>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();

        for &byte in chunk {
            if self.skip_lf {
                self.skip_lf = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\r' => {
                    self.skip_lf = true;
                    self.end_line(&mut events);
                }
                b'\n' => self.end_line(&mut events),
                _ => self.buf.push(byte),
            }
        }

        events
    }

    /// Last event id the stream has set.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_id.as_deref()
    }

    fn end_line(&mut self, events: &mut Vec<SseEvent>) {
        let raw = std::mem::take(&mut self.buf);
        let mut line = String::from_utf8_lossy(&raw).into_owned();

        if !self.bom_checked {
            self.bom_checked = true;
            if let Some(stripped) = line.strip_prefix('\u{feff}') {
                line = stripped.to_string();
            }
        }

        if line.is_empty() {
            if let Some(event) = self.dispatch() {
                events.push(event);
            }
            return;
        }

        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_str(), ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            "id" => {
                if !value.contains('\0') {
                    self.last_id = Some(value.to_string());
                }
            }
            "retry" => {
                if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                    self.retry = value.parse().ok();
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }

        let mut data = std::mem::take(&mut self.data);
        if data.ends_with('\n') {
            data.pop();
        }

        Some(SseEvent {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| MESSAGE.to_string()),
            data,
            id: self.last_id.clone().filter(|id| !id.is_empty()),
            retry: self.retry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"id: 7\ndata: {\"a\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, MESSAGE);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn test_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: hel").is_empty());
        assert!(decoder.feed(b"lo\r").is_empty());
        let events = decoder.feed(b"\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b": keepalive\n\ndata: one\ndata:two\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn test_named_events_and_sticky_id() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"event: ping\nid: 5\ndata: x\n\ndata: y\n\n");
        assert_eq!(events[0].event, "ping");
        assert_eq!(events[1].event, MESSAGE);
        assert_eq!(events[1].id.as_deref(), Some("5"));
        assert_eq!(decoder.last_event_id(), Some("5"));
    }

    #[test]
    fn test_retry_and_bom() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed("\u{feff}retry: 3000\nretry: soon\ndata: z\n\n".as_bytes());
        assert_eq!(events[0].retry, Some(3000));
    }

    #[test]
    fn test_empty_data_is_not_dispatched() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"event: nothing\n\n\n").is_empty());
    }
}
