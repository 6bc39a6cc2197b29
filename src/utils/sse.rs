use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(self.data.len() + 16);
        if let Some(event) = &self.event {
            buffer.put_slice(b"event: ");
            buffer.put_slice(event.as_bytes());
            buffer.put_u8(b'\n');
        }
        for line in self.data.split('\n') {
            buffer.put_slice(b"data: ");
            buffer.put_slice(line.as_bytes());
            buffer.put_u8(b'\n');
        }
        buffer.put_u8(b'\n');
        buffer.freeze()
    }
}

pub fn done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// Incremental parser for `text/event-stream` bodies. Bytes may be fed in
/// arbitrary slices; an event is emitted once its terminating blank line
/// has been seen.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    current: SseEvent,
    has_data: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);

            if line.is_empty() {
                if self.has_data || self.current.event.is_some() {
                    events.push(std::mem::take(&mut self.current));
                    self.has_data = false;
                }
                continue;
            }
            self.parse_line(&line);
        }

        events
    }

    /// Emits whatever is pending when the upstream closes without a final blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
            if !line.is_empty() {
                self.parse_line(&line);
            }
        }
        if self.has_data || self.current.event.is_some() {
            self.has_data = false;
            return Some(std::mem::take(&mut self.current));
        }
        None
    }

    fn parse_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);

        match field {
            "event" => self.current.event = Some(value.to_string()),
            "data" => {
                if self.has_data {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
                self.has_data = true;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.process(b"data: {\"a\":").is_empty());
        let events = parser.process(b"1}\r\n\r\ndata: [DONE]\n\n");

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert!(events[1].is_done());
    }

    #[test]
    fn test_named_events_and_comments() {
        let mut parser = SseParser::new();
        let input = ": keep-alive\nevent: message_start\ndata: {}\n\nevent: ping\n\n";
        let events = parser.process(input.as_bytes());

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[1].event.as_deref(), Some("ping"));
        assert_eq!(events[1].data, "");
    }

    #[test]
    fn test_finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.process(b"data: tail").is_empty());
        assert_eq!(parser.finish().unwrap().data, "tail");
        assert!(parser.finish().is_none());
    }

    #[test]
    fn test_utf8_split_between_chunks() {
        let mut parser = SseParser::new();
        let mut events = parser.process(&[b'd', b'a', b't', b'a', b':', b' ', 0xF0, 0x9F]);
        events.extend(parser.process(&[0x9A, 0x80, b'\n', b'\n']));
        assert_eq!(events[0].data, "\u{1F680}");
    }

    #[test]
    fn test_event_to_bytes() {
        let event = SseEvent {
            event: Some("error".to_string()),
            data: "a\nb".to_string(),
        };
        assert_eq!(&event.to_bytes()[..], b"event: error\ndata: a\ndata: b\n\n");
        assert_eq!(&done_frame()[..], b"data: [DONE]\n\n");
    }
}
