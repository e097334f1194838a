use crate::error::AppError;

pub const MAX_PENDING_LINE_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    max_line_bytes: usize,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_PENDING_LINE_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_bytes,
            event: None,
            data: Vec::new(),
            id: None,
        }
    }

    /// Fails once an unterminated line grows past the limit; the decoder is
    /// unusable after that and the stream should be dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, AppError> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }

        if self.buffer.len() > self.max_line_bytes {
            let pending = self.buffer.len();
            self.buffer.clear();
            return Err(AppError::InvalidPayload(format!(
                "event stream line of {pending} bytes exceeds {} without a newline",
                self.max_line_bytes
            )));
        }
        Ok(events)
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event,
            data,
            id: self.id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_events_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder
            .push(b"event: price\ndata: {\"data\":")
            .expect("partial line fits")
            .is_empty());
        let events = decoder
            .push(b"{\"price\":1}}\r\n\r\n")
            .expect("chunk should decode");

        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("price".to_string()),
                data: "{\"data\":{\"price\":1}}".to_string(),
                id: None,
            }]
        );
    }

    #[test]
    fn joins_multi_line_data_and_skips_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder
            .push(b": keep-alive\n\ndata: a\ndata: b\nid: 7\n\n")
            .expect("chunk should decode");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
        assert_eq!(events[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn yields_multiple_events_from_one_chunk() {
        let mut decoder = SseDecoder::new();
        let events = decoder
            .push(b"data: 1\n\ndata: 2\n\n")
            .expect("chunk should decode");
        let payloads: Vec<&str> = events.iter().map(|event| event.data.as_str()).collect();
        assert_eq!(payloads, vec!["1", "2"]);
    }

    #[test]
    fn rejects_unterminated_line_past_limit() {
        let mut decoder = SseDecoder::with_max_line(16);
        assert!(decoder
            .push(b"data: 0123456789")
            .expect("line is within limit")
            .is_empty());

        let error = decoder
            .push(b"abcdefghij")
            .expect_err("line without newline should overflow");
        assert!(matches!(error, AppError::InvalidPayload(_)));
    }

    #[test]
    fn long_stream_of_terminated_lines_stays_within_limit() {
        let mut decoder = SseDecoder::with_max_line(16);
        let events = decoder
            .push(b"data: 1\n\ndata: 2\n\ndata: 3\n\ndata: 4\n\n")
            .expect("each line is short");
        assert_eq!(events.len(), 4);
    }
}
