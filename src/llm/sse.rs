//! Incremental Server-Sent-Events decoder.
//!
//! Only `data:` fields matter for chat-completion streams; other fields and
//! comment lines are dropped.  Multi-line `data:` fields are joined with `\n`
//! as the SSE format requires.

#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns the payload of every event completed by them.
    ///
    /// Bytes may split lines (or UTF-8 sequences) arbitrarily.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw);
            let line = text.trim_end_matches(|c| c == '\n' || c == '\r');
            self.line(line, &mut events);
        }
        events
    }

    /// Flush an event left unterminated when the connection closed.
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending.is_empty() {
            let raw = std::mem::take(&mut self.pending);
            let text = String::from_utf8_lossy(&raw);
            let mut ignored = Vec::new();
            self.line(text.trim_end_matches('\r'), &mut ignored);
        }
        if self.data.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.data).join("\n"))
        }
    }

    fn line(&mut self, line: &str, events: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                events.push(std::mem::take(&mut self.data).join("\n"));
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_complete_events() {
        let mut dec = SseDecoder::new();
        let events = dec.push(b"data: one\n\ndata: two\n\n");
        assert_eq!(events, vec!["one", "two"]);
    }

    #[test]
    fn handles_events_split_across_chunks() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"da").is_empty());
        assert!(dec.push(b"ta: hel").is_empty());
        assert!(dec.push(b"lo\r\n").is_empty());
        assert_eq!(dec.push(b"\r\n"), vec!["hello"]);
    }

    #[test]
    fn keeps_multibyte_chars_split_between_chunks() {
        let bytes = "data: café\n\n".as_bytes();
        let split = bytes.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let mut dec = SseDecoder::new();
        assert!(dec.push(&bytes[..split]).is_empty());
        assert_eq!(dec.push(&bytes[split..]), vec!["café"]);
    }

    #[test]
    fn ignores_comments_and_other_fields() {
        let mut dec = SseDecoder::new();
        let events = dec.push(b": keep-alive\nevent: message\nid: 7\ndata: x\n\n");
        assert_eq!(events, vec!["x"]);
    }

    #[test]
    fn joins_multiline_data() {
        let mut dec = SseDecoder::new();
        assert_eq!(dec.push(b"data: a\ndata: b\n\n"), vec!["a\nb"]);
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"data: [DONE]").is_empty());
        assert_eq!(dec.finish().as_deref(), Some("[DONE]"));
        assert_eq!(dec.finish(), None);
    }
}
