/// Line buffer for SSE bodies read in arbitrary network-sized chunks.
///
/// The tail of each read that is not yet terminated by `\n` is carried
/// over into the next `push` so a `data:` line split across two reads is
/// reassembled before anyone inspects it.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    remainder: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the complete lines it closed out, with
    /// line terminators stripped.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.remainder.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.remainder.find('\n') {
            let mut line: String = self.remainder.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// Flush the trailing unterminated line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.remainder.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.remainder);
        if line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }
}

/// Extract the payload of a `data:` line; returns `None` for event
/// names, comments and blank lines.
pub fn data_payload(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// The stream terminator payload used by the OpenAI-style protocols.
pub const DONE_PAYLOAD: &str = "[DONE]";

/// Frame a payload as one SSE data event.
pub fn frame(payload: &str) -> String {
    format!("data: {payload}\n\n")
}

/// Frame a payload with an explicit event name (Claude-style streams).
pub fn frame_event(event: &str, payload: &str) -> String {
    format!("event: {event}\ndata: {payload}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_lines_split_across_reads() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.push("data: {\"a\":").is_empty());
        let lines = buf.push("1}\ndata: next\n");
        assert_eq!(lines, vec!["data: {\"a\":1}", "data: next"]);
    }

    #[test]
    fn strips_carriage_returns() {
        let mut buf = SseLineBuffer::new();
        let lines = buf.push("data: x\r\n");
        assert_eq!(lines, vec!["data: x"]);
    }

    #[test]
    fn finish_drains_the_tail() {
        let mut buf = SseLineBuffer::new();
        buf.push("data: partial");
        assert_eq!(buf.finish().as_deref(), Some("data: partial"));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn data_payload_ignores_other_lines() {
        assert_eq!(data_payload("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(data_payload("event: message_start"), None);
        assert_eq!(data_payload(""), None);
        assert_eq!(data_payload("data:tight"), Some("tight"));
    }
}
