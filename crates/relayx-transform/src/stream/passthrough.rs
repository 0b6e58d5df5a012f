use bytes::Bytes;
use serde_json::Value;

use relayx_common::Usage;
use relayx_core::StreamTranslator;
use relayx_protocol::sse::{data_payload, SseLineBuffer, DONE_PAYLOAD};

/// Which wire format's usage shape to look for while passing frames
/// through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageWire {
    OpenAi,
    Claude,
    Gemini,
    Responses,
}

/// Byte-exact passthrough for streams whose upstream format already
/// matches the client. Chunks are forwarded as-is; complete `data:`
/// lines are scanned on the side for usage numbers.
pub struct PassthroughStream {
    wire: UsageWire,
    buffer: SseLineBuffer,
    usage: Usage,
    has_usage: bool,
}

impl PassthroughStream {
    pub fn new(wire: UsageWire) -> Self {
        PassthroughStream {
            wire,
            buffer: SseLineBuffer::new(),
            usage: Usage::default(),
            has_usage: false,
        }
    }

    fn scan_line(&mut self, line: &str) {
        let Some(payload) = data_payload(line) else {
            return;
        };
        if payload == DONE_PAYLOAD {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(payload) else {
            return;
        };
        match self.wire {
            UsageWire::OpenAi => {
                if let Some(usage) = crate::usage::usage_from_openai(&value) {
                    self.usage = usage;
                    self.has_usage = true;
                }
            }
            UsageWire::Claude => self.scan_claude(&value),
            UsageWire::Gemini => {
                if let Some(usage) = crate::usage::usage_from_gemini(&value) {
                    self.usage = usage;
                    self.has_usage = true;
                }
            }
            UsageWire::Responses => {
                let usage = value
                    .get("response")
                    .and_then(|r| crate::usage::usage_from_openai(r));
                if let Some(usage) = usage {
                    self.usage = usage;
                    self.has_usage = true;
                }
            }
        }
    }

    fn scan_claude(&mut self, value: &Value) {
        match value.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(message) = value.get("message") {
                    if let Some(usage) = crate::usage::usage_from_claude(message) {
                        self.usage.input_tokens = usage.input_tokens;
                        self.usage.cache_creation_input_tokens = usage.cache_creation_total();
                        self.usage.cache_read_input_tokens = usage.cache_read_input_tokens;
                        self.has_usage = true;
                    }
                }
            }
            Some("message_delta") => {
                if let Some(usage) = value.get("usage") {
                    if let Some(input) = usage.get("input_tokens").and_then(Value::as_i64) {
                        self.usage.input_tokens = input;
                    }
                    if let Some(output) = usage.get("output_tokens").and_then(Value::as_i64) {
                        self.usage.output_tokens = output;
                    }
                    self.has_usage = true;
                }
            }
            _ => {}
        }
    }
}

impl StreamTranslator for PassthroughStream {
    fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        let text = String::from_utf8_lossy(chunk).into_owned();
        for line in self.buffer.push(&text) {
            self.scan_line(&line);
        }
        if chunk.is_empty() {
            Vec::new()
        } else {
            vec![Bytes::copy_from_slice(chunk)]
        }
    }

    fn finish(&mut self) -> Vec<Bytes> {
        if let Some(line) = self.buffer.finish() {
            self.scan_line(&line);
        }
        Vec::new()
    }

    fn usage(&self) -> Option<Usage> {
        self.has_usage.then_some(self.usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_bytes_untouched_and_harvests_openai_usage() {
        let mut stream = PassthroughStream::new(UsageWire::OpenAi);
        let chunk = b"data: {\"choices\":[],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2}}\n\ndata: [DONE]\n\n";
        let frames = stream.push(chunk);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), chunk.as_ref());
        let usage = stream.usage().unwrap();
        assert_eq!(usage.input_tokens, 4);
        assert_eq!(usage.output_tokens, 2);
    }

    #[test]
    fn claude_usage_spans_start_and_delta() {
        let mut stream = PassthroughStream::new(UsageWire::Claude);
        stream.push(
            b"event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":7}}}\n\n",
        );
        stream.push(
            b"event: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":3}}\n\n",
        );
        let usage = stream.usage().unwrap();
        assert_eq!(usage.input_tokens, 7);
        assert_eq!(usage.output_tokens, 3);
    }

    #[test]
    fn usage_line_split_across_chunks_still_counts() {
        let mut stream = PassthroughStream::new(UsageWire::OpenAi);
        stream.push(b"data: {\"usage\":{\"prompt_tokens\":4,");
        stream.push(b"\"completion_tokens\":2}}\n\n");
        let usage = stream.usage().unwrap();
        assert_eq!(usage.output_tokens, 2);
    }
}
