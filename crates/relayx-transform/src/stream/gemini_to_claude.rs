use bytes::Bytes;
use serde_json::{json, Value};

use relayx_common::Usage;
use relayx_core::StreamTranslator;
use relayx_protocol::sse::{data_payload, frame_event, SseLineBuffer};

/// Gemini streamGenerateContent (alt=sse) chunks -> Claude Messages SSE
/// framing for the Messages client.
pub struct GeminiToClaudeStream {
    model: String,
    buffer: SseLineBuffer,
    usage: Usage,
    has_usage: bool,
    message_opened: bool,
    message_closed: bool,
}

impl GeminiToClaudeStream {
    pub fn new(model: &str) -> Self {
        GeminiToClaudeStream {
            model: model.to_string(),
            buffer: SseLineBuffer::new(),
            usage: Usage::default(),
            has_usage: false,
            message_opened: false,
            message_closed: false,
        }
    }

    fn open_message(&mut self, out: &mut Vec<Bytes>) {
        if self.message_opened {
            return;
        }
        self.message_opened = true;
        let start = json!({
            "type": "message_start",
            "message": {
                "id": "msg-gemini",
                "type": "message",
                "role": "assistant",
                "model": self.model,
                "content": [],
                "stop_reason": null,
                "usage": {"input_tokens": 0, "output_tokens": 0},
            }
        });
        out.push(event_frame("message_start", &start));
        out.push(event_frame(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": {"type": "text", "text": ""},
            }),
        ));
    }

    fn close_message(&mut self, out: &mut Vec<Bytes>) {
        if self.message_closed || !self.message_opened {
            return;
        }
        self.message_closed = true;
        out.push(event_frame(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": 0}),
        ));
        out.push(event_frame(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                "usage": {
                    "input_tokens": self.usage.input_tokens,
                    "output_tokens": self.usage.output_tokens,
                },
            }),
        ));
        out.push(event_frame("message_stop", &json!({"type": "message_stop"})));
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<Bytes>) {
        let Some(payload) = data_payload(line) else {
            return;
        };
        let Ok(chunk) = serde_json::from_str::<Value>(payload) else {
            return;
        };

        if let Some(usage) = crate::usage::usage_from_gemini(&chunk) {
            self.usage = usage;
            self.has_usage = true;
        }

        let parts = chunk
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array);
        if let Some(parts) = parts {
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        self.open_message(out);
                        out.push(event_frame(
                            "content_block_delta",
                            &json!({
                                "type": "content_block_delta",
                                "index": 0,
                                "delta": {"type": "text_delta", "text": text},
                            }),
                        ));
                    }
                }
            }
        }
    }
}

fn event_frame(event: &str, payload: &Value) -> Bytes {
    Bytes::from(frame_event(event, &payload.to_string()))
}

impl StreamTranslator for GeminiToClaudeStream {
    fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        let text = String::from_utf8_lossy(chunk).into_owned();
        let mut out = Vec::new();
        for line in self.buffer.push(&text) {
            self.handle_line(&line, &mut out);
        }
        out
    }

    fn finish(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        if let Some(line) = self.buffer.finish() {
            self.handle_line(&line, &mut out);
        }
        self.close_message(&mut out);
        out
    }

    fn usage(&self) -> Option<Usage> {
        self.has_usage.then_some(self.usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_chunks_become_claude_events() {
        let mut stream = GeminiToClaudeStream::new("gemini-2.0-flash");
        let frames = stream.push(
            b"data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hi\"}]}}],\"usageMetadata\":{\"promptTokenCount\":6,\"candidatesTokenCount\":1}}\n\n",
        );
        // message_start + content_block_start + content_block_delta
        assert_eq!(frames.len(), 3);

        let trailing = stream.finish();
        let text: String = trailing
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect();
        assert!(text.contains("message_stop"));
        let usage = stream.usage().unwrap();
        assert_eq!(usage.input_tokens, 6);
        assert_eq!(usage.output_tokens, 1);
    }
}
