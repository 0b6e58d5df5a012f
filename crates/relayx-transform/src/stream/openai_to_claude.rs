use bytes::Bytes;
use serde_json::{json, Value};

use relayx_common::Usage;
use relayx_core::StreamTranslator;
use relayx_protocol::reasons::openai_finish_reason_to_anthropic;
use relayx_protocol::sse::{data_payload, frame_event, SseLineBuffer, DONE_PAYLOAD};

/// Chat Completions chunks -> Claude Messages SSE framing.
///
/// The first content chunk opens the message (message_start +
/// content_block_start); deltas map to text_delta events; the upstream
/// finish_reason closes the block and emits message_delta/message_stop
/// with the mapped stop_reason.
pub struct OpenAiToClaudeStream {
    model: String,
    buffer: SseLineBuffer,
    usage: Usage,
    has_usage: bool,
    message_opened: bool,
    message_closed: bool,
}

impl OpenAiToClaudeStream {
    pub fn new(model: &str) -> Self {
        OpenAiToClaudeStream {
            model: model.to_string(),
            buffer: SseLineBuffer::new(),
            usage: Usage::default(),
            has_usage: false,
            message_opened: false,
            message_closed: false,
        }
    }

    fn open_message(&mut self, id: &str, out: &mut Vec<Bytes>) {
        if self.message_opened {
            return;
        }
        self.message_opened = true;
        let start = json!({
            "type": "message_start",
            "message": {
                "id": id,
                "type": "message",
                "role": "assistant",
                "model": self.model,
                "content": [],
                "stop_reason": null,
                "usage": {"input_tokens": 0, "output_tokens": 0},
            }
        });
        out.push(event_frame("message_start", &start));
        let block_start = json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": {"type": "text", "text": ""},
        });
        out.push(event_frame("content_block_start", &block_start));
    }

    fn close_message(&mut self, finish_reason: &str, out: &mut Vec<Bytes>) {
        if self.message_closed {
            return;
        }
        self.open_message("chatcmpl-stream", out);
        self.message_closed = true;

        let block_stop = json!({"type": "content_block_stop", "index": 0});
        out.push(event_frame("content_block_stop", &block_stop));

        let stop_reason = openai_finish_reason_to_anthropic(finish_reason);
        let message_delta = json!({
            "type": "message_delta",
            "delta": {"stop_reason": stop_reason, "stop_sequence": null},
            "usage": {
                "input_tokens": self.usage.input_tokens,
                "output_tokens": self.usage.output_tokens,
            },
        });
        out.push(event_frame("message_delta", &message_delta));
        out.push(event_frame("message_stop", &json!({"type": "message_stop"})));
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<Bytes>) {
        let Some(payload) = data_payload(line) else {
            return;
        };
        if payload == DONE_PAYLOAD {
            self.close_message("stop", out);
            return;
        }
        let Ok(chunk) = serde_json::from_str::<Value>(payload) else {
            return;
        };

        if let Some(usage) = crate::usage::usage_from_openai(&chunk) {
            self.usage = usage;
            self.has_usage = true;
        }

        let id = chunk
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("chatcmpl-stream")
            .to_string();
        let Some(choice) = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
        else {
            return;
        };

        if let Some(content) = choice
            .get("delta")
            .and_then(|delta| delta.get("content"))
            .and_then(Value::as_str)
        {
            if !content.is_empty() {
                self.open_message(&id, out);
                let delta = json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": {"type": "text_delta", "text": content},
                });
                out.push(event_frame("content_block_delta", &delta));
            }
        }

        if let Some(finish_reason) = choice.get("finish_reason").and_then(Value::as_str) {
            if !finish_reason.is_empty() {
                self.close_message(finish_reason, out);
            }
        }
    }
}

fn event_frame(event: &str, payload: &Value) -> Bytes {
    Bytes::from(frame_event(event, &payload.to_string()))
}

impl StreamTranslator for OpenAiToClaudeStream {
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
        if self.message_opened && !self.message_closed {
            self.close_message("stop", &mut out);
        }
        out
    }

    fn usage(&self) -> Option<Usage> {
        self.has_usage.then_some(self.usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_names(frames: &[Bytes]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|frame| {
                let text = String::from_utf8_lossy(frame);
                text.lines()
                    .find_map(|line| line.strip_prefix("event: ").map(str::to_string))
            })
            .collect()
    }

    #[test]
    fn full_stream_produces_claude_event_sequence() {
        let mut stream = OpenAiToClaudeStream::new("claude-3");
        let mut frames = stream.push(
            b"data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"},\"finish_reason\":null}]}\n\n",
        );
        frames.extend(stream.push(
            b"data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2}}\n\n",
        ));
        frames.extend(stream.push(b"data: [DONE]\n\n"));
        frames.extend(stream.finish());

        assert_eq!(
            event_names(&frames),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        let usage = stream.usage().unwrap();
        assert_eq!(usage.input_tokens, 4);
        assert_eq!(usage.output_tokens, 2);
    }

    #[test]
    fn done_without_finish_reason_still_closes() {
        let mut stream = OpenAiToClaudeStream::new("m");
        stream.push(
            b"data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"x\"},\"finish_reason\":null}]}\n\n",
        );
        let frames = stream.push(b"data: [DONE]\n\n");
        assert!(event_names(&frames).contains(&"message_stop".to_string()));
        assert!(stream.finish().is_empty());
    }

    #[test]
    fn length_maps_to_max_tokens() {
        let mut stream = OpenAiToClaudeStream::new("m");
        let frames = stream.push(
            b"data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"length\"}]}\n\n",
        );
        let text = frames
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect::<String>();
        assert!(text.contains("\"stop_reason\":\"max_tokens\""));
    }
}
