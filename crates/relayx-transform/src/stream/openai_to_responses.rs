use bytes::Bytes;
use serde_json::{json, Value};

use relayx_common::Usage;
use relayx_core::StreamTranslator;
use relayx_protocol::reasons::openai_finish_reason_to_responses;
use relayx_protocol::sse::{data_payload, frame, SseLineBuffer, DONE_PAYLOAD};

/// Chat Completions chunks -> Responses SSE events
/// (`response.output_text.delta` per text delta, then a final
/// `response.completed` carrying usage and the mapped status).
pub struct OpenAiToResponsesStream {
    model: String,
    buffer: SseLineBuffer,
    usage: Usage,
    has_usage: bool,
    completed_sent: bool,
    finish_reason: String,
    collected: String,
}

impl OpenAiToResponsesStream {
    pub fn new(model: &str) -> Self {
        OpenAiToResponsesStream {
            model: model.to_string(),
            buffer: SseLineBuffer::new(),
            usage: Usage::default(),
            has_usage: false,
            completed_sent: false,
            finish_reason: String::new(),
            collected: String::new(),
        }
    }

    fn complete(&mut self, out: &mut Vec<Bytes>) {
        if self.completed_sent {
            return;
        }
        self.completed_sent = true;
        let status = openai_finish_reason_to_responses(&self.finish_reason);
        let completed = json!({
            "type": "response.completed",
            "response": {
                "object": "response",
                "model": self.model,
                "status": status,
                "output": [{
                    "type": "message",
                    "role": "assistant",
                    "content": [{"type": "output_text", "text": self.collected}],
                }],
                "usage": {
                    "input_tokens": self.usage.input_tokens,
                    "output_tokens": self.usage.output_tokens,
                    "total_tokens": self.usage.input_tokens + self.usage.output_tokens,
                },
            },
        });
        out.push(Bytes::from(frame(&completed.to_string())));
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<Bytes>) {
        let Some(payload) = data_payload(line) else {
            return;
        };
        if payload == DONE_PAYLOAD {
            self.complete(out);
            return;
        }
        let Ok(chunk) = serde_json::from_str::<Value>(payload) else {
            return;
        };
        if let Some(usage) = crate::usage::usage_from_openai(&chunk) {
            self.usage = usage;
            self.has_usage = true;
        }
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
                self.collected.push_str(content);
                let delta = json!({
                    "type": "response.output_text.delta",
                    "delta": content,
                });
                out.push(Bytes::from(frame(&delta.to_string())));
            }
        }

        if let Some(finish_reason) = choice.get("finish_reason").and_then(Value::as_str) {
            if !finish_reason.is_empty() {
                self.finish_reason = finish_reason.to_string();
            }
        }
    }
}

impl StreamTranslator for OpenAiToResponsesStream {
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
        self.complete(&mut out);
        out
    }

    fn usage(&self) -> Option<Usage> {
        self.has_usage.then_some(self.usage)
    }
}
