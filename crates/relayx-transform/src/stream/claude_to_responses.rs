use bytes::Bytes;
use serde_json::{json, Value};

use relayx_common::Usage;
use relayx_core::StreamTranslator;
use relayx_protocol::claude::{ContentBlockDelta, KnownStreamEvent, StreamEvent};
use relayx_protocol::reasons::{
    anthropic_stop_reason_to_openai, openai_finish_reason_to_responses,
};
use relayx_protocol::sse::{data_payload, frame, SseLineBuffer, DONE_PAYLOAD};

/// Claude Messages SSE -> Responses SSE events. Stop reasons route
/// through the OpenAI mapping so the Responses status table stays the
/// single source of truth.
pub struct ClaudeToResponsesStream {
    model: String,
    buffer: SseLineBuffer,
    usage: Usage,
    has_usage: bool,
    completed_sent: bool,
    stop_reason: String,
    collected: String,
}

impl ClaudeToResponsesStream {
    pub fn new(model: &str) -> Self {
        ClaudeToResponsesStream {
            model: model.to_string(),
            buffer: SseLineBuffer::new(),
            usage: Usage::default(),
            has_usage: false,
            completed_sent: false,
            stop_reason: String::new(),
            collected: String::new(),
        }
    }

    fn complete(&mut self, out: &mut Vec<Bytes>) {
        if self.completed_sent {
            return;
        }
        self.completed_sent = true;
        let finish_reason = anthropic_stop_reason_to_openai(&self.stop_reason);
        let status = openai_finish_reason_to_responses(&finish_reason);
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
        let Ok(StreamEvent::Known(event)) = serde_json::from_str::<StreamEvent>(payload) else {
            return;
        };
        match event {
            KnownStreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    usage.merge_into(&mut self.usage);
                    self.has_usage = true;
                }
            }
            KnownStreamEvent::ContentBlockDelta { delta, .. } => {
                if let ContentBlockDelta::TextDelta { text } = delta {
                    if !text.is_empty() {
                        self.collected.push_str(&text);
                        let event = json!({
                            "type": "response.output_text.delta",
                            "delta": text,
                        });
                        out.push(Bytes::from(frame(&event.to_string())));
                    }
                }
            }
            KnownStreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    usage.merge_into(&mut self.usage);
                    self.has_usage = true;
                }
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = reason;
                }
            }
            KnownStreamEvent::MessageStop => self.complete(out),
            _ => {}
        }
    }
}

impl StreamTranslator for ClaudeToResponsesStream {
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
