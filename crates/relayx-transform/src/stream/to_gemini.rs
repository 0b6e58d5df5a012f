use bytes::Bytes;
use serde_json::{json, Value};

use relayx_common::Usage;
use relayx_core::StreamTranslator;
use relayx_protocol::claude::{ContentBlockDelta, KnownStreamEvent, StreamEvent};
use relayx_protocol::sse::{data_payload, frame, SseLineBuffer, DONE_PAYLOAD};

fn gemini_text_chunk(model: &str, text: &str, finish_reason: Option<&str>) -> Bytes {
    let mut candidate = json!({
        "content": {"role": "model", "parts": [{"text": text}]},
        "index": 0,
    });
    if let Some(reason) = finish_reason {
        candidate["finishReason"] = Value::String(reason.to_string());
    }
    let chunk = json!({
        "candidates": [candidate],
        "modelVersion": model,
    });
    Bytes::from(frame(&chunk.to_string()))
}

fn gemini_final_chunk(model: &str, usage: &Usage) -> Bytes {
    let chunk = json!({
        "candidates": [{
            "content": {"role": "model", "parts": []},
            "finishReason": "STOP",
            "index": 0,
        }],
        "usageMetadata": {
            "promptTokenCount": usage.input_tokens + usage.cache_read_input_tokens,
            "candidatesTokenCount": usage.output_tokens,
            "totalTokenCount": usage.input_tokens
                + usage.cache_read_input_tokens
                + usage.output_tokens,
            "cachedContentTokenCount": usage.cache_read_input_tokens,
        },
        "modelVersion": model,
    });
    Bytes::from(frame(&chunk.to_string()))
}

/// Claude Messages SSE -> Gemini streamGenerateContent chunks.
pub struct ClaudeToGeminiStream {
    model: String,
    buffer: SseLineBuffer,
    usage: Usage,
    has_usage: bool,
    final_sent: bool,
}

impl ClaudeToGeminiStream {
    pub fn new(model: &str) -> Self {
        ClaudeToGeminiStream {
            model: model.to_string(),
            buffer: SseLineBuffer::new(),
            usage: Usage::default(),
            has_usage: false,
            final_sent: false,
        }
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<Bytes>) {
        let Some(payload) = data_payload(line) else {
            return;
        };
        if payload == DONE_PAYLOAD {
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
                        out.push(gemini_text_chunk(&self.model, &text, None));
                    }
                }
            }
            KnownStreamEvent::MessageDelta { usage, .. } => {
                if let Some(usage) = usage {
                    usage.merge_into(&mut self.usage);
                    self.has_usage = true;
                }
            }
            KnownStreamEvent::MessageStop => {
                if !self.final_sent {
                    self.final_sent = true;
                    out.push(gemini_final_chunk(&self.model, &self.usage));
                }
            }
            _ => {}
        }
    }
}

impl StreamTranslator for ClaudeToGeminiStream {
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
        if !self.final_sent {
            self.final_sent = true;
            out.push(gemini_final_chunk(&self.model, &self.usage));
        }
        out
    }

    fn usage(&self) -> Option<Usage> {
        self.has_usage.then_some(self.usage)
    }
}

/// Chat Completions chunks -> Gemini streamGenerateContent chunks.
pub struct OpenAiToGeminiStream {
    model: String,
    buffer: SseLineBuffer,
    usage: Usage,
    has_usage: bool,
    final_sent: bool,
}

impl OpenAiToGeminiStream {
    pub fn new(model: &str) -> Self {
        OpenAiToGeminiStream {
            model: model.to_string(),
            buffer: SseLineBuffer::new(),
            usage: Usage::default(),
            has_usage: false,
            final_sent: false,
        }
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<Bytes>) {
        let Some(payload) = data_payload(line) else {
            return;
        };
        if payload == DONE_PAYLOAD {
            if !self.final_sent {
                self.final_sent = true;
                out.push(gemini_final_chunk(&self.model, &self.usage));
            }
            return;
        }
        let Ok(chunk) = serde_json::from_str::<Value>(payload) else {
            return;
        };
        if let Some(usage) = crate::usage::usage_from_openai(&chunk) {
            self.usage = usage;
            self.has_usage = true;
        }
        let content = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("delta"))
            .and_then(|delta| delta.get("content"))
            .and_then(Value::as_str);
        if let Some(text) = content {
            if !text.is_empty() {
                out.push(gemini_text_chunk(&self.model, text, None));
            }
        }
    }
}

impl StreamTranslator for OpenAiToGeminiStream {
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
        if !self.final_sent {
            self.final_sent = true;
            out.push(gemini_final_chunk(&self.model, &self.usage));
        }
        out
    }

    fn usage(&self) -> Option<Usage> {
        self.has_usage.then_some(self.usage)
    }
}
