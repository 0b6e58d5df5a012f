use bytes::Bytes;
use time::OffsetDateTime;

use relayx_common::Usage;
use relayx_core::StreamTranslator;
use relayx_protocol::claude::{ContentBlockDelta, KnownStreamEvent, StreamEvent};
use relayx_protocol::openai::{ChatCompletionChunk, ChatUsage};
use relayx_protocol::reasons::anthropic_stop_reason_to_openai;
use relayx_protocol::sse::{data_payload, frame, SseLineBuffer, DONE_PAYLOAD};

const CHUNK_ID: &str = "chatcmpl-claude";

/// Claude Messages SSE -> Chat Completions chunks.
///
/// Text deltas become content chunks; `message_start` captures input
/// tokens; `message_delta` emits the finishing chunk with mapped
/// finish_reason and usage. Exactly one `data: [DONE]` terminator goes
/// out no matter what the upstream sent.
pub struct ClaudeToChatStream {
    model: String,
    created: i64,
    buffer: SseLineBuffer,
    usage: Usage,
    has_usage: bool,
    done_sent: bool,
    finish_sent: bool,
}

impl ClaudeToChatStream {
    pub fn new(model: &str) -> Self {
        ClaudeToChatStream {
            model: model.to_string(),
            created: OffsetDateTime::now_utc().unix_timestamp(),
            buffer: SseLineBuffer::new(),
            usage: Usage::default(),
            has_usage: false,
            done_sent: false,
            finish_sent: false,
        }
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<Bytes>) {
        let Some(payload) = data_payload(line) else {
            return;
        };
        if payload == DONE_PAYLOAD {
            if !self.done_sent {
                self.done_sent = true;
                out.push(Bytes::from(frame(DONE_PAYLOAD)));
            }
            return;
        }
        let Ok(event) = serde_json::from_str::<StreamEvent>(payload) else {
            return;
        };
        let StreamEvent::Known(event) = event else {
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
                        let chunk =
                            ChatCompletionChunk::text(CHUNK_ID, &self.model, self.created, text);
                        out.push(chunk_frame(&chunk));
                    }
                }
            }
            KnownStreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    usage.merge_into(&mut self.usage);
                    self.has_usage = true;
                }
                let finish_reason =
                    anthropic_stop_reason_to_openai(delta.stop_reason.as_deref().unwrap_or(""));
                let chat_usage = self.has_usage.then(|| ChatUsage {
                    prompt_tokens: self.usage.input_tokens,
                    completion_tokens: self.usage.output_tokens,
                    total_tokens: self.usage.input_tokens + self.usage.output_tokens,
                });
                self.finish_sent = true;
                let chunk = ChatCompletionChunk::finish(
                    CHUNK_ID,
                    &self.model,
                    self.created,
                    finish_reason,
                    chat_usage,
                );
                out.push(chunk_frame(&chunk));
            }
            KnownStreamEvent::MessageStop => {
                if !self.finish_sent {
                    self.finish_sent = true;
                    let chunk = ChatCompletionChunk::finish(
                        CHUNK_ID,
                        &self.model,
                        self.created,
                        "stop".to_string(),
                        None,
                    );
                    out.push(chunk_frame(&chunk));
                }
            }
            _ => {}
        }
    }
}

fn chunk_frame(chunk: &ChatCompletionChunk) -> Bytes {
    let payload = serde_json::to_string(chunk).unwrap_or_default();
    Bytes::from(frame(&payload))
}

impl StreamTranslator for ClaudeToChatStream {
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
        if !self.done_sent {
            self.done_sent = true;
            out.push(Bytes::from(frame(DONE_PAYLOAD)));
        }
        out
    }

    fn usage(&self) -> Option<Usage> {
        self.has_usage.then_some(self.usage)
    }
}
