use serde::{Deserialize, Serialize};
use serde_json::Value;

use relayx_common::Usage;

/// One event of a Claude Messages SSE stream. Events the proxy does not
/// understand are preserved as raw values so passthrough stays lossless.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Known(KnownStreamEvent),
    Unknown(Value),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KnownStreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockStart {
        index: u32,
        content_block: Value,
    },
    ContentBlockDelta {
        index: u32,
        delta: ContentBlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: MessageDelta,
        #[serde(default)]
        usage: Option<StreamUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: Value,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageStart {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<StreamUsage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlockDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    SignatureDelta {
        #[serde(default)]
        signature: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageDelta {
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct StreamUsage {
    #[serde(default)]
    pub input_tokens: Option<i64>,
    #[serde(default)]
    pub output_tokens: Option<i64>,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<i64>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<i64>,
}

impl StreamUsage {
    /// Merge into an accumulating [`Usage`]; absent fields keep the value
    /// accumulated so far (message_start carries input tokens only,
    /// message_delta carries output tokens).
    pub fn merge_into(&self, usage: &mut Usage) {
        if let Some(input) = self.input_tokens {
            usage.input_tokens = input;
        }
        if let Some(output) = self.output_tokens {
            usage.output_tokens = output;
        }
        if let Some(cache_creation) = self.cache_creation_input_tokens {
            usage.cache_creation_input_tokens = cache_creation;
        }
        if let Some(cache_read) = self.cache_read_input_tokens {
            usage.cache_read_input_tokens = cache_read;
        }
    }
}

/// Claude-shaped error body for terminal proxy errors on the Messages
/// surface.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub r#type: &'static str,
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub r#type: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: &str, message: &str) -> Self {
        ErrorBody {
            r#type: "error",
            error: ErrorDetail {
                r#type: kind.to_string(),
                message: message.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_delta_event() {
        let event: StreamEvent = serde_json::from_str(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
        )
        .unwrap();
        match event {
            StreamEvent::Known(KnownStreamEvent::ContentBlockDelta {
                delta: ContentBlockDelta::TextDelta { text },
                ..
            }) => assert_eq!(text, "Hi"),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parses_message_delta_usage() {
        let event: StreamEvent = serde_json::from_str(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"input_tokens":4,"output_tokens":2}}"#,
        )
        .unwrap();
        match event {
            StreamEvent::Known(KnownStreamEvent::MessageDelta { delta, usage }) => {
                assert_eq!(delta.stop_reason.as_deref(), Some("end_turn"));
                let usage = usage.unwrap();
                assert_eq!(usage.input_tokens, Some(4));
                assert_eq!(usage.output_tokens, Some(2));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn unknown_events_fall_back_to_raw() {
        let event: StreamEvent =
            serde_json::from_str(r#"{"type":"future_event","payload":1}"#).unwrap();
        assert!(matches!(event, StreamEvent::Unknown(_)));
    }
}
