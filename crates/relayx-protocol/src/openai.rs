use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One `chat.completion.chunk` frame as the proxy emits it when
/// translating a foreign stream into the Chat Completions format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

impl ChatCompletionChunk {
    pub fn text(id: &str, model: &str, created: i64, text: String) -> Self {
        ChatCompletionChunk {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    content: Some(text),
                    ..ChunkDelta::default()
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    pub fn finish(
        id: &str,
        model: &str,
        created: i64,
        finish_reason: String,
        usage: Option<ChatUsage>,
    ) -> Self {
        ChatCompletionChunk {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta::default(),
                finish_reason: Some(finish_reason),
            }],
            usage,
        }
    }
}

/// OpenAI-shaped error body for terminal proxy errors on the Chat and
/// Responses surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: String,
    pub code: String,
}

impl ErrorBody {
    pub fn new(message: &str, kind: &str, code: &str) -> Self {
        ErrorBody {
            error: ErrorDetail {
                message: message.to_string(),
                r#type: kind.to_string(),
                code: code.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_chunk_serializes_without_usage_or_finish() {
        let chunk = ChatCompletionChunk::text("chatcmpl-claude", "m", 7, "Hi".to_string());
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["object"], "chat.completion.chunk");
        assert_eq!(json["choices"][0]["delta"]["content"], "Hi");
        assert_eq!(json["choices"][0]["finish_reason"], Value::Null);
        assert!(json.get("usage").is_none());
    }

    #[test]
    fn finish_chunk_carries_usage() {
        let chunk = ChatCompletionChunk::finish(
            "id",
            "m",
            7,
            "stop".to_string(),
            Some(ChatUsage {
                prompt_tokens: 4,
                completion_tokens: 2,
                total_tokens: 6,
            }),
        );
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
        assert_eq!(json["usage"]["total_tokens"], 6);
    }
}
