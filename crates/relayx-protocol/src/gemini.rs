use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Placeholder signature injected into empty `functionCall` signatures
/// when a channel sets the inject flag (some aggregator endpoints reject
/// calls without one).
pub const DUMMY_THOUGHT_SIGNATURE: &str = "skip_thought_signature_validator";

/// Gemini generateContent request. Only the parts the proxy rewrites are
/// typed; everything else flows through the flattened map untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateContentRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contents: Vec<Content>,
    #[serde(
        rename = "systemInstruction",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub system_instruction: Option<Value>,
    #[serde(
        rename = "generationConfig",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub generation_config: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<Part>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(
        rename = "functionCall",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub function_call: Option<FunctionCall>,
    /// Part-level signature; always preserved verbatim.
    #[serde(
        rename = "thoughtSignature",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub thought_signature: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    /// Omitted from the wire when `None`, so clearing it strips the
    /// field entirely.
    #[serde(
        rename = "thoughtSignature",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub thought_signature: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GenerateContentRequest {
    /// Strip flag: remove `thoughtSignature` from every `functionCall`.
    /// Part-level signatures stay.
    pub fn strip_thought_signatures(&mut self) {
        for content in &mut self.contents {
            for part in &mut content.parts {
                if let Some(call) = part.function_call.as_mut() {
                    call.thought_signature = None;
                }
            }
        }
    }

    /// Inject flag: fill absent or empty `functionCall` signatures with
    /// the dummy value, preserving non-empty ones.
    pub fn inject_dummy_thought_signatures(&mut self) {
        for content in &mut self.contents {
            for part in &mut content.parts {
                if let Some(call) = part.function_call.as_mut() {
                    match call.thought_signature.as_deref() {
                        None | Some("") => {
                            call.thought_signature = Some(DUMMY_THOUGHT_SIGNATURE.to_string());
                        }
                        Some(_) => {}
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    pub prompt_token_count: i64,
    #[serde(rename = "candidatesTokenCount", default)]
    pub candidates_token_count: i64,
    #[serde(rename = "cachedContentTokenCount", default)]
    pub cached_content_token_count: i64,
}

/// Gemini-shaped error body for terminal proxy errors on the Gemini
/// surface.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub code: u16,
    pub message: String,
    pub status: String,
}

impl ErrorBody {
    pub fn new(code: u16, message: &str, status: &str) -> Self {
        ErrorBody {
            error: ErrorDetail {
                code,
                message: message.to_string(),
                status: status.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_with_call(signature: Option<&str>) -> GenerateContentRequest {
        let mut call = json!({"name": "get_weather", "args": {"city": "Paris"}});
        if let Some(sig) = signature {
            call["thoughtSignature"] = json!(sig);
        }
        serde_json::from_value(json!({
            "contents": [{"role": "model", "parts": [{"functionCall": call}]}],
        }))
        .unwrap()
    }

    #[test]
    fn strip_removes_the_field_from_the_wire() {
        let mut req = request_with_call(Some("real-signature"));
        req.strip_thought_signatures();
        let wire = serde_json::to_value(&req).unwrap();
        let call = &wire["contents"][0]["parts"][0]["functionCall"];
        assert!(call.get("thoughtSignature").is_none());
    }

    #[test]
    fn inject_fills_only_empty_signatures() {
        let mut req = request_with_call(Some(""));
        req.inject_dummy_thought_signatures();
        let wire = serde_json::to_value(&req).unwrap();
        assert_eq!(
            wire["contents"][0]["parts"][0]["functionCall"]["thoughtSignature"],
            DUMMY_THOUGHT_SIGNATURE
        );

        let mut req = request_with_call(Some("keep-me"));
        req.inject_dummy_thought_signatures();
        let wire = serde_json::to_value(&req).unwrap();
        assert_eq!(
            wire["contents"][0]["parts"][0]["functionCall"]["thoughtSignature"],
            "keep-me"
        );
    }

    #[test]
    fn passthrough_preserves_part_level_signature() {
        let req: GenerateContentRequest = serde_json::from_value(json!({
            "contents": [{"parts": [{"text": "hi", "thoughtSignature": "part-sig"}]}],
        }))
        .unwrap();
        let mut req = req;
        req.inject_dummy_thought_signatures();
        let wire = serde_json::to_value(&req).unwrap();
        assert_eq!(wire["contents"][0]["parts"][0]["thoughtSignature"], "part-sig");
    }

    #[test]
    fn unknown_fields_round_trip() {
        let req: GenerateContentRequest = serde_json::from_value(json!({
            "contents": [{"parts": [{"text": "hi"}]}],
            "safetySettings": [{"category": "X", "threshold": "LOW"}],
        }))
        .unwrap();
        let wire = serde_json::to_value(&req).unwrap();
        assert_eq!(wire["safetySettings"][0]["category"], "X");
    }
}
