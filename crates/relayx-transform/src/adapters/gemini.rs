use bytes::Bytes;

use relayx_common::{ApiType, ServiceType, Usage};
use relayx_core::{
    AdapterError, ChannelConfig, ProtocolAdapter, StreamTranslator, UpstreamHttpRequest,
};
use relayx_protocol::gemini::{ErrorBody, GenerateContentRequest};

use super::convert;
use super::{ensure_model_supported, parse_json_body, parse_upstream_json, post_request, serialize};
use crate::stream::{
    ClaudeToGeminiStream, OpenAiToGeminiStream, PassthroughStream, UsageWire,
};
use crate::usage::{patch_usage, usage_from_claude, usage_from_gemini, usage_from_openai};

/// Gemini generateContent client surface.
#[derive(Default)]
pub struct GeminiAdapter;

impl GeminiAdapter {
    pub fn new() -> Self {
        GeminiAdapter
    }
}

impl ProtocolAdapter for GeminiAdapter {
    fn api_type(&self) -> ApiType {
        ApiType::Gemini
    }

    fn build_request(
        &self,
        channel: &ChannelConfig,
        base_url: &str,
        api_key: &str,
        body: &[u8],
        model: &str,
        stream: bool,
    ) -> Result<UpstreamHttpRequest, AdapterError> {
        ensure_model_supported(channel, model)?;
        let mapped = channel.redirect_model(model);

        let payload = match channel.service_type {
            ServiceType::Claude => {
                let request = parse_json_body(body, "gemini")?;
                serialize(&convert::claude_request_from_gemini(&request, &mapped, stream))
            }
            ServiceType::OpenAI => {
                let request = parse_json_body(body, "gemini")?;
                serialize(&convert::chat_request_from_gemini(&request, &mapped, stream))
            }
            // Native passthrough, with the thought-signature flags
            // applied on a typed copy. Unknown service types behave as
            // gemini-compatible.
            _ => {
                let mut request: GenerateContentRequest = serde_json::from_slice(body)
                    .map_err(|err| AdapterError::Build(format!("invalid gemini body: {err}")))?;
                if channel.strip_thought_signature {
                    request.strip_thought_signatures();
                } else if channel.inject_dummy_thought_signature {
                    request.inject_dummy_thought_signatures();
                }
                serde_json::to_vec(&request)
                    .map_err(|err| AdapterError::Build(err.to_string()))?
            }
        };
        Ok(post_request(channel, base_url, api_key, &mapped, stream, payload))
    }

    fn translate_body(
        &self,
        channel: &ChannelConfig,
        body: Bytes,
        model: &str,
        request_body: &[u8],
    ) -> Result<(Bytes, Option<Usage>), AdapterError> {
        match channel.service_type {
            ServiceType::Claude => {
                let claude = parse_upstream_json(&body, "claude response")?;
                let gemini = convert::gemini_response_from_claude(&claude);
                let content = claude.get("content").cloned().unwrap_or(serde_json::Value::Null);
                let usage = patch_usage(
                    usage_from_claude(&claude),
                    request_body,
                    &content,
                    channel.low_quality,
                );
                Ok((Bytes::from(serialize(&gemini)), Some(usage)))
            }
            ServiceType::OpenAI => {
                let chat = parse_upstream_json(&body, "chat response")?;
                let gemini = convert::gemini_response_from_chat(&chat);
                let content = gemini
                    .get("candidates")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                let usage = patch_usage(
                    usage_from_openai(&chat),
                    request_body,
                    &content,
                    channel.low_quality,
                );
                Ok((Bytes::from(serialize(&gemini)), Some(usage)))
            }
            _ => {
                // Native passthrough. Usage is harvested when the body
                // parses; aggregators sometimes return non-JSON which
                // still belongs to the client verbatim.
                match serde_json::from_slice::<serde_json::Value>(&body) {
                    Ok(value) => {
                        let usage = usage_from_gemini(&value);
                        Ok((body, usage))
                    }
                    Err(_) => Ok((body, None)),
                }
            }
        }
    }

    fn new_stream(&self, channel: &ChannelConfig, model: &str) -> Box<dyn StreamTranslator> {
        match channel.service_type {
            ServiceType::Claude => Box::new(ClaudeToGeminiStream::new(model)),
            ServiceType::OpenAI => Box::new(OpenAiToGeminiStream::new(model)),
            _ => Box::new(PassthroughStream::new(UsageWire::Gemini)),
        }
    }

    fn error_body(&self, status: u16, message: &str) -> Bytes {
        let status_name = match status {
            400 => "INVALID_ARGUMENT",
            401 => "UNAUTHENTICATED",
            403 => "PERMISSION_DENIED",
            404 => "NOT_FOUND",
            413 => "INVALID_ARGUMENT",
            429 => "RESOURCE_EXHAUSTED",
            503 => "UNAVAILABLE",
            _ => "INTERNAL",
        };
        Bytes::from(
            serde_json::to_vec(&ErrorBody::new(status, message, status_name)).unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayx_protocol::gemini::DUMMY_THOUGHT_SIGNATURE;
    use serde_json::json;

    fn adapter() -> GeminiAdapter {
        GeminiAdapter::new()
    }

    fn channel(service_type: ServiceType) -> ChannelConfig {
        ChannelConfig {
            name: "g1".to_string(),
            base_url: "https://u1".to_string(),
            api_keys: vec!["AIza-k1".to_string()],
            service_type,
            ..ChannelConfig::default()
        }
    }

    fn body_with_call(signature: Option<&str>) -> Vec<u8> {
        let mut call = json!({"name": "f", "args": {}});
        if let Some(sig) = signature {
            call["thoughtSignature"] = json!(sig);
        }
        serde_json::to_vec(&json!({
            "contents": [{"role": "model", "parts": [{"functionCall": call}]}],
        }))
        .unwrap()
    }

    #[test]
    fn native_url_and_auth_header() {
        let request = adapter()
            .build_request(
                &channel(ServiceType::Gemini),
                "https://u1",
                "AIza-k1",
                &body_with_call(None),
                "gemini-2.0-flash",
                true,
            )
            .unwrap();
        assert_eq!(
            request.url,
            "https://u1/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse"
        );
        assert!(request
            .headers
            .iter()
            .any(|(name, value)| name == "x-goog-api-key" && value == "AIza-k1"));
    }

    #[test]
    fn default_passthrough_keeps_signatures() {
        let request = adapter()
            .build_request(
                &channel(ServiceType::Gemini),
                "https://u1",
                "k",
                &body_with_call(Some("sig")),
                "m",
                false,
            )
            .unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
        assert_eq!(
            value["contents"][0]["parts"][0]["functionCall"]["thoughtSignature"],
            "sig"
        );
    }

    #[test]
    fn strip_flag_removes_signatures() {
        let mut ch = channel(ServiceType::Gemini);
        ch.strip_thought_signature = true;
        let request = adapter()
            .build_request(&ch, "https://u1", "k", &body_with_call(Some("sig")), "m", false)
            .unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
        assert!(value["contents"][0]["parts"][0]["functionCall"]
            .get("thoughtSignature")
            .is_none());
    }

    #[test]
    fn inject_flag_fills_empty_signatures() {
        let mut ch = channel(ServiceType::Gemini);
        ch.inject_dummy_thought_signature = true;
        let request = adapter()
            .build_request(&ch, "https://u1", "k", &body_with_call(Some("")), "m", false)
            .unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
        assert_eq!(
            value["contents"][0]["parts"][0]["functionCall"]["thoughtSignature"],
            DUMMY_THOUGHT_SIGNATURE
        );
    }

    #[test]
    fn claude_upstream_translation_and_usage() {
        let body = Bytes::from_static(
            br#"{"content":[{"type":"text","text":"ok"}],"usage":{"input_tokens":6,"output_tokens":3}}"#,
        );
        let (reply, usage) = adapter()
            .translate_body(&channel(ServiceType::Claude), body, "gemini-pro", b"{}")
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(value["candidates"][0]["content"]["parts"][0]["text"], "ok");
        assert_eq!(usage.unwrap().output_tokens, 3);
    }

    #[test]
    fn gemini_error_body_shape() {
        let body = adapter().error_body(503, "All channels failed");
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], 503);
        assert_eq!(value["error"]["status"], "UNAVAILABLE");
    }
}
