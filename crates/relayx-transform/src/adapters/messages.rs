use std::sync::Arc;

use bytes::Bytes;
use serde_json::json;

use relayx_common::{ApiType, ServiceType, Usage};
use relayx_core::{
    AdapterError, ChannelConfig, ConfigView, ProtocolAdapter, StreamTranslator,
    UpstreamHttpRequest,
};
use relayx_protocol::claude;

use super::convert;
use super::{ensure_model_supported, parse_json_body, parse_upstream_json, post_request, serialize};
use crate::preprocess::{remove_empty_signatures, set_model, strip_billing_header};
use crate::stream::{
    GeminiToClaudeStream, OpenAiToClaudeStream, PassthroughStream, UsageWire,
};
use crate::usage::{patch_usage, usage_from_claude, usage_from_gemini, usage_from_openai};

/// Claude Messages client surface.
pub struct MessagesAdapter {
    config: Arc<ConfigView>,
}

impl MessagesAdapter {
    pub fn new(config: Arc<ConfigView>) -> Self {
        MessagesAdapter { config }
    }
}

impl ProtocolAdapter for MessagesAdapter {
    fn api_type(&self) -> ApiType {
        ApiType::Messages
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
        let mut request = parse_json_body(body, "messages")?;

        let payload = match channel.service_type {
            ServiceType::Claude => {
                set_model(&mut request, &mapped);
                remove_empty_signatures(&mut request);
                if self.config.strip_billing_header() {
                    strip_billing_header(&mut request);
                }
                serialize(&request)
            }
            ServiceType::OpenAI => {
                serialize(&convert::chat_request_from_claude(&request, &mapped, stream))
            }
            ServiceType::Gemini => {
                serialize(&convert::gemini_request_from_claude(&request))
            }
            ServiceType::Responses => {
                return Err(AdapterError::Build(
                    "service type responses is not supported for the messages surface".to_string(),
                ));
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
                let mut value = parse_upstream_json(&body, "claude response")?;
                let content = value.get("content").cloned().unwrap_or(serde_json::Value::Null);
                let usage = patch_usage(
                    usage_from_claude(&value),
                    request_body,
                    &content,
                    channel.low_quality,
                );
                if let Some(map) = value.as_object_mut() {
                    map.insert(
                        "usage".to_string(),
                        json!({
                            "input_tokens": usage.input_tokens,
                            "output_tokens": usage.output_tokens,
                            "cache_creation_input_tokens": usage.cache_creation_total(),
                            "cache_read_input_tokens": usage.cache_read_input_tokens,
                        }),
                    );
                }
                Ok((Bytes::from(serialize(&value)), Some(usage)))
            }
            ServiceType::OpenAI => {
                let chat = parse_upstream_json(&body, "chat response")?;
                let claude = convert::claude_response_from_chat(&chat, model);
                let content = claude.get("content").cloned().unwrap_or(serde_json::Value::Null);
                let usage = patch_usage(
                    usage_from_openai(&chat),
                    request_body,
                    &content,
                    channel.low_quality,
                );
                Ok((Bytes::from(serialize(&claude)), Some(usage)))
            }
            ServiceType::Gemini => {
                let gemini = parse_upstream_json(&body, "gemini response")?;
                let claude = convert::claude_response_from_gemini(&gemini, model);
                let content = claude.get("content").cloned().unwrap_or(serde_json::Value::Null);
                let usage = patch_usage(
                    usage_from_gemini(&gemini),
                    request_body,
                    &content,
                    channel.low_quality,
                );
                Ok((Bytes::from(serialize(&claude)), Some(usage)))
            }
            ServiceType::Responses => Err(AdapterError::Build(
                "service type responses is not supported for the messages surface".to_string(),
            )),
        }
    }

    fn new_stream(&self, channel: &ChannelConfig, model: &str) -> Box<dyn StreamTranslator> {
        match channel.service_type {
            ServiceType::OpenAI => Box::new(OpenAiToClaudeStream::new(model)),
            ServiceType::Gemini => Box::new(GeminiToClaudeStream::new(model)),
            _ => Box::new(PassthroughStream::new(UsageWire::Claude)),
        }
    }

    fn error_body(&self, status: u16, message: &str) -> Bytes {
        let kind = match status {
            400 => "invalid_request_error",
            401 => "authentication_error",
            403 => "permission_error",
            404 => "not_found_error",
            413 => "request_too_large",
            429 => "rate_limit_error",
            503 => "overloaded_error",
            _ => "api_error",
        };
        Bytes::from(serde_json::to_vec(&claude::ErrorBody::new(kind, message)).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayx_core::Config;

    fn adapter() -> MessagesAdapter {
        MessagesAdapter::new(Arc::new(ConfigView::new(Config::default())))
    }

    fn claude_channel() -> ChannelConfig {
        ChannelConfig {
            name: "c1".to_string(),
            base_url: "https://u1".to_string(),
            api_keys: vec!["sk-ant-k1".to_string()],
            service_type: ServiceType::Claude,
            ..ChannelConfig::default()
        }
    }

    #[test]
    fn claude_passthrough_renames_model_and_builds_url() {
        let mut channel = claude_channel();
        channel
            .model_mapping
            .insert("claude-3".to_string(), "claude-3-backend".to_string());
        let request = adapter()
            .build_request(
                &channel,
                "https://u1",
                "sk-ant-k1",
                br#"{"model":"claude-3","messages":[{"role":"user","content":"hi"}]}"#,
                "claude-3",
                false,
            )
            .unwrap();
        assert_eq!(request.url, "https://u1/v1/messages");
        let body: serde_json::Value =
            serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["model"], "claude-3-backend");
        assert!(request
            .headers
            .iter()
            .any(|(name, value)| name == "x-api-key" && value == "sk-ant-k1"));
    }

    #[test]
    fn malformed_client_body_is_a_build_error() {
        let channel = claude_channel();
        let err = adapter()
            .build_request(&channel, "https://u1", "k", b"{broken", "m", false)
            .unwrap_err();
        assert!(matches!(err, AdapterError::Build(_)));
    }

    #[test]
    fn unsupported_model_is_a_build_error() {
        let mut channel = claude_channel();
        channel.supported_models = vec!["claude-3*".to_string()];
        let err = adapter()
            .build_request(&channel, "https://u1", "k", b"{}", "gpt-4o", false)
            .unwrap_err();
        assert!(matches!(err, AdapterError::Build(_)));
    }

    #[test]
    fn openai_upstream_gets_chat_shape() {
        let mut channel = claude_channel();
        channel.service_type = ServiceType::OpenAI;
        let request = adapter()
            .build_request(
                &channel,
                "https://u1",
                "k",
                br#"{"model":"claude-3","system":"be nice","messages":[{"role":"user","content":"hi"}]}"#,
                "claude-3",
                true,
            )
            .unwrap();
        assert_eq!(request.url, "https://u1/v1/chat/completions");
        let body: serde_json::Value =
            serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn html_instead_of_json_is_invalid_response() {
        let channel = claude_channel();
        let err = adapter()
            .translate_body(&channel, Bytes::from_static(b"<html>gateway</html>"), "m", b"{}")
            .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidResponseBody(_)));
    }

    #[test]
    fn claude_response_usage_is_patched_when_missing() {
        let channel = claude_channel();
        let (body, usage) = adapter()
            .translate_body(
                &channel,
                Bytes::from_static(
                    br#"{"content":[{"type":"text","text":"a long answer with several words"}]}"#,
                ),
                "m",
                br#"{"messages":[{"role":"user","content":"a question goes here"}]}"#,
            )
            .unwrap();
        let usage = usage.unwrap();
        assert!(usage.input_tokens > 0);
        assert!(usage.output_tokens > 0);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["usage"]["input_tokens"], usage.input_tokens);
    }

    #[test]
    fn error_body_is_claude_shaped() {
        let body = adapter().error_body(503, "all channels failed");
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["type"], "overloaded_error");
    }
}
