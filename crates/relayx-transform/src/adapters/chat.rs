use bytes::Bytes;

use relayx_common::{ApiType, ServiceType, Usage};
use relayx_core::{
    AdapterError, ChannelConfig, ProtocolAdapter, StreamTranslator, UpstreamHttpRequest,
};
use relayx_protocol::openai;

use super::convert;
use super::{ensure_model_supported, parse_json_body, parse_upstream_json, post_request, serialize};
use crate::preprocess::set_model;
use crate::stream::{ClaudeToChatStream, PassthroughStream, UsageWire};
use crate::usage::{patch_usage, usage_from_claude, usage_from_openai};

/// OpenAI Chat Completions client surface. OpenAI-compatible upstreams
/// (openai, responses, gemini aggregators) take the body as-is with the
/// model renamed; Claude upstreams get a full translation.
#[derive(Default)]
pub struct ChatAdapter;

impl ChatAdapter {
    pub fn new() -> Self {
        ChatAdapter
    }
}

impl ProtocolAdapter for ChatAdapter {
    fn api_type(&self) -> ApiType {
        ApiType::Chat
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

        match channel.service_type {
            ServiceType::Claude => {
                let request = parse_json_body(body, "chat")?;
                let claude = convert::claude_request_from_chat(&request, &mapped, stream);
                Ok(post_request(channel, base_url, api_key, &mapped, stream, serialize(&claude)))
            }
            _ => {
                // OpenAI-compatible passthrough; only touch the body when
                // the model actually changes. Responses and gemini
                // aggregators exposed on this surface speak
                // /chat/completions with Bearer auth, not their native
                // endpoints.
                let payload = if mapped == model {
                    body.to_vec()
                } else {
                    let mut request = parse_json_body(body, "chat")?;
                    set_model(&mut request, &mapped);
                    serialize(&request)
                };
                Ok(UpstreamHttpRequest {
                    method: wreq::Method::POST,
                    url: crate::url::upstream_url(ServiceType::OpenAI, base_url, &mapped, stream),
                    headers: crate::headers::upstream_headers(
                        ServiceType::OpenAI,
                        api_key,
                        &channel.custom_headers,
                    ),
                    body: Some(Bytes::from(payload)),
                    stream,
                    proxy: channel.proxy_url.clone(),
                })
            }
        }
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
                let chat = convert::chat_response_from_claude(&claude, model);
                let content = claude.get("content").cloned().unwrap_or(serde_json::Value::Null);
                let usage = patch_usage(
                    usage_from_claude(&claude),
                    request_body,
                    &content,
                    channel.low_quality,
                );
                Ok((Bytes::from(serialize(&chat)), Some(usage)))
            }
            _ => {
                // Passthrough, byte-exact. Usage is read on the side; a
                // non-JSON body here is an aggregator error page.
                let value = parse_upstream_json(&body, "chat response")?;
                let content = value
                    .get("choices")
                    .and_then(|choices| choices.get(0))
                    .and_then(|choice| choice.get("message"))
                    .and_then(|message| message.get("content"))
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                let usage = patch_usage(
                    usage_from_openai(&value),
                    request_body,
                    &content,
                    channel.low_quality,
                );
                Ok((body, Some(usage)))
            }
        }
    }

    fn new_stream(&self, channel: &ChannelConfig, model: &str) -> Box<dyn StreamTranslator> {
        match channel.service_type {
            ServiceType::Claude => Box::new(ClaudeToChatStream::new(model)),
            _ => Box::new(PassthroughStream::new(UsageWire::OpenAi)),
        }
    }

    fn error_body(&self, status: u16, message: &str) -> Bytes {
        let (kind, code) = match status {
            400 => ("invalid_request_error", "invalid_request"),
            401 => ("authentication_error", "invalid_api_key"),
            413 => ("invalid_request_error", "request_too_large"),
            429 => ("rate_limit_error", "rate_limit_exceeded"),
            503 => ("server_error", "service_unavailable"),
            _ => ("server_error", "internal_error"),
        };
        Bytes::from(
            serde_json::to_vec(&openai::ErrorBody::new(message, kind, code)).unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> ChatAdapter {
        ChatAdapter::new()
    }

    fn channel(service_type: ServiceType) -> ChannelConfig {
        ChannelConfig {
            name: "c1".to_string(),
            base_url: "https://u1".to_string(),
            api_keys: vec!["k1".to_string()],
            service_type,
            ..ChannelConfig::default()
        }
    }

    #[test]
    fn openai_passthrough_preserves_bytes_when_model_unchanged() {
        let body = br#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#;
        let request = adapter()
            .build_request(&channel(ServiceType::OpenAI), "https://u1", "k1", body, "gpt-4o", false)
            .unwrap();
        assert_eq!(request.body.as_ref().unwrap().as_ref(), body.as_ref());
        assert_eq!(request.url, "https://u1/v1/chat/completions");
        assert!(request
            .headers
            .iter()
            .any(|(name, value)| name == "authorization" && value == "Bearer k1"));
    }

    #[test]
    fn claude_upstream_translates_to_messages() {
        let body = br#"{"model":"gpt-4o","messages":[{"role":"system","content":"S"},{"role":"user","content":"hi"}]}"#;
        let request = adapter()
            .build_request(&channel(ServiceType::Claude), "https://u1", "k1", body, "gpt-4o", true)
            .unwrap();
        assert_eq!(request.url, "https://u1/v1/messages");
        let value: serde_json::Value =
            serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
        assert_eq!(value["system"], "S");
        assert_eq!(value["max_tokens"], 4096);
        assert_eq!(value["stream"], true);
    }

    #[test]
    fn gemini_compatible_channels_use_chat_endpoint() {
        let body = br#"{"model":"gemini-pro","messages":[]}"#;
        let request = adapter()
            .build_request(&channel(ServiceType::Gemini), "https://u1", "k1", body, "gemini-pro", false)
            .unwrap();
        assert_eq!(request.url, "https://u1/v1/chat/completions");
    }

    #[test]
    fn claude_response_translates_and_extracts_usage() {
        let body = Bytes::from_static(
            br#"{"id":"m1","content":[{"type":"text","text":"hello"}],"stop_reason":"end_turn","usage":{"input_tokens":5,"output_tokens":9}}"#,
        );
        let (reply, usage) = adapter()
            .translate_body(&channel(ServiceType::Claude), body, "gpt-4o", b"{}")
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(value["object"], "chat.completion");
        assert_eq!(value["choices"][0]["message"]["content"], "hello");
        let usage = usage.unwrap();
        assert_eq!(usage.input_tokens, 5);
        assert_eq!(usage.output_tokens, 9);
    }

    #[test]
    fn openai_response_passes_through_byte_exact() {
        let body = Bytes::from_static(
            br#"{"id":"c","choices":[{"message":{"content":"x"}}],"usage":{"prompt_tokens":2,"completion_tokens":8}}"#,
        );
        let (reply, usage) = adapter()
            .translate_body(&channel(ServiceType::OpenAI), body.clone(), "m", b"{}")
            .unwrap();
        assert_eq!(reply, body);
        assert_eq!(usage.unwrap().output_tokens, 8);
    }

    #[test]
    fn html_body_is_invalid_response() {
        let err = adapter()
            .translate_body(
                &channel(ServiceType::OpenAI),
                Bytes::from_static(b"<html>bad gateway</html>"),
                "m",
                b"{}",
            )
            .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidResponseBody(_)));
    }

    #[test]
    fn error_body_is_openai_shaped() {
        let body = adapter().error_body(503, "All channels failed");
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], "service_unavailable");
        assert_eq!(value["error"]["message"], "All channels failed");
    }
}
