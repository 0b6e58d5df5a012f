use bytes::Bytes;

use relayx_common::{ApiType, ServiceType, Usage};
use relayx_core::{
    AdapterError, ChannelConfig, ProtocolAdapter, StreamTranslator, UpstreamHttpRequest,
};
use relayx_protocol::openai;

use super::convert;
use super::{ensure_model_supported, parse_json_body, parse_upstream_json, post_request, serialize};
use crate::preprocess::set_model;
use crate::stream::{
    ClaudeToResponsesStream, OpenAiToResponsesStream, PassthroughStream, UsageWire,
};
use crate::usage::{patch_usage, usage_from_claude, usage_from_openai};

/// OpenAI Responses client surface.
#[derive(Default)]
pub struct ResponsesAdapter;

impl ResponsesAdapter {
    pub fn new() -> Self {
        ResponsesAdapter
    }
}

impl ProtocolAdapter for ResponsesAdapter {
    fn api_type(&self) -> ApiType {
        ApiType::Responses
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
            ServiceType::Responses => {
                if mapped == model {
                    body.to_vec()
                } else {
                    let mut request = parse_json_body(body, "responses")?;
                    set_model(&mut request, &mapped);
                    serialize(&request)
                }
            }
            ServiceType::OpenAI => {
                let request = parse_json_body(body, "responses")?;
                serialize(&convert::chat_request_from_responses(&request, &mapped, stream))
            }
            ServiceType::Claude => {
                let request = parse_json_body(body, "responses")?;
                serialize(&convert::claude_request_from_responses(&request, &mapped, stream))
            }
            ServiceType::Gemini => {
                return Err(AdapterError::Build(
                    "service type gemini is not supported for the responses surface".to_string(),
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
            ServiceType::Responses => {
                let value = parse_upstream_json(&body, "responses response")?;
                let output = value.get("output").cloned().unwrap_or(serde_json::Value::Null);
                let usage = patch_usage(
                    usage_from_openai(&value),
                    request_body,
                    &output,
                    channel.low_quality,
                );
                Ok((body, Some(usage)))
            }
            ServiceType::OpenAI => {
                let chat = parse_upstream_json(&body, "chat response")?;
                let responses = convert::responses_response_from_chat(&chat, model);
                let output = responses.get("output").cloned().unwrap_or(serde_json::Value::Null);
                let usage = patch_usage(
                    usage_from_openai(&chat),
                    request_body,
                    &output,
                    channel.low_quality,
                );
                Ok((Bytes::from(serialize(&responses)), Some(usage)))
            }
            ServiceType::Claude => {
                let claude = parse_upstream_json(&body, "claude response")?;
                let responses = convert::responses_response_from_claude(&claude, model);
                let output = responses.get("output").cloned().unwrap_or(serde_json::Value::Null);
                let usage = patch_usage(
                    usage_from_claude(&claude),
                    request_body,
                    &output,
                    channel.low_quality,
                );
                Ok((Bytes::from(serialize(&responses)), Some(usage)))
            }
            ServiceType::Gemini => Err(AdapterError::Build(
                "service type gemini is not supported for the responses surface".to_string(),
            )),
        }
    }

    fn new_stream(&self, channel: &ChannelConfig, model: &str) -> Box<dyn StreamTranslator> {
        match channel.service_type {
            ServiceType::OpenAI => Box::new(OpenAiToResponsesStream::new(model)),
            ServiceType::Claude => Box::new(ClaudeToResponsesStream::new(model)),
            _ => Box::new(PassthroughStream::new(UsageWire::Responses)),
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
