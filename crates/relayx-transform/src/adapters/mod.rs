pub mod chat;
mod convert;
pub mod gemini;
pub mod messages;
pub mod responses;

use bytes::Bytes;
use serde_json::Value;

use relayx_core::{AdapterError, ChannelConfig, UpstreamHttpRequest};

use crate::headers::upstream_headers;
use crate::url::upstream_url;

/// Assemble the POST for one upstream attempt.
pub(crate) fn post_request(
    channel: &ChannelConfig,
    base_url: &str,
    api_key: &str,
    model: &str,
    stream: bool,
    body: Vec<u8>,
) -> UpstreamHttpRequest {
    UpstreamHttpRequest {
        method: wreq::Method::POST,
        url: upstream_url(channel.service_type, base_url, model, stream),
        headers: upstream_headers(channel.service_type, api_key, &channel.custom_headers),
        body: Some(Bytes::from(body)),
        stream,
        proxy: channel.proxy_url.clone(),
    }
}

pub(crate) fn parse_json_body(body: &[u8], label: &str) -> Result<Value, AdapterError> {
    serde_json::from_slice(body)
        .map_err(|err| AdapterError::Build(format!("invalid {label} body: {err}")))
}

pub(crate) fn parse_upstream_json(body: &[u8], label: &str) -> Result<Value, AdapterError> {
    serde_json::from_slice(body)
        .map_err(|err| AdapterError::InvalidResponseBody(format!("{label}: {err}")))
}

pub(crate) fn serialize(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

/// Reject models outside the channel whitelist before any bytes leave
/// the process.
pub(crate) fn ensure_model_supported(
    channel: &ChannelConfig,
    model: &str,
) -> Result<(), AdapterError> {
    if channel.supports_model(model) {
        Ok(())
    } else {
        Err(AdapterError::Build(format!(
            "model {model} is not supported by channel {}",
            channel.name
        )))
    }
}
