use bytes::Bytes;
use tokio::sync::mpsc;

use relayx_common::{ApiType, Usage};

use crate::channel::ChannelConfig;
use crate::upstream::UpstreamHttpRequest;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The upstream request could not be constructed from the client
    /// body. A client-side fault; never touches metrics.
    #[error("request build failed: {0}")]
    Build(String),
    /// The upstream answered 2xx with a body that is not the expected
    /// JSON (an HTML error page, typically). Nothing was forwarded yet,
    /// so the executor may fail over.
    #[error("invalid response body: {0}")]
    InvalidResponseBody(String),
}

/// Per-apiType protocol work the failover executor delegates: building
/// the upstream request, translating a buffered response back, and
/// translating stream frames. All methods are pure with respect to the
/// executor's state.
pub trait ProtocolAdapter: Send + Sync {
    fn api_type(&self) -> ApiType;

    /// Build the upstream request for one attempt. `base_url` is the
    /// URL of the current attempt (already chosen from the channel's
    /// sorted list).
    fn build_request(
        &self,
        channel: &ChannelConfig,
        base_url: &str,
        api_key: &str,
        body: &[u8],
        model: &str,
        stream: bool,
    ) -> Result<UpstreamHttpRequest, AdapterError>;

    /// Translate a buffered 2xx upstream body into the client's wire
    /// format; returns the reply body and the extracted usage.
    fn translate_body(
        &self,
        channel: &ChannelConfig,
        body: Bytes,
        model: &str,
        request_body: &[u8],
    ) -> Result<(Bytes, Option<Usage>), AdapterError>;

    /// Fresh per-request stream translator.
    fn new_stream(&self, channel: &ChannelConfig, model: &str) -> Box<dyn StreamTranslator>;

    /// apiType-shaped JSON error body for proxy-originated errors.
    fn error_body(&self, status: u16, message: &str) -> Bytes;
}

/// Stateful SSE translation for one request: line remainder buffering,
/// terminator dedup, usage accumulation.
pub trait StreamTranslator: Send {
    /// Feed one upstream chunk; returns the client-ready SSE frames it
    /// produced.
    fn push(&mut self, chunk: &[u8]) -> Vec<Bytes>;

    /// The upstream stream ended; returns any trailing frames (e.g. the
    /// deduplicated `data: [DONE]`).
    fn finish(&mut self) -> Vec<Bytes>;

    /// Usage accumulated so far.
    fn usage(&self) -> Option<Usage>;
}

/// The reply the executor hands back to the HTTP layer.
pub enum ClientReply {
    Json {
        status: u16,
        body: Bytes,
    },
    /// SSE reply; frames arrive on the receiver, the head frames are
    /// already queued inside it.
    Sse {
        frames: mpsc::Receiver<Bytes>,
    },
}
