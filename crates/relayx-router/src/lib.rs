use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;
use tracing::{info, warn};

use relayx_common::{estimate_request_tokens, ApiType, SettingsHandle};
use relayx_core::{ClientReply, ProtocolAdapter, ProxyCore, RequestSpec};
use relayx_protocol::request::RequestPeek;
use relayx_transform::{ChatAdapter, GeminiAdapter, MessagesAdapter, ResponsesAdapter};

pub struct Adapters {
    pub messages: MessagesAdapter,
    pub chat: ChatAdapter,
    pub responses: ResponsesAdapter,
    pub gemini: GeminiAdapter,
}

impl Adapters {
    fn for_api(&self, api_type: ApiType) -> &dyn ProtocolAdapter {
        match api_type {
            ApiType::Messages => &self.messages,
            ApiType::Chat => &self.chat,
            ApiType::Responses => &self.responses,
            ApiType::Gemini => &self.gemini,
        }
    }
}

#[derive(Clone)]
pub struct RouterState {
    pub core: Arc<ProxyCore>,
    pub settings: SettingsHandle,
    pub adapters: Arc<Adapters>,
}

pub fn proxy_router(core: Arc<ProxyCore>, settings: SettingsHandle) -> Router {
    let adapters = Arc::new(Adapters {
        messages: MessagesAdapter::new(core.config.clone()),
        chat: ChatAdapter::new(),
        responses: ResponsesAdapter::new(),
        gemini: GeminiAdapter::new(),
    });
    let state = RouterState {
        core,
        settings,
        adapters,
    };

    Router::new()
        .route("/v1/messages", post(messages_handler))
        .route("/v1/messages/count_tokens", post(count_tokens_handler))
        .route("/v1/chat/completions", post(chat_handler))
        .route("/v1/responses", post(responses_handler))
        .route("/v1beta/models/{*model_action}", post(gemini_handler))
        .layer(middleware::from_fn_with_state(state.clone(), proxy_auth))
        .route("/healthz", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state)
}

/// Proxy access-key authentication: `x-api-key` or `Authorization:
/// Bearer`. Upstream-format credentials (including `x-goog-api-key`)
/// never satisfy it.
async fn proxy_auth(
    State(state): State<RouterState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    let expected = state.settings.load().proxy_access_key.clone();
    if expected.is_empty() {
        return Ok(next.run(request).await);
    }

    let presented = extract_access_key(request.headers());
    match presented {
        Some(key) if key == expected => Ok(next.run(request).await),
        _ => {
            let trace_id = uuid::Uuid::now_v7();
            warn!(%trace_id, path = %request.uri().path(), "proxy auth rejected");
            Err((
                StatusCode::UNAUTHORIZED,
                [(header::CONTENT_TYPE, "application/json")],
                r#"{"error":{"message":"invalid proxy access key","type":"authentication_error"}}"#,
            )
                .into_response())
        }
    }
}

fn extract_access_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
        .filter(|v| !v.is_empty())
}

async fn read_limited_body(
    state: &RouterState,
    api_type: ApiType,
    body: Body,
) -> Result<Bytes, Response> {
    let limit = state.settings.load().max_body_bytes;
    match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => Ok(bytes),
        Err(_) => {
            let adapter = state.adapters.for_api(api_type);
            let body = adapter.error_body(
                413,
                &format!("request body too large, maximum size is {} MB", limit / 1024 / 1024),
            );
            Err(json_response(413, body))
        }
    }
}

/// Trace identity for Responses/Gemini style clients: explicit headers
/// first, then the request body fallbacks.
fn conversation_id(headers: &HeaderMap, peek: &RequestPeek) -> String {
    for name in ["conversation_id", "session_id", "x-gemini-api-privileged-user-id"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    if let Some(key) = peek.prompt_cache_key.as_deref() {
        if !key.is_empty() {
            return key.to_string();
        }
    }
    peek.metadata_user_id().unwrap_or("").to_string()
}

fn json_response(status: u16, body: Bytes) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

fn reply_to_response(reply: ClientReply) -> Response {
    match reply {
        ClientReply::Json { status, body } => json_response(status, body),
        ClientReply::Sse { frames } => {
            let stream = ReceiverStream::new(frames).map(Ok::<Bytes, Infallible>);
            let body = Body::from_stream(stream);
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "text/event-stream"),
                    (header::CACHE_CONTROL, "no-cache"),
                    (header::CONNECTION, "keep-alive"),
                    (header::HeaderName::from_static("x-accel-buffering"), "no"),
                ],
                body,
            )
                .into_response()
        }
    }
}

async fn messages_handler(
    State(state): State<RouterState>,
    request: Request<Body>,
) -> Response {
    let (_, body) = request.into_parts();
    let body = match read_limited_body(&state, ApiType::Messages, body).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };
    let peek = RequestPeek::parse(&body);
    let spec = RequestSpec {
        api_type: ApiType::Messages,
        body: &body,
        model: peek.model.clone().unwrap_or_default(),
        stream: peek.stream.unwrap_or(false),
        user_id: peek.metadata_user_id().unwrap_or("").to_string(),
    };
    info!(model = %spec.model, stream = spec.stream, "messages request");
    let reply = state
        .core
        .handle_request(state.adapters.for_api(ApiType::Messages), &spec)
        .await;
    reply_to_response(reply)
}

async fn count_tokens_handler(
    State(state): State<RouterState>,
    request: Request<Body>,
) -> Response {
    let (_, body) = request.into_parts();
    let body = match read_limited_body(&state, ApiType::Messages, body).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };
    if serde_json::from_slice::<serde_json::Value>(&body).is_err() {
        let adapter = state.adapters.for_api(ApiType::Messages);
        return json_response(400, adapter.error_body(400, "invalid JSON"));
    }
    // Local estimation only; no upstream call.
    let input_tokens = estimate_request_tokens(&body);
    json_response(
        200,
        Bytes::from(format!("{{\"input_tokens\":{input_tokens}}}")),
    )
}

async fn chat_handler(State(state): State<RouterState>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let body = match read_limited_body(&state, ApiType::Chat, body).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };
    let adapter = state.adapters.for_api(ApiType::Chat);
    if !body.is_empty() && serde_json::from_slice::<serde_json::Value>(&body).is_err() {
        return json_response(400, adapter.error_body(400, "invalid request body"));
    }
    let peek = RequestPeek::parse(&body);
    let Some(model) = peek.model.clone().filter(|m| !m.is_empty()) else {
        return json_response(400, adapter.error_body(400, "model is required"));
    };

    let mut user_id = peek.user.clone().unwrap_or_default();
    if user_id.is_empty() {
        user_id = conversation_id(&parts.headers, &peek);
    }

    let spec = RequestSpec {
        api_type: ApiType::Chat,
        body: &body,
        model,
        stream: peek.stream.unwrap_or(false),
        user_id,
    };
    info!(model = %spec.model, stream = spec.stream, "chat request");
    let reply = state.core.handle_request(adapter, &spec).await;
    reply_to_response(reply)
}

async fn responses_handler(State(state): State<RouterState>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let body = match read_limited_body(&state, ApiType::Responses, body).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };
    let peek = RequestPeek::parse(&body);
    let user_id = conversation_id(&parts.headers, &peek);
    let spec = RequestSpec {
        api_type: ApiType::Responses,
        body: &body,
        model: peek.model.clone().unwrap_or_default(),
        stream: peek.stream.unwrap_or(false),
        user_id,
    };
    info!(model = %spec.model, stream = spec.stream, "responses request");
    let reply = state
        .core
        .handle_request(state.adapters.for_api(ApiType::Responses), &spec)
        .await;
    reply_to_response(reply)
}

async fn gemini_handler(
    State(state): State<RouterState>,
    Path(model_action): Path<String>,
    request: Request<Body>,
) -> Response {
    let adapter = state.adapters.for_api(ApiType::Gemini);
    let (model, action) = match model_action.split_once(':') {
        Some((model, action)) if !model.is_empty() => (model.to_string(), action),
        _ => {
            return json_response(
                400,
                adapter.error_body(400, "model name is required in the URL path"),
            );
        }
    };
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        _ => {
            return json_response(404, adapter.error_body(404, "unknown action"));
        }
    };

    let (parts, body) = request.into_parts();
    let body = match read_limited_body(&state, ApiType::Gemini, body).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };
    if !body.is_empty() && serde_json::from_slice::<serde_json::Value>(&body).is_err() {
        return json_response(400, adapter.error_body(400, "invalid request body"));
    }
    let peek = RequestPeek::parse(&body);
    let user_id = conversation_id(&parts.headers, &peek);

    let spec = RequestSpec {
        api_type: ApiType::Gemini,
        body: &body,
        model,
        stream,
        user_id,
    };
    info!(model = %spec.model, stream = spec.stream, "gemini request");
    let reply = state.core.handle_request(adapter, &spec).await;
    reply_to_response(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_key_comes_from_either_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "secret".parse().unwrap());
        assert_eq!(extract_access_key(&headers).as_deref(), Some("secret"));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer secret".parse().unwrap());
        assert_eq!(extract_access_key(&headers).as_deref(), Some("secret"));
    }

    #[test]
    fn goog_api_key_never_authorizes() {
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", "AIza-upstream".parse().unwrap());
        assert_eq!(extract_access_key(&headers), None);
    }

    #[test]
    fn conversation_id_prefers_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("session_id", "sess-9".parse().unwrap());
        let peek = RequestPeek::parse(br#"{"prompt_cache_key":"pck-1"}"#);
        assert_eq!(conversation_id(&headers, &peek), "sess-9");

        let headers = HeaderMap::new();
        assert_eq!(conversation_id(&headers, &peek), "pck-1");
    }
}
