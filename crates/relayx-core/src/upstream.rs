use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use wreq::{Client, Method, Proxy};

pub type Headers = Vec<(String, String)>;

#[derive(Debug)]
pub struct UpstreamHttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub stream: bool,
    /// Channel-level proxy override; `None` uses the process default.
    pub proxy: Option<String>,
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamFailure {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream client build failed: {0}")]
    Build(String),
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    /// Overall deadline for buffered requests. Streaming requests keep
    /// only the connect timeout plus the per-read idle timeout.
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        UpstreamClientConfig {
            proxy: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
            stream_idle_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum ClientMode {
    Buffered,
    Streaming,
}

/// Thin pool over `wreq` clients, one per (mode, proxy) pair. Streaming
/// clients carry no overall timeout so long generations are not cut off.
pub struct UpstreamClient {
    config: UpstreamClientConfig,
    clients: Mutex<HashMap<(ClientMode, Option<String>), Client>>,
}

impl UpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Arc<Self> {
        Arc::new(UpstreamClient {
            config,
            clients: Mutex::new(HashMap::new()),
        })
    }

    fn client_for(
        &self,
        mode: ClientMode,
        proxy: Option<String>,
    ) -> Result<Client, UpstreamFailure> {
        let proxy = normalize_proxy(proxy.or_else(|| self.config.proxy.clone()));
        let key = (mode, proxy.clone());
        let mut guard = self
            .clients
            .lock()
            .map_err(|_| UpstreamFailure::Build("client cache lock poisoned".to_string()))?;
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, mode, proxy.as_deref())
            .map_err(|err| UpstreamFailure::Build(err.to_string()))?;
        guard.insert(key, client.clone());
        Ok(client)
    }

    pub async fn send(
        &self,
        request: UpstreamHttpRequest,
    ) -> Result<UpstreamResponse, UpstreamFailure> {
        let mode = if request.stream {
            ClientMode::Streaming
        } else {
            ClientMode::Buffered
        };
        let client = self.client_for(mode, request.proxy.clone())?;

        let mut builder = client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| UpstreamFailure::Transport(err.to_string()))?;

        let status = response.status().as_u16();
        let headers: Headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let success = (200..300).contains(&status);
        if !success || !request.stream {
            let body = response
                .bytes()
                .await
                .map_err(|err| UpstreamFailure::Transport(err.to_string()))?;
            return Ok(UpstreamResponse {
                status,
                headers,
                body: UpstreamBody::Bytes(body),
            });
        }

        let idle = self.config.stream_idle_timeout;
        let (tx, rx) = mpsc::channel::<Bytes>(16);
        tokio::spawn(async move {
            use futures_util::StreamExt;
            let mut stream = response.bytes_stream();
            loop {
                let next = tokio::time::timeout(idle, stream.next()).await;
                let chunk = match next {
                    Ok(Some(Ok(chunk))) => chunk,
                    // Idle timeout, clean end, or mid-stream error: the
                    // channel closing tells the reader the stream ended.
                    _ => break,
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        Ok(UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Stream(rx),
        })
    }
}

fn normalize_proxy(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

fn build_client(
    config: &UpstreamClientConfig,
    mode: ClientMode,
    proxy: Option<&str>,
) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.stream_idle_timeout);
    if mode == ClientMode::Buffered {
        builder = builder.timeout(config.request_timeout);
    }
    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }
    builder.build()
}
