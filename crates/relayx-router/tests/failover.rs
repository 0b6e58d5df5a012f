//! End-to-end failover behavior against stub HTTP upstreams: key
//! rotation inside a channel, channel rotation with trace affinity, URL
//! reordering, and verbatim error propagation on total failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use relayx_common::ApiType;
use relayx_core::{
    ChannelConfig, ChannelScheduler, ClientReply, Config, ConfigView, FailedKeyCache, ProxyCore,
    RequestSpec, TraceAffinityMap, UpstreamClient, UpstreamClientConfig, UrlRanker,
};
use relayx_metrics::MetricsEngine;
use relayx_transform::MessagesAdapter;

const CLAUDE_OK: &str =
    r#"{"id":"msg_ok","content":[{"type":"text","text":"hello"}],"stop_reason":"end_turn","usage":{"input_tokens":5,"output_tokens":1}}"#;

/// One scripted upstream: each accepted connection consumes the next
/// (status, body) pair; the script's last entry repeats forever.
async fn spawn_stub(script: Vec<(u16, String)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let index = counter.fetch_add(1, Ordering::SeqCst);
            let (status, body) = script[index.min(script.len() - 1)].clone();
            tokio::spawn(async move {
                // Drain the request head and body enough to respond.
                let mut buf = vec![0u8; 64 * 1024];
                let _ = socket.read(&mut buf).await;
                let reason = match status {
                    200 => "OK",
                    401 => "Unauthorized",
                    429 => "Too Many Requests",
                    500 => "Internal Server Error",
                    _ => "Error",
                };
                let response = format!(
                    "HTTP/1.1 {status} {reason}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{addr}")
}

fn channel(name: &str, urls: Vec<String>, keys: &[&str]) -> ChannelConfig {
    let mut channel = ChannelConfig {
        name: name.to_string(),
        api_keys: keys.iter().map(|k| k.to_string()).collect(),
        service_type: relayx_common::ServiceType::Claude,
        ..ChannelConfig::default()
    };
    if urls.len() == 1 {
        channel.base_url = urls[0].clone();
    } else {
        channel.base_urls = urls;
    }
    channel
}

struct Harness {
    core: Arc<ProxyCore>,
    adapter: MessagesAdapter,
}

fn harness(channels: Vec<ChannelConfig>) -> Harness {
    let config = Arc::new(ConfigView::new(Config {
        messages: channels,
        ..Config::default()
    }));
    let mut engines = HashMap::new();
    for api_type in ApiType::ALL {
        engines.insert(api_type, MetricsEngine::new(api_type, 10, 0.5));
    }
    let affinity = Arc::new(TraceAffinityMap::new(Duration::from_secs(1800)));
    let scheduler = Arc::new(ChannelScheduler::new(
        config.clone(),
        engines,
        affinity,
        Arc::new(UrlRanker::new()),
    ));
    let upstream = UpstreamClient::new(UpstreamClientConfig {
        proxy: None,
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(5),
        stream_idle_timeout: Duration::from_secs(5),
    });
    let core = Arc::new(ProxyCore {
        config: config.clone(),
        scheduler,
        failed_keys: Arc::new(FailedKeyCache::new(Duration::from_secs(120), 3)),
        upstream,
    });
    Harness {
        adapter: MessagesAdapter::new(config),
        core,
    }
}

fn messages_spec(body: &[u8], user_id: &str) -> RequestSpec<'_> {
    RequestSpec {
        api_type: ApiType::Messages,
        body,
        model: "claude-3".to_string(),
        stream: false,
        user_id: user_id.to_string(),
    }
}

const REQUEST: &[u8] = br#"{"model":"claude-3","messages":[{"role":"user","content":"hi"}]}"#;

#[tokio::test]
async fn second_key_succeeds_after_auth_failure() {
    let url = spawn_stub(vec![
        (401, r#"{"error":{"type":"authentication_error","message":"bad key"}}"#.to_string()),
        (200, CLAUDE_OK.to_string()),
    ])
    .await;
    let harness = harness(vec![channel("C1", vec![url.clone()], &["k1", "k2"])]);

    let reply = harness
        .core
        .handle_request(&harness.adapter, &messages_spec(REQUEST, ""))
        .await;
    let ClientReply::Json { status, body } = reply else {
        panic!("expected a buffered reply");
    };
    assert_eq!(status, 200);
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["content"][0]["text"], "hello");

    // k1 went into the cooldown cache for this apiType only.
    assert!(harness.core.failed_keys.is_cooling(ApiType::Messages, "k1"));
    assert!(!harness.core.failed_keys.is_cooling(ApiType::Chat, "k1"));
    assert!(!harness.core.failed_keys.is_cooling(ApiType::Messages, "k2"));

    // Both attempts are on the books: one failure for k1, one success
    // for k2.
    let engine = harness.core.scheduler.engine(ApiType::Messages);
    let k1 = engine.key_snapshot(&url, "k1").unwrap();
    assert_eq!(k1.failure_count, 1);
    let k2 = engine.key_snapshot(&url, "k2").unwrap();
    assert_eq!(k2.request_count, 1);
    assert_eq!(k2.success_count, 1);
}

#[tokio::test]
async fn next_channel_takes_over_and_affinity_sticks() {
    let bad = spawn_stub(vec![(500, r#"{"error":"boom"}"#.to_string())]).await;
    let good = spawn_stub(vec![(200, CLAUDE_OK.to_string())]).await;
    let harness = harness(vec![
        channel("C1", vec![bad], &["k1"]),
        channel("C2", vec![good], &["k2"]),
    ]);

    let reply = harness
        .core
        .handle_request(&harness.adapter, &messages_spec(REQUEST, "user-7"))
        .await;
    let ClientReply::Json { status, .. } = reply else {
        panic!("expected a buffered reply");
    };
    assert_eq!(status, 200);

    // Trace affinity points at the channel that actually served the
    // request.
    assert_eq!(
        harness
            .core
            .scheduler
            .affinity()
            .preferred_channel(ApiType::Messages, "user-7"),
        Some(1)
    );
}

#[tokio::test]
async fn exhaustion_returns_the_last_failover_body_verbatim() {
    let quota_body = r#"{"error":{"type":"rate_limit_error","message":"quota exhausted for key"}}"#;
    let bad = spawn_stub(vec![(429, quota_body.to_string())]).await;
    let harness = harness(vec![channel("C1", vec![bad], &["k1", "k2"])]);

    let reply = harness
        .core
        .handle_request(&harness.adapter, &messages_spec(REQUEST, ""))
        .await;
    let ClientReply::Json { status, body } = reply else {
        panic!("expected a buffered reply");
    };
    assert_eq!(status, 429);
    assert_eq!(body.as_ref(), quota_body.as_bytes());
}

#[tokio::test]
async fn terminal_errors_pass_through_without_retry() {
    let terminal = r#"{"error":{"type":"invalid_request_error","message":"max_tokens required"}}"#;
    let url = spawn_stub(vec![
        (400, terminal.to_string()),
        (200, CLAUDE_OK.to_string()),
    ])
    .await;
    let harness = harness(vec![channel("C1", vec![url.clone()], &["k1", "k2"])]);

    let reply = harness
        .core
        .handle_request(&harness.adapter, &messages_spec(REQUEST, ""))
        .await;
    let ClientReply::Json { status, body } = reply else {
        panic!("expected a buffered reply");
    };
    assert_eq!(status, 400);
    assert_eq!(body.as_ref(), terminal.as_bytes());

    // The second key never fired.
    let engine = harness.core.scheduler.engine(ApiType::Messages);
    assert!(engine.key_snapshot(&url, "k2").is_none());
}

#[tokio::test]
async fn backup_url_serves_and_gets_promoted() {
    let primary = spawn_stub(vec![(
        429,
        r#"{"error":{"type":"rate_limit_error","message":"slow down"}}"#.to_string(),
    )])
    .await;
    let backup = spawn_stub(vec![(200, CLAUDE_OK.to_string())]).await;

    // Two channels so multi-channel mode engages URL marking.
    let other = spawn_stub(vec![(200, CLAUDE_OK.to_string())]).await;
    let mut main = channel("C1", vec![primary.clone(), backup.clone()], &["k1"]);
    main.priority = 1;
    let mut standby = channel("C2", vec![other], &["k9"]);
    standby.priority = 2;
    let harness = harness(vec![main, standby]);

    let reply = harness
        .core
        .handle_request(&harness.adapter, &messages_spec(REQUEST, ""))
        .await;
    let ClientReply::Json { status, .. } = reply else {
        panic!("expected a buffered reply");
    };
    assert_eq!(status, 200);

    // The ranker now prefers the backup for this channel.
    let sorted = harness.core.scheduler.url_ranker().sorted_urls(
        ApiType::Messages,
        0,
        &[primary.clone(), backup.clone()],
    );
    assert_eq!(sorted[0].url, backup);
    assert_eq!(sorted[0].original_idx, 1);
    assert_eq!(sorted[1].url, primary);
}

#[tokio::test]
async fn build_failure_reports_400_and_touches_no_metrics() {
    let url = spawn_stub(vec![(200, CLAUDE_OK.to_string())]).await;
    let harness = harness(vec![channel("C1", vec![url.clone()], &["k1"])]);

    let reply = harness
        .core
        .handle_request(&harness.adapter, &messages_spec(b"{not json", ""))
        .await;
    let ClientReply::Json { status, .. } = reply else {
        panic!("expected a buffered reply");
    };
    assert_eq!(status, 400);
    let engine = harness.core.scheduler.engine(ApiType::Messages);
    assert!(engine.key_snapshot(&url, "k1").is_none());
}

#[tokio::test]
async fn streaming_claude_upstream_reaches_chat_client_translated() {
    use relayx_transform::ChatAdapter;

    let sse_body = concat!(
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n",
        "\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"input_tokens\":4,\"output_tokens\":2}}\n",
        "\n",
    );
    let url = spawn_stub(vec![(200, sse_body.to_string())]).await;

    let mut chat_channel = channel("C1", vec![url.clone()], &["k1"]);
    chat_channel.name = "chat-c1".to_string();
    let config = Arc::new(ConfigView::new(Config {
        chat: vec![chat_channel],
        ..Config::default()
    }));
    let mut engines = HashMap::new();
    for api_type in ApiType::ALL {
        engines.insert(api_type, MetricsEngine::new(api_type, 10, 0.5));
    }
    let scheduler = Arc::new(ChannelScheduler::new(
        config.clone(),
        engines,
        Arc::new(TraceAffinityMap::new(Duration::from_secs(1800))),
        Arc::new(UrlRanker::new()),
    ));
    let core = Arc::new(ProxyCore {
        config: config.clone(),
        scheduler,
        failed_keys: Arc::new(FailedKeyCache::new(Duration::from_secs(120), 3)),
        upstream: UpstreamClient::new(UpstreamClientConfig {
            proxy: None,
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            stream_idle_timeout: Duration::from_secs(5),
        }),
    });
    let adapter = ChatAdapter::new();

    let body = br#"{"model":"claude-3","stream":true,"messages":[{"role":"user","content":"hi"}]}"#;
    let spec = RequestSpec {
        api_type: ApiType::Chat,
        body,
        model: "claude-3".to_string(),
        stream: true,
        user_id: String::new(),
    };

    let reply = core.handle_request(&adapter, &spec).await;
    let ClientReply::Sse { mut frames } = reply else {
        panic!("expected a streaming reply");
    };

    let mut collected = String::new();
    while let Some(frame) = frames.recv().await {
        collected.push_str(&String::from_utf8_lossy(&frame));
    }

    let payloads: Vec<&str> = collected
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect();
    assert_eq!(payloads.len(), 3, "two chunks and the terminator: {collected}");

    let first: serde_json::Value = serde_json::from_str(payloads[0]).unwrap();
    assert_eq!(first["object"], "chat.completion.chunk");
    assert_eq!(first["choices"][0]["delta"]["content"], "Hi");
    assert!(first["choices"][0]["finish_reason"].is_null());

    let second: serde_json::Value = serde_json::from_str(payloads[1]).unwrap();
    assert_eq!(second["choices"][0]["finish_reason"], "stop");
    assert_eq!(second["usage"]["prompt_tokens"], 4);
    assert_eq!(second["usage"]["completion_tokens"], 2);
    assert_eq!(second["usage"]["total_tokens"], 6);

    assert_eq!(payloads[2], "[DONE]");

    // The pump finalized the attempt as a success with the stream usage.
    let engine = core.scheduler.engine(ApiType::Chat);
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let snap = engine.key_snapshot(&url, "k1");
        if let Some(snap) = snap {
            if snap.success_count == 1 {
                assert_eq!(snap.request_count, 1);
                break;
            }
        }
        assert!(std::time::Instant::now() < deadline, "success finalize not observed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn removing_a_channel_clears_its_cooldowns_and_metrics() {
    let url = spawn_stub(vec![(200, CLAUDE_OK.to_string())]).await;
    let harness = harness(vec![channel("C1", vec![url.clone()], &["k1"])]);

    harness.core.failed_keys.mark_failed(ApiType::Messages, "k1");
    let engine = harness.core.scheduler.engine(ApiType::Messages);
    let id = engine.reserve_attempt(&url, "k1", "m");
    engine.finalize_success(&url, "k1", id, None);

    let removed = harness
        .core
        .remove_channel(ApiType::Messages, 0)
        .await
        .expect("channel exists");
    assert_eq!(removed.name, "C1");
    assert!(!harness.core.failed_keys.is_cooling(ApiType::Messages, "k1"));
    assert!(engine.key_snapshot(&url, "k1").is_none());
    assert!(harness
        .core
        .config
        .channels(ApiType::Messages)
        .is_empty());
}
