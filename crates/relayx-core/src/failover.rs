use std::collections::HashSet;
use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{info, warn};

use relayx_common::{mask_api_key, ApiType, Usage};

use crate::adapter::{AdapterError, ClientReply, ProtocolAdapter, StreamTranslator};
use crate::channel::ChannelConfig;
use crate::classify::should_retry_with_next_key;
use crate::config_view::ConfigView;
use crate::failed_keys::FailedKeyCache;
use crate::scheduler::ChannelScheduler;
use crate::upstream::{UpstreamBody, UpstreamClient};
use crate::url_ranker::SortedUrl;

/// The last failover-classified upstream response, preserved verbatim so
/// total failure can surface the real upstream error.
#[derive(Debug, Clone)]
pub struct FailoverBody {
    pub status: u16,
    pub body: Bytes,
}

/// One client request as the executor sees it.
pub struct RequestSpec<'a> {
    pub api_type: ApiType,
    pub body: &'a [u8],
    /// Client-requested model, before any per-channel rename.
    pub model: String,
    pub stream: bool,
    pub user_id: String,
}

/// Outcome of trying one selected channel.
pub enum ChannelAttempt {
    /// A reply is ready for the client (success, or a terminal upstream
    /// error passed through unchanged).
    Handled(ClientReply),
    /// The upstream request could not be constructed; client-side fault.
    BuildFailed(String),
    /// Every URL x key combination failed with retryable errors.
    Exhausted {
        failover: Option<FailoverBody>,
        last_error: Option<String>,
    },
}

/// Dispatch core: channel selection loop plus the in-channel failover
/// executor over base URLs and keys.
pub struct ProxyCore {
    pub config: Arc<ConfigView>,
    pub scheduler: Arc<ChannelScheduler>,
    pub failed_keys: Arc<FailedKeyCache>,
    pub upstream: Arc<UpstreamClient>,
}

impl ProxyCore {
    /// Entry point for one client request. Picks single- or
    /// multi-channel mode and always produces a client reply.
    pub async fn handle_request(
        &self,
        adapter: &dyn ProtocolAdapter,
        spec: &RequestSpec<'_>,
    ) -> ClientReply {
        if self.scheduler.is_multi_channel_mode(spec.api_type) {
            self.handle_multi_channel(adapter, spec).await
        } else {
            self.handle_single_channel(adapter, spec).await
        }
    }

    async fn handle_multi_channel(
        &self,
        adapter: &dyn ProtocolAdapter,
        spec: &RequestSpec<'_>,
    ) -> ClientReply {
        let api_type = spec.api_type;
        let mut failed_channels: HashSet<usize> = HashSet::new();
        let mut last_failover: Option<FailoverBody> = None;
        let mut last_error: Option<String> = None;

        let max_attempts = self.scheduler.active_channel_count(api_type);
        for attempt in 0..max_attempts {
            let Some(selection) =
                self.scheduler
                    .select_channel(api_type, &spec.user_id, &failed_channels)
            else {
                break;
            };
            info!(
                api_type = %api_type,
                index = selection.channel_index,
                name = %selection.channel.name,
                reason = selection.reason.as_str(),
                attempt = attempt + 1,
                max_attempts,
                "channel selected"
            );

            let urls = selection.channel.effective_base_urls();
            let sorted = self
                .scheduler
                .sorted_urls_for_channel(api_type, selection.channel_index, &urls);
            let affinity = (!spec.user_id.is_empty())
                .then(|| (spec.user_id.clone(), selection.channel_index));

            match self
                .try_channel(adapter, spec, &selection.channel, selection.channel_index, &sorted, true, affinity)
                .await
            {
                ChannelAttempt::Handled(reply) => return reply,
                ChannelAttempt::BuildFailed(message) => {
                    return ClientReply::Json {
                        status: 400,
                        body: adapter.error_body(400, &message),
                    };
                }
                ChannelAttempt::Exhausted { failover, last_error: err } => {
                    if failover.is_some() {
                        last_failover = failover;
                    }
                    if err.is_some() {
                        last_error = err;
                    }
                    failed_channels.insert(selection.channel_index);
                    warn!(
                        api_type = %api_type,
                        index = selection.channel_index,
                        name = %selection.channel.name,
                        "all keys failed, trying next channel"
                    );
                }
            }
        }

        warn!(api_type = %api_type, "all channels failed");
        all_failed_reply(adapter, last_failover, last_error)
    }

    async fn handle_single_channel(
        &self,
        adapter: &dyn ProtocolAdapter,
        spec: &RequestSpec<'_>,
    ) -> ClientReply {
        let api_type = spec.api_type;
        let Some((channel, channel_index)) = self.config.current_channel(api_type) else {
            return ClientReply::Json {
                status: 503,
                body: adapter.error_body(503, "no channel configured"),
            };
        };
        if channel.api_keys.is_empty() {
            return ClientReply::Json {
                status: 503,
                body: adapter.error_body(
                    503,
                    &format!("no API keys configured for channel \"{}\"", channel.name),
                ),
            };
        }

        // Single-channel mode bypasses the ranker: configured order, no
        // URL outcome marks.
        let urls = channel.effective_base_urls();
        let sorted: Vec<SortedUrl> = urls
            .iter()
            .enumerate()
            .map(|(original_idx, url)| SortedUrl {
                url: url.clone(),
                original_idx,
            })
            .collect();

        match self
            .try_channel(adapter, spec, &channel, channel_index, &sorted, false, None)
            .await
        {
            ChannelAttempt::Handled(reply) => reply,
            ChannelAttempt::BuildFailed(message) => ClientReply::Json {
                status: 400,
                body: adapter.error_body(400, &message),
            },
            ChannelAttempt::Exhausted { failover, last_error } => {
                warn!(api_type = %api_type, "all API keys failed");
                all_failed_reply(adapter, failover, last_error)
            }
        }
    }

    /// Remove a channel and clean up everything scoped to it: cooldown
    /// entries, the URL ranking, and the metrics rows no surviving
    /// channel of this apiType still references.
    pub async fn remove_channel(
        &self,
        api_type: ApiType,
        index: usize,
    ) -> Option<ChannelConfig> {
        let removed = self.config.remove_channel(api_type, index)?;
        self.failed_keys.clear_keys(api_type, &removed.api_keys);
        self.scheduler.url_ranker().invalidate(api_type, index);
        self.scheduler.delete_channel_metrics(api_type, &removed).await;
        Some(removed)
    }

    /// Pick the next key for one URL attempt: skip keys that failed this
    /// URL and keys in cooldown; when everything is cooling, probe the
    /// key whose failure is oldest.
    fn next_api_key(
        &self,
        api_type: ApiType,
        channel: &ChannelConfig,
        failed_this_url: &HashSet<String>,
    ) -> Option<String> {
        if channel.api_keys.is_empty() {
            return None;
        }
        if channel.api_keys.len() == 1 {
            return Some(channel.api_keys[0].clone());
        }
        let available = channel.api_keys.iter().find(|key| {
            !failed_this_url.contains(*key) && !self.failed_keys.is_cooling(api_type, key)
        });
        if let Some(key) = available {
            return Some(key.clone());
        }
        let oldest =
            self.failed_keys
                .oldest_failure(api_type, &channel.api_keys, failed_this_url);
        if let Some(key) = oldest.as_ref() {
            warn!(
                api_type = %api_type,
                key = %mask_api_key(key),
                "all keys cooling down, probing the oldest failure"
            );
        }
        oldest
    }

    /// Try every sorted base URL x key combination of one channel.
    #[allow(clippy::too_many_arguments)]
    pub async fn try_channel(
        &self,
        adapter: &dyn ProtocolAdapter,
        spec: &RequestSpec<'_>,
        channel: &ChannelConfig,
        channel_index: usize,
        sorted_urls: &[SortedUrl],
        mark_urls: bool,
        affinity: Option<(String, usize)>,
    ) -> ChannelAttempt {
        let api_type = spec.api_type;
        let engine = self.scheduler.engine(api_type);
        if channel.api_keys.is_empty() || sorted_urls.is_empty() {
            return ChannelAttempt::Exhausted {
                failover: None,
                last_error: None,
            };
        }

        let redirected_model = channel.redirect_model(&spec.model);
        let mut last_failover: Option<FailoverBody> = None;
        let mut last_error: Option<String> = None;
        let mut deprioritize_candidates: HashSet<String> = HashSet::new();

        // Force-probe: when every key is circuit-broken at the first URL
        // we would otherwise never discover recovery. Circuit checks are
        // bypassed for this request; the cooldown cache still applies.
        let force_probe = channel
            .api_keys
            .iter()
            .all(|key| engine.should_suspend_key(&sorted_urls[0].url, key));
        if force_probe {
            warn!(
                api_type = %api_type,
                name = %channel.name,
                "all keys circuit-broken, force-probe mode"
            );
        }

        for sorted_url in sorted_urls {
            let base_url = &sorted_url.url;
            let mut failed_this_url: HashSet<String> = HashSet::new();

            for _ in 0..channel.api_keys.len() {
                let Some(api_key) = self.next_api_key(api_type, channel, &failed_this_url) else {
                    break;
                };

                if !force_probe && engine.should_suspend_key(base_url, &api_key) {
                    failed_this_url.insert(api_key.clone());
                    continue;
                }

                // The request body is borrowed, never consumed, so every
                // retry sees the identical bytes.
                let request = match adapter.build_request(
                    channel,
                    base_url,
                    &api_key,
                    spec.body,
                    &spec.model,
                    spec.stream,
                ) {
                    Ok(request) => request,
                    Err(err) => {
                        return ChannelAttempt::BuildFailed(err.to_string());
                    }
                };

                let request_id =
                    engine.reserve_attempt(base_url, &api_key, &redirected_model);
                self.scheduler.record_request_start(api_type, base_url, &api_key);
                let ticket = AttemptTicket::new(
                    self.scheduler.clone(),
                    api_type,
                    base_url.clone(),
                    api_key.clone(),
                    request_id,
                    affinity.clone(),
                );

                let response = match self.upstream.send(request).await {
                    Ok(response) => response,
                    Err(err) => {
                        self.failed_keys.mark_failed(api_type, &api_key);
                        ticket.failure();
                        if mark_urls {
                            self.scheduler
                                .url_ranker()
                                .mark_failure(api_type, channel_index, base_url);
                        }
                        warn!(
                            api_type = %api_type,
                            key = %mask_api_key(&api_key),
                            error = %err,
                            "upstream send failed"
                        );
                        last_error = Some(err.to_string());
                        failed_this_url.insert(api_key);
                        continue;
                    }
                };

                if !(200..300).contains(&response.status) {
                    let raw = match response.body {
                        UpstreamBody::Bytes(bytes) => bytes,
                        UpstreamBody::Stream(_) => Bytes::new(),
                    };
                    let body = decompress_if_gzip(&response.headers, raw);
                    let classification = should_retry_with_next_key(
                        response.status,
                        &body,
                        self.config.fuzzy_mode(),
                        api_type,
                    );

                    if classification.should_failover {
                        self.failed_keys.mark_failed(api_type, &api_key);
                        ticket.failure();
                        if mark_urls {
                            self.scheduler
                                .url_ranker()
                                .mark_failure(api_type, channel_index, base_url);
                        }
                        warn!(
                            api_type = %api_type,
                            key = %mask_api_key(&api_key),
                            status = response.status,
                            "key failed, trying the next one"
                        );
                        last_failover = Some(FailoverBody {
                            status: response.status,
                            body: body.clone(),
                        });
                        last_error = Some(format!("upstream status {}", response.status));
                        if classification.quota_related {
                            deprioritize_candidates.insert(api_key.clone());
                        }
                        failed_this_url.insert(api_key);
                        continue;
                    }

                    // Terminal: the upstream body goes through unchanged.
                    ticket.failure();
                    return ChannelAttempt::Handled(ClientReply::Json {
                        status: response.status,
                        body,
                    });
                }

                // Success path. Quota-degraded keys only demote once the
                // request as a whole is succeeding.
                for key in deprioritize_candidates.drain() {
                    self.config.deprioritize_key(api_type, &key);
                }
                if mark_urls {
                    self.scheduler
                        .url_ranker()
                        .mark_success(api_type, channel_index, base_url);
                }

                match response.body {
                    UpstreamBody::Bytes(bytes) => {
                        match adapter.translate_body(channel, bytes, &spec.model, spec.body) {
                            Ok((reply, usage)) => {
                                ticket.success(usage);
                                return ChannelAttempt::Handled(ClientReply::Json {
                                    status: response.status,
                                    body: reply,
                                });
                            }
                            Err(AdapterError::InvalidResponseBody(message)) => {
                                self.failed_keys.mark_failed(api_type, &api_key);
                                ticket.failure();
                                if mark_urls {
                                    self.scheduler
                                        .url_ranker()
                                        .mark_failure(api_type, channel_index, base_url);
                                }
                                warn!(
                                    api_type = %api_type,
                                    key = %mask_api_key(&api_key),
                                    %message,
                                    "invalid upstream body, trying the next key"
                                );
                                last_error = Some(message);
                                failed_this_url.insert(api_key);
                                continue;
                            }
                            Err(AdapterError::Build(message)) => {
                                ticket.failure();
                                return ChannelAttempt::Handled(ClientReply::Json {
                                    status: 500,
                                    body: adapter.error_body(500, &message),
                                });
                            }
                        }
                    }
                    UpstreamBody::Stream(mut upstream_rx) => {
                        let mut translator = adapter.new_stream(channel, &spec.model);

                        // Hold the attempt open until the first payload
                        // frame: an upstream that closes without one is
                        // retryable because nothing reached the client.
                        let mut head: Vec<Bytes> = Vec::new();
                        while let Some(chunk) = upstream_rx.recv().await {
                            let frames = translator.push(&chunk);
                            if !frames.is_empty() {
                                head = frames;
                                break;
                            }
                        }
                        if head.is_empty() {
                            self.failed_keys.mark_failed(api_type, &api_key);
                            ticket.failure();
                            if mark_urls {
                                self.scheduler
                                    .url_ranker()
                                    .mark_failure(api_type, channel_index, base_url);
                            }
                            warn!(
                                api_type = %api_type,
                                key = %mask_api_key(&api_key),
                                "empty stream response, trying the next key"
                            );
                            last_error = Some("empty stream response".to_string());
                            failed_this_url.insert(api_key);
                            continue;
                        }

                        let (frames_tx, frames_rx) = mpsc::channel::<Bytes>(64);
                        tokio::spawn(pump_stream(
                            head,
                            upstream_rx,
                            translator,
                            frames_tx,
                            ticket,
                        ));
                        return ChannelAttempt::Handled(ClientReply::Sse { frames: frames_rx });
                    }
                }
            }
        }

        ChannelAttempt::Exhausted {
            failover: last_failover,
            last_error,
        }
    }
}

/// Forwards translated frames to the client and finalizes the attempt
/// exactly once when the stream ends: success with the accumulated
/// usage, or client-cancel when the receiver went away.
async fn pump_stream(
    head: Vec<Bytes>,
    mut upstream_rx: mpsc::Receiver<Bytes>,
    mut translator: Box<dyn StreamTranslator>,
    frames_tx: mpsc::Sender<Bytes>,
    ticket: AttemptTicket,
) {
    let mut canceled = false;

    'forward: {
        for frame in head {
            if frames_tx.send(frame).await.is_err() {
                canceled = true;
                break 'forward;
            }
        }
        while let Some(chunk) = upstream_rx.recv().await {
            for frame in translator.push(&chunk) {
                if frames_tx.send(frame).await.is_err() {
                    canceled = true;
                    break 'forward;
                }
            }
        }
        for frame in translator.finish() {
            if frames_tx.send(frame).await.is_err() {
                canceled = true;
                break 'forward;
            }
        }
    }

    if canceled {
        ticket.cancel();
    } else {
        ticket.success(translator.usage());
    }
}

fn all_failed_reply(
    adapter: &dyn ProtocolAdapter,
    failover: Option<FailoverBody>,
    last_error: Option<String>,
) -> ClientReply {
    if let Some(failover) = failover {
        return ClientReply::Json {
            status: failover.status,
            body: failover.body,
        };
    }
    let message = last_error.unwrap_or_else(|| "all channels failed".to_string());
    ClientReply::Json {
        status: 503,
        body: adapter.error_body(503, &message),
    }
}

fn decompress_if_gzip(headers: &[(String, String)], body: Bytes) -> Bytes {
    let gzipped = headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case("content-encoding") && value.to_lowercase().contains("gzip")
    });
    if !gzipped {
        return body;
    }
    let mut decoder = flate2::read::GzDecoder::new(body.as_ref());
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out) {
        Ok(_) => Bytes::from(out),
        Err(_) => body,
    }
}

/// One reserved engine attempt. Exactly one of success / failure /
/// cancel runs; if the owning future is dropped (the client went away),
/// the drop guard finalizes as a client cancel so the pending slot is
/// always released and never counted as a failure.
struct AttemptTicket {
    scheduler: Arc<ChannelScheduler>,
    api_type: ApiType,
    base_url: String,
    api_key: String,
    request_id: u64,
    affinity: Option<(String, usize)>,
    finalized: bool,
}

impl AttemptTicket {
    fn new(
        scheduler: Arc<ChannelScheduler>,
        api_type: ApiType,
        base_url: String,
        api_key: String,
        request_id: u64,
        affinity: Option<(String, usize)>,
    ) -> Self {
        AttemptTicket {
            scheduler,
            api_type,
            base_url,
            api_key,
            request_id,
            affinity,
            finalized: false,
        }
    }

    fn success(mut self, usage: Option<Usage>) {
        self.scheduler.engine(self.api_type).finalize_success(
            &self.base_url,
            &self.api_key,
            self.request_id,
            usage,
        );
        self.scheduler
            .record_request_end(self.api_type, &self.base_url, &self.api_key);
        if let Some((user_id, channel_index)) = self.affinity.take() {
            self.scheduler
                .set_trace_affinity(self.api_type, &user_id, channel_index);
        }
        self.finalized = true;
    }

    fn failure(mut self) {
        self.scheduler.engine(self.api_type).finalize_failure(
            &self.base_url,
            &self.api_key,
            self.request_id,
        );
        self.scheduler
            .record_request_end(self.api_type, &self.base_url, &self.api_key);
        self.finalized = true;
    }

    fn cancel(mut self) {
        self.finalize_cancel();
    }

    fn finalize_cancel(&mut self) {
        if self.finalized {
            return;
        }
        self.scheduler.engine(self.api_type).finalize_client_cancel(
            &self.base_url,
            &self.api_key,
            self.request_id,
        );
        self.scheduler
            .record_request_end(self.api_type, &self.base_url, &self.api_key);
        self.finalized = true;
    }
}

impl Drop for AttemptTicket {
    fn drop(&mut self) {
        // Reached when the request future was dropped mid-attempt: the
        // client disconnected. Never a failure, never a circuit event.
        self.finalize_cancel();
    }
}
