use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{info, warn};

use relayx_common::ApiType;
use relayx_metrics::{metrics_key, MetricsEngine};

use crate::affinity::TraceAffinityMap;
use crate::channel::{ChannelConfig, ChannelStatus};
use crate::config_view::ConfigView;
use crate::url_ranker::{SortedUrl, UrlRanker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    PromotionPriority,
    TraceAffinity,
    PriorityOrder,
    Fallback,
}

impl SelectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionReason::PromotionPriority => "promotion_priority",
            SelectionReason::TraceAffinity => "trace_affinity",
            SelectionReason::PriorityOrder => "priority_order",
            SelectionReason::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectionResult {
    pub channel: ChannelConfig,
    pub channel_index: usize,
    pub reason: SelectionReason,
}

struct RankedChannel {
    index: usize,
    priority: usize,
    status: ChannelStatus,
}

/// Channel selection under trace affinity, promotion windows and
/// health. One scheduler serves all four apiTypes; each consults its own
/// metrics engine.
pub struct ChannelScheduler {
    config: Arc<ConfigView>,
    engines: HashMap<ApiType, Arc<MetricsEngine>>,
    affinity: Arc<TraceAffinityMap>,
    url_ranker: Arc<UrlRanker>,
}

impl ChannelScheduler {
    pub fn new(
        config: Arc<ConfigView>,
        engines: HashMap<ApiType, Arc<MetricsEngine>>,
        affinity: Arc<TraceAffinityMap>,
        url_ranker: Arc<UrlRanker>,
    ) -> Self {
        ChannelScheduler {
            config,
            engines,
            affinity,
            url_ranker,
        }
    }

    pub fn engine(&self, api_type: ApiType) -> &Arc<MetricsEngine> {
        self.engines
            .get(&api_type)
            .expect("an engine exists for every apiType")
    }

    pub fn affinity(&self) -> &Arc<TraceAffinityMap> {
        &self.affinity
    }

    pub fn url_ranker(&self) -> &Arc<UrlRanker> {
        &self.url_ranker
    }

    /// Channels that participate in scheduling (everything but
    /// disabled), sorted by priority.
    fn active_channels(&self, api_type: ApiType) -> (Vec<ChannelConfig>, Vec<RankedChannel>) {
        let channels = self.config.channels(api_type);
        let mut ranked: Vec<RankedChannel> = channels
            .iter()
            .enumerate()
            .filter(|(_, channel)| channel.status != ChannelStatus::Disabled)
            .map(|(index, channel)| RankedChannel {
                index,
                priority: channel.effective_priority(index),
                status: channel.status,
            })
            .collect();
        ranked.sort_by_key(|entry| entry.priority);
        (channels, ranked)
    }

    pub fn active_channel_count(&self, api_type: ApiType) -> usize {
        self.active_channels(api_type).1.len()
    }

    pub fn is_multi_channel_mode(&self, api_type: ApiType) -> bool {
        self.active_channel_count(api_type) > 1
    }

    /// Selection rules, in order: promotion (no health check), trace
    /// affinity, priority order, then lowest-failure-rate fallback.
    pub fn select_channel(
        &self,
        api_type: ApiType,
        user_id: &str,
        failed_channels: &HashSet<usize>,
    ) -> Option<SelectionResult> {
        let (channels, ranked) = self.active_channels(api_type);
        if ranked.is_empty() {
            return None;
        }
        let engine = self.engine(api_type);
        let now = OffsetDateTime::now_utc();

        // Promotion: an operator-pinned channel always gets an attempt,
        // health unchecked.
        for entry in &ranked {
            if entry.status != ChannelStatus::Active {
                continue;
            }
            let channel = &channels[entry.index];
            if !channel.in_promotion(now) {
                continue;
            }
            if failed_channels.contains(&entry.index) {
                warn!(
                    api_type = %api_type,
                    index = entry.index,
                    name = %channel.name,
                    "promoted channel already failed this request, skipping"
                );
                break;
            }
            if channel.api_keys.is_empty() {
                warn!(
                    api_type = %api_type,
                    index = entry.index,
                    name = %channel.name,
                    "promoted channel has no keys, skipping"
                );
                break;
            }
            info!(
                api_type = %api_type,
                index = entry.index,
                name = %channel.name,
                "promotion selected, health check bypassed"
            );
            return Some(SelectionResult {
                channel: channel.clone(),
                channel_index: entry.index,
                reason: SelectionReason::PromotionPriority,
            });
        }

        // Trace affinity.
        if !user_id.is_empty() {
            if let Some(preferred) = self.affinity.preferred_channel(api_type, user_id) {
                if let Some(entry) = ranked.iter().find(|entry| entry.index == preferred) {
                    let channel = &channels[entry.index];
                    if entry.status == ChannelStatus::Active
                        && !failed_channels.contains(&preferred)
                        && !channel.api_keys.is_empty()
                        && engine
                            .is_channel_healthy(&channel.effective_base_urls(), &channel.api_keys)
                    {
                        return Some(SelectionResult {
                            channel: channel.clone(),
                            channel_index: preferred,
                            reason: SelectionReason::TraceAffinity,
                        });
                    }
                }
            }
        }

        // Priority order over healthy active channels.
        for entry in &ranked {
            if failed_channels.contains(&entry.index) || entry.status != ChannelStatus::Active {
                continue;
            }
            let channel = &channels[entry.index];
            if channel.api_keys.is_empty() {
                continue;
            }
            let base_urls = channel.effective_base_urls();
            if !engine.is_channel_healthy(&base_urls, &channel.api_keys) {
                warn!(
                    api_type = %api_type,
                    index = entry.index,
                    name = %channel.name,
                    failure_rate = engine.channel_failure_rate(&base_urls, &channel.api_keys) * 100.0,
                    "skipping unhealthy channel"
                );
                continue;
            }
            return Some(SelectionResult {
                channel: channel.clone(),
                channel_index: entry.index,
                reason: SelectionReason::PriorityOrder,
            });
        }

        // Fallback: the least-failing active channel that is left.
        let mut best: Option<(usize, f64)> = None;
        for entry in &ranked {
            if failed_channels.contains(&entry.index) || entry.status != ChannelStatus::Active {
                continue;
            }
            let channel = &channels[entry.index];
            if channel.api_keys.is_empty() {
                continue;
            }
            let rate =
                engine.channel_failure_rate(&channel.effective_base_urls(), &channel.api_keys);
            match best {
                Some((_, best_rate)) if rate >= best_rate => {}
                _ => best = Some((entry.index, rate)),
            }
        }
        best.map(|(index, rate)| {
            warn!(
                api_type = %api_type,
                index,
                failure_rate = rate * 100.0,
                "fallback selection"
            );
            SelectionResult {
                channel: channels[index].clone(),
                channel_index: index,
                reason: SelectionReason::Fallback,
            }
        })
    }

    pub fn sorted_urls_for_channel(
        &self,
        api_type: ApiType,
        channel_index: usize,
        urls: &[String],
    ) -> Vec<SortedUrl> {
        self.url_ranker.sorted_urls(api_type, channel_index, urls)
    }

    pub fn record_request_start(&self, api_type: ApiType, base_url: &str, api_key: &str) {
        self.engine(api_type).record_request_start(base_url, api_key);
    }

    pub fn record_request_end(&self, api_type: ApiType, base_url: &str, api_key: &str) {
        self.engine(api_type).record_request_end(base_url, api_key);
    }

    /// Only called after a fully successful request.
    pub fn set_trace_affinity(&self, api_type: ApiType, user_id: &str, channel_index: usize) {
        self.affinity
            .set_preferred_channel(api_type, user_id, channel_index);
    }

    /// Clear failure state (window, circuit, consecutive counter) for
    /// every (baseURL, key) pair of one channel. History survives.
    pub fn reset_channel_metrics(&self, api_type: ApiType, channel_index: usize) {
        let Some(channel) = self.config.channel(api_type, channel_index) else {
            return;
        };
        let engine = self.engine(api_type);
        for base_url in channel.effective_base_urls() {
            for api_key in &channel.api_keys {
                engine.reset_key_failure_state(&base_url, api_key);
            }
        }
        info!(api_type = %api_type, index = channel_index, "channel failure state reset");
    }

    /// Delete the metrics of a removed channel, keeping any (baseURL,
    /// key) pair that a surviving channel of the same apiType still
    /// references. Precondition: the channel is already out of the
    /// config snapshot.
    pub async fn delete_channel_metrics(&self, api_type: ApiType, removed: &ChannelConfig) -> u64 {
        let mut still_used: HashSet<(String, String)> = HashSet::new();
        for channel in self.config.channels(api_type) {
            let mut keys = channel.api_keys.clone();
            keys.extend(channel.historical_api_keys.iter().cloned());
            for base_url in channel.effective_base_urls() {
                for api_key in &keys {
                    still_used.insert((base_url.clone(), api_key.clone()));
                }
            }
        }

        let mut doomed: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut removed_keys = removed.api_keys.clone();
        removed_keys.extend(removed.historical_api_keys.iter().cloned());
        for base_url in removed.effective_base_urls() {
            for api_key in &removed_keys {
                if still_used.contains(&(base_url.clone(), api_key.clone())) {
                    continue;
                }
                let key = metrics_key(&base_url, api_key);
                if seen.insert(key.clone()) {
                    doomed.push(key);
                }
            }
        }

        if doomed.is_empty() {
            info!(
                api_type = %api_type,
                name = %removed.name,
                "channel metrics shared with other channels, kept"
            );
            return 0;
        }
        self.engine(api_type).delete_by_metrics_keys(&doomed).await
    }
}
