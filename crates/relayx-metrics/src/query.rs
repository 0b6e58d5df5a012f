use std::collections::HashMap;

use serde::Serialize;
use time::OffsetDateTime;

use crate::engine::{metrics_key, MetricsEngine, RequestRecord};

/// Aggregate over one fixed lookback window (15m/1h/6h/24h).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TimeWindowStats {
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub success_rate: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    /// Token-denominated cache hit rate, 0-100.
    pub cache_hit_rate: f64,
}

/// One bucket of a time-series query.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HistoryPoint {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    /// Empty buckets report 0, not 100, so gaps never read as healthy.
    pub success_rate: f64,
}

/// Key-level bucket with token detail.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct KeyHistoryPoint {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub success_rate: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalStatsSummary {
    pub total_requests: i64,
    pub total_success: i64,
    pub total_failure: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_cache_creation_tokens: i64,
    pub total_cache_read_tokens: i64,
    pub avg_success_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalStatsHistory {
    pub data_points: Vec<KeyHistoryPoint>,
    pub summary: GlobalStatsSummary,
    pub model_data_points: HashMap<String, Vec<KeyHistoryPoint>>,
}

/// One 6-second activity segment.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ActivitySegment {
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentActivity {
    pub channel_index: usize,
    /// 150 segments of 6 seconds, oldest first (15 minutes total).
    pub segments: Vec<ActivitySegment>,
    pub rpm: f64,
    /// Output tokens only.
    pub tpm: f64,
}

const ACTIVITY_SEGMENTS: usize = 150;
const ACTIVITY_SEGMENT_SECS: i64 = 6;

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    requests: i64,
    successes: i64,
    failures: i64,
    input_tokens: i64,
    output_tokens: i64,
    cache_creation_tokens: i64,
    cache_read_tokens: i64,
}

impl Bucket {
    fn add(&mut self, record: &RequestRecord) {
        self.requests += 1;
        if record.success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.input_tokens += record.input_tokens;
        self.output_tokens += record.output_tokens;
        self.cache_creation_tokens += record.cache_creation_tokens;
        self.cache_read_tokens += record.cache_read_tokens;
    }

    fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.successes as f64 / self.requests as f64 * 100.0
        }
    }
}

/// Interval-aligned bucket frame: `[start, end)` with `points` buckets.
struct BucketFrame {
    start: OffsetDateTime,
    end: OffsetDateTime,
    interval_secs: i64,
    points: usize,
}

impl BucketFrame {
    fn new(now: OffsetDateTime, duration: time::Duration, interval: time::Duration) -> Option<Self> {
        let duration_secs = duration.whole_seconds();
        let interval_secs = interval.whole_seconds();
        if duration_secs <= 0 || interval_secs <= 0 {
            return None;
        }
        let start = truncate_to(now - duration, interval_secs);
        // Extend one interval past the truncated now so the live bucket
        // is included.
        let end = truncate_to(now, interval_secs) + interval;
        // Ceiling division: a duration that is not an exact multiple of
        // the interval still spans the extra partial bucket.
        let points = (duration_secs as u64).div_ceil(interval_secs as u64) as usize + 1;
        Some(BucketFrame {
            start,
            end,
            interval_secs,
            points,
        })
    }

    fn offset_of(&self, at: OffsetDateTime) -> Option<usize> {
        if at < self.start || at >= self.end {
            return None;
        }
        let offset = ((at - self.start).whole_seconds() / self.interval_secs) as usize;
        (offset < self.points).then_some(offset)
    }

    fn label(&self, index: usize) -> OffsetDateTime {
        self.start + time::Duration::seconds(self.interval_secs * index as i64)
    }
}

fn truncate_to(at: OffsetDateTime, interval_secs: i64) -> OffsetDateTime {
    let unix = at.unix_timestamp();
    let truncated = unix.div_euclid(interval_secs) * interval_secs;
    OffsetDateTime::from_unix_timestamp(truncated).unwrap_or(at)
}

impl MetricsEngine {
    /// Aggregate stats over one lookback window, across every
    /// (baseURL, key) combination of a channel.
    pub fn time_window_stats(
        &self,
        base_urls: &[String],
        active_keys: &[String],
        duration: time::Duration,
    ) -> TimeWindowStats {
        let cutoff = OffsetDateTime::now_utc() - duration;
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());

        let mut bucket = Bucket::default();
        for base_url in base_urls {
            for api_key in active_keys {
                let key = metrics_key(base_url, api_key);
                if let Some(metrics) = inner.keys.get(&key) {
                    for record in &metrics.request_history {
                        if record.timestamp > cutoff {
                            bucket.add(record);
                        }
                    }
                }
            }
        }

        let success_rate = if bucket.requests > 0 {
            bucket.successes as f64 / bucket.requests as f64 * 100.0
        } else {
            100.0
        };
        let cache_denominator = bucket.cache_read_tokens + bucket.input_tokens;
        let cache_hit_rate = if cache_denominator > 0 {
            bucket.cache_read_tokens as f64 / cache_denominator as f64 * 100.0
        } else {
            0.0
        };

        TimeWindowStats {
            request_count: bucket.requests,
            success_count: bucket.successes,
            failure_count: bucket.failures,
            success_rate,
            input_tokens: bucket.input_tokens,
            output_tokens: bucket.output_tokens,
            cache_creation_tokens: bucket.cache_creation_tokens,
            cache_read_tokens: bucket.cache_read_tokens,
            cache_hit_rate,
        }
    }

    /// The standard four windows keyed by label.
    pub fn all_time_window_stats(
        &self,
        base_urls: &[String],
        active_keys: &[String],
    ) -> HashMap<&'static str, TimeWindowStats> {
        let mut out = HashMap::new();
        out.insert(
            "15m",
            self.time_window_stats(base_urls, active_keys, time::Duration::minutes(15)),
        );
        out.insert(
            "1h",
            self.time_window_stats(base_urls, active_keys, time::Duration::hours(1)),
        );
        out.insert(
            "6h",
            self.time_window_stats(base_urls, active_keys, time::Duration::hours(6)),
        );
        out.insert(
            "24h",
            self.time_window_stats(base_urls, active_keys, time::Duration::hours(24)),
        );
        out
    }

    /// Channel-level bucketed history across base URLs and keys.
    pub fn historical_stats(
        &self,
        base_urls: &[String],
        active_keys: &[String],
        duration: time::Duration,
        interval: time::Duration,
    ) -> Vec<HistoryPoint> {
        let Some(frame) = BucketFrame::new(OffsetDateTime::now_utc(), duration, interval) else {
            return Vec::new();
        };
        let mut buckets = vec![Bucket::default(); frame.points];

        {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            for base_url in base_urls {
                for api_key in active_keys {
                    let key = metrics_key(base_url, api_key);
                    if let Some(metrics) = inner.keys.get(&key) {
                        for record in &metrics.request_history {
                            if let Some(offset) = frame.offset_of(record.timestamp) {
                                buckets[offset].add(record);
                            }
                        }
                    }
                }
            }
        }

        buckets
            .iter()
            .enumerate()
            .map(|(i, bucket)| HistoryPoint {
                timestamp: frame.label(i),
                request_count: bucket.requests,
                success_count: bucket.successes,
                failure_count: bucket.failures,
                success_rate: bucket.success_rate(),
            })
            .collect()
    }

    /// One key aggregated over every base URL, with token detail.
    pub fn key_historical_stats(
        &self,
        base_urls: &[String],
        api_key: &str,
        duration: time::Duration,
        interval: time::Duration,
    ) -> Vec<KeyHistoryPoint> {
        let Some(frame) = BucketFrame::new(OffsetDateTime::now_utc(), duration, interval) else {
            return Vec::new();
        };
        let mut buckets = vec![Bucket::default(); frame.points];

        {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            for base_url in base_urls {
                let key = metrics_key(base_url, api_key);
                if let Some(metrics) = inner.keys.get(&key) {
                    for record in &metrics.request_history {
                        if let Some(offset) = frame.offset_of(record.timestamp) {
                            buckets[offset].add(record);
                        }
                    }
                }
            }
        }

        buckets
            .iter()
            .enumerate()
            .map(|(i, bucket)| key_point(&frame, i, bucket))
            .collect()
    }

    /// One key's history grouped by model.
    pub fn key_model_historical_stats(
        &self,
        base_urls: &[String],
        api_key: &str,
        duration: time::Duration,
        interval: time::Duration,
    ) -> HashMap<String, Vec<KeyHistoryPoint>> {
        let Some(frame) = BucketFrame::new(OffsetDateTime::now_utc(), duration, interval) else {
            return HashMap::new();
        };
        let mut model_buckets: HashMap<String, Vec<Bucket>> = HashMap::new();

        {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            for base_url in base_urls {
                let key = metrics_key(base_url, api_key);
                if let Some(metrics) = inner.keys.get(&key) {
                    for record in &metrics.request_history {
                        let Some(offset) = frame.offset_of(record.timestamp) else {
                            continue;
                        };
                        let model = if record.model.is_empty() {
                            "unknown".to_string()
                        } else {
                            record.model.clone()
                        };
                        model_buckets
                            .entry(model)
                            .or_insert_with(|| vec![Bucket::default(); frame.points])[offset]
                            .add(record);
                    }
                }
            }
        }

        model_buckets
            .into_iter()
            .map(|(model, buckets)| {
                let points = buckets
                    .iter()
                    .enumerate()
                    .map(|(i, bucket)| key_point(&frame, i, bucket))
                    .collect();
                (model, points)
            })
            .collect()
    }

    /// Every key of this engine bucketed together, with a summary and a
    /// per-model breakdown. History slices are cloned under the read
    /// lock and aggregated outside it to keep the hot path short.
    pub fn global_historical_stats(
        &self,
        duration: time::Duration,
        interval: time::Duration,
    ) -> GlobalStatsHistory {
        let Some(frame) = BucketFrame::new(OffsetDateTime::now_utc(), duration, interval) else {
            return GlobalStatsHistory::default();
        };

        let histories: Vec<Vec<RequestRecord>> = {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            inner
                .keys
                .values()
                .map(|metrics| metrics.request_history.clone())
                .collect()
        };

        let mut buckets = vec![Bucket::default(); frame.points];
        let mut model_buckets: HashMap<String, Vec<Bucket>> = HashMap::new();
        let mut summary = GlobalStatsSummary::default();

        for history in &histories {
            for record in history {
                let Some(offset) = frame.offset_of(record.timestamp) else {
                    continue;
                };
                buckets[offset].add(record);
                summary.total_requests += 1;
                if record.success {
                    summary.total_success += 1;
                } else {
                    summary.total_failure += 1;
                }
                summary.total_input_tokens += record.input_tokens;
                summary.total_output_tokens += record.output_tokens;
                summary.total_cache_creation_tokens += record.cache_creation_tokens;
                summary.total_cache_read_tokens += record.cache_read_tokens;

                if !record.model.is_empty() {
                    model_buckets
                        .entry(record.model.clone())
                        .or_insert_with(|| vec![Bucket::default(); frame.points])[offset]
                        .add(record);
                }
            }
        }

        summary.avg_success_rate = if summary.total_requests > 0 {
            summary.total_success as f64 / summary.total_requests as f64 * 100.0
        } else {
            0.0
        };

        GlobalStatsHistory {
            data_points: buckets
                .iter()
                .enumerate()
                .map(|(i, bucket)| key_point(&frame, i, bucket))
                .collect(),
            summary,
            model_data_points: model_buckets
                .into_iter()
                .map(|(model, buckets)| {
                    let points = buckets
                        .iter()
                        .enumerate()
                        .map(|(i, bucket)| key_point(&frame, i, bucket))
                        .collect();
                    (model, points)
                })
                .collect(),
        }
    }

    /// 150 fixed six-second segments covering the last 15 minutes. The
    /// end boundary is aligned up to the next segment edge so buckets do
    /// not drift with wall-clock jitter between calls.
    pub fn recent_activity(
        &self,
        channel_index: usize,
        base_urls: &[String],
        active_keys: &[String],
    ) -> RecentActivity {
        let mut segments = vec![ActivitySegment::default(); ACTIVITY_SEGMENTS];
        if base_urls.is_empty() || active_keys.is_empty() {
            return RecentActivity {
                channel_index,
                segments,
                rpm: 0.0,
                tpm: 0.0,
            };
        }

        let now = OffsetDateTime::now_utc();
        let aligned_end =
            (now.unix_timestamp() / ACTIVITY_SEGMENT_SECS + 1) * ACTIVITY_SEGMENT_SECS;
        let end = OffsetDateTime::from_unix_timestamp(aligned_end).unwrap_or(now);
        let start =
            end - time::Duration::seconds(ACTIVITY_SEGMENT_SECS * ACTIVITY_SEGMENTS as i64);

        let mut total_requests = 0i64;
        let mut total_output_tokens = 0i64;

        {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            for base_url in base_urls {
                for api_key in active_keys {
                    let key = metrics_key(base_url, api_key);
                    let Some(metrics) = inner.keys.get(&key) else {
                        continue;
                    };
                    for record in &metrics.request_history {
                        if record.timestamp < start || record.timestamp >= end {
                            continue;
                        }
                        let offset = ((record.timestamp - start).whole_seconds()
                            / ACTIVITY_SEGMENT_SECS) as usize;
                        if offset >= ACTIVITY_SEGMENTS {
                            continue;
                        }
                        let segment = &mut segments[offset];
                        segment.request_count += 1;
                        if record.success {
                            segment.success_count += 1;
                        } else {
                            segment.failure_count += 1;
                        }
                        segment.input_tokens += record.input_tokens;
                        segment.output_tokens += record.output_tokens;

                        total_requests += 1;
                        total_output_tokens += record.output_tokens;
                    }
                }
            }
        }

        let window_minutes =
            (ACTIVITY_SEGMENTS as f64 * ACTIVITY_SEGMENT_SECS as f64) / 60.0;
        RecentActivity {
            channel_index,
            segments,
            rpm: total_requests as f64 / window_minutes,
            tpm: total_output_tokens as f64 / window_minutes,
        }
    }
}

fn key_point(frame: &BucketFrame, index: usize, bucket: &Bucket) -> KeyHistoryPoint {
    KeyHistoryPoint {
        timestamp: frame.label(index),
        request_count: bucket.requests,
        success_count: bucket.successes,
        failure_count: bucket.failures,
        success_rate: bucket.success_rate(),
        input_tokens: bucket.input_tokens,
        output_tokens: bucket.output_tokens,
        cache_creation_tokens: bucket.cache_creation_tokens,
        cache_read_tokens: bucket.cache_read_tokens,
    }
}
