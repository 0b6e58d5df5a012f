use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{info, warn};

use relayx_common::{mask_api_key, ApiType, Usage};
use relayx_storage::{PersistentRecord, RecordStore};

const HISTORY_RETENTION: time::Duration = time::Duration::hours(24);
const WINDOW_RELOAD_SPAN: time::Duration = time::Duration::minutes(15);
const STALE_KEY_THRESHOLD: time::Duration = time::Duration::hours(48);

/// Metrics identity: first 16 hex chars of sha256(baseURL | apiKey).
/// Pure and deterministic so reloading the persistence log reproduces
/// the same identities.
pub fn metrics_key(base_url: &str, api_key: &str) -> String {
    let digest = Sha256::digest(format!("{base_url}|{api_key}").as_bytes());
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// One request in a key's 24-hour history. Stamped at upstream
/// connection time; success and token counts are rewritten when the
/// request finalizes.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub model: String,
    pub timestamp: OffsetDateTime,
    pub success: bool,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
}

#[derive(Debug)]
pub(crate) struct KeyMetrics {
    pub(crate) metrics_key: String,
    pub(crate) base_url: String,
    pub(crate) key_mask: String,
    pub(crate) request_count: i64,
    pub(crate) success_count: i64,
    pub(crate) failure_count: i64,
    pub(crate) consecutive_failures: i64,
    pub(crate) active_requests: i64,
    pub(crate) last_success_at: Option<OffsetDateTime>,
    pub(crate) last_failure_at: Option<OffsetDateTime>,
    pub(crate) circuit_broken_at: Option<OffsetDateTime>,
    /// Most recent outcomes, newest last, capped at the window size.
    pub(crate) recent_results: Vec<bool>,
    pub(crate) request_history: Vec<RequestRecord>,
    /// In-flight reservations: request id -> slot in `request_history`.
    pub(crate) pending_history_idx: HashMap<u64, usize>,
}

impl KeyMetrics {
    fn new(metrics_key: String, base_url: String, key_mask: String, window: usize) -> Self {
        KeyMetrics {
            metrics_key,
            base_url,
            key_mask,
            request_count: 0,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            active_requests: 0,
            last_success_at: None,
            last_failure_at: None,
            circuit_broken_at: None,
            recent_results: Vec::with_capacity(window),
            request_history: Vec::new(),
            pending_history_idx: HashMap::new(),
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.recent_results.is_empty() {
            return 0.0;
        }
        let failures = self.recent_results.iter().filter(|ok| !**ok).count();
        failures as f64 / self.recent_results.len() as f64
    }
}

/// Copy of one key's aggregate counters, for dashboards and tests.
#[derive(Debug, Clone)]
pub struct KeyMetricsSnapshot {
    pub metrics_key: String,
    pub base_url: String,
    pub key_mask: String,
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub consecutive_failures: i64,
    pub active_requests: i64,
    pub last_success_at: Option<OffsetDateTime>,
    pub last_failure_at: Option<OffsetDateTime>,
    pub circuit_broken_at: Option<OffsetDateTime>,
    pub window_len: usize,
}

pub(crate) struct Inner {
    pub(crate) keys: HashMap<String, KeyMetrics>,
    next_request_id: u64,
}

/// Per-apiType metrics engine. One writer lock guards the whole key map;
/// every counter, window, history slice and pending map mutates only
/// under it.
pub struct MetricsEngine {
    pub(crate) inner: RwLock<Inner>,
    pub(crate) window_size: usize,
    pub(crate) failure_threshold: f64,
    pub(crate) circuit_recovery: time::Duration,
    api_type: ApiType,
    store: Option<Arc<RecordStore>>,
}

impl MetricsEngine {
    pub fn new(api_type: ApiType, window_size: usize, failure_threshold: f64) -> Arc<Self> {
        Self::build(api_type, window_size, failure_threshold, None)
    }

    /// Engine backed by the persistence store; replays the last 24 hours
    /// of this apiType before returning.
    pub async fn with_store(
        api_type: ApiType,
        window_size: usize,
        failure_threshold: f64,
        store: Arc<RecordStore>,
    ) -> Arc<Self> {
        let engine = Self::build(api_type, window_size, failure_threshold, Some(store));
        if let Err(err) = engine.load_from_store().await {
            warn!(api_type = %api_type, error = %err, "loading historical metrics failed");
        }
        engine
    }

    fn build(
        api_type: ApiType,
        window_size: usize,
        failure_threshold: f64,
        store: Option<Arc<RecordStore>>,
    ) -> Arc<Self> {
        let window_size = window_size.max(3);
        let failure_threshold = if failure_threshold <= 0.0 || failure_threshold > 1.0 {
            0.5
        } else {
            failure_threshold
        };
        Arc::new(MetricsEngine {
            inner: RwLock::new(Inner {
                keys: HashMap::new(),
                next_request_id: 0,
            }),
            window_size,
            failure_threshold,
            circuit_recovery: time::Duration::minutes(15),
            api_type,
            store,
        })
    }

    pub fn api_type(&self) -> ApiType {
        self.api_type
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn failure_threshold(&self) -> f64 {
        self.failure_threshold
    }

    /// Engine with a custom circuit recovery time (tests and tuning).
    pub fn with_recovery(
        api_type: ApiType,
        window_size: usize,
        failure_threshold: f64,
        recovery: time::Duration,
    ) -> Arc<Self> {
        let engine = Self::build(api_type, window_size, failure_threshold, None);
        // Safe: the engine has not been shared yet.
        let mut engine = engine;
        if let Some(inner) = Arc::get_mut(&mut engine) {
            inner.circuit_recovery = recovery;
        }
        engine
    }

    fn min_window_samples(&self) -> usize {
        (self.window_size / 2).max(3)
    }

    async fn load_from_store(&self) -> Result<(), relayx_storage::StoreError> {
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        let since = OffsetDateTime::now_utc() - HISTORY_RETENTION;
        let records = store.load_records(since, self.api_type).await?;
        if records.is_empty() {
            return Ok(());
        }

        let loaded = records.len();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for record in records {
            let entry = inner
                .keys
                .entry(record.metrics_key.clone())
                .or_insert_with(|| {
                    KeyMetrics::new(
                        record.metrics_key.clone(),
                        record.base_url.clone(),
                        record.key_mask.clone(),
                        self.window_size,
                    )
                });
            entry.request_history.push(RequestRecord {
                model: record.model.clone(),
                timestamp: record.timestamp,
                success: record.success,
                input_tokens: record.input_tokens,
                output_tokens: record.output_tokens,
                cache_creation_tokens: record.cache_creation_tokens,
                cache_read_tokens: record.cache_read_tokens,
            });
            entry.request_count += 1;
            if record.success {
                entry.success_count += 1;
                if entry.last_success_at.map_or(true, |t| record.timestamp > t) {
                    entry.last_success_at = Some(record.timestamp);
                }
            } else {
                entry.failure_count += 1;
                if entry.last_failure_at.map_or(true, |t| record.timestamp > t) {
                    entry.last_failure_at = Some(record.timestamp);
                }
            }
        }

        // Rebuild sliding windows from only the last 15 minutes so old
        // failures cannot keep a key unhealthy across a restart.
        let window_cutoff = OffsetDateTime::now_utc() - WINDOW_RELOAD_SPAN;
        let window_size = self.window_size;
        for metrics in inner.keys.values_mut() {
            let recent: Vec<bool> = metrics
                .request_history
                .iter()
                .filter(|record| record.timestamp > window_cutoff)
                .map(|record| record.success)
                .collect();
            let start = recent.len().saturating_sub(window_size);
            metrics.recent_results = recent[start..].to_vec();
        }

        info!(
            api_type = %self.api_type,
            records = loaded,
            keys = inner.keys.len(),
            "historical metrics loaded"
        );
        Ok(())
    }

    /// Reserve a history slot at upstream connection time. Does not bump
    /// the request counter; that happens at finalize so failover retries
    /// are not double-counted.
    pub fn reserve_attempt(&self, base_url: &str, api_key: &str, model: &str) -> u64 {
        self.reserve_attempt_at(base_url, api_key, model, OffsetDateTime::now_utc())
    }

    pub fn reserve_attempt_at(
        &self,
        base_url: &str,
        api_key: &str,
        model: &str,
        timestamp: OffsetDateTime,
    ) -> u64 {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.next_request_id += 1;
        let request_id = inner.next_request_id;

        let window = self.window_size;
        let metrics = get_or_create(&mut inner.keys, base_url, api_key, window);
        metrics.request_history.push(RequestRecord {
            model: model.to_string(),
            timestamp,
            // Provisionally a success; the finalize rewrites it.
            success: true,
            input_tokens: 0,
            output_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
        });
        let slot = metrics.request_history.len() - 1;
        metrics.pending_history_idx.insert(request_id, slot);

        cleanup_history(metrics, OffsetDateTime::now_utc());
        request_id
    }

    pub fn finalize_success(
        &self,
        base_url: &str,
        api_key: &str,
        request_id: u64,
        usage: Option<Usage>,
    ) {
        let now = OffsetDateTime::now_utc();
        let key = metrics_key(base_url, api_key);
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        let Some(metrics) = inner.keys.get_mut(&key) else {
            drop(inner);
            self.record_fresh_outcome(base_url, api_key, true, usage, now);
            return;
        };
        let slot = match metrics.pending_history_idx.get(&request_id) {
            Some(&idx) if idx < metrics.request_history.len() => idx,
            _ => {
                drop(inner);
                self.record_fresh_outcome(base_url, api_key, true, usage, now);
                return;
            }
        };
        metrics.pending_history_idx.remove(&request_id);

        metrics.request_count += 1;
        metrics.success_count += 1;
        metrics.consecutive_failures = 0;
        metrics.last_success_at = Some(now);
        if metrics.circuit_broken_at.take().is_some() {
            info!(
                key = %metrics.key_mask,
                base_url = %metrics.base_url,
                "circuit closed after successful request"
            );
        }
        push_window(metrics, true, self.window_size);

        let usage = usage.unwrap_or_default();
        let record = &mut metrics.request_history[slot];
        record.success = true;
        record.input_tokens = usage.input_tokens;
        record.output_tokens = usage.output_tokens;
        record.cache_creation_tokens = usage.cache_creation_total();
        record.cache_read_tokens = usage.cache_read_input_tokens;

        let persistent = self.persistent_record(metrics, slot);
        drop(inner);
        self.persist(persistent);
    }

    pub fn finalize_failure(&self, base_url: &str, api_key: &str, request_id: u64) {
        let now = OffsetDateTime::now_utc();
        let key = metrics_key(base_url, api_key);
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        let Some(metrics) = inner.keys.get_mut(&key) else {
            drop(inner);
            self.record_fresh_outcome(base_url, api_key, false, None, now);
            return;
        };
        let slot = match metrics.pending_history_idx.get(&request_id) {
            Some(&idx) if idx < metrics.request_history.len() => idx,
            _ => {
                drop(inner);
                self.record_fresh_outcome(base_url, api_key, false, None, now);
                return;
            }
        };
        metrics.pending_history_idx.remove(&request_id);

        metrics.request_count += 1;
        metrics.failure_count += 1;
        metrics.consecutive_failures += 1;
        metrics.last_failure_at = Some(now);
        push_window(metrics, false, self.window_size);
        self.enter_circuit_if_due(metrics, now);

        let record = &mut metrics.request_history[slot];
        record.success = false;
        record.input_tokens = 0;
        record.output_tokens = 0;
        record.cache_creation_tokens = 0;
        record.cache_read_tokens = 0;

        let persistent = self.persistent_record(metrics, slot);
        drop(inner);
        self.persist(persistent);
    }

    /// Client disconnection: counts the request, touches neither the
    /// failure counters nor the sliding window, removes the reserved
    /// history slot, and persists nothing.
    pub fn finalize_client_cancel(&self, base_url: &str, api_key: &str, request_id: u64) {
        let key = metrics_key(base_url, api_key);
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let Some(metrics) = inner.keys.get_mut(&key) else {
            return;
        };
        let slot = match metrics.pending_history_idx.get(&request_id) {
            Some(&idx) if idx < metrics.request_history.len() => idx,
            _ => return,
        };
        metrics.pending_history_idx.remove(&request_id);

        metrics.request_count += 1;
        metrics.request_history.remove(slot);
        for idx in metrics.pending_history_idx.values_mut() {
            if *idx > slot {
                *idx -= 1;
            }
        }
    }

    /// Outcome for a request whose reservation was lost (24h cleanup, or
    /// the engine was reset underneath it): record a fresh sample so the
    /// outcome still counts.
    fn record_fresh_outcome(
        &self,
        base_url: &str,
        api_key: &str,
        success: bool,
        usage: Option<Usage>,
        now: OffsetDateTime,
    ) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let window = self.window_size;
        let metrics = get_or_create(&mut inner.keys, base_url, api_key, window);

        metrics.request_count += 1;
        if success {
            metrics.success_count += 1;
            metrics.consecutive_failures = 0;
            metrics.last_success_at = Some(now);
            metrics.circuit_broken_at = None;
        } else {
            metrics.failure_count += 1;
            metrics.consecutive_failures += 1;
            metrics.last_failure_at = Some(now);
        }
        push_window(metrics, success, self.window_size);
        if !success {
            self.enter_circuit_if_due(metrics, now);
        }

        let usage = usage.unwrap_or_default();
        metrics.request_history.push(RequestRecord {
            model: String::new(),
            timestamp: now,
            success,
            input_tokens: if success { usage.input_tokens } else { 0 },
            output_tokens: if success { usage.output_tokens } else { 0 },
            cache_creation_tokens: if success { usage.cache_creation_total() } else { 0 },
            cache_read_tokens: if success { usage.cache_read_input_tokens } else { 0 },
        });
        cleanup_history(metrics, now);

        let slot = metrics.request_history.len() - 1;
        let persistent = self.persistent_record(metrics, slot);
        drop(inner);
        self.persist(persistent);
    }

    fn enter_circuit_if_due(&self, metrics: &mut KeyMetrics, now: OffsetDateTime) {
        if metrics.circuit_broken_at.is_none()
            && metrics.recent_results.len() >= self.min_window_samples()
            && metrics.failure_rate() >= self.failure_threshold
        {
            metrics.circuit_broken_at = Some(now);
            warn!(
                key = %metrics.key_mask,
                base_url = %metrics.base_url,
                failure_rate = metrics.failure_rate() * 100.0,
                "circuit opened"
            );
        }
    }

    fn persistent_record(&self, metrics: &KeyMetrics, slot: usize) -> PersistentRecord {
        let record = &metrics.request_history[slot];
        PersistentRecord {
            metrics_key: metrics.metrics_key.clone(),
            base_url: metrics.base_url.clone(),
            key_mask: metrics.key_mask.clone(),
            timestamp: record.timestamp,
            success: record.success,
            input_tokens: record.input_tokens,
            output_tokens: record.output_tokens,
            cache_creation_tokens: record.cache_creation_tokens,
            cache_read_tokens: record.cache_read_tokens,
            api_type: self.api_type,
            model: record.model.clone(),
        }
    }

    fn persist(&self, record: PersistentRecord) {
        if let Some(store) = self.store.as_ref() {
            store.add_record(record);
        }
    }

    pub fn record_request_start(&self, base_url: &str, api_key: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let window = self.window_size;
        let metrics = get_or_create(&mut inner.keys, base_url, api_key, window);
        metrics.active_requests += 1;
    }

    pub fn record_request_end(&self, base_url: &str, api_key: &str) {
        let key = metrics_key(base_url, api_key);
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(metrics) = inner.keys.get_mut(&key) {
            if metrics.active_requests > 0 {
                metrics.active_requests -= 1;
            }
        }
    }

    /// True iff the key has enough window samples and its failure rate
    /// has crossed the threshold.
    pub fn should_suspend_key(&self, base_url: &str, api_key: &str) -> bool {
        let key = metrics_key(base_url, api_key);
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let Some(metrics) = inner.keys.get(&key) else {
            return false;
        };
        metrics.recent_results.len() >= self.min_window_samples()
            && metrics.failure_rate() >= self.failure_threshold
    }

    pub fn is_key_healthy(&self, base_url: &str, api_key: &str) -> bool {
        let key = metrics_key(base_url, api_key);
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        match inner.keys.get(&key) {
            Some(metrics) if !metrics.recent_results.is_empty() => {
                metrics.failure_rate() < self.failure_threshold
            }
            _ => true,
        }
    }

    /// Aggregate health over every (baseURL, key) combination. Too few
    /// samples counts as healthy.
    pub fn is_channel_healthy(&self, base_urls: &[String], active_keys: &[String]) -> bool {
        if active_keys.is_empty() {
            return false;
        }
        let (samples, failures) = self.window_totals(base_urls, active_keys);
        if samples < self.min_window_samples() {
            return true;
        }
        (failures as f64 / samples as f64) < self.failure_threshold
    }

    pub fn channel_failure_rate(&self, base_urls: &[String], active_keys: &[String]) -> f64 {
        let (samples, failures) = self.window_totals(base_urls, active_keys);
        if samples == 0 {
            return 0.0;
        }
        failures as f64 / samples as f64
    }

    fn window_totals(&self, base_urls: &[String], active_keys: &[String]) -> (usize, usize) {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut samples = 0usize;
        let mut failures = 0usize;
        for base_url in base_urls {
            for api_key in active_keys {
                let key = metrics_key(base_url, api_key);
                if let Some(metrics) = inner.keys.get(&key) {
                    samples += metrics.recent_results.len();
                    failures += metrics.recent_results.iter().filter(|ok| !**ok).count();
                }
            }
        }
        (samples, failures)
    }

    /// Clear only the failure-oriented fields; cumulative counters and
    /// history survive.
    pub fn reset_key_failure_state(&self, base_url: &str, api_key: &str) {
        let key = metrics_key(base_url, api_key);
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(metrics) = inner.keys.get_mut(&key) {
            metrics.consecutive_failures = 0;
            metrics.recent_results.clear();
            metrics.circuit_broken_at = None;
        }
    }

    /// Full reset of one key, pending slots included.
    pub fn reset_key(&self, base_url: &str, api_key: &str) {
        let key = metrics_key(base_url, api_key);
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(metrics) = inner.keys.get_mut(&key) {
            metrics.request_count = 0;
            metrics.success_count = 0;
            metrics.failure_count = 0;
            metrics.consecutive_failures = 0;
            metrics.active_requests = 0;
            metrics.last_success_at = None;
            metrics.last_failure_at = None;
            metrics.circuit_broken_at = None;
            metrics.recent_results.clear();
            metrics.request_history.clear();
            metrics.pending_history_idx.clear();
        }
    }

    pub fn reset_all(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.keys.clear();
    }

    /// Drop rows from memory only. Returns how many existed.
    pub fn delete_keys(&self, keys: &[String]) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut deleted = 0;
        for key in keys {
            if inner.keys.remove(key).is_some() {
                deleted += 1;
            }
        }
        deleted
    }

    /// Drop rows from memory and from the persistence store (scoped to
    /// this engine's apiType). Returns the persisted rows removed.
    pub async fn delete_by_metrics_keys(&self, keys: &[String]) -> u64 {
        if keys.is_empty() {
            return 0;
        }
        let deleted = self.delete_keys(keys);
        if deleted > 0 {
            info!(api_type = %self.api_type, deleted, "in-memory key metrics deleted");
        }
        let Some(store) = self.store.as_ref() else {
            return 0;
        };
        match store.delete_records_by_metrics_keys(keys, self.api_type).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(api_type = %self.api_type, error = %err, "persistent metrics delete failed");
                0
            }
        }
    }

    /// Minute sweep: close circuits whose recovery time elapsed.
    pub fn recover_expired_circuits(&self) {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for metrics in inner.keys.values_mut() {
            if let Some(broken_at) = metrics.circuit_broken_at {
                if now - broken_at > self.circuit_recovery {
                    metrics.consecutive_failures = 0;
                    metrics.recent_results.clear();
                    metrics.circuit_broken_at = None;
                    info!(
                        key = %metrics.key_mask,
                        base_url = %metrics.base_url,
                        "circuit recovered after timeout"
                    );
                }
            }
        }
    }

    /// Hourly sweep: drop keys with no activity for 48 hours.
    pub fn cleanup_stale_keys(&self) {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.keys.retain(|_, metrics| {
            let last = match (metrics.last_success_at, metrics.last_failure_at) {
                (Some(s), Some(f)) => Some(s.max(f)),
                (Some(s), None) => Some(s),
                (None, Some(f)) => Some(f),
                (None, None) => None,
            };
            match last {
                Some(at) => now - at <= STALE_KEY_THRESHOLD,
                None => false,
            }
        });
    }

    pub fn key_snapshot(&self, base_url: &str, api_key: &str) -> Option<KeyMetricsSnapshot> {
        let key = metrics_key(base_url, api_key);
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.keys.get(&key).map(snapshot_of)
    }

    pub fn all_key_snapshots(&self) -> Vec<KeyMetricsSnapshot> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.keys.values().map(snapshot_of).collect()
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self, base_url: &str, api_key: &str) -> usize {
        let key = metrics_key(base_url, api_key);
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .keys
            .get(&key)
            .map(|m| m.pending_history_idx.len())
            .unwrap_or(0)
    }
}

fn snapshot_of(metrics: &KeyMetrics) -> KeyMetricsSnapshot {
    KeyMetricsSnapshot {
        metrics_key: metrics.metrics_key.clone(),
        base_url: metrics.base_url.clone(),
        key_mask: metrics.key_mask.clone(),
        request_count: metrics.request_count,
        success_count: metrics.success_count,
        failure_count: metrics.failure_count,
        consecutive_failures: metrics.consecutive_failures,
        active_requests: metrics.active_requests,
        last_success_at: metrics.last_success_at,
        last_failure_at: metrics.last_failure_at,
        circuit_broken_at: metrics.circuit_broken_at,
        window_len: metrics.recent_results.len(),
    }
}

fn get_or_create<'a>(
    keys: &'a mut HashMap<String, KeyMetrics>,
    base_url: &str,
    api_key: &str,
    window: usize,
) -> &'a mut KeyMetrics {
    let key = metrics_key(base_url, api_key);
    keys.entry(key.clone()).or_insert_with(|| {
        KeyMetrics::new(
            key,
            base_url.to_string(),
            mask_api_key(api_key),
            window,
        )
    })
}

fn push_window(metrics: &mut KeyMetrics, success: bool, window_size: usize) {
    metrics.recent_results.push(success);
    if metrics.recent_results.len() > window_size {
        metrics.recent_results.remove(0);
    }
}

/// Evict history older than 24 hours and rebase pending slot indices so
/// open reservations stay valid. The single most delicate invariant in
/// the engine; exercised directly by the pending-integrity tests.
fn cleanup_history(metrics: &mut KeyMetrics, now: OffsetDateTime) {
    if metrics.request_history.is_empty() {
        return;
    }
    let cutoff = now - HISTORY_RETENTION;
    let new_start = metrics
        .request_history
        .iter()
        .position(|record| record.timestamp > cutoff);

    match new_start {
        Some(0) => {}
        Some(start) => {
            metrics.request_history.drain(..start);
            let rebased: HashMap<u64, usize> = metrics
                .pending_history_idx
                .drain()
                .filter_map(|(id, idx)| {
                    if idx < start {
                        None
                    } else {
                        Some((id, idx - start))
                    }
                })
                .collect();
            metrics.pending_history_idx = rebased;
        }
        None => {
            metrics.request_history.clear();
            metrics.pending_history_idx.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://u1";
    const KEY: &str = "sk-test-0123456789";

    fn engine() -> Arc<MetricsEngine> {
        MetricsEngine::new(ApiType::Messages, 10, 0.5)
    }

    #[test]
    fn identity_is_per_pair_not_per_channel() {
        let a = metrics_key("https://u1", "k1");
        let b = metrics_key("https://u1", "k1");
        let c = metrics_key("https://u1", "k2");
        let d = metrics_key("https://u2", "k1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn success_finalize_updates_counters_and_window() {
        let engine = engine();
        let id = engine.reserve_attempt(URL, KEY, "claude-3");
        engine.finalize_success(URL, KEY, id, Some(Usage::new(5, 1)));

        let snap = engine.key_snapshot(URL, KEY).unwrap();
        assert_eq!(snap.request_count, 1);
        assert_eq!(snap.success_count, 1);
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.window_len, 1);
        assert!(snap.last_success_at.is_some());
        assert_eq!(engine.pending_len(URL, KEY), 0);
    }

    #[test]
    fn client_cancel_does_not_poison_health() {
        let engine = engine();

        // Establish some failure state first.
        let id = engine.reserve_attempt(URL, KEY, "m");
        engine.finalize_failure(URL, KEY, id);
        let before = engine.key_snapshot(URL, KEY).unwrap();

        let id = engine.reserve_attempt(URL, KEY, "m");
        engine.finalize_client_cancel(URL, KEY, id);

        let after = engine.key_snapshot(URL, KEY).unwrap();
        assert_eq!(after.request_count, before.request_count + 1);
        assert_eq!(after.failure_count, before.failure_count);
        assert_eq!(after.consecutive_failures, before.consecutive_failures);
        assert_eq!(after.window_len, before.window_len);
        assert_eq!(engine.pending_len(URL, KEY), 0);
    }

    #[test]
    fn cancel_rebases_later_pending_slots() {
        let engine = engine();
        let first = engine.reserve_attempt(URL, KEY, "m");
        let second = engine.reserve_attempt(URL, KEY, "m");
        engine.finalize_client_cancel(URL, KEY, first);
        // The second reservation must still resolve after the slot shift.
        engine.finalize_success(URL, KEY, second, Some(Usage::new(2, 2)));
        let snap = engine.key_snapshot(URL, KEY).unwrap();
        assert_eq!(snap.success_count, 1);
        assert_eq!(engine.pending_len(URL, KEY), 0);
    }

    #[test]
    fn stale_reservation_degrades_to_fresh_outcome() {
        let engine = engine();
        let old = OffsetDateTime::now_utc() - time::Duration::hours(25);
        let id = engine.reserve_attempt_at(URL, KEY, "m", old);

        // A later reservation triggers the 24h cleanup, evicting the old
        // slot and dropping its pending entry.
        let newer = engine.reserve_attempt(URL, KEY, "m");
        assert_eq!(engine.pending_len(URL, KEY), 1);

        // Finalizing the evicted reservation must not panic and must
        // still record an outcome.
        engine.finalize_success(URL, KEY, id, Some(Usage::new(1, 1)));
        let snap = engine.key_snapshot(URL, KEY).unwrap();
        assert_eq!(snap.success_count, 1);

        engine.finalize_failure(URL, KEY, newer);
        let snap = engine.key_snapshot(URL, KEY).unwrap();
        assert_eq!(snap.request_count, 2);
        assert_eq!(snap.failure_count, 1);
    }

    #[test]
    fn circuit_opens_at_threshold_and_clears_on_success() {
        let engine = engine();

        // Window 10, threshold 0.5: five failures out of five samples
        // trips the circuit.
        for _ in 0..4 {
            let id = engine.reserve_attempt(URL, KEY, "m");
            engine.finalize_failure(URL, KEY, id);
        }
        // Four samples are below the five-sample minimum.
        assert!(engine
            .key_snapshot(URL, KEY)
            .unwrap()
            .circuit_broken_at
            .is_none());

        let id = engine.reserve_attempt(URL, KEY, "m");
        engine.finalize_failure(URL, KEY, id);
        assert!(engine.should_suspend_key(URL, KEY));
        assert!(engine
            .key_snapshot(URL, KEY)
            .unwrap()
            .circuit_broken_at
            .is_some());

        let id = engine.reserve_attempt(URL, KEY, "m");
        engine.finalize_success(URL, KEY, id, None);
        assert!(engine
            .key_snapshot(URL, KEY)
            .unwrap()
            .circuit_broken_at
            .is_none());
    }

    #[test]
    fn too_few_samples_is_not_suspended() {
        let engine = engine();
        for _ in 0..2 {
            let id = engine.reserve_attempt(URL, KEY, "m");
            engine.finalize_failure(URL, KEY, id);
        }
        // Two samples < max(3, 10/2) = 5.
        assert!(!engine.should_suspend_key(URL, KEY));
        assert!(engine.is_channel_healthy(&[URL.to_string()], &[KEY.to_string()]));
    }

    #[test]
    fn reset_failure_state_preserves_history() {
        let engine = engine();
        for _ in 0..5 {
            let id = engine.reserve_attempt(URL, KEY, "m");
            engine.finalize_failure(URL, KEY, id);
        }
        engine.reset_key_failure_state(URL, KEY);
        let snap = engine.key_snapshot(URL, KEY).unwrap();
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.window_len, 0);
        assert!(snap.circuit_broken_at.is_none());
        // Cumulative counters survive.
        assert_eq!(snap.request_count, 5);
        assert_eq!(snap.failure_count, 5);
    }

    #[test]
    fn active_requests_never_go_negative() {
        let engine = engine();
        engine.record_request_end(URL, KEY);
        engine.record_request_start(URL, KEY);
        engine.record_request_end(URL, KEY);
        engine.record_request_end(URL, KEY);
        let snap = engine.key_snapshot(URL, KEY).unwrap();
        assert_eq!(snap.active_requests, 0);
    }
}
