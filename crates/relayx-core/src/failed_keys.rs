use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use relayx_common::{mask_api_key, ApiType};

#[derive(Debug, Clone, Copy)]
struct FailedKey {
    last_failure: Instant,
    failure_count: u32,
}

/// Short-lived cooldown of keys that returned key-attributable failures
/// (quota, auth, bad status). Entries are scoped `apiType:apiKey` so a
/// failure on one client surface never poisons the others.
pub struct FailedKeyCache {
    inner: Mutex<HashMap<String, FailedKey>>,
    recovery: Duration,
    max_failures: u32,
}

fn cache_key(api_type: ApiType, api_key: &str) -> String {
    format!("{}:{}", api_type.as_str(), api_key)
}

impl FailedKeyCache {
    pub fn new(recovery: Duration, max_failures: u32) -> Self {
        FailedKeyCache {
            inner: Mutex::new(HashMap::new()),
            recovery,
            max_failures,
        }
    }

    pub fn mark_failed(&self, api_type: ApiType, api_key: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner
            .entry(cache_key(api_type, api_key))
            .or_insert(FailedKey {
                last_failure: Instant::now(),
                failure_count: 0,
            });
        entry.failure_count += 1;
        entry.last_failure = Instant::now();
        debug!(
            api_type = %api_type,
            key = %mask_api_key(api_key),
            failures = entry.failure_count,
            "key marked failed"
        );
    }

    fn recovery_for(&self, entry: &FailedKey) -> Duration {
        if entry.failure_count > self.max_failures {
            self.recovery * 2
        } else {
            self.recovery
        }
    }

    /// True while the key is inside its cooldown window.
    pub fn is_cooling(&self, api_type: ApiType, api_key: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.get(&cache_key(api_type, api_key)) {
            Some(entry) => entry.last_failure.elapsed() < self.recovery_for(entry),
            None => false,
        }
    }

    /// When every candidate is cooling, pick the one whose failure is
    /// oldest as the recovery probe.
    pub fn oldest_failure(
        &self,
        api_type: ApiType,
        candidates: &[String],
        exclude: &HashSet<String>,
    ) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut best: Option<(&String, Instant)> = None;
        for key in candidates {
            if exclude.contains(key) {
                continue;
            }
            if let Some(entry) = inner.get(&cache_key(api_type, key)) {
                match best {
                    Some((_, at)) if entry.last_failure >= at => {}
                    _ => best = Some((key, entry.last_failure)),
                }
            }
        }
        best.map(|(key, _)| key.clone())
    }

    /// Minute sweep: evict entries whose cooldown has expired.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let recovery = self.recovery;
        let max_failures = self.max_failures;
        inner.retain(|_, entry| {
            let window = if entry.failure_count > max_failures {
                recovery * 2
            } else {
                recovery
            };
            entry.last_failure.elapsed() <= window
        });
    }

    /// Drop every entry for the given keys (used when a channel is
    /// deleted, so cooldown state does not linger).
    pub fn clear_keys(&self, api_type: ApiType, api_keys: &[String]) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for key in api_keys {
            inner.remove(&cache_key(api_type, key));
        }
    }
}
