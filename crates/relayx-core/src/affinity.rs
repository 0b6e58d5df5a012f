use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use relayx_common::ApiType;

struct AffinityEntry {
    channel_index: usize,
    last_used: Instant,
}

/// Best-effort stickiness of `apiType:userID` to the channel of its last
/// fully successful request, TTL-bounded and refreshed on read.
pub struct TraceAffinityMap {
    inner: Mutex<HashMap<String, AffinityEntry>>,
    ttl: Duration,
}

fn affinity_key(api_type: ApiType, user_id: &str) -> String {
    format!("{}:{}", api_type.as_str(), user_id)
}

impl TraceAffinityMap {
    pub fn new(ttl: Duration) -> Self {
        TraceAffinityMap {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn preferred_channel(&self, api_type: ApiType, user_id: &str) -> Option<usize> {
        if user_id.is_empty() {
            return None;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner.get_mut(&affinity_key(api_type, user_id))?;
        if entry.last_used.elapsed() > self.ttl {
            return None;
        }
        entry.last_used = Instant::now();
        Some(entry.channel_index)
    }

    /// Only called after a fully successful request.
    pub fn set_preferred_channel(&self, api_type: ApiType, user_id: &str, channel_index: usize) {
        if user_id.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.insert(
            affinity_key(api_type, user_id),
            AffinityEntry {
                channel_index,
                last_used: Instant::now(),
            },
        );
    }

    pub fn sweep(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let ttl = self.ttl;
        inner.retain(|_, entry| entry.last_used.elapsed() <= ttl);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
