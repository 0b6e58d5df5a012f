use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

/// Final, merged runtime settings for the running process.
///
/// Merge order: CLI > ENV > defaults (clap applies CLI > ENV per field; the
/// binary overlays the result on these defaults).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// Single proxy access key clients present via `x-api-key` or
    /// `Authorization: Bearer`. Upstream-format keys never satisfy it.
    pub proxy_access_key: String,
    /// Optional outbound proxy for upstream egress.
    pub outbound_proxy: Option<String>,
    pub config_path: String,
    pub db_path: String,

    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub stream_idle_timeout_secs: u64,
    pub max_body_bytes: usize,

    pub window_size: usize,
    pub failure_threshold: f64,
    pub circuit_recovery_secs: u64,
    pub key_cooldown_secs: u64,
    pub key_max_failures: u32,
    pub retention_days: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            host: "127.0.0.1".to_string(),
            port: 8790,
            proxy_access_key: String::new(),
            outbound_proxy: None,
            config_path: "relayx.json".to_string(),
            db_path: "relayx-metrics.db".to_string(),
            request_timeout_ms: 120_000,
            connect_timeout_ms: 10_000,
            stream_idle_timeout_secs: 300,
            max_body_bytes: 50 * 1024 * 1024,
            window_size: 10,
            failure_threshold: 0.5,
            circuit_recovery_secs: 900,
            key_cooldown_secs: 120,
            key_max_failures: 3,
            retention_days: 7,
        }
    }
}

/// Cheap shared handle; readers load a snapshot, the binary swaps on
/// reconfiguration.
pub type SettingsHandle = Arc<ArcSwap<Settings>>;

impl Settings {
    pub fn into_handle(self) -> SettingsHandle {
        Arc::new(ArcSwap::from_pointee(self))
    }
}
