use clap::Parser;

use relayx_common::Settings;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "relayx",
    version,
    about = "Multi-protocol LLM reverse proxy with per-key health tracking"
)]
pub struct CliArgs {
    /// Bind host.
    #[arg(long, env = "RELAYX_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "RELAYX_PORT")]
    pub port: Option<u16>,

    /// Proxy access key clients must present. Empty disables auth.
    #[arg(long, env = "RELAYX_ACCESS_KEY")]
    pub access_key: Option<String>,

    /// Channel configuration file (JSON).
    #[arg(long, env = "RELAYX_CONFIG", default_value = "relayx.json")]
    pub config: String,

    /// SQLite metrics database path.
    #[arg(long, env = "RELAYX_DB")]
    pub db: Option<String>,

    /// Optional outbound proxy for upstream egress.
    #[arg(long, env = "RELAYX_PROXY")]
    pub proxy: Option<String>,

    /// Overall timeout for buffered upstream requests, in milliseconds.
    #[arg(long, env = "RELAYX_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: Option<u64>,

    /// Connect/header timeout, in milliseconds.
    #[arg(long, env = "RELAYX_CONNECT_TIMEOUT_MS")]
    pub connect_timeout_ms: Option<u64>,

    /// Per-read idle timeout for streaming responses, in seconds.
    #[arg(long, env = "RELAYX_STREAM_IDLE_SECS")]
    pub stream_idle_secs: Option<u64>,

    /// Maximum request body size, in bytes.
    #[arg(long, env = "RELAYX_MAX_BODY_BYTES")]
    pub max_body_bytes: Option<usize>,

    /// Sliding window size for per-key health (floor 3).
    #[arg(long, env = "RELAYX_WINDOW_SIZE")]
    pub window_size: Option<usize>,

    /// Failure-rate threshold over the window, 0 < t <= 1.
    #[arg(long, env = "RELAYX_FAILURE_THRESHOLD")]
    pub failure_threshold: Option<f64>,

    /// Circuit recovery time, in seconds.
    #[arg(long, env = "RELAYX_CIRCUIT_RECOVERY_SECS")]
    pub circuit_recovery_secs: Option<u64>,

    /// Failed-key cooldown, in seconds (doubles past the max-failure
    /// threshold).
    #[arg(long, env = "RELAYX_KEY_COOLDOWN_SECS")]
    pub key_cooldown_secs: Option<u64>,

    /// Failure count past which the cooldown doubles.
    #[arg(long, env = "RELAYX_KEY_MAX_FAILURES")]
    pub key_max_failures: Option<u32>,

    /// Persistent record retention, clamped to 3..=30 days.
    #[arg(long, env = "RELAYX_RETENTION_DAYS")]
    pub retention_days: Option<i64>,
}

impl CliArgs {
    /// Overlay CLI/ENV values onto the defaults: CLI > ENV > default
    /// (clap already applies CLI > ENV per field).
    pub fn into_settings(self) -> Settings {
        let mut settings = Settings {
            config_path: self.config,
            ..Settings::default()
        };
        if let Some(host) = self.host {
            settings.host = host;
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(access_key) = self.access_key {
            settings.proxy_access_key = access_key;
        }
        if let Some(db) = self.db {
            settings.db_path = db;
        }
        settings.outbound_proxy = self.proxy;
        if let Some(timeout) = self.request_timeout_ms {
            settings.request_timeout_ms = timeout;
        }
        if let Some(timeout) = self.connect_timeout_ms {
            settings.connect_timeout_ms = timeout;
        }
        if let Some(idle) = self.stream_idle_secs {
            settings.stream_idle_timeout_secs = idle;
        }
        if let Some(max) = self.max_body_bytes {
            settings.max_body_bytes = max;
        }
        if let Some(window) = self.window_size {
            settings.window_size = window;
        }
        if let Some(threshold) = self.failure_threshold {
            settings.failure_threshold = threshold;
        }
        if let Some(recovery) = self.circuit_recovery_secs {
            settings.circuit_recovery_secs = recovery;
        }
        if let Some(cooldown) = self.key_cooldown_secs {
            settings.key_cooldown_secs = cooldown;
        }
        if let Some(max_failures) = self.key_max_failures {
            settings.key_max_failures = max_failures;
        }
        if let Some(retention) = self.retention_days {
            settings.retention_days = retention;
        }
        settings
    }
}
