use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use relayx_common::{ApiType, ServiceType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    #[default]
    Active,
    /// Stays in the failover sequence but is skipped unless promotion
    /// bypasses the checks.
    Suspended,
    /// Excluded from scheduling entirely.
    Disabled,
}

/// One configured upstream target: base URLs, an ordered key list and
/// routing metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub base_url: String,
    /// Multi-URL failover list; when non-empty it supersedes `base_url`.
    #[serde(default)]
    pub base_urls: Vec<String>,
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Previously-active keys, kept so their statistics stay aggregated.
    #[serde(default)]
    pub historical_api_keys: Vec<String>,
    #[serde(default)]
    pub service_type: ServiceType,
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    /// Smaller sorts earlier; 0 falls back to the list index.
    #[serde(default)]
    pub priority: usize,
    #[serde(default)]
    pub status: ChannelStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub promotion_until: Option<OffsetDateTime>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    #[serde(default)]
    pub proxy_url: Option<String>,
    /// Shell-glob whitelist; empty allows every model.
    #[serde(default)]
    pub supported_models: Vec<String>,
    #[serde(default)]
    pub strip_thought_signature: bool,
    #[serde(default)]
    pub inject_dummy_thought_signature: bool,
    /// Forces local token estimation when the upstream's usage numbers
    /// cannot be trusted.
    #[serde(default)]
    pub low_quality: bool,
}

impl ChannelConfig {
    /// Effective failover URL list: `base_urls` when present, otherwise
    /// the single `base_url`.
    pub fn effective_base_urls(&self) -> Vec<String> {
        if !self.base_urls.is_empty() {
            self.base_urls.clone()
        } else if !self.base_url.is_empty() {
            vec![self.base_url.clone()]
        } else {
            Vec::new()
        }
    }

    /// Apply the per-channel rename map; identity when unmapped.
    pub fn redirect_model(&self, model: &str) -> String {
        self.model_mapping
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    pub fn in_promotion(&self, now: OffsetDateTime) -> bool {
        matches!(self.promotion_until, Some(until) if until > now)
    }

    pub fn supports_model(&self, model: &str) -> bool {
        if self.supported_models.is_empty() {
            return true;
        }
        self.supported_models
            .iter()
            .any(|pattern| glob_match(pattern, model))
    }

    pub fn effective_priority(&self, index: usize) -> usize {
        if self.priority == 0 {
            index
        } else {
            self.priority
        }
    }
}

/// Shell-style `*` glob, anchored at both ends.
fn glob_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut rest = value;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            let Some(stripped) = rest.strip_prefix(part) else {
                return false;
            };
            rest = stripped;
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            let Some(at) = rest.find(part) else {
                return false;
            };
            rest = &rest[at + part.len()..];
        }
    }
    // Pattern ended with '*' (or was all wildcards).
    parts.last().map(|p| p.is_empty()).unwrap_or(true) || rest.is_empty()
}

/// The whole runtime configuration: ordered channels per apiType plus
/// the global toggles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub messages: Vec<ChannelConfig>,
    #[serde(default)]
    pub chat: Vec<ChannelConfig>,
    #[serde(default)]
    pub responses: Vec<ChannelConfig>,
    #[serde(default)]
    pub gemini: Vec<ChannelConfig>,
    /// Broadened failover classification: every non-2xx retries.
    #[serde(default)]
    pub fuzzy_mode_enabled: bool,
    #[serde(default)]
    pub strip_billing_header: bool,
    /// Advisory per-apiType strategy names; only failover ordering is
    /// exercised by the core.
    #[serde(default)]
    pub load_balance: HashMap<String, String>,
}

impl Config {
    pub fn channels(&self, api_type: ApiType) -> &Vec<ChannelConfig> {
        match api_type {
            ApiType::Messages => &self.messages,
            ApiType::Chat => &self.chat,
            ApiType::Responses => &self.responses,
            ApiType::Gemini => &self.gemini,
        }
    }

    pub fn channels_mut(&mut self, api_type: ApiType) -> &mut Vec<ChannelConfig> {
        match api_type {
            ApiType::Messages => &mut self.messages,
            ApiType::Chat => &mut self.chat,
            ApiType::Responses => &mut self.responses,
            ApiType::Gemini => &mut self.gemini,
        }
    }

    pub fn from_path(path: &str) -> std::io::Result<Config> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }
}
