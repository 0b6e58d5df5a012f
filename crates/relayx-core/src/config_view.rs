use std::sync::RwLock;

use time::OffsetDateTime;
use tracing::info;

use relayx_common::ApiType;

use crate::channel::{ChannelConfig, ChannelStatus, Config};

/// Owner of the channel lists. Readers get deep-cloned snapshots so an
/// in-flight request keeps the config it started with; writers take the
/// write lock.
pub struct ConfigView {
    inner: RwLock<Config>,
}

impl ConfigView {
    pub fn new(config: Config) -> Self {
        ConfigView {
            inner: RwLock::new(config),
        }
    }

    pub fn snapshot(&self) -> Config {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn channels(&self, api_type: ApiType) -> Vec<ChannelConfig> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .channels(api_type)
            .clone()
    }

    pub fn channel(&self, api_type: ApiType, index: usize) -> Option<ChannelConfig> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .channels(api_type)
            .get(index)
            .cloned()
    }

    pub fn fuzzy_mode(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .fuzzy_mode_enabled
    }

    pub fn strip_billing_header(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .strip_billing_header
    }

    pub fn replace(&self, config: Config) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *inner = config;
    }

    /// Single-channel mode target: the first active channel, falling
    /// back to index 0 when none is active.
    pub fn current_channel(&self, api_type: ApiType) -> Option<(ChannelConfig, usize)> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let channels = inner.channels(api_type);
        if channels.is_empty() {
            return None;
        }
        for (index, channel) in channels.iter().enumerate() {
            if channel.status == ChannelStatus::Active {
                return Some((channel.clone(), index));
            }
        }
        Some((channels[0].clone(), 0))
    }

    pub fn set_status(&self, api_type: ApiType, index: usize, status: ChannelStatus) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let channels = inner.channels_mut(api_type);
        let Some(channel) = channels.get_mut(index) else {
            return false;
        };
        channel.status = status;
        if status == ChannelStatus::Suspended && channel.promotion_until.is_some() {
            channel.promotion_until = None;
            info!(api_type = %api_type, index, "promotion cleared by suspension");
        }
        true
    }

    /// Set one channel's promotion deadline. The deadline is exclusive
    /// per apiType: setting it clears every other channel's.
    pub fn set_promotion(
        &self,
        api_type: ApiType,
        index: usize,
        until: Option<OffsetDateTime>,
    ) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let channels = inner.channels_mut(api_type);
        if index >= channels.len() {
            return false;
        }
        if until.is_some() {
            for (i, channel) in channels.iter_mut().enumerate() {
                if i != index {
                    channel.promotion_until = None;
                }
            }
        }
        channels[index].promotion_until = until;
        true
    }

    /// Remove a channel and return it, so the scheduler can clean up its
    /// exclusive metrics afterwards.
    pub fn remove_channel(&self, api_type: ApiType, index: usize) -> Option<ChannelConfig> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let channels = inner.channels_mut(api_type);
        if index >= channels.len() {
            return None;
        }
        Some(channels.remove(index))
    }

    /// Add a key to a channel, reviving it from the historical list if
    /// it was retired before.
    pub fn add_api_key(&self, api_type: ApiType, index: usize, api_key: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let channels = inner.channels_mut(api_type);
        let Some(channel) = channels.get_mut(index) else {
            return false;
        };
        if channel.api_keys.iter().any(|k| k == api_key) {
            return false;
        }
        channel.api_keys.push(api_key.to_string());
        channel.historical_api_keys.retain(|k| k != api_key);
        true
    }

    /// Retire a key into the historical list so its statistics stay
    /// aggregated.
    pub fn remove_api_key(&self, api_type: ApiType, index: usize, api_key: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let channels = inner.channels_mut(api_type);
        let Some(channel) = channels.get_mut(index) else {
            return false;
        };
        let before = channel.api_keys.len();
        channel.api_keys.retain(|k| k != api_key);
        if channel.api_keys.len() == before {
            return false;
        }
        if !channel.historical_api_keys.iter().any(|k| k == api_key) {
            channel.historical_api_keys.push(api_key.to_string());
        }
        true
    }

    /// Move a key to the front of one channel's failover order.
    pub fn promote_key(&self, api_type: ApiType, index: usize, api_key: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let channels = inner.channels_mut(api_type);
        let Some(channel) = channels.get_mut(index) else {
            return false;
        };
        let Some(position) = channel.api_keys.iter().position(|k| k == api_key) else {
            return false;
        };
        if position > 0 {
            let key = channel.api_keys.remove(position);
            channel.api_keys.insert(0, key);
        }
        true
    }

    /// Quota-degraded keys go to the back of every channel of this
    /// apiType that lists them, so the failover order tries them last.
    pub fn deprioritize_key(&self, api_type: ApiType, api_key: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for channel in inner.channels_mut(api_type).iter_mut() {
            let Some(position) = channel.api_keys.iter().position(|k| k == api_key) else {
                continue;
            };
            if position + 1 == channel.api_keys.len() {
                continue;
            }
            let key = channel.api_keys.remove(position);
            channel.api_keys.push(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(name: &str) -> ChannelConfig {
        ChannelConfig {
            name: name.to_string(),
            base_url: "https://u1".to_string(),
            api_keys: vec!["k1".to_string(), "k2".to_string(), "k3".to_string()],
            ..ChannelConfig::default()
        }
    }

    fn view() -> ConfigView {
        ConfigView::new(Config {
            messages: vec![channel("a"), channel("b")],
            ..Config::default()
        })
    }

    #[test]
    fn snapshots_are_isolated_from_later_writes() {
        let view = view();
        let snapshot = view.channels(ApiType::Messages);
        view.set_status(ApiType::Messages, 0, ChannelStatus::Disabled);
        assert_eq!(snapshot[0].status, ChannelStatus::Active);
        assert_eq!(
            view.channel(ApiType::Messages, 0).unwrap().status,
            ChannelStatus::Disabled
        );
    }

    #[test]
    fn promotion_is_exclusive_per_api_type() {
        let view = view();
        let later = OffsetDateTime::now_utc() + time::Duration::minutes(5);
        assert!(view.set_promotion(ApiType::Messages, 0, Some(later)));
        assert!(view.set_promotion(ApiType::Messages, 1, Some(later)));

        let channels = view.channels(ApiType::Messages);
        assert!(channels[0].promotion_until.is_none());
        assert!(channels[1].promotion_until.is_some());
    }

    #[test]
    fn suspension_clears_promotion() {
        let view = view();
        let later = OffsetDateTime::now_utc() + time::Duration::minutes(5);
        view.set_promotion(ApiType::Messages, 0, Some(later));
        view.set_status(ApiType::Messages, 0, ChannelStatus::Suspended);
        assert!(view
            .channel(ApiType::Messages, 0)
            .unwrap()
            .promotion_until
            .is_none());
    }

    #[test]
    fn removed_keys_move_to_history_and_back() {
        let view = view();
        assert!(view.remove_api_key(ApiType::Messages, 0, "k2"));
        let ch = view.channel(ApiType::Messages, 0).unwrap();
        assert_eq!(ch.api_keys, vec!["k1", "k3"]);
        assert_eq!(ch.historical_api_keys, vec!["k2"]);

        assert!(view.add_api_key(ApiType::Messages, 0, "k2"));
        let ch = view.channel(ApiType::Messages, 0).unwrap();
        assert_eq!(ch.api_keys, vec!["k1", "k3", "k2"]);
        assert!(ch.historical_api_keys.is_empty());
    }

    #[test]
    fn deprioritize_moves_key_to_bottom() {
        let view = view();
        view.deprioritize_key(ApiType::Messages, "k1");
        let ch = view.channel(ApiType::Messages, 0).unwrap();
        assert_eq!(ch.api_keys, vec!["k2", "k3", "k1"]);
        // Already-last keys stay put.
        view.deprioritize_key(ApiType::Messages, "k1");
        let ch = view.channel(ApiType::Messages, 0).unwrap();
        assert_eq!(ch.api_keys, vec!["k2", "k3", "k1"]);
    }

    #[test]
    fn promote_key_moves_to_front() {
        let view = view();
        assert!(view.promote_key(ApiType::Messages, 0, "k3"));
        let ch = view.channel(ApiType::Messages, 0).unwrap();
        assert_eq!(ch.api_keys, vec!["k3", "k1", "k2"]);
        assert!(!view.promote_key(ApiType::Messages, 0, "missing"));
    }

    #[test]
    fn current_channel_prefers_first_active() {
        let view = view();
        view.set_status(ApiType::Messages, 0, ChannelStatus::Suspended);
        let (channel, index) = view.current_channel(ApiType::Messages).unwrap();
        assert_eq!(channel.name, "b");
        assert_eq!(index, 1);

        view.set_status(ApiType::Messages, 1, ChannelStatus::Suspended);
        let (_, index) = view.current_channel(ApiType::Messages).unwrap();
        assert_eq!(index, 0);
    }
}
