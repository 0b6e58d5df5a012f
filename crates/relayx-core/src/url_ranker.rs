use std::collections::HashMap;
use std::sync::Mutex;

use relayx_common::ApiType;

/// A base URL annotated with its index in the channel's configured
/// list. The original index keys per-URL metrics aggregation, so it must
/// survive reordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortedUrl {
    pub url: String,
    pub original_idx: usize,
}

/// Per-(apiType, channel) dynamic ordering of base URLs by recent
/// outcome. Each URL carries a score (unseen URLs score 0): a failure
/// decrements it, pushing the URL behind the healthy ones; a success
/// restores it to the front group. The sort is stable, so equal scores
/// keep the configured order. Single-URL channels bypass the ranker.
pub struct UrlRanker {
    inner: Mutex<HashMap<(ApiType, usize), HashMap<String, i64>>>,
}

impl UrlRanker {
    pub fn new() -> Self {
        UrlRanker {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Order `urls` by score, best first. Scores for URLs that left the
    /// configuration simply stop mattering; they are dropped on the next
    /// mark for this channel.
    pub fn sorted_urls(
        &self,
        api_type: ApiType,
        channel_index: usize,
        urls: &[String],
    ) -> Vec<SortedUrl> {
        let mut out: Vec<SortedUrl> = urls
            .iter()
            .enumerate()
            .map(|(original_idx, url)| SortedUrl {
                url: url.clone(),
                original_idx,
            })
            .collect();
        if urls.len() <= 1 {
            return out;
        }

        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(scores) = inner.get(&(api_type, channel_index)) else {
            return out;
        };
        out.sort_by_key(|sorted| -scores.get(&sorted.url).copied().unwrap_or(0));
        out
    }

    pub fn mark_success(&self, api_type: ApiType, channel_index: usize, url: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let scores = inner.entry((api_type, channel_index)).or_default();
        let score = scores.entry(url.to_string()).or_insert(0);
        if *score < 0 {
            *score = 0;
        }
    }

    pub fn mark_failure(&self, api_type: ApiType, channel_index: usize, url: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let scores = inner.entry((api_type, channel_index)).or_default();
        *scores.entry(url.to_string()).or_insert(0) -= 1;
    }

    /// Forget a channel's ranking (config changed or channel removed).
    pub fn invalidate(&self, api_type: ApiType, channel_index: usize) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.remove(&(api_type, channel_index));
    }
}

impl Default for UrlRanker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls() -> Vec<String> {
        vec!["https://primary".to_string(), "https://backup".to_string()]
    }

    #[test]
    fn failure_demotes_and_success_restores() {
        let ranker = UrlRanker::new();
        let api = ApiType::Messages;

        ranker.mark_failure(api, 0, "https://primary");
        ranker.mark_success(api, 0, "https://backup");

        let sorted = ranker.sorted_urls(api, 0, &urls());
        assert_eq!(sorted[0].url, "https://backup");
        assert_eq!(sorted[0].original_idx, 1);
        assert_eq!(sorted[1].url, "https://primary");
        assert_eq!(sorted[1].original_idx, 0);

        // Recovery puts the configured order back.
        ranker.mark_success(api, 0, "https://primary");
        let sorted = ranker.sorted_urls(api, 0, &urls());
        assert_eq!(sorted[0].url, "https://primary");
    }

    #[test]
    fn a_failure_alone_moves_the_url_behind_untouched_ones() {
        let ranker = UrlRanker::new();
        ranker.mark_failure(ApiType::Messages, 0, "https://primary");
        let sorted = ranker.sorted_urls(ApiType::Messages, 0, &urls());
        assert_eq!(sorted[0].url, "https://backup");
    }

    #[test]
    fn single_url_bypasses_the_ranker() {
        let ranker = UrlRanker::new();
        ranker.mark_failure(ApiType::Messages, 0, "https://only");
        let sorted = ranker.sorted_urls(ApiType::Messages, 0, &["https://only".to_string()]);
        assert_eq!(sorted.len(), 1);
        assert_eq!(sorted[0].original_idx, 0);
    }

    #[test]
    fn equal_scores_keep_configured_order() {
        let ranker = UrlRanker::new();
        let sorted = ranker.sorted_urls(ApiType::Messages, 0, &urls());
        assert_eq!(sorted[0].url, "https://primary");
        assert_eq!(sorted[1].url, "https://backup");
    }

    #[test]
    fn rankings_are_per_channel() {
        let ranker = UrlRanker::new();
        ranker.mark_failure(ApiType::Messages, 0, "https://primary");
        let other = ranker.sorted_urls(ApiType::Messages, 1, &urls());
        assert_eq!(other[0].url, "https://primary");
    }

    #[test]
    fn invalidate_resets_the_channel() {
        let ranker = UrlRanker::new();
        ranker.mark_failure(ApiType::Messages, 0, "https://primary");
        ranker.invalidate(ApiType::Messages, 0);
        let sorted = ranker.sorted_urls(ApiType::Messages, 0, &urls());
        assert_eq!(sorted[0].url, "https://primary");
    }
}
