use serde::Deserialize;

/// Minimal peek at an inbound request body: the fields the router needs
/// before any translation happens (model, stream flag, trace identity).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestPeek {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub stream: Option<bool>,
    /// Chat Completions `user` field.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub prompt_cache_key: Option<String>,
    #[serde(default)]
    pub metadata: Option<RequestMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestMetadata {
    #[serde(default)]
    pub user_id: Option<String>,
}

impl RequestPeek {
    pub fn parse(body: &[u8]) -> RequestPeek {
        serde_json::from_slice(body).unwrap_or_default()
    }

    pub fn metadata_user_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|metadata| metadata.user_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}
