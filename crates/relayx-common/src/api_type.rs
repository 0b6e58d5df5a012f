use serde::{Deserialize, Serialize};

/// Client-facing wire protocol. Determines the endpoint, the metrics
/// domain, the scheduler instance and the configuration group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    Messages,
    Chat,
    Responses,
    Gemini,
}

impl ApiType {
    pub const ALL: [ApiType; 4] = [
        ApiType::Messages,
        ApiType::Chat,
        ApiType::Responses,
        ApiType::Gemini,
    ];

    /// Lowercase tag stored in the persistence log and used as the
    /// failed-key cache scope.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiType::Messages => "messages",
            ApiType::Chat => "chat",
            ApiType::Responses => "responses",
            ApiType::Gemini => "gemini",
        }
    }

}

impl std::fmt::Display for ApiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream wire protocol a channel speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Claude,
    #[default]
    OpenAI,
    Responses,
    Gemini,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Claude => "claude",
            ServiceType::OpenAI => "openai",
            ServiceType::Responses => "responses",
            ServiceType::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
