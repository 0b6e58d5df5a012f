use serde::{Deserialize, Serialize};

/// Token usage reported by (or estimated for) one upstream request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub cache_creation_input_tokens: i64,
    #[serde(default)]
    pub cache_read_input_tokens: i64,
    /// 5m/1h cache-creation split; some upstreams only report these and
    /// omit the aggregate field.
    #[serde(default)]
    pub cache_creation_5m_input_tokens: i64,
    #[serde(default)]
    pub cache_creation_1h_input_tokens: i64,
}

impl Usage {
    pub fn new(input_tokens: i64, output_tokens: i64) -> Self {
        Usage {
            input_tokens,
            output_tokens,
            ..Usage::default()
        }
    }

    /// Aggregate cache-creation tokens, falling back to the 5m/1h split
    /// when the aggregate field was omitted.
    pub fn cache_creation_total(&self) -> i64 {
        if self.cache_creation_input_tokens > 0 {
            self.cache_creation_input_tokens
        } else {
            self.cache_creation_5m_input_tokens + self.cache_creation_1h_input_tokens
        }
    }
}
