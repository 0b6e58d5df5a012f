use serde_json::Value;

use relayx_common::{
    estimate_request_tokens, estimate_response_tokens, Usage,
};

/// Usage from a Claude Messages response body.
pub fn usage_from_claude(value: &Value) -> Option<Usage> {
    let usage = value.get("usage")?;
    Some(Usage {
        input_tokens: usage.get("input_tokens").and_then(Value::as_i64).unwrap_or(0),
        output_tokens: usage.get("output_tokens").and_then(Value::as_i64).unwrap_or(0),
        cache_creation_input_tokens: usage
            .get("cache_creation_input_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0),
        cache_read_input_tokens: usage
            .get("cache_read_input_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0),
        cache_creation_5m_input_tokens: usage
            .get("cache_creation")
            .and_then(|c| c.get("ephemeral_5m_input_tokens"))
            .and_then(Value::as_i64)
            .unwrap_or(0),
        cache_creation_1h_input_tokens: usage
            .get("cache_creation")
            .and_then(|c| c.get("ephemeral_1h_input_tokens"))
            .and_then(Value::as_i64)
            .unwrap_or(0),
    })
}

/// Usage from an OpenAI Chat (or Responses `usage`) body.
pub fn usage_from_openai(value: &Value) -> Option<Usage> {
    let usage = value.get("usage")?;
    let prompt = usage
        .get("prompt_tokens")
        .or_else(|| usage.get("input_tokens"))
        .and_then(Value::as_i64)?;
    let completion = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    Some(Usage::new(prompt, completion))
}

/// Usage from a Gemini response: cached content is subtracted from the
/// prompt count so input tokens reflect uncached work.
pub fn usage_from_gemini(value: &Value) -> Option<Usage> {
    let metadata: relayx_protocol::gemini::UsageMetadata =
        serde_json::from_value(value.get("usageMetadata")?.clone()).ok()?;
    Some(Usage {
        input_tokens: metadata.prompt_token_count - metadata.cached_content_token_count,
        output_tokens: metadata.candidates_token_count,
        cache_read_input_tokens: metadata.cached_content_token_count,
        ..Usage::default()
    })
}

/// Replace absent or clearly falsified usage with the local estimator:
/// an input of <= 1 without cache tokens, or an output of <= 1, cannot
/// be real for a request that produced content.
pub fn patch_usage(
    usage: Option<Usage>,
    request_body: &[u8],
    response_content: &Value,
    low_quality: bool,
) -> Usage {
    let mut usage = match usage {
        Some(usage) => usage,
        None => {
            return Usage::new(
                estimate_request_tokens(request_body),
                estimate_response_tokens(response_content),
            );
        }
    };

    let has_cache_tokens =
        usage.cache_creation_total() > 0 || usage.cache_read_input_tokens > 0;
    if usage.input_tokens <= 1 && !has_cache_tokens {
        usage.input_tokens = estimate_request_tokens(request_body);
    }
    if usage.output_tokens <= 1 {
        usage.output_tokens = estimate_response_tokens(response_content);
    }

    // Low-quality channels report numbers that drift; when the local
    // estimate disagrees by more than 5%, trust the estimate.
    if low_quality {
        let estimated_output = estimate_response_tokens(response_content);
        if estimated_output > 0 {
            let deviation =
                (usage.output_tokens - estimated_output).abs() as f64 / estimated_output as f64;
            if deviation > 0.05 {
                usage.output_tokens = estimated_output;
            }
        }
    }
    usage
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn claude_usage_reads_cache_fields() {
        let body = json!({
            "usage": {
                "input_tokens": 10,
                "output_tokens": 3,
                "cache_read_input_tokens": 100,
                "cache_creation": {"ephemeral_5m_input_tokens": 7}
            }
        });
        let usage = usage_from_claude(&body).unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.cache_read_input_tokens, 100);
        assert_eq!(usage.cache_creation_total(), 7);
    }

    #[test]
    fn openai_usage_reads_prompt_and_completion() {
        let body = json!({"usage": {"prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6}});
        let usage = usage_from_openai(&body).unwrap();
        assert_eq!(usage.input_tokens, 4);
        assert_eq!(usage.output_tokens, 2);
    }

    #[test]
    fn gemini_usage_subtracts_cached_content() {
        let body = json!({
            "usageMetadata": {
                "promptTokenCount": 120,
                "cachedContentTokenCount": 100,
                "candidatesTokenCount": 9
            }
        });
        let usage = usage_from_gemini(&body).unwrap();
        assert_eq!(usage.input_tokens, 20);
        assert_eq!(usage.output_tokens, 9);
        assert_eq!(usage.cache_read_input_tokens, 100);
    }

    #[test]
    fn missing_usage_is_estimated() {
        let request = br#"{"messages":[{"role":"user","content":"tell me something long"}]}"#;
        let content = json!([{"type": "text", "text": "a fairly long answer with many words"}]);
        let usage = patch_usage(None, request, &content, false);
        assert!(usage.input_tokens > 0);
        assert!(usage.output_tokens > 0);
    }

    #[test]
    fn falsified_values_are_replaced() {
        let request = br#"{"messages":[{"role":"user","content":"some request body text"}]}"#;
        let content = json!([{"type": "text", "text": "plenty of output text right here"}]);
        let usage = patch_usage(Some(Usage::new(1, 1)), request, &content, false);
        assert!(usage.input_tokens > 1);
        assert!(usage.output_tokens > 1);
    }

    #[test]
    fn tiny_input_with_cache_tokens_is_trusted() {
        let usage = Usage {
            input_tokens: 1,
            output_tokens: 50,
            cache_read_input_tokens: 900,
            ..Usage::default()
        };
        let patched = patch_usage(Some(usage), b"{}", &Value::Null, false);
        assert_eq!(patched.input_tokens, 1);
        assert_eq!(patched.output_tokens, 50);
    }
}
