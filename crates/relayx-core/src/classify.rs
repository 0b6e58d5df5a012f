use relayx_common::ApiType;

/// How a non-2xx upstream response should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Try the next key / URL / channel.
    pub should_failover: bool,
    /// Auth, billing or rate related; the key gets deprioritized after
    /// the request eventually succeeds elsewhere.
    pub quota_related: bool,
}

const TERMINAL: Classification = Classification {
    should_failover: false,
    quota_related: false,
};
const FAILOVER: Classification = Classification {
    should_failover: true,
    quota_related: false,
};
const QUOTA: Classification = Classification {
    should_failover: true,
    quota_related: true,
};

/// The upstream-protocol knowledge of the failover loop.
///
/// 401/402/403/429 are key-attributable (auth, billing, rate) and
/// failover with the quota flag. 5xx failover without it. 404 is a
/// failover when the endpoint is missing but terminal when the body
/// names a missing model, because retrying another key cannot conjure
/// the model. 400 is a client error and terminal. Fuzzy mode broadens
/// every non-2xx into a failover; the quota flag is unchanged.
pub fn should_retry_with_next_key(
    status: u16,
    body: &[u8],
    fuzzy_mode: bool,
    api_type: ApiType,
) -> Classification {
    match status {
        200..=299 => TERMINAL,
        401 | 402 | 403 | 429 => QUOTA,
        500..=599 => FAILOVER,
        404 => classify_not_found(body, fuzzy_mode, api_type),
        _ if fuzzy_mode => FAILOVER,
        _ => TERMINAL,
    }
}

fn classify_not_found(body: &[u8], fuzzy_mode: bool, api_type: ApiType) -> Classification {
    if body_names_missing_model(body, api_type) {
        if fuzzy_mode {
            FAILOVER
        } else {
            TERMINAL
        }
    } else {
        // Endpoint not found (wrong base URL, HTML error page, empty
        // body): another URL or key can still work.
        FAILOVER
    }
}

/// A 404 body that complains about the model itself, as opposed to the
/// path. Gemini reports `status: NOT_FOUND` with the model name in the
/// message; the OpenAI-compatible shapes carry `model` in the message or
/// a model_not_found code.
fn body_names_missing_model(body: &[u8], api_type: ApiType) -> bool {
    if body.is_empty() {
        return false;
    }
    let text = String::from_utf8_lossy(body).to_lowercase();
    if !text.contains("model") {
        return false;
    }
    match api_type {
        ApiType::Gemini => {
            text.contains("not_found") || text.contains("not found") || text.contains("is not supported")
        }
        _ => {
            text.contains("model_not_found")
                || text.contains("not found")
                || text.contains("not_found")
                || text.contains("does not exist")
                || text.contains("unknown model")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_statuses_failover_with_quota_flag() {
        for status in [401u16, 402, 403, 429] {
            let c = should_retry_with_next_key(status, b"", false, ApiType::Messages);
            assert!(c.should_failover, "status {status}");
            assert!(c.quota_related, "status {status}");
        }
    }

    #[test]
    fn server_errors_failover_without_quota_flag() {
        for status in [500u16, 502, 503, 529] {
            let c = should_retry_with_next_key(status, b"", false, ApiType::Messages);
            assert!(c.should_failover, "status {status}");
            assert!(!c.quota_related, "status {status}");
        }
    }

    #[test]
    fn bad_request_is_terminal_unless_fuzzy() {
        let strict = should_retry_with_next_key(400, b"{}", false, ApiType::Messages);
        assert!(!strict.should_failover);
        let fuzzy = should_retry_with_next_key(400, b"{}", true, ApiType::Messages);
        assert!(fuzzy.should_failover);
        assert!(!fuzzy.quota_related);
    }

    #[test]
    fn endpoint_404_fails_over_but_missing_model_is_terminal() {
        let endpoint = should_retry_with_next_key(
            404,
            b"<html>404 page not found</html>",
            false,
            ApiType::Messages,
        );
        assert!(endpoint.should_failover);

        let model = should_retry_with_next_key(
            404,
            br#"{"error":{"type":"not_found_error","message":"model: claude-9 not found"}}"#,
            false,
            ApiType::Messages,
        );
        assert!(!model.should_failover);
    }

    #[test]
    fn gemini_missing_model_uses_its_own_shape() {
        let body = br#"{"error":{"code":404,"message":"models/gemini-9 is not found","status":"NOT_FOUND"}}"#;
        let c = should_retry_with_next_key(404, body, false, ApiType::Gemini);
        assert!(!c.should_failover);
    }

    #[test]
    fn fuzzy_mode_retries_everything_non_2xx() {
        for status in [301u16, 400, 404, 405, 418] {
            let c = should_retry_with_next_key(status, b"model not found", true, ApiType::Messages);
            assert!(c.should_failover, "status {status}");
        }
        // The quota flag still tracks the status class.
        let c = should_retry_with_next_key(429, b"", true, ApiType::Messages);
        assert!(c.quota_related);
        let c = should_retry_with_next_key(400, b"", true, ApiType::Messages);
        assert!(!c.quota_related);
    }

    #[test]
    fn other_4xx_terminal_in_strict_mode() {
        let c = should_retry_with_next_key(405, b"", false, ApiType::Messages);
        assert!(!c.should_failover);
    }
}
