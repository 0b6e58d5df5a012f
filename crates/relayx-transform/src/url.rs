use relayx_common::ServiceType;

/// Build the full upstream URL for one attempt.
///
/// Version-prefix rules: a trailing `#` on the base URL suppresses the
/// version prefix, as does an existing `/vN` or `/vNbeta` suffix;
/// otherwise `/v1` is appended for claude/openai/responses and
/// `/v1beta` for gemini.
pub fn upstream_url(
    service_type: ServiceType,
    base_url: &str,
    model: &str,
    stream: bool,
) -> String {
    match service_type {
        ServiceType::Claude => versioned(base_url, "/messages", "/v1"),
        ServiceType::OpenAI => versioned(base_url, "/chat/completions", "/v1"),
        ServiceType::Responses => versioned(base_url, "/responses", "/v1"),
        ServiceType::Gemini => {
            let action = if stream {
                "streamGenerateContent"
            } else {
                "generateContent"
            };
            let mut url = versioned(base_url, &format!("/models/{model}:{action}"), "/v1beta");
            if stream {
                url.push_str("?alt=sse");
            }
            url
        }
    }
}

fn versioned(base_url: &str, endpoint: &str, default_version: &str) -> String {
    let skip_version = base_url.ends_with('#');
    let base = base_url
        .trim_end_matches('#')
        .trim_end_matches('/');

    if skip_version || has_version_suffix(base) {
        format!("{base}{endpoint}")
    } else {
        format!("{base}{default_version}{endpoint}")
    }
}

/// Matches a trailing path segment of the form `v<digits><lowercase*>`,
/// e.g. `/v1`, `/v2`, `/v1beta`.
fn has_version_suffix(base: &str) -> bool {
    let Some(segment) = base.rsplit('/').next() else {
        return false;
    };
    let Some(rest) = segment.strip_prefix('v') else {
        return false;
    };
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return false;
    }
    rest[digits.len()..]
        .chars()
        .all(|c| c.is_ascii_lowercase())
}
