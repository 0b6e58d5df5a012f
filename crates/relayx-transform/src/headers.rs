use std::collections::HashMap;

use relayx_common::ServiceType;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Headers for one upstream attempt: content type, authentication in
/// the upstream's scheme, then the channel's custom headers on top.
///
/// Claude accepts Bearer for gateway-style keys but native `sk-ant-*`
/// keys must go through `x-api-key`.
pub fn upstream_headers(
    service_type: ServiceType,
    api_key: &str,
    custom: &HashMap<String, String>,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = Vec::with_capacity(4 + custom.len());
    headers.push(("content-type".to_string(), "application/json".to_string()));

    match service_type {
        ServiceType::Claude => {
            if api_key.starts_with("sk-ant-") {
                headers.push(("x-api-key".to_string(), api_key.to_string()));
            } else {
                headers.push(("authorization".to_string(), format!("Bearer {api_key}")));
            }
            headers.push((
                "anthropic-version".to_string(),
                ANTHROPIC_VERSION.to_string(),
            ));
        }
        ServiceType::OpenAI | ServiceType::Responses => {
            headers.push(("authorization".to_string(), format!("Bearer {api_key}")));
        }
        ServiceType::Gemini => {
            headers.push(("x-goog-api-key".to_string(), api_key.to_string()));
        }
    }

    for (name, value) in custom {
        let lowered = name.to_lowercase();
        headers.retain(|(existing, _)| existing != &lowered);
        headers.push((lowered, value.clone()));
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn native_anthropic_keys_use_x_api_key() {
        let headers = upstream_headers(ServiceType::Claude, "sk-ant-api03-x", &HashMap::new());
        assert_eq!(get(&headers, "x-api-key"), Some("sk-ant-api03-x"));
        assert_eq!(get(&headers, "anthropic-version"), Some(ANTHROPIC_VERSION));
        assert!(get(&headers, "authorization").is_none());
    }

    #[test]
    fn gateway_claude_keys_use_bearer() {
        let headers = upstream_headers(ServiceType::Claude, "sk-gw-123", &HashMap::new());
        assert_eq!(get(&headers, "authorization"), Some("Bearer sk-gw-123"));
        assert_eq!(get(&headers, "anthropic-version"), Some(ANTHROPIC_VERSION));
    }

    #[test]
    fn gemini_uses_goog_api_key() {
        let headers = upstream_headers(ServiceType::Gemini, "AIza-x", &HashMap::new());
        assert_eq!(get(&headers, "x-goog-api-key"), Some("AIza-x"));
        assert!(get(&headers, "authorization").is_none());
    }

    #[test]
    fn custom_headers_override() {
        let mut custom = HashMap::new();
        custom.insert("X-Custom".to_string(), "1".to_string());
        custom.insert("Authorization".to_string(), "Bearer other".to_string());
        let headers = upstream_headers(ServiceType::OpenAI, "k", &custom);
        assert_eq!(get(&headers, "x-custom"), Some("1"));
        assert_eq!(get(&headers, "authorization"), Some("Bearer other"));
        assert_eq!(
            headers.iter().filter(|(n, _)| n == "authorization").count(),
            1
        );
    }
}
