use serde_json::Value;

const MESSAGE_OVERHEAD_TOKENS: usize = 4;
const TOOL_OVERHEAD_TOKENS: usize = 150;

/// Character-class token estimate: CJK at ~1.5 chars/token, everything
/// else non-whitespace at ~3.5 chars/token.
pub fn estimate_text_tokens(text: &str) -> i64 {
    if text.is_empty() {
        return 0;
    }
    let mut cjk = 0usize;
    let mut other = 0usize;
    for ch in text.chars() {
        if is_cjk(ch) {
            cjk += 1;
        } else if !ch.is_whitespace() {
            other += 1;
        }
    }
    (cjk as f64 / 1.5 + other as f64 / 3.5 + 0.5) as i64
}

fn is_cjk(ch: char) -> bool {
    matches!(ch,
        '\u{4E00}'..='\u{9FFF}'      // CJK unified ideographs
        | '\u{3400}'..='\u{4DBF}'    // extension A
        | '\u{F900}'..='\u{FAFF}'    // compatibility ideographs
        | '\u{3040}'..='\u{309F}'    // hiragana
        | '\u{30A0}'..='\u{30FF}'    // katakana
        | '\u{AC00}'..='\u{D7AF}'    // hangul syllables
        | '\u{1100}'..='\u{11FF}'    // hangul jamo
    )
}

fn estimate_value_tokens(value: &Value) -> i64 {
    match value {
        Value::String(text) => estimate_text_tokens(text),
        other => estimate_text_tokens(&other.to_string()),
    }
}

fn estimate_messages_tokens(messages: &Value) -> i64 {
    let serialized = messages.to_string();
    let count = messages.as_array().map(|arr| arr.len()).unwrap_or(0);
    estimate_text_tokens(&serialized) + (count * MESSAGE_OVERHEAD_TOKENS) as i64
}

/// Estimate input tokens from a Messages/Chat request body: system prompt,
/// message array (with per-message overhead) and tool definitions.
pub fn estimate_request_tokens(body: &[u8]) -> i64 {
    if body.is_empty() {
        return 0;
    }
    let Ok(req) = serde_json::from_slice::<Value>(body) else {
        return estimate_text_tokens(&String::from_utf8_lossy(body));
    };

    let mut total = 0i64;
    match req.get("system") {
        Some(Value::String(text)) => total += estimate_text_tokens(text),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    total += estimate_text_tokens(text);
                }
            }
        }
        _ => {}
    }
    if let Some(messages) = req.get("messages") {
        total += estimate_messages_tokens(messages);
    }
    if let Some(tools) = req.get("tools").and_then(Value::as_array) {
        total += (tools.len() * TOOL_OVERHEAD_TOKENS) as i64;
    }
    total
}

/// Estimate input tokens from a Responses request body (`instructions` +
/// `input`, which may be a string or an item array).
pub fn estimate_responses_request_tokens(body: &[u8]) -> i64 {
    if body.is_empty() {
        return 0;
    }
    let Ok(req) = serde_json::from_slice::<Value>(body) else {
        return estimate_text_tokens(&String::from_utf8_lossy(body));
    };

    let mut total = 0i64;
    if let Some(instructions) = req.get("instructions").and_then(Value::as_str) {
        total += estimate_text_tokens(instructions);
    }
    match req.get("input") {
        Some(Value::String(text)) => total += estimate_text_tokens(text),
        Some(Value::Array(items)) => {
            for item in items {
                total += MESSAGE_OVERHEAD_TOKENS as i64;
                if let Some(content) = item.get("content") {
                    total += estimate_content_tokens(content);
                }
            }
        }
        Some(other) => total += estimate_value_tokens(other),
        None => {}
    }
    if let Some(tools) = req.get("tools").and_then(Value::as_array) {
        total += (tools.len() * TOOL_OVERHEAD_TOKENS) as i64;
    }
    total
}

fn estimate_content_tokens(content: &Value) -> i64 {
    match content {
        Value::String(text) => estimate_text_tokens(text),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .map(estimate_text_tokens)
            .sum(),
        other => estimate_value_tokens(other),
    }
}

/// Estimate output tokens from a response `content` value (string or
/// content-block array; `tool_use` inputs count too).
pub fn estimate_response_tokens(content: &Value) -> i64 {
    match content {
        Value::Null => 0,
        Value::String(text) => estimate_text_tokens(text),
        Value::Array(blocks) => {
            let mut total = 0i64;
            for block in blocks {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    total += estimate_text_tokens(text);
                }
                if let Some(input) = block.get("input") {
                    total += estimate_value_tokens(input);
                }
            }
            total
        }
        other => estimate_value_tokens(other),
    }
}
