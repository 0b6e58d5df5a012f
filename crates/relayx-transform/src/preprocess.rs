use serde_json::Value;

/// Drop null/empty `signature` fields from `messages[*].content[*]`.
/// Some upstreams reject an empty signature with a 400 before even
/// looking at the rest of the request. Returns whether anything changed.
pub fn remove_empty_signatures(body: &mut Value) -> bool {
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return false;
    };
    let mut modified = false;
    for message in messages {
        let Some(content) = message.get_mut("content").and_then(Value::as_array_mut) else {
            continue;
        };
        for block in content {
            let Some(map) = block.as_object_mut() else {
                continue;
            };
            let empty = match map.get("signature") {
                Some(Value::Null) => true,
                Some(Value::String(s)) if s.is_empty() => true,
                _ => false,
            };
            if empty {
                map.remove("signature");
                modified = true;
            }
        }
    }
    modified
}

/// Remove `cch=...;` billing prefixes from system text blocks (both the
/// top-level string form and the block-array form).
pub fn strip_billing_header(body: &mut Value) -> bool {
    let Some(system) = body.get_mut("system") else {
        return false;
    };
    match system {
        Value::String(text) => {
            let stripped = strip_cch(text);
            if stripped != *text {
                *text = stripped;
                true
            } else {
                false
            }
        }
        Value::Array(blocks) => {
            let mut modified = false;
            for block in blocks {
                if let Some(text) = block.get_mut("text").and_then(Value::as_str).map(String::from)
                {
                    let stripped = strip_cch(&text);
                    if stripped != text {
                        block["text"] = Value::String(stripped);
                        modified = true;
                    }
                }
            }
            modified
        }
        _ => false,
    }
}

fn strip_cch(text: &str) -> String {
    let mut out = text.to_string();
    while let Some(start) = out.find("cch=") {
        let Some(end) = out[start..].find(';') else {
            break;
        };
        out.replace_range(start..start + end + 1, "");
    }
    out.trim_start().to_string()
}

/// Rewrite the `model` field in place.
pub fn set_model(body: &mut Value, model: &str) {
    if let Some(map) = body.as_object_mut() {
        map.insert("model".to_string(), Value::String(model.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn removes_only_empty_signatures() {
        let mut body = json!({
            "messages": [{
                "role": "assistant",
                "content": [
                    {"type": "thinking", "signature": ""},
                    {"type": "thinking", "signature": null},
                    {"type": "thinking", "signature": "keep"},
                ]
            }]
        });
        assert!(remove_empty_signatures(&mut body));
        let blocks = body["messages"][0]["content"].as_array().unwrap();
        assert!(blocks[0].get("signature").is_none());
        assert!(blocks[1].get("signature").is_none());
        assert_eq!(blocks[2]["signature"], "keep");
    }

    #[test]
    fn string_content_is_untouched() {
        let mut body = json!({"messages": [{"role": "user", "content": "hi"}]});
        assert!(!remove_empty_signatures(&mut body));
    }

    #[test]
    fn strips_cch_prefix_from_system_string() {
        let mut body = json!({"system": "cch=abc123; You are helpful."});
        assert!(strip_billing_header(&mut body));
        assert_eq!(body["system"], "You are helpful.");
    }

    #[test]
    fn strips_cch_from_system_blocks() {
        let mut body = json!({"system": [{"type": "text", "text": "cch=zz; rules"}]});
        assert!(strip_billing_header(&mut body));
        assert_eq!(body["system"][0]["text"], "rules");
    }

    #[test]
    fn set_model_overwrites() {
        let mut body = json!({"model": "gpt-4", "messages": []});
        set_model(&mut body, "gpt-4o");
        assert_eq!(body["model"], "gpt-4o");
    }
}
