use serde_json::{json, Map, Value};
use time::OffsetDateTime;

use relayx_protocol::reasons::{
    anthropic_stop_reason_to_openai, openai_finish_reason_to_anthropic,
    openai_finish_reason_to_responses,
};

const DEFAULT_MAX_TOKENS: i64 = 4096;

/// Flatten a `content` value (plain string or content-block array) into
/// text. Blocks of type text/input_text/output_text contribute; others
/// are skipped.
pub fn extract_text_from_content(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => {
            let mut parts: Vec<&str> = Vec::new();
            for block in blocks {
                let kind = block.get("type").and_then(Value::as_str).unwrap_or("text");
                if matches!(kind, "text" | "input_text" | "output_text") {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        parts.push(text);
                    }
                }
            }
            parts.join("\n")
        }
        _ => String::new(),
    }
}

fn copy_field(src: &Value, dst: &mut Map<String, Value>, from: &str, to: &str) {
    if let Some(value) = src.get(from) {
        if !value.is_null() {
            dst.insert(to.to_string(), value.clone());
        }
    }
}

// ---------------------------------------------------------------- chat <-> claude

/// OpenAI Chat request -> Claude Messages request. System messages fold
/// into the top-level `system`, assistant tool_calls become tool_use
/// blocks, tool results become user-side tool_result blocks, and
/// `max_completion_tokens` maps onto `max_tokens` (default 4096).
pub fn claude_request_from_chat(chat: &Value, model: &str, stream: bool) -> Value {
    let mut out = Map::new();
    out.insert("model".to_string(), json!(model));
    out.insert("stream".to_string(), json!(stream));

    let max_tokens = chat
        .get("max_tokens")
        .and_then(Value::as_i64)
        .or_else(|| chat.get("max_completion_tokens").and_then(Value::as_i64))
        .unwrap_or(DEFAULT_MAX_TOKENS);
    out.insert("max_tokens".to_string(), json!(max_tokens));

    copy_field(chat, &mut out, "temperature", "temperature");
    copy_field(chat, &mut out, "top_p", "top_p");
    // `stop` may be a bare string; stop_sequences is always a list.
    match chat.get("stop") {
        Some(Value::String(stop)) => {
            out.insert("stop_sequences".to_string(), json!([stop]));
        }
        Some(Value::Array(stops)) => {
            out.insert("stop_sequences".to_string(), json!(stops));
        }
        _ => {}
    }

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();
    if let Some(chat_messages) = chat.get("messages").and_then(Value::as_array) {
        for message in chat_messages {
            let role = message.get("role").and_then(Value::as_str).unwrap_or("");
            let content = message.get("content").cloned().unwrap_or(Value::Null);
            match role {
                "system" => {
                    let text = extract_text_from_content(&content);
                    if !text.is_empty() {
                        system_parts.push(text);
                    }
                }
                "assistant" => {
                    let mut blocks: Vec<Value> = Vec::new();
                    let text = extract_text_from_content(&content);
                    if !text.is_empty() {
                        blocks.push(json!({"type": "text", "text": text}));
                    }
                    if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
                        for call in tool_calls {
                            let id = call.get("id").and_then(Value::as_str).unwrap_or("");
                            let function = call.get("function").cloned().unwrap_or(Value::Null);
                            let name =
                                function.get("name").and_then(Value::as_str).unwrap_or("");
                            let input = function
                                .get("arguments")
                                .and_then(Value::as_str)
                                .and_then(|args| serde_json::from_str::<Value>(args).ok())
                                .unwrap_or_else(|| json!({}));
                            blocks.push(json!({
                                "type": "tool_use",
                                "id": id,
                                "name": name,
                                "input": input,
                            }));
                        }
                    }
                    if blocks.is_empty() {
                        continue;
                    }
                    messages.push(json!({"role": "assistant", "content": blocks}));
                }
                "tool" => {
                    let tool_use_id = message
                        .get("tool_call_id")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    messages.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": tool_use_id,
                            "content": extract_text_from_content(&content),
                        }],
                    }));
                }
                // user and anything else forward as user content.
                _ => messages.push(json!({"role": "user", "content": content})),
            }
        }
    }

    if !system_parts.is_empty() {
        out.insert("system".to_string(), json!(system_parts.join("\n\n")));
    }
    out.insert("messages".to_string(), Value::Array(messages));
    Value::Object(out)
}

/// Claude Messages response -> OpenAI Chat response, with tool_use
/// blocks surfaced as tool_calls and the stop reason mapped.
pub fn chat_response_from_claude(claude: &Value, model: &str) -> Value {
    let mut text = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    if let Some(content) = claude.get("content").and_then(Value::as_array) {
        for block in content {
            match block.get("type").and_then(Value::as_str) {
                Some("tool_use") => {
                    let arguments = block
                        .get("input")
                        .map(|input| input.to_string())
                        .unwrap_or_else(|| "{}".to_string());
                    tool_calls.push(json!({
                        "id": block.get("id").cloned().unwrap_or(json!("")),
                        "type": "function",
                        "function": {
                            "name": block.get("name").cloned().unwrap_or(json!("")),
                            "arguments": arguments,
                        },
                    }));
                }
                _ => {
                    if let Some(t) = block.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                }
            }
        }
    }

    let stop_reason = claude
        .get("stop_reason")
        .and_then(Value::as_str)
        .unwrap_or("");
    let finish_reason = anthropic_stop_reason_to_openai(stop_reason);

    let mut message = Map::new();
    message.insert("role".to_string(), json!("assistant"));
    message.insert("content".to_string(), json!(text));
    if !tool_calls.is_empty() {
        message.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }

    let mut out = Map::new();
    out.insert(
        "id".to_string(),
        claude.get("id").cloned().unwrap_or(json!("chatcmpl-claude")),
    );
    out.insert("object".to_string(), json!("chat.completion"));
    out.insert(
        "created".to_string(),
        json!(OffsetDateTime::now_utc().unix_timestamp()),
    );
    out.insert("model".to_string(), json!(model));
    out.insert(
        "choices".to_string(),
        json!([{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": finish_reason,
        }]),
    );
    if let Some(usage) = claude.get("usage") {
        let input = usage.get("input_tokens").and_then(Value::as_i64).unwrap_or(0);
        let output = usage.get("output_tokens").and_then(Value::as_i64).unwrap_or(0);
        out.insert(
            "usage".to_string(),
            json!({
                "prompt_tokens": input,
                "completion_tokens": output,
                "total_tokens": input + output,
            }),
        );
    }
    Value::Object(out)
}

/// Claude Messages request -> OpenAI Chat request (Messages client on an
/// OpenAI upstream). Tool_use/tool_result blocks map to tool_calls and
/// tool-role messages; `stop_sequences` maps to `stop`.
pub fn chat_request_from_claude(claude: &Value, model: &str, stream: bool) -> Value {
    let mut out = Map::new();
    out.insert("model".to_string(), json!(model));
    out.insert("stream".to_string(), json!(stream));
    copy_field(claude, &mut out, "max_tokens", "max_tokens");
    copy_field(claude, &mut out, "temperature", "temperature");
    copy_field(claude, &mut out, "top_p", "top_p");
    copy_field(claude, &mut out, "stop_sequences", "stop");

    let mut messages: Vec<Value> = Vec::new();
    if let Some(system) = claude.get("system") {
        let text = extract_text_from_content(system);
        if !text.is_empty() {
            messages.push(json!({"role": "system", "content": text}));
        }
    }
    if let Some(claude_messages) = claude.get("messages").and_then(Value::as_array) {
        for message in claude_messages {
            let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
            let content = message.get("content").cloned().unwrap_or(Value::Null);
            match &content {
                Value::Array(blocks) => {
                    let mut text = String::new();
                    let mut tool_calls: Vec<Value> = Vec::new();
                    for block in blocks {
                        match block.get("type").and_then(Value::as_str) {
                            Some("tool_use") => {
                                let arguments = block
                                    .get("input")
                                    .map(|input| input.to_string())
                                    .unwrap_or_else(|| "{}".to_string());
                                tool_calls.push(json!({
                                    "id": block.get("id").cloned().unwrap_or(json!("")),
                                    "type": "function",
                                    "function": {
                                        "name": block.get("name").cloned().unwrap_or(json!("")),
                                        "arguments": arguments,
                                    },
                                }));
                            }
                            Some("tool_result") => {
                                let result_text = block
                                    .get("content")
                                    .map(extract_text_from_content)
                                    .unwrap_or_default();
                                messages.push(json!({
                                    "role": "tool",
                                    "tool_call_id": block
                                        .get("tool_use_id")
                                        .cloned()
                                        .unwrap_or(json!("")),
                                    "content": result_text,
                                }));
                            }
                            _ => {
                                if let Some(t) = block.get("text").and_then(Value::as_str) {
                                    text.push_str(t);
                                }
                            }
                        }
                    }
                    if !text.is_empty() || !tool_calls.is_empty() {
                        let mut chat_message = Map::new();
                        chat_message.insert("role".to_string(), json!(role));
                        chat_message.insert("content".to_string(), json!(text));
                        if !tool_calls.is_empty() {
                            chat_message
                                .insert("tool_calls".to_string(), Value::Array(tool_calls));
                        }
                        messages.push(Value::Object(chat_message));
                    }
                }
                _ => messages.push(json!({"role": role, "content": content})),
            }
        }
    }
    out.insert("messages".to_string(), Value::Array(messages));
    Value::Object(out)
}

/// OpenAI Chat response -> Claude Messages response.
pub fn claude_response_from_chat(chat: &Value, model: &str) -> Value {
    let choice = chat
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .cloned()
        .unwrap_or(Value::Null);
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    let mut blocks: Vec<Value> = Vec::new();
    let text = message
        .get("content")
        .map(extract_text_from_content)
        .unwrap_or_default();
    if !text.is_empty() {
        blocks.push(json!({"type": "text", "text": text}));
    }
    if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in tool_calls {
            let function = call.get("function").cloned().unwrap_or(Value::Null);
            let input = function
                .get("arguments")
                .and_then(Value::as_str)
                .and_then(|args| serde_json::from_str::<Value>(args).ok())
                .unwrap_or_else(|| json!({}));
            blocks.push(json!({
                "type": "tool_use",
                "id": call.get("id").cloned().unwrap_or(json!("")),
                "name": function.get("name").cloned().unwrap_or(json!("")),
                "input": input,
            }));
        }
    }

    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .unwrap_or("");
    let stop_reason = openai_finish_reason_to_anthropic(finish_reason);

    let mut out = Map::new();
    out.insert(
        "id".to_string(),
        chat.get("id").cloned().unwrap_or(json!("msg-openai")),
    );
    out.insert("type".to_string(), json!("message"));
    out.insert("role".to_string(), json!("assistant"));
    out.insert("model".to_string(), json!(model));
    out.insert("content".to_string(), Value::Array(blocks));
    out.insert("stop_reason".to_string(), json!(stop_reason));
    out.insert("stop_sequence".to_string(), Value::Null);
    if let Some(usage) = chat.get("usage") {
        out.insert(
            "usage".to_string(),
            json!({
                "input_tokens": usage.get("prompt_tokens").and_then(Value::as_i64).unwrap_or(0),
                "output_tokens": usage
                    .get("completion_tokens")
                    .and_then(Value::as_i64)
                    .unwrap_or(0),
            }),
        );
    }
    Value::Object(out)
}

// ---------------------------------------------------------------- gemini directions

/// Gemini generateContent request -> Claude Messages request.
pub fn claude_request_from_gemini(gemini: &Value, model: &str, stream: bool) -> Value {
    let mut out = Map::new();
    out.insert("model".to_string(), json!(model));
    out.insert("stream".to_string(), json!(stream));

    let config = gemini.get("generationConfig").cloned().unwrap_or(Value::Null);
    let max_tokens = config
        .get("maxOutputTokens")
        .and_then(Value::as_i64)
        .unwrap_or(DEFAULT_MAX_TOKENS);
    out.insert("max_tokens".to_string(), json!(max_tokens));
    copy_field(&config, &mut out, "temperature", "temperature");
    copy_field(&config, &mut out, "topP", "top_p");
    copy_field(&config, &mut out, "stopSequences", "stop_sequences");

    if let Some(instruction) = gemini.get("systemInstruction") {
        let text = gemini_parts_text(instruction.get("parts"));
        if !text.is_empty() {
            out.insert("system".to_string(), json!(text));
        }
    }

    let mut messages: Vec<Value> = Vec::new();
    if let Some(contents) = gemini.get("contents").and_then(Value::as_array) {
        for content in contents {
            let role = match content.get("role").and_then(Value::as_str) {
                Some("model") => "assistant",
                _ => "user",
            };
            let text = gemini_parts_text(content.get("parts"));
            if !text.is_empty() {
                messages.push(json!({"role": role, "content": text}));
            }
        }
    }
    out.insert("messages".to_string(), Value::Array(messages));
    Value::Object(out)
}

/// Gemini generateContent request -> OpenAI Chat request.
pub fn chat_request_from_gemini(gemini: &Value, model: &str, stream: bool) -> Value {
    let mut out = Map::new();
    out.insert("model".to_string(), json!(model));
    out.insert("stream".to_string(), json!(stream));

    let config = gemini.get("generationConfig").cloned().unwrap_or(Value::Null);
    if let Some(max) = config.get("maxOutputTokens").and_then(Value::as_i64) {
        out.insert("max_tokens".to_string(), json!(max));
    }
    copy_field(&config, &mut out, "temperature", "temperature");
    copy_field(&config, &mut out, "topP", "top_p");

    let mut messages: Vec<Value> = Vec::new();
    if let Some(instruction) = gemini.get("systemInstruction") {
        let text = gemini_parts_text(instruction.get("parts"));
        if !text.is_empty() {
            messages.push(json!({"role": "system", "content": text}));
        }
    }
    if let Some(contents) = gemini.get("contents").and_then(Value::as_array) {
        for content in contents {
            let role = match content.get("role").and_then(Value::as_str) {
                Some("model") => "assistant",
                _ => "user",
            };
            let text = gemini_parts_text(content.get("parts"));
            if !text.is_empty() {
                messages.push(json!({"role": role, "content": text}));
            }
        }
    }
    out.insert("messages".to_string(), Value::Array(messages));
    Value::Object(out)
}

/// Claude Messages request -> Gemini generateContent request (Messages
/// client on a Gemini upstream). Text only; the model name travels in
/// the URL, not the body.
pub fn gemini_request_from_claude(claude: &Value) -> Value {
    let mut out = Map::new();

    if let Some(system) = claude.get("system") {
        let text = extract_text_from_content(system);
        if !text.is_empty() {
            out.insert(
                "systemInstruction".to_string(),
                json!({"parts": [{"text": text}]}),
            );
        }
    }

    let mut contents: Vec<Value> = Vec::new();
    if let Some(messages) = claude.get("messages").and_then(Value::as_array) {
        for message in messages {
            let role = match message.get("role").and_then(Value::as_str) {
                Some("assistant") => "model",
                _ => "user",
            };
            let text = message
                .get("content")
                .map(extract_text_from_content)
                .unwrap_or_default();
            if !text.is_empty() {
                contents.push(json!({"role": role, "parts": [{"text": text}]}));
            }
        }
    }
    out.insert("contents".to_string(), Value::Array(contents));

    let mut config = Map::new();
    if let Some(max) = claude.get("max_tokens").and_then(Value::as_i64) {
        config.insert("maxOutputTokens".to_string(), json!(max));
    }
    if let Some(temperature) = claude.get("temperature") {
        if !temperature.is_null() {
            config.insert("temperature".to_string(), temperature.clone());
        }
    }
    if let Some(top_p) = claude.get("top_p") {
        if !top_p.is_null() {
            config.insert("topP".to_string(), top_p.clone());
        }
    }
    if let Some(stop) = claude.get("stop_sequences") {
        if !stop.is_null() {
            config.insert("stopSequences".to_string(), stop.clone());
        }
    }
    if !config.is_empty() {
        out.insert("generationConfig".to_string(), Value::Object(config));
    }
    Value::Object(out)
}

/// Gemini generateContent response -> Claude Messages response.
pub fn claude_response_from_gemini(gemini: &Value, model: &str) -> Value {
    let text = gemini
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .map(|parts| gemini_parts_text(Some(parts)))
        .unwrap_or_default();

    let mut out = json!({
        "id": "msg-gemini",
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn",
        "stop_sequence": null,
    });
    if let Some(metadata) = gemini.get("usageMetadata") {
        let prompt = metadata
            .get("promptTokenCount")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let cached = metadata
            .get("cachedContentTokenCount")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let candidates = metadata
            .get("candidatesTokenCount")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        out["usage"] = json!({
            "input_tokens": prompt - cached,
            "output_tokens": candidates,
            "cache_read_input_tokens": cached,
        });
    }
    out
}

fn gemini_parts_text(parts: Option<&Value>) -> String {
    let Some(parts) = parts.and_then(Value::as_array) else {
        return String::new();
    };
    let texts: Vec<&str> = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    texts.join("\n")
}

/// Claude Messages response -> Gemini generateContent response.
pub fn gemini_response_from_claude(claude: &Value) -> Value {
    let mut text = String::new();
    if let Some(content) = claude.get("content").and_then(Value::as_array) {
        for block in content {
            if let Some(t) = block.get("text").and_then(Value::as_str) {
                text.push_str(t);
            }
        }
    }
    let mut out = json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": text}]},
            "finishReason": "STOP",
            "index": 0,
        }],
    });
    if let Some(usage) = claude.get("usage") {
        let input = usage.get("input_tokens").and_then(Value::as_i64).unwrap_or(0);
        let output = usage.get("output_tokens").and_then(Value::as_i64).unwrap_or(0);
        let cached = usage
            .get("cache_read_input_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        out["usageMetadata"] = json!({
            "promptTokenCount": input + cached,
            "candidatesTokenCount": output,
            "totalTokenCount": input + cached + output,
            "cachedContentTokenCount": cached,
        });
    }
    out
}

/// OpenAI Chat response -> Gemini generateContent response.
pub fn gemini_response_from_chat(chat: &Value) -> Value {
    let text = chat
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .map(extract_text_from_content)
        .unwrap_or_default();
    let mut out = json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": text}]},
            "finishReason": "STOP",
            "index": 0,
        }],
    });
    if let Some(usage) = chat.get("usage") {
        let prompt = usage.get("prompt_tokens").and_then(Value::as_i64).unwrap_or(0);
        let completion = usage
            .get("completion_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        out["usageMetadata"] = json!({
            "promptTokenCount": prompt,
            "candidatesTokenCount": completion,
            "totalTokenCount": prompt + completion,
        });
    }
    out
}

// ---------------------------------------------------------------- responses directions

/// Responses request -> OpenAI Chat request: `instructions` becomes the
/// system message, `input` (string or item list) becomes the message
/// array, `max_output_tokens` maps to `max_tokens`.
pub fn chat_request_from_responses(responses: &Value, model: &str, stream: bool) -> Value {
    let mut out = Map::new();
    out.insert("model".to_string(), json!(model));
    out.insert("stream".to_string(), json!(stream));
    if let Some(max) = responses
        .get("max_output_tokens")
        .or_else(|| responses.get("max_tokens"))
        .and_then(Value::as_i64)
    {
        out.insert("max_tokens".to_string(), json!(max));
    }
    copy_field(responses, &mut out, "temperature", "temperature");
    copy_field(responses, &mut out, "top_p", "top_p");

    let mut messages: Vec<Value> = Vec::new();
    if let Some(instructions) = responses.get("instructions").and_then(Value::as_str) {
        if !instructions.is_empty() {
            messages.push(json!({"role": "system", "content": instructions}));
        }
    }
    match responses.get("input") {
        Some(Value::String(text)) => {
            messages.push(json!({"role": "user", "content": text}));
        }
        Some(Value::Array(items)) => {
            for item in items {
                let role = item.get("role").and_then(Value::as_str).unwrap_or("user");
                let content = item
                    .get("content")
                    .map(extract_text_from_content)
                    .unwrap_or_default();
                if !content.is_empty() {
                    messages.push(json!({"role": role, "content": content}));
                }
            }
        }
        _ => {}
    }
    out.insert("messages".to_string(), Value::Array(messages));
    Value::Object(out)
}

/// Responses request -> Claude Messages request.
pub fn claude_request_from_responses(responses: &Value, model: &str, stream: bool) -> Value {
    let chat = chat_request_from_responses(responses, model, stream);
    let mut claude = claude_request_from_chat(&chat, model, stream);
    // chat_request_from_responses never sets max_completion_tokens; keep
    // an explicit max_output_tokens if the client sent one.
    if let Some(max) = responses.get("max_output_tokens").and_then(Value::as_i64) {
        claude["max_tokens"] = json!(max);
    }
    claude
}

/// OpenAI Chat response -> Responses response with the status table
/// applied.
pub fn responses_response_from_chat(chat: &Value, model: &str) -> Value {
    let choice = chat
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .cloned()
        .unwrap_or(Value::Null);
    let text = choice
        .get("message")
        .and_then(|message| message.get("content"))
        .map(extract_text_from_content)
        .unwrap_or_default();
    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .unwrap_or("");
    let status = openai_finish_reason_to_responses(finish_reason);

    let mut out = json!({
        "id": chat.get("id").cloned().unwrap_or(json!("resp-openai")),
        "object": "response",
        "model": model,
        "status": status,
        "output": [{
            "type": "message",
            "role": "assistant",
            "content": [{"type": "output_text", "text": text}],
        }],
    });
    if let Some(usage) = chat.get("usage") {
        let input = usage.get("prompt_tokens").and_then(Value::as_i64).unwrap_or(0);
        let output = usage
            .get("completion_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        out["usage"] = json!({
            "input_tokens": input,
            "output_tokens": output,
            "total_tokens": input + output,
        });
    }
    out
}

/// Claude Messages response -> Responses response (stop reason routed
/// through the OpenAI table first).
pub fn responses_response_from_claude(claude: &Value, model: &str) -> Value {
    let chat = chat_response_from_claude(claude, model);
    responses_response_from_chat(&chat, model)
}
