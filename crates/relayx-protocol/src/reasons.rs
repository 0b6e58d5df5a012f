/// OpenAI `finish_reason` -> Anthropic `stop_reason`. Unknown reasons pass
/// through unchanged so upstream state is never hidden.
pub fn openai_finish_reason_to_anthropic(reason: &str) -> String {
    match reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" | "function_call" => "tool_use",
        "content_filter" => "refusal",
        "" | "empty" => "end_turn",
        other => other,
    }
    .to_string()
}

/// Anthropic `stop_reason` -> OpenAI `finish_reason`. Unknown reasons pass
/// through unchanged.
pub fn anthropic_stop_reason_to_openai(reason: &str) -> String {
    match reason {
        "end_turn" => "stop",
        "max_tokens" => "length",
        "stop_sequence" | "pause_turn" => "stop",
        "tool_use" => "tool_calls",
        "refusal" => "content_filter",
        "" | "empty" => "stop",
        other => other,
    }
    .to_string()
}

/// OpenAI `finish_reason` -> Responses `status`. Unknown reasons map to
/// `incomplete` so a potential error is never reported as success.
pub fn openai_finish_reason_to_responses(reason: &str) -> String {
    match reason {
        "stop" | "tool_calls" | "function_call" => "completed",
        "length" => "incomplete",
        "content_filter" => "failed",
        "" | "empty" => "completed",
        _ => "incomplete",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_to_anthropic_table() {
        for (input, want) in [
            ("stop", "end_turn"),
            ("length", "max_tokens"),
            ("tool_calls", "tool_use"),
            ("function_call", "tool_use"),
            ("content_filter", "refusal"),
            ("", "end_turn"),
            ("empty", "end_turn"),
            ("weird_reason", "weird_reason"),
        ] {
            assert_eq!(openai_finish_reason_to_anthropic(input), want);
        }
    }

    #[test]
    fn anthropic_to_openai_table() {
        for (input, want) in [
            ("end_turn", "stop"),
            ("max_tokens", "length"),
            ("stop_sequence", "stop"),
            ("pause_turn", "stop"),
            ("tool_use", "tool_calls"),
            ("refusal", "content_filter"),
            ("", "stop"),
            ("weird_reason", "weird_reason"),
        ] {
            assert_eq!(anthropic_stop_reason_to_openai(input), want);
        }
    }

    #[test]
    fn openai_to_responses_table() {
        for (input, want) in [
            ("stop", "completed"),
            ("tool_calls", "completed"),
            ("function_call", "completed"),
            ("length", "incomplete"),
            ("content_filter", "failed"),
            ("", "completed"),
            ("weird_reason", "incomplete"),
        ] {
            assert_eq!(openai_finish_reason_to_responses(input), want);
        }
    }
}
