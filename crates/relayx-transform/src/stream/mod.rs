mod claude_to_chat;
mod claude_to_responses;
mod gemini_to_claude;
mod openai_to_claude;
mod openai_to_responses;
mod passthrough;
mod to_gemini;

pub use claude_to_chat::ClaudeToChatStream;
pub use claude_to_responses::ClaudeToResponsesStream;
pub use gemini_to_claude::GeminiToClaudeStream;
pub use openai_to_claude::OpenAiToClaudeStream;
pub use openai_to_responses::OpenAiToResponsesStream;
pub use passthrough::{PassthroughStream, UsageWire};
pub use to_gemini::{ClaudeToGeminiStream, OpenAiToGeminiStream};
