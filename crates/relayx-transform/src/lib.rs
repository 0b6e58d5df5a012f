mod adapters;
mod headers;
mod preprocess;
mod stream;
mod url;
mod usage;

pub use adapters::chat::ChatAdapter;
pub use adapters::gemini::GeminiAdapter;
pub use adapters::messages::MessagesAdapter;
pub use adapters::responses::ResponsesAdapter;
pub use url::upstream_url;
