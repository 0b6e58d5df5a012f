mod api_type;
mod estimate;
mod mask;
mod settings;
mod usage;

pub use api_type::{ApiType, ServiceType};
pub use estimate::{
    estimate_request_tokens, estimate_response_tokens, estimate_responses_request_tokens,
    estimate_text_tokens,
};
pub use mask::{mask_api_key, redact_url_credentials};
pub use settings::{Settings, SettingsHandle};
pub use usage::Usage;
