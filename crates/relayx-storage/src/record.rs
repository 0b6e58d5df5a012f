use time::OffsetDateTime;

use relayx_common::ApiType;

use crate::entities::request_records;

/// One finalized request outcome, as written to the append-only log.
/// Mirrors the in-memory history record plus the identity columns needed
/// to rebuild engines on startup.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistentRecord {
    pub metrics_key: String,
    pub base_url: String,
    pub key_mask: String,
    pub timestamp: OffsetDateTime,
    pub success: bool,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub api_type: ApiType,
    pub model: String,
}

impl PersistentRecord {
    pub(crate) fn into_active_model(self) -> request_records::ActiveModel {
        use sea_orm::ActiveValue;

        request_records::ActiveModel {
            id: ActiveValue::NotSet,
            metrics_key: ActiveValue::Set(self.metrics_key),
            base_url: ActiveValue::Set(self.base_url),
            key_mask: ActiveValue::Set(self.key_mask),
            timestamp: ActiveValue::Set(self.timestamp.unix_timestamp()),
            success: ActiveValue::Set(i32::from(self.success)),
            input_tokens: ActiveValue::Set(self.input_tokens),
            output_tokens: ActiveValue::Set(self.output_tokens),
            cache_creation_tokens: ActiveValue::Set(self.cache_creation_tokens),
            cache_read_tokens: ActiveValue::Set(self.cache_read_tokens),
            api_type: ActiveValue::Set(self.api_type.as_str().to_string()),
            model: ActiveValue::Set(self.model),
        }
    }

    pub(crate) fn from_model(model: request_records::Model, api_type: ApiType) -> Self {
        PersistentRecord {
            metrics_key: model.metrics_key,
            base_url: model.base_url,
            key_mask: model.key_mask,
            timestamp: OffsetDateTime::from_unix_timestamp(model.timestamp)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
            success: model.success == 1,
            input_tokens: model.input_tokens,
            output_tokens: model.output_tokens,
            cache_creation_tokens: model.cache_creation_tokens,
            cache_read_tokens: model.cache_read_tokens,
            api_type,
            model: model.model,
        }
    }
}
