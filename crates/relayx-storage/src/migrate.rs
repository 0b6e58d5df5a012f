use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, DbErr, Statement};
use tracing::info;

const BASE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS request_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    metrics_key TEXT NOT NULL,
    base_url TEXT NOT NULL,
    key_mask TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    success INTEGER NOT NULL,
    input_tokens INTEGER DEFAULT 0,
    output_tokens INTEGER DEFAULT 0,
    cache_creation_tokens INTEGER DEFAULT 0,
    cache_read_tokens INTEGER DEFAULT 0,
    api_type TEXT NOT NULL DEFAULT 'messages'
);
CREATE INDEX IF NOT EXISTS idx_records_api_type_timestamp
    ON request_records(api_type, timestamp);
CREATE INDEX IF NOT EXISTS idx_records_metrics_key
    ON request_records(metrics_key);
";

/// Apply the base schema, then run idempotent versioned steps gated on
/// `PRAGMA user_version`.
pub(crate) async fn apply(db: &DatabaseConnection) -> Result<(), DbErr> {
    db.execute_unprepared(BASE_SCHEMA).await?;

    let version = user_version(db).await?;
    if version < 1 {
        db.execute_unprepared("ALTER TABLE request_records ADD COLUMN model TEXT DEFAULT ''")
            .await?;
        db.execute_unprepared("CREATE INDEX IF NOT EXISTS idx_records_model ON request_records(model)")
            .await?;
        db.execute_unprepared("PRAGMA user_version = 1").await?;
        info!("metrics store schema upgraded: v0 -> v1 (model column)");
    }

    Ok(())
}

async fn user_version(db: &DatabaseConnection) -> Result<i64, DbErr> {
    let row = db
        .query_one(Statement::from_string(
            DbBackend::Sqlite,
            "PRAGMA user_version".to_owned(),
        ))
        .await?;
    match row {
        Some(row) => row.try_get_by_index::<i64>(0),
        None => Ok(0),
    }
}
