use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use sea_orm::{
    ColumnTrait, Database, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    TransactionTrait,
};
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use relayx_common::ApiType;

use crate::entities::{request_records, RequestRecords};
use crate::migrate;
use crate::record::PersistentRecord;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("db error: {0}")]
    Db(#[from] DbErr),
}

const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(30);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
const DELETE_CHUNK: usize = 500;

#[derive(Debug, Clone)]
pub struct RecordStoreConfig {
    pub db_path: String,
    /// Clamped to 3..=30 days.
    pub retention_days: i64,
}

impl Default for RecordStoreConfig {
    fn default() -> Self {
        RecordStoreConfig {
            db_path: "relayx-metrics.db".to_string(),
            retention_days: 7,
        }
    }
}

struct Buffer {
    records: Vec<PersistentRecord>,
    closed: bool,
}

/// Append-only log of request outcomes with buffered, batched writes.
///
/// `add_record` never blocks on the database: records accumulate in a
/// memory buffer and at most one async flush worker drains it. Deletion
/// and flushing serialize on one lock so a delete can never race with a
/// flush that would reinsert the rows it just removed.
pub struct RecordStore {
    db: DatabaseConnection,
    buffer: StdMutex<Buffer>,
    flushing: AtomicBool,
    flush_lock: AsyncMutex<()>,
    inflight_flushes: AtomicUsize,
    inflight_done: Notify,
    stop: watch::Sender<bool>,
    retention_days: i64,
}

impl RecordStore {
    pub async fn open(config: RecordStoreConfig) -> StoreResult<Arc<RecordStore>> {
        let retention_days = config.retention_days.clamp(3, 30);
        let dsn = format!("sqlite://{}?mode=rwc", config.db_path);
        let db = Database::connect(&dsn).await?;
        migrate::apply(&db).await?;

        let (stop, _) = watch::channel(false);
        let store = Arc::new(RecordStore {
            db,
            buffer: StdMutex::new(Buffer {
                records: Vec::with_capacity(BATCH_SIZE),
                closed: false,
            }),
            flushing: AtomicBool::new(false),
            flush_lock: AsyncMutex::new(()),
            inflight_flushes: AtomicUsize::new(0),
            inflight_done: Notify::new(),
            stop,
            retention_days,
        });

        tokio::spawn(flush_loop(store.clone()));
        tokio::spawn(cleanup_loop(store.clone()));

        info!(
            path = %config.db_path,
            retention_days,
            "record store opened"
        );
        Ok(store)
    }

    /// Non-blocking append. Once the buffer crosses the batch threshold,
    /// one async flush worker is scheduled (at most one at a time).
    pub fn add_record(self: &Arc<Self>, record: PersistentRecord) {
        let should_flush = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            if buffer.closed {
                return;
            }
            buffer.records.push(record);
            buffer.records.len() >= BATCH_SIZE
        };

        if should_flush
            && self
                .flushing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let store = self.clone();
            self.inflight_flushes.fetch_add(1, Ordering::AcqRel);
            tokio::spawn(async move {
                {
                    let _guard = store.flush_lock.lock().await;
                    store.flush_buffered().await;
                }
                store.flushing.store(false, Ordering::Release);
                store.inflight_flushes.fetch_sub(1, Ordering::AcqRel);
                store.inflight_done.notify_waiters();
            });
        }
    }

    /// Drain the buffer into one transactional batch insert. Caller must
    /// hold the flush lock. On failure the batch is returned to the
    /// buffer, capped at ten batches; overflow is dropped with a warning.
    async fn flush_buffered(&self) {
        let records = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            if buffer.records.is_empty() {
                return;
            }
            std::mem::replace(&mut buffer.records, Vec::with_capacity(BATCH_SIZE))
        };

        if let Err(err) = self.insert_batch(records.clone()).await {
            warn!(error = %err, count = records.len(), "metrics batch insert failed");
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            if buffer.records.len() < BATCH_SIZE * 10 {
                let mut restored = records;
                restored.append(&mut buffer.records);
                buffer.records = restored;
            } else {
                warn!(
                    dropped = records.len(),
                    "metrics write buffer full, dropping failed batch"
                );
            }
        }
    }

    async fn insert_batch(&self, records: Vec<PersistentRecord>) -> Result<(), DbErr> {
        let result = self
            .db
            .transaction::<_, (), DbErr>(move |txn| {
                Box::pin(async move {
                    for record in records {
                        RequestRecords::insert(record.into_active_model())
                            .exec(txn)
                            .await?;
                    }
                    Ok(())
                })
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(sea_orm::TransactionError::Connection(err)) => Err(err),
            Err(sea_orm::TransactionError::Transaction(err)) => Err(err),
        }
    }

    /// All records for one apiType with `timestamp >= since`, ascending.
    pub async fn load_records(
        &self,
        since: OffsetDateTime,
        api_type: ApiType,
    ) -> StoreResult<Vec<PersistentRecord>> {
        let rows = RequestRecords::find()
            .filter(
                request_records::Column::ApiType
                    .eq(api_type.as_str())
                    .and(request_records::Column::Timestamp.gte(since.unix_timestamp())),
            )
            .order_by_asc(request_records::Column::Timestamp)
            .all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .map(|model| PersistentRecord::from_model(model, api_type))
            .collect())
    }

    /// Delete records older than `before`. Returns the affected count.
    pub async fn cleanup_old_records(&self, before: OffsetDateTime) -> StoreResult<u64> {
        let result = RequestRecords::delete_many()
            .filter(request_records::Column::Timestamp.lt(before.unix_timestamp()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    /// Delete every record whose metrics identity is in `metrics_keys`,
    /// scoped to one apiType so shared identities in other apiTypes are
    /// untouched. Flushes the buffer first under the flush lock.
    pub async fn delete_records_by_metrics_keys(
        &self,
        metrics_keys: &[String],
        api_type: ApiType,
    ) -> StoreResult<u64> {
        if metrics_keys.is_empty() {
            return Ok(0);
        }

        let _guard = self.flush_lock.lock().await;
        self.flush_buffered().await;

        let mut total = 0u64;
        for chunk in metrics_keys.chunks(DELETE_CHUNK) {
            let result = RequestRecords::delete_many()
                .filter(
                    request_records::Column::ApiType
                        .eq(api_type.as_str())
                        .and(request_records::Column::MetricsKey.is_in(chunk.to_vec())),
                )
                .exec(&self.db)
                .await?;
            total += result.rows_affected;
        }
        Ok(total)
    }

    /// Record count, for diagnostics and tests.
    pub async fn record_count(&self) -> StoreResult<u64> {
        use sea_orm::PaginatorTrait;
        Ok(RequestRecords::find().count(&self.db).await?)
    }

    /// Stop accepting records, halt the background loops, flush the
    /// residue, and wait for any in-flight async flush to finish.
    pub async fn close(&self) {
        {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer.closed = true;
        }
        let _ = self.stop.send(true);

        {
            let _guard = self.flush_lock.lock().await;
            self.flush_buffered().await;
        }

        loop {
            // Register interest before re-checking, so a notification
            // between the check and the await is never lost.
            let notified = self.inflight_done.notified();
            if self.inflight_flushes.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }
    }
}

async fn flush_loop(store: Arc<RecordStore>) {
    let mut stop = store.stop.subscribe();
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let _guard = store.flush_lock.lock().await;
                store.flush_buffered().await;
            }
            _ = stop.changed() => return,
        }
    }
}

async fn cleanup_loop(store: Arc<RecordStore>) {
    let mut stop = store.stop.subscribe();
    let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cutoff = OffsetDateTime::now_utc() - time::Duration::days(store.retention_days);
                match store.cleanup_old_records(cutoff).await {
                    Ok(0) => {}
                    Ok(deleted) => info!(deleted, "expired metrics records removed"),
                    Err(err) => warn!(error = %err, "metrics retention cleanup failed"),
                }
            }
            _ = stop.changed() => return,
        }
    }
}
