use relayx_common::{ApiType, Usage};
use relayx_metrics::MetricsEngine;
use relayx_storage::{RecordStore, RecordStoreConfig};

const URL: &str = "https://u1";
const KEY_A: &str = "sk-aaaa-0123456789";
const KEY_B: &str = "sk-bbbb-0123456789";

async fn open_store(dir: &tempfile::TempDir) -> std::sync::Arc<RecordStore> {
    RecordStore::open(RecordStoreConfig {
        db_path: dir.path().join("metrics.db").to_string_lossy().into_owned(),
        retention_days: 7,
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn counters_rebuild_from_persisted_records() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = open_store(&dir).await;
        let engine =
            MetricsEngine::with_store(ApiType::Messages, 10, 0.5, store.clone()).await;

        for _ in 0..3 {
            let id = engine.reserve_attempt(URL, KEY_A, "claude-3");
            engine.finalize_success(URL, KEY_A, id, Some(Usage::new(5, 1)));
        }
        let id = engine.reserve_attempt(URL, KEY_A, "claude-3");
        engine.finalize_failure(URL, KEY_A, id);

        let id = engine.reserve_attempt(URL, KEY_B, "claude-3");
        engine.finalize_success(URL, KEY_B, id, Some(Usage::new(7, 2)));

        store.close().await;
    }

    let store = open_store(&dir).await;
    let engine = MetricsEngine::with_store(ApiType::Messages, 10, 0.5, store.clone()).await;

    let a = engine.key_snapshot(URL, KEY_A).expect("key A reloaded");
    assert_eq!(a.request_count, 4);
    assert_eq!(a.success_count, 3);
    assert_eq!(a.failure_count, 1);
    // Records were written moments ago, so they are inside the 15-minute
    // window-rebuild span.
    assert_eq!(a.window_len, 4);

    let b = engine.key_snapshot(URL, KEY_B).expect("key B reloaded");
    assert_eq!(b.request_count, 1);
    assert_eq!(b.success_count, 1);

    store.close().await;
}

#[tokio::test]
async fn reload_is_scoped_to_the_engine_api_type() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = open_store(&dir).await;
        let messages =
            MetricsEngine::with_store(ApiType::Messages, 10, 0.5, store.clone()).await;
        let chat = MetricsEngine::with_store(ApiType::Chat, 10, 0.5, store.clone()).await;

        let id = messages.reserve_attempt(URL, KEY_A, "claude-3");
        messages.finalize_success(URL, KEY_A, id, Some(Usage::new(5, 1)));
        let id = chat.reserve_attempt(URL, KEY_A, "gpt-4o");
        chat.finalize_failure(URL, KEY_A, id);

        store.close().await;
    }

    let store = open_store(&dir).await;
    let chat = MetricsEngine::with_store(ApiType::Chat, 10, 0.5, store.clone()).await;
    let snap = chat.key_snapshot(URL, KEY_A).expect("chat rows reloaded");
    assert_eq!(snap.request_count, 1);
    assert_eq!(snap.failure_count, 1);
    assert_eq!(snap.success_count, 0);
    store.close().await;
}

#[tokio::test]
async fn shared_pair_deletion_is_scoped_by_metrics_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let engine = MetricsEngine::with_store(ApiType::Messages, 10, 0.5, store.clone()).await;

    let id = engine.reserve_attempt(URL, KEY_A, "m");
    engine.finalize_success(URL, KEY_A, id, None);
    let id = engine.reserve_attempt(URL, KEY_B, "m");
    engine.finalize_success(URL, KEY_B, id, None);

    let doomed = vec![relayx_metrics::metrics_key(URL, KEY_A)];
    let deleted_rows = engine.delete_by_metrics_keys(&doomed).await;
    assert_eq!(deleted_rows, 1);

    assert!(engine.key_snapshot(URL, KEY_A).is_none());
    assert!(engine.key_snapshot(URL, KEY_B).is_some());
    store.close().await;
}
