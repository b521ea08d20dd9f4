//! End-to-end batch-pull scenarios against the mock adapter and a real
//! state database.

mod common;

use std::sync::atomic::Ordering;

use common::{MockAdapter, mock_source, orders_batch, table_from_json, ts};
use mirrorpoint_agent::engine::batch_pull;
use mirrorpoint_agent::error::SyncError;
use mirrorpoint_agent::rows::Cell;
use mirrorpoint_agent::state::{StateStore, TableSyncInfo, big_table_gate_open, epoch_now};

async fn temp_store() -> (tempfile::TempDir, StateStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(&dir.path().join("sync_info.db"))
        .await
        .unwrap();
    (dir, store)
}

fn wire_rows(payload: &serde_json::Value) -> Vec<Vec<serde_json::Value>> {
    serde_json::from_str(payload["values"].as_str().unwrap()).unwrap()
}

/// Cold start: one table with no history does a full pull.
#[tokio::test]
async fn cold_start_initial_pull() {
    let (_dir, store) = temp_store().await;
    let adapter = MockAdapter {
        initial: orders_batch(vec![
            vec![Cell::Int(1), ts(1, 0)],
            vec![Cell::Int(2), ts(2, 0)],
        ]),
        ..Default::default()
    };
    let source = mock_source("src-1", serde_json::json!({}));
    let table = table_from_json(serde_json::json!({
        "table_name": "orders",
        "primary_key": "id",
        "last_update": "updated_at",
        "sync_status": 1,
        "crawler_step": 1,
        "batch_pull_size": 2,
    }));

    let outcome = batch_pull("agent-1", &table, "t-1", &source, &adapter, &store, true)
        .await
        .unwrap();

    let update = serde_json::to_value(&outcome.update).unwrap();
    assert_eq!(update["sync_status"], 1);
    assert_eq!(update["crawler_step"], 1);
    assert_eq!(update["agent_uuid"], "agent-1");
    assert_eq!(update["table_uuid"], "t-1");
    assert_eq!(
        update["new_rows"]["columns"],
        serde_json::json!(["id", "updated_at"])
    );
    assert_eq!(wire_rows(&update["new_rows"]).len(), 2);
    assert_eq!(update["updated_rows"], serde_json::json!({}));
    assert_eq!(adapter.initial_calls.load(Ordering::SeqCst), 1);
}

/// Counter at threshold with a settled crawl triggers the deleted-rows
/// check and resets to zero.
#[tokio::test]
async fn deleted_rows_counter_triggers_primary_key_pull() {
    let (_dir, store) = temp_store().await;
    let adapter = MockAdapter {
        primary_keys: orders_batch(vec![
            vec![Cell::Int(1), ts(1, 0)],
            vec![Cell::Int(2), ts(2, 0)],
        ]),
        ..Default::default()
    };
    let source = mock_source("src-1", serde_json::json!({}));
    let table = table_from_json(serde_json::json!({
        "table_name": "orders",
        "primary_key": "id",
        "last_update": "updated_at",
        "sync_status": 3,
        "crawler_step_info": "completed",
        "check_for_deleted_rows_counter": 10,
    }));

    let outcome = batch_pull("agent-1", &table, "t-1", &source, &adapter, &store, true)
        .await
        .unwrap();

    let update = serde_json::to_value(&outcome.update).unwrap();
    assert_eq!(update["check_for_deleted_rows_counter"], 0);
    assert!(!wire_rows(&update["deleted_rows_check"]).is_empty());
    assert_eq!(adapter.primary_key_calls.load(Ordering::SeqCst), 1);
}

/// Below the threshold the counter just increments in the outbound message.
#[tokio::test]
async fn deleted_rows_counter_increments_below_threshold() {
    let (_dir, store) = temp_store().await;
    let adapter = MockAdapter::default();
    let source = mock_source("src-1", serde_json::json!({}));
    let table = table_from_json(serde_json::json!({
        "table_name": "orders",
        "primary_key": "id",
        "last_update": "updated_at",
        "sync_status": 3,
        "check_for_deleted_rows_counter": 4,
    }));

    let outcome = batch_pull("agent-1", &table, "t-1", &source, &adapter, &store, true)
        .await
        .unwrap();

    let update = serde_json::to_value(&outcome.update).unwrap();
    assert_eq!(update["check_for_deleted_rows_counter"], 5);
    assert_eq!(update["deleted_rows_check"], serde_json::json!({}));
    assert_eq!(adapter.primary_key_calls.load(Ordering::SeqCst), 0);
}

/// The cursor row resurfacing with an unchanged ordering value is
/// suppressed along with everything at or below the watermark.
#[tokio::test]
async fn duplicate_watermark_rows_are_dropped() {
    let (_dir, store) = temp_store().await;
    let adapter = MockAdapter {
        updated: orders_batch(vec![
            vec![Cell::Int(42), ts(1, 0)],
            vec![Cell::Int(43), ts(1, 6)],
            vec![Cell::Int(44), ts(2, 0)],
            vec![Cell::Int(45), ts(3, 0)],
        ]),
        ..Default::default()
    };
    let source = mock_source("src-1", serde_json::json!({}));
    let table = table_from_json(serde_json::json!({
        "table_name": "orders",
        "primary_key": "id",
        "last_update": "updated_at",
        "sync_status": 3,
        "last_update_value": "2024-01-01 00:00:00",
        "last_update_pk": 42,
    }));

    let outcome = batch_pull("agent-1", &table, "t-1", &source, &adapter, &store, true)
        .await
        .unwrap();

    let update = serde_json::to_value(&outcome.update).unwrap();
    let rows = wire_rows(&update["updated_rows"]);
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0][0], 43);
}

/// Old-rows crawling marks completion when a page comes back short.
#[tokio::test]
async fn short_crawl_page_completes_the_crawl() {
    let (_dir, store) = temp_store().await;
    let adapter = MockAdapter {
        old_rows: orders_batch(vec![vec![Cell::Int(9), ts(1, 0)]]),
        old_rows_completed: true,
        ..Default::default()
    };
    let source = mock_source("src-1", serde_json::json!({}));
    let table = table_from_json(serde_json::json!({
        "table_name": "orders",
        "primary_key": "id",
        "last_update": "updated_at",
        "sync_status": 3,
        "import_old_rows": true,
        "crawler_step": 3,
    }));

    let outcome = batch_pull("agent-1", &table, "t-1", &source, &adapter, &store, true)
        .await
        .unwrap();

    assert_eq!(
        outcome.table_after.crawler_step_info.as_deref(),
        Some("completed")
    );
    let update = serde_json::to_value(&outcome.update).unwrap();
    assert_eq!(update["crawler_step_info"], "completed");
    assert_eq!(wire_rows(&update["new_rows"]).len(), 1);
}

/// The concurrency guard rejects a second pull while one is in flight, but
/// a lock older than 15 minutes is preempted.
#[tokio::test]
async fn processing_guard_blocks_until_stale() {
    let (_dir, store) = temp_store().await;
    let adapter = MockAdapter::default();
    let source = mock_source("src-1", serde_json::json!({}));

    let held = table_from_json(serde_json::json!({
        "table_name": "orders",
        "last_update": "updated_at",
        "sync_status": 1,
        "processing_data": true,
        "last_sync": epoch_now(),
    }));
    let result = batch_pull("agent-1", &held, "t-1", &source, &adapter, &store, true).await;
    assert!(matches!(result, Err(SyncError::TableAlreadyProcessing)));

    let stale = table_from_json(serde_json::json!({
        "table_name": "orders",
        "last_update": "updated_at",
        "sync_status": 1,
        "processing_data": true,
        "last_sync": epoch_now() - 16.0 * 60.0,
    }));
    let result = batch_pull("agent-1", &stale, "t-1", &source, &adapter, &store, true).await;
    assert!(result.is_ok());
}

/// Large-table gate: a held lock with a live heartbeat blocks new workers;
/// a stale heartbeat or a finished worker opens it again.
#[tokio::test]
async fn large_table_gate_follows_heartbeats() {
    let (dir, store) = temp_store().await;

    // Fresh dispatch stamps the row: the gate closes.
    store.touch_table_sync("t-big").await.unwrap();
    store.worker_heartbeat("t-big").await.unwrap();
    let info = store.table_sync_info("t-big").await.unwrap();
    assert!(!big_table_gate_open(info.as_ref(), epoch_now()));

    // Age the stamp and heartbeat through a second connection, as if 16
    // minutes passed with the worker wedged at 70 seconds of silence.
    let db = libsql::Builder::new_local(dir.path().join("sync_info.db"))
        .build()
        .await
        .unwrap();
    let conn = db.connect().unwrap();
    let stale = epoch_now() - 16.0 * 60.0;
    let dead_heartbeat = epoch_now() - 70.0;
    conn.execute(
        &format!(
            "UPDATE table_sync_info SET last_update = {stale}, heartbeat = {dead_heartbeat} \
             WHERE table_uuid = 't-big'"
        ),
        (),
    )
    .await
    .unwrap();

    let info = store.table_sync_info("t-big").await.unwrap();
    assert!(big_table_gate_open(info.as_ref(), epoch_now()));

    // Same staleness but a live heartbeat keeps it closed.
    let live = TableSyncInfo {
        last_update: epoch_now() - 16.0 * 60.0,
        in_progress: Some("true".to_string()),
        heartbeat: epoch_now() - 30.0,
        checked_for_deleted_rows: None,
    };
    assert!(!big_table_gate_open(Some(&live), epoch_now()));
}
