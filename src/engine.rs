//! Sync engine: the periodic scheduler and the per-table batch pull.
//!
//! The 60-second loop only *requests* work: it asks the remote for the
//! latest config (`agent_info`) and heartbeats. The remote's `agent_info`
//! push is what actually triggers [`sync`], which fans out per-table tasks.
//! Small tables pull in-process and ship a `data_update` message; large
//! tables delegate to a separate worker process behind a state-store gate.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinSet;

use crate::agent::Agent;
use crate::channel::protocol::DataUpdate;
use crate::error::{StateError, SyncError};
use crate::model::{Source, SyncStatus, TableConfig};
use crate::rows::{Cell, RowBatch, WirePayload, compare_cells};
use crate::state::{StateStore, big_table_gate_open, epoch_now};
use crate::adapters::SourceAdapter;

const CYCLE: Duration = Duration::from_secs(60);
/// A sync lock older than this is considered stuck and may be preempted.
const STUCK_LOCK: f64 = 60.0 * 15.0;
const DELETED_ROWS_TRIGGER: i64 = 10;
/// Page size for the deleted-rows primary-key pull on the in-process path.
const PRIMARY_KEY_LIMIT: i64 = 20_000;

/// Liveness ping consumed by the supervisor watchdog. Worker processes keep
/// stdout reserved for exactly this.
pub fn liveness_ping() {
    use std::io::Write;
    let mut stdout = std::io::stdout();
    let _ = writeln!(stdout, "ping");
    let _ = stdout.flush();
}

/// The periodic loop: every 60 seconds (or immediately when a cycle ran
/// long), request fresh config and heartbeat. Skips while the control
/// channel has no token yet.
pub async fn sync_loop(agent: Arc<Agent>) {
    loop {
        let started = std::time::Instant::now();

        if agent.channel.auth().is_authenticated() {
            if let Err(e) = agent.channel.send("agent_info", Value::Null).await {
                tracing::warn!(error = %e, "agent_info request failed");
            }
            if let Err(e) = agent.channel.send_heartbeat(&agent.config.identity.uuid).await {
                tracing::warn!(error = %e, "heartbeat failed");
            }
            let elapsed = started.elapsed();
            if elapsed < CYCLE {
                tokio::time::sleep(CYCLE - elapsed).await;
            }
        } else {
            tracing::debug!("waiting on control channel to be ready");
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
}

/// One full sync pass over every configured source.
pub async fn sync(agent: Arc<Agent>) {
    let started = epoch_now();

    if let Err(e) = agent
        .store
        .set_agent_error(crate::state::AgentErrorKind::AgentFailure, "Ready")
        .await
    {
        tracing::warn!(error = %e, "failed to reset failure status");
    }

    if let Err(e) = sync_inner(&agent).await {
        tracing::error!(error = %e, "general failure when doing a sync");
        let _ = agent
            .store
            .set_agent_error(crate::state::AgentErrorKind::AgentFailure, &e.to_string())
            .await;
    }

    // Ping the supervisor and record the cycle duration for the dashboard.
    liveness_ping();
    if let Err(e) = agent.store.insert_sync_time(epoch_now() - started).await {
        tracing::warn!(error = %e, "failed to record sync time");
    }
}

async fn sync_inner(agent: &Arc<Agent>) -> Result<(), StateError> {
    if agent.channel.auth().claims.paused {
        tracing::info!("customer paused, skipping sync");
        return Ok(());
    }

    let source_uuids: Vec<String> = agent.sources.read().await.keys().cloned().collect();
    let mut tasks: JoinSet<()> = JoinSet::new();

    for source_uuid in source_uuids {
        let snapshot = match agent.sources.read().await.get(&source_uuid) {
            Some(source) => source.clone(),
            None => continue,
        };

        // One reconnect attempt per disconnected source per cycle.
        let source = if snapshot.connected {
            Some(snapshot)
        } else {
            agent.refresh_source_entry(&source_uuid).await
        };

        let Some(source) = source_or_record(agent, source).await? else {
            continue;
        };

        for (table_uuid, table) in source.tables.clone() {
            let agent = Arc::clone(agent);
            let source = source.clone();
            tasks.spawn(async move {
                let _permit = agent.table_permits.clone().acquire_owned().await.ok();
                sync_table(agent.clone(), source, table_uuid, table).await;
            });
        }
    }

    while tasks.join_next().await.is_some() {}
    Ok(())
}

/// Record the source's connection row; `Some(source)` when it is usable
/// this cycle.
async fn source_or_record(
    agent: &Arc<Agent>,
    source: Option<Source>,
) -> Result<Option<Source>, StateError> {
    let Some(source) = source else {
        return Ok(None);
    };
    if source.connected {
        agent
            .store
            .upsert_connection_info(
                &source.source_uuid,
                source.display_name(),
                true,
                "Good to go!",
            )
            .await?;
        Ok(Some(source))
    } else {
        agent
            .store
            .upsert_connection_info(
                &source.source_uuid,
                source.display_name(),
                false,
                &source.error_message(),
            )
            .await?;
        Ok(None)
    }
}

/// Dispatch one table: worker process for large tables, in-process batch
/// pull otherwise.
pub async fn sync_table(
    agent: Arc<Agent>,
    source: Source,
    table_uuid: String,
    table: TableConfig,
) {
    let result = if table.large_table {
        dispatch_large_table(&agent, &source, &table_uuid, table).await
    } else {
        dispatch_batch_pull(&agent, &source, &table_uuid, table).await
    };

    match result {
        Ok(()) => {}
        Err(SyncError::TableAlreadyProcessing) => {
            tracing::info!(table_uuid = %table_uuid, "table already processing data");
        }
        Err(e) => {
            tracing::warn!(table_uuid = %table_uuid, error = %e, "table sync failed");
        }
    }
}

async fn dispatch_large_table(
    agent: &Arc<Agent>,
    source: &Source,
    table_uuid: &str,
    mut table: TableConfig,
) -> Result<(), SyncError> {
    let info = agent.store.table_sync_info(table_uuid).await?;
    if !big_table_gate_open(info.as_ref(), epoch_now()) {
        return Ok(());
    }
    agent.store.touch_table_sync(table_uuid).await?;

    // Resolve the run mode from local state: a dirtied config restarts from
    // a full pull; otherwise a cursor captured by a previous worker run
    // continues incrementally.
    if table.dirty {
        table.sync_status = SyncStatus::Initial;
        table.last_update_value = None;
        agent.store.clear_big_table_cursor(table_uuid).await?;
        agent.clear_table_dirty(&source.source_uuid, table_uuid).await;
    } else if let Some(cursor) = agent.store.big_table_cursor(table_uuid).await? {
        table.sync_status = SyncStatus::Incremental;
        table.last_update_value = Some(cursor);
    }

    crate::worker::spawn_big_table_process(agent, source, table_uuid, &table)
        .await
        .map_err(|e| SyncError::Adapter(crate::error::AdapterError::Query(e.to_string())))?;
    Ok(())
}

async fn dispatch_batch_pull(
    agent: &Arc<Agent>,
    source: &Source,
    table_uuid: &str,
    table: TableConfig,
) -> Result<(), SyncError> {
    let adapter = agent
        .registry
        .get(&source.engine_type)
        .map_err(SyncError::Adapter)?;

    let outcome = batch_pull(
        &agent.config.identity.uuid,
        &table,
        table_uuid,
        source,
        adapter.as_ref(),
        &agent.store,
        true,
    )
    .await?;

    agent.store.touch_table_sync(table_uuid).await?;
    agent
        .write_back_table(&source.source_uuid, table_uuid, &outcome.table_after)
        .await;

    let body = serde_json::to_value(&outcome.update)
        .unwrap_or_else(|_| Value::Bool(false));
    if let Err(e) = agent.channel.send("data_update", body).await {
        tracing::warn!(table_uuid = %table_uuid, error = %e, "data_update send failed");
    }
    Ok(())
}

/// Result of a batch pull: the outbound message plus the table state the
/// engine writes back (crawler completion, forced sync mode).
pub struct BatchPullOutcome {
    pub update: DataUpdate,
    pub table_after: TableConfig,
}

/// The in-process pull decision tree.
pub async fn batch_pull(
    agent_uuid: &str,
    table: &TableConfig,
    table_uuid: &str,
    source: &Source,
    adapter: &dyn SourceAdapter,
    store: &StateStore,
    run_datasets: bool,
) -> Result<BatchPullOutcome, SyncError> {
    // At most one in-flight sync per table; a lock held longer than the
    // stuck threshold may be preempted.
    if table.processing_data && epoch_now() - table.last_sync <= STUCK_LOCK {
        return Err(SyncError::TableAlreadyProcessing);
    }

    let mut table = table.clone();
    if !adapter.supports_row_updates() {
        table.sync_status = SyncStatus::Initial;
    }

    let (_, last_sync) = store.latest_sync_info().await.map_err(SyncError::State)?;
    let batch_pull_size = table.batch_pull_size();

    let mut update = DataUpdate {
        sync_status: table.sync_status,
        agent_uuid: agent_uuid.to_string(),
        table_uuid: table_uuid.to_string(),
        primary_key: table.primary_key.clone(),
        crawler_step: table.crawler_step,
        crawler_step_info: table.crawler_step_info.clone(),
        new_rows: None,
        updated_rows: None,
        deleted_rows_check: None,
        check_for_deleted_rows_counter: table.check_for_deleted_rows_counter,
        last_sync,
        run_datasets,
    };

    let timezones = table.column_timezones.clone().unwrap_or_default();

    match table.sync_status {
        SyncStatus::Incremental => {
            if table.import_old_rows && table.crawler_step_info.as_deref() != Some("completed") {
                let page = adapter.get_old_rows(source, &table, batch_pull_size).await?;
                if page.completed {
                    table.crawler_step_info = Some("completed".to_string());
                    update.crawler_step_info = table.crawler_step_info.clone();
                }
                update.new_rows = Some(page.rows.to_wire(Some(&timezones)));
            }

            if table.ordering_key.is_some() && table.last_update_value.is_some() {
                let mut rows = adapter.get_updated_rows(source, &table).await?;
                if !rows.is_empty() {
                    suppress_duplicate_watermark(&mut rows, &table);
                    update.updated_rows = Some(rows.to_wire(Some(&timezones)));
                }
            }

            let crawl_settled = matches!(
                table.crawler_step_info.as_deref(),
                None | Some("completed")
            );
            if table.check_for_deleted_rows_counter >= DELETED_ROWS_TRIGGER && crawl_settled {
                let keys = adapter
                    .get_primary_keys(source, &table, PRIMARY_KEY_LIMIT)
                    .await?;
                update.deleted_rows_check = Some(keys.to_wire(None));
                update.check_for_deleted_rows_counter = 0;
            } else {
                update.check_for_deleted_rows_counter += 1;
            }
        }
        SyncStatus::Initial => {
            tracing::info!(table_uuid = %table_uuid, "doing a full pull");
            let rows = adapter.initial_pull(source, &table, batch_pull_size).await?;
            update.new_rows = Some(rows.to_wire(Some(&timezones)));
        }
    }

    if let Some(force) = &table.force_dtypes {
        for payload in [
            update.new_rows.as_mut(),
            update.updated_rows.as_mut(),
            update.deleted_rows_check.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            apply_force_dtypes(payload, force);
        }
    }

    Ok(BatchPullOutcome {
        update,
        table_after: table,
    })
}

/// Override dtype entries at the positions of the forced columns. The value
/// `"none"` means no override.
fn apply_force_dtypes(
    payload: &mut WirePayload,
    force_dtypes: &std::collections::HashMap<String, String>,
) {
    for (i, column) in payload.columns.iter().enumerate() {
        if let Some(forced) = force_dtypes.get(column) {
            if forced != "none" {
                payload.dtypes[i] = forced.clone();
            }
        }
    }
}

/// Updated-rows queries use `>` against `last_update_value`, but equal-cursor
/// rows can resurface when the cursor column has sub-second precision the
/// literal lost. When the exact row the cursor came from (matched by
/// `last_update_pk`) is present with an unchanged ordering value, every row
/// at or below the cursor is dropped.
fn suppress_duplicate_watermark(rows: &mut RowBatch, table: &TableConfig) {
    let (Some(primary_key), Some(ordering_key)) = (&table.primary_key, &table.ordering_key)
    else {
        return;
    };
    let (Some(last_pk), Some(cursor)) = (&table.last_update_pk, &table.last_update_value) else {
        return;
    };
    let (Some(pk_idx), Some(ord_idx)) = (
        rows.column_index(primary_key),
        rows.column_index(ordering_key),
    ) else {
        return;
    };

    let cursor_iso = iso_normalize(cursor);
    let watermark_row_present = rows.rows.iter().any(|row| {
        cell_matches_text(&row[pk_idx], last_pk)
            && cell_iso(&row[ord_idx]).as_deref() == Some(cursor_iso.as_str())
    });

    if watermark_row_present {
        let cursor_cell = Cell::Text(cursor.clone());
        rows.rows.retain(|row| {
            matches!(
                compare_cells(&row[ord_idx], &cursor_cell),
                Some(std::cmp::Ordering::Greater)
            )
        });
    }
}

/// `2024-01-01 00:00:00` and `2024-01-01T00:00:00` are the same instant.
fn iso_normalize(value: &str) -> String {
    value.replace(' ', "T")
}

fn cell_iso(cell: &Cell) -> Option<String> {
    match cell {
        Cell::Timestamp(v) => Some(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        Cell::TimestampTz(v) => Some(v.naive_utc().format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        Cell::Text(v) => Some(iso_normalize(v)),
        Cell::Int(v) => Some(v.to_string()),
        Cell::Float(v) => Some(v.to_string()),
        _ => None,
    }
}

/// Textual primary-key match, tolerating numeric representation drift
/// (`42` vs `"42"`).
fn cell_matches_text(cell: &Cell, expected: &str) -> bool {
    let text = match cell {
        Cell::Int(v) => v.to_string(),
        Cell::Float(v) => v.to_string(),
        Cell::Text(v) => v.clone(),
        _ => return false,
    };
    if text == expected {
        return true;
    }
    match (text.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
