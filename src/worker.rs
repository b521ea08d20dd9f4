//! Large-table worker.
//!
//! Flagged tables are exported by a separate OS process so the page buffers
//! are returned to the OS when the run completes. The parent engine spawns
//! `<agent> big-table` with a JSON job spec on stdin; the child heartbeats
//! into `table_sync_info` every 10 seconds and streams pages straight to the
//! ingest endpoint over HTTP, bypassing the control channel.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::adapters::{AdapterRegistry, SourceAdapter, refresh_source};
use crate::agent::Agent;
use crate::error::{AdapterError, Error, WorkerError};
use crate::model::{ConnectionDescriptor, Source, SyncStatus, TableConfig};
use crate::rows::{Cell, RowBatch, compare_cells};
use crate::state::{StateStore, epoch_now};

/// Rows per export page on the initial path.
const PAGE_SIZE: i64 = 500_000;
/// Primary-key cap for the deleted-rows upload.
const PRIMARY_KEY_LIMIT: i64 = 5_000_000;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
/// Deleted-row reconciliation cadence on the incremental path.
const DELETED_ROWS_INTERVAL: f64 = 3600.0;

/// Everything the child process needs, piped over stdin (never written to
/// disk: the spec carries the unwrapped secret).
#[derive(Debug, Serialize, Deserialize)]
pub struct BigTableJob {
    pub source_uuid: String,
    pub table_uuid: String,
    pub table: TableConfig,
    pub engine_type: String,
    pub connection: ConnectionDescriptor,
    pub secret: Option<String>,
    pub token: Option<String>,
    pub ingest_url: String,
    pub state_db: PathBuf,
}

/// Spawn the worker process for one large-table run. The child is not
/// awaited; the state-store gate serializes future runs.
pub async fn spawn_big_table_process(
    agent: &Arc<Agent>,
    source: &Source,
    table_uuid: &str,
    table: &TableConfig,
) -> Result<(), WorkerError> {
    let job = BigTableJob {
        source_uuid: source.source_uuid.clone(),
        table_uuid: table_uuid.to_string(),
        table: table.clone(),
        engine_type: source.engine_type.clone(),
        connection: source.connection.clone(),
        secret: source
            .secret
            .as_ref()
            .map(|s| s.expose_secret().to_string()),
        token: agent.channel.auth().token,
        ingest_url: agent.config.ingest_url(),
        state_db: agent.config.state_db.clone(),
    };

    let exe = std::env::current_exe()?;
    let mut child = tokio::process::Command::new(exe)
        .arg("big-table")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| WorkerError::Spawn(e.to_string()))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| WorkerError::Spawn("child has no stdin".to_string()))?;
    let payload =
        serde_json::to_vec(&job).map_err(|e| WorkerError::BadJobSpec(e.to_string()))?;
    stdin.write_all(&payload).await?;
    drop(stdin);

    tracing::info!(table_uuid = %table_uuid, "spawned large-table worker");
    tokio::spawn(async move {
        let _ = child.wait().await;
    });
    Ok(())
}

/// Child process entry point.
pub async fn run_big_table(job: BigTableJob) -> Result<(), Error> {
    let store = Arc::new(StateStore::open(&job.state_db).await.map_err(Error::State)?);
    let registry = AdapterRegistry::with_builtin();
    let adapter = registry.get(&job.engine_type).map_err(Error::Adapter)?;

    let mut source = Source {
        source_uuid: job.source_uuid.clone(),
        source_name: None,
        engine_type: job.engine_type.clone(),
        encrypted_secret: None,
        connection: job.connection.clone(),
        secret: job.secret.clone().map(SecretString::from),
        connected: false,
        error: None,
        client: None,
        tables: Default::default(),
    };
    refresh_source(&registry, &mut source).await;
    if !source.connected {
        return Err(Error::Adapter(AdapterError::SourceConnect(
            source.error_message(),
        )));
    }

    let heartbeat = {
        let store = Arc::clone(&store);
        let table_uuid = job.table_uuid.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = store.worker_heartbeat(&table_uuid).await {
                    tracing::warn!(error = %e, "worker heartbeat failed");
                }
            }
        })
    };

    tracing::info!(
        table_uuid = %job.table_uuid,
        sync_status = job.table.sync_status.as_int(),
        "doing big sync"
    );
    let ingest = IngestClient::new(&job)?;
    let result = match job.table.sync_status {
        SyncStatus::Initial => initial_sync(adapter.as_ref(), &source, &store, &ingest, &job).await,
        SyncStatus::Incremental => {
            incremental_sync(adapter.as_ref(), &source, &store, &ingest, &job).await
        }
    };

    heartbeat.abort();
    store
        .worker_finished(&job.table_uuid)
        .await
        .map_err(Error::State)?;
    tracing::info!(table_uuid = %job.table_uuid, "finished big pull");
    result
}

async fn initial_sync(
    adapter: &dyn SourceAdapter,
    source: &Source,
    store: &StateStore,
    ingest: &IngestClient,
    job: &BigTableJob,
) -> Result<(), Error> {
    let mut table = job.table.clone();
    let ordering_key = table
        .ordering_key
        .clone()
        .ok_or(Error::Sync(crate::error::SyncError::MissingField("ordering_key")))?;

    let pages = table.large_table_row_limit / PAGE_SIZE;
    let mut previous_min: Option<Cell> = None;

    for page in 0..pages {
        tracing::info!(page, "doing page");
        table.crawler_step = page;
        let mut rows = adapter
            .get_old_rows(source, &table, PAGE_SIZE)
            .await
            .map_err(Error::Adapter)?
            .rows;
        let rows_pulled = rows.len() as i64;

        let ord_idx = rows.column_index(&ordering_key).ok_or_else(|| {
            Error::Adapter(AdapterError::Query(format!(
                "result has no ordering column {ordering_key:?}"
            )))
        })?;
        let page_min = column_extreme(&rows, ord_idx, Ordering::Less);

        if page == 0 {
            // The run's upper watermark: the newest ordering value seen.
            if let Some(max) = column_extreme(&rows, ord_idx, Ordering::Greater) {
                store
                    .set_big_table_cursor(&job.table_uuid, &max.csv_value())
                    .await
                    .map_err(Error::State)?;
            }
            let schema = RowBatch {
                columns: rows.columns.clone(),
                dtypes: rows.dtypes.clone(),
                rows: Vec::new(),
            };
            ingest
                .post("table_metadata", schema.to_columnar_blob(), &[])
                .await
                .map_err(Error::Worker)?;
        } else if let Some(previous_min) = &previous_min {
            // Pages overlap when rows land mid-export; drop everything at or
            // past the previous page's oldest value.
            rows.rows.retain(|row| {
                matches!(
                    compare_cells(&row[ord_idx], previous_min),
                    Some(Ordering::Less)
                )
            });
        }
        previous_min = page_min;

        ingest
            .post("initial_table_data", to_csv(&rows)?, &[])
            .await
            .map_err(Error::Worker)?;

        if rows_pulled < PAGE_SIZE {
            tracing::info!(rows_pulled, "short page, stopping data import");
            break;
        }
    }

    store
        .set_checked_for_deleted_rows(&job.table_uuid)
        .await
        .map_err(Error::State)?;
    Ok(())
}

async fn incremental_sync(
    adapter: &dyn SourceAdapter,
    source: &Source,
    store: &StateStore,
    ingest: &IngestClient,
    job: &BigTableJob,
) -> Result<(), Error> {
    let table = &job.table;
    let ordering_key = table
        .ordering_key
        .clone()
        .ok_or(Error::Sync(crate::error::SyncError::MissingField("ordering_key")))?;

    let rows = adapter
        .get_updated_rows(source, table)
        .await
        .map_err(Error::Adapter)?;
    tracing::info!(rows = rows.len(), "got new rows");

    if let Some(ord_idx) = rows.column_index(&ordering_key) {
        if let Some(max) = column_extreme(&rows, ord_idx, Ordering::Greater) {
            store
                .set_big_table_cursor(&job.table_uuid, &max.csv_value())
                .await
                .map_err(Error::State)?;
        }
    }

    let columns_header = serde_json::to_string(&table.relevant_columns)
        .map_err(|e| Error::Worker(WorkerError::BadJobSpec(e.to_string())))?;
    ingest
        .post(
            "update_table_data",
            to_csv(&rows)?,
            &[
                ("Primary-Key", table.primary_key.clone().unwrap_or_default()),
                ("Columns", columns_header),
            ],
        )
        .await
        .map_err(Error::Worker)?;

    let last_check = store
        .table_sync_info(&job.table_uuid)
        .await
        .map_err(Error::State)?
        .and_then(|info| info.checked_for_deleted_rows);
    let due = last_check.is_none_or(|t| epoch_now() - t > DELETED_ROWS_INTERVAL);
    if due {
        let keys = adapter
            .get_primary_keys(source, table, PRIMARY_KEY_LIMIT)
            .await
            .map_err(Error::Adapter)?;
        ingest
            .post(
                "check_for_deleted_rows",
                keys.to_columnar_blob(),
                &[
                    ("Primary-Key", table.primary_key.clone().unwrap_or_default()),
                    ("Ordering-Key", ordering_key),
                ],
            )
            .await
            .map_err(Error::Worker)?;
        store
            .set_checked_for_deleted_rows(&job.table_uuid)
            .await
            .map_err(Error::State)?;
    }
    Ok(())
}

/// HTTP uploader for the ingest endpoint. No retries: the next sync cycle
/// re-drives a failed run.
pub struct IngestClient {
    http: reqwest::Client,
    url: String,
    token: String,
    table_uuid: String,
}

impl IngestClient {
    fn new(job: &BigTableJob) -> Result<Self, Error> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(UPLOAD_TIMEOUT)
                .build()
                .map_err(|e| Error::Worker(WorkerError::Http(e)))?,
            url: job.ingest_url.clone(),
            token: job.token.clone().unwrap_or_default(),
            table_uuid: job.table_uuid.clone(),
        })
    }

    /// Build an uploader directly from its parts.
    pub fn from_parts(url: String, token: String, table_uuid: String) -> Result<Self, WorkerError> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(UPLOAD_TIMEOUT).build()?,
            url,
            token,
            table_uuid,
        })
    }

    pub async fn post(
        &self,
        message_type: &str,
        body: Vec<u8>,
        extra_headers: &[(&str, String)],
    ) -> Result<(), WorkerError> {
        tracing::info!(message_type, bytes = body.len(), "uploading");
        let mut request = self
            .http
            .post(&self.url)
            .header("Auth", &self.token)
            .header("Table-Uuid", &self.table_uuid)
            .header("Message-Type", message_type)
            .body(body);
        for (name, value) in extra_headers {
            request = request.header(*name, value);
        }

        let response = request.send().await.map_err(|e| WorkerError::Upload {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if !response.status().is_success() {
            return Err(WorkerError::IngestStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

/// CSV export: no header row, no index column, `\N` for nulls.
pub fn to_csv(batch: &RowBatch) -> Result<Vec<u8>, Error> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    for row in &batch.rows {
        let record: Vec<String> = row
            .iter()
            .map(|cell| {
                if cell.is_null() {
                    "\\N".to_string()
                } else {
                    cell.csv_value()
                }
            })
            .collect();
        writer
            .write_record(&record)
            .map_err(|e| Error::Worker(WorkerError::Csv(e)))?;
    }
    writer
        .into_inner()
        .map_err(|e| Error::Worker(WorkerError::Io(std::io::Error::other(e.to_string()))))
}

/// Largest (`Ordering::Greater`) or smallest (`Ordering::Less`) non-null
/// value in a column.
fn column_extreme(batch: &RowBatch, idx: usize, want: Ordering) -> Option<Cell> {
    let mut best: Option<&Cell> = None;
    for row in &batch.rows {
        let cell = &row[idx];
        if cell.is_null() {
            continue;
        }
        best = match best {
            None => Some(cell),
            Some(current) => {
                if compare_cells(cell, current) == Some(want) {
                    Some(cell)
                } else {
                    Some(current)
                }
            }
        };
    }
    best.cloned()
}
