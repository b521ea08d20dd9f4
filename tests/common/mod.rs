//! Shared test fixtures: an in-memory source adapter registered as its own
//! engine type, plus source/table builders.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;

use mirrorpoint_agent::adapters::{OldRowsPage, SourceAdapter, SqlClient};
use mirrorpoint_agent::error::AdapterError;
use mirrorpoint_agent::model::{Source, SourceConfig, TableConfig};
use mirrorpoint_agent::rows::{Cell, Dtype, RowBatch};

pub fn ts(day: u32, hour: u32) -> Cell {
    Cell::Timestamp(
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap(),
    )
}

pub fn orders_batch(rows: Vec<Vec<Cell>>) -> RowBatch {
    let mut batch = RowBatch::new(
        vec!["id".to_string(), "updated_at".to_string()],
        vec![Dtype::Int64, Dtype::DatetimeNaive],
    );
    batch.rows = rows;
    batch
}

/// Canned responses per operation, with call counters.
#[derive(Default)]
pub struct MockAdapter {
    pub initial: RowBatch,
    pub updated: RowBatch,
    pub old_rows: RowBatch,
    pub old_rows_completed: bool,
    pub primary_keys: RowBatch,
    pub initial_calls: AtomicUsize,
    pub updated_calls: AtomicUsize,
    pub primary_key_calls: AtomicUsize,
}

struct MockClient;

#[async_trait]
impl SqlClient for MockClient {
    async fn query(&self, _sql: &str) -> Result<RowBatch, AdapterError> {
        Ok(RowBatch::default())
    }

    async fn ping(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    fn engine_type(&self) -> &'static str {
        "mock"
    }

    fn format_creds(&self, _source: &Source) -> Result<String, AdapterError> {
        Ok("mock://".to_string())
    }

    async fn connect(&self, _source: &Source) -> Result<Arc<dyn SqlClient>, AdapterError> {
        Ok(Arc::new(MockClient))
    }

    async fn list_tables_and_views(
        &self,
        _source: &Source,
    ) -> Result<(Vec<String>, Vec<String>), AdapterError> {
        Ok((vec!["orders".to_string()], Vec::new()))
    }

    async fn preview(
        &self,
        _source: &Source,
        _table_name: &str,
        _limit: i64,
    ) -> Result<RowBatch, AdapterError> {
        Ok(self.initial.clone())
    }

    async fn initial_pull(
        &self,
        _source: &Source,
        _table: &TableConfig,
        _batch_pull_size: i64,
    ) -> Result<RowBatch, AdapterError> {
        self.initial_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.initial.clone())
    }

    async fn get_updated_rows(
        &self,
        _source: &Source,
        _table: &TableConfig,
    ) -> Result<RowBatch, AdapterError> {
        self.updated_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.updated.clone())
    }

    async fn get_old_rows(
        &self,
        _source: &Source,
        _table: &TableConfig,
        _batch_pull_size: i64,
    ) -> Result<OldRowsPage, AdapterError> {
        Ok(OldRowsPage {
            rows: self.old_rows.clone(),
            completed: self.old_rows_completed,
        })
    }

    async fn get_primary_keys(
        &self,
        _source: &Source,
        _table: &TableConfig,
        _limit: i64,
    ) -> Result<RowBatch, AdapterError> {
        self.primary_key_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.primary_keys.clone())
    }
}

pub fn mock_source(source_uuid: &str, tables: serde_json::Value) -> Source {
    let config: SourceConfig = serde_json::from_value(serde_json::json!({
        "source_name": "warehouse",
        "engine_type": "mock",
        "creds": {"user": "svc", "ip": "127.0.0.1", "port": 3306, "db_name": "shop"},
        "tables": tables,
    }))
    .unwrap();
    let mut source = Source::from_config(source_uuid.to_string(), config);
    source.connected = true;
    source
}

pub fn table_from_json(value: serde_json::Value) -> TableConfig {
    serde_json::from_value(value).unwrap()
}
