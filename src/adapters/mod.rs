//! Source adapters: per-engine SQL generation and row fetch.
//!
//! Each engine implements [`SourceAdapter`] and registers under its
//! `engine_type` string in an [`AdapterRegistry`]. The trait is the full
//! capability contract the engine and control channel consume; everything
//! dialect-specific (identifier quoting, paging syntax, literal casting)
//! stays inside the adapter modules.

pub mod dialect;

#[cfg(feature = "mssql")]
pub mod mssql;
#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::AdapterError;
use crate::model::{Source, TableConfig, TableRequirements};
use crate::rows::RowBatch;

/// Database connect timeout. Everything slower than this is treated as an
/// unreachable source and retried next cycle.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(4);

/// A live driver connection. Adapters generate SQL; clients run it.
#[async_trait]
pub trait SqlClient: Send + Sync {
    async fn query(&self, sql: &str) -> Result<RowBatch, AdapterError>;

    /// Cheap connectivity probe.
    async fn ping(&self) -> Result<(), AdapterError>;
}

/// Result page of a historical crawl.
pub struct OldRowsPage {
    pub rows: RowBatch,
    /// The page came back short: the crawl has reached the oldest rows.
    pub completed: bool,
}

/// Capability contract implemented per engine.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn engine_type(&self) -> &'static str;

    /// Engines without a usable change cursor keep every table in the
    /// initial-pull mode; no incremental or deletion logic runs for them.
    fn supports_row_updates(&self) -> bool {
        true
    }

    /// Render the connection URI for this source. Fails with `NoDriver` when
    /// the engine's driver cannot run in this build/host.
    fn format_creds(&self, source: &Source) -> Result<String, AdapterError>;

    /// Open a fresh client. Callers hold the result on the source; use
    /// [`refresh_source`] for the idempotent connect-and-record flow.
    async fn connect(&self, source: &Source) -> Result<Arc<dyn SqlClient>, AdapterError>;

    /// Available base tables and views, each sorted ascending.
    async fn list_tables_and_views(
        &self,
        source: &Source,
    ) -> Result<(Vec<String>, Vec<String>), AdapterError>;

    async fn preview(
        &self,
        source: &Source,
        table_name: &str,
        limit: i64,
    ) -> Result<RowBatch, AdapterError>;

    async fn initial_pull(
        &self,
        source: &Source,
        table: &TableConfig,
        batch_pull_size: i64,
    ) -> Result<RowBatch, AdapterError>;

    async fn get_updated_rows(
        &self,
        source: &Source,
        table: &TableConfig,
    ) -> Result<RowBatch, AdapterError>;

    async fn get_old_rows(
        &self,
        source: &Source,
        table: &TableConfig,
        batch_pull_size: i64,
    ) -> Result<OldRowsPage, AdapterError>;

    async fn get_primary_keys(
        &self,
        source: &Source,
        table: &TableConfig,
        limit: i64,
    ) -> Result<RowBatch, AdapterError>;

    /// Dashboard pre-fill hints. Plain relational engines have none.
    fn table_requirements(
        &self,
        _source: &Source,
        _table_name: &str,
    ) -> Option<TableRequirements> {
        None
    }
}

/// Fetch the live client off a source, failing when `refresh_conn` has not
/// succeeded yet.
pub fn client_of(source: &Source) -> Result<Arc<dyn SqlClient>, AdapterError> {
    source.client.clone().ok_or(AdapterError::NotConnected)
}

/// Collapse a single-column result (table/view listings) into strings.
pub(crate) fn first_column_strings(batch: &RowBatch) -> Vec<String> {
    batch
        .rows
        .iter()
        .filter_map(|row| match row.first() {
            Some(crate::rows::Cell::Text(s)) => Some(s.clone()),
            Some(crate::rows::Cell::Int(v)) => Some(v.to_string()),
            _ => None,
        })
        .collect()
}

/// Engine-type keyed capability registry.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every adapter compiled into this build.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        #[cfg(feature = "mysql")]
        registry.register(Arc::new(mysql::MySqlAdapter));
        #[cfg(feature = "postgres")]
        registry.register(Arc::new(postgres::PostgresAdapter));
        #[cfg(feature = "mssql")]
        registry.register(Arc::new(mssql::MssqlAdapter));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.engine_type(), adapter);
    }

    pub fn get(&self, engine_type: &str) -> Result<Arc<dyn SourceAdapter>, AdapterError> {
        self.adapters
            .get(engine_type)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownEngine(engine_type.to_string()))
    }
}

/// Idempotent reconnect: clear the recorded error, open a new client within
/// the connect timeout, and record the outcome on the source.
pub async fn refresh_source(registry: &AdapterRegistry, source: &mut Source) {
    source.error = None;

    let adapter = match registry.get(&source.engine_type) {
        Ok(adapter) => adapter,
        Err(e) => {
            source.connected = false;
            source.error = Some(e.to_string());
            return;
        }
    };

    let connect = tokio::time::timeout(CONNECT_TIMEOUT, adapter.connect(source));
    match connect.await {
        Ok(Ok(client)) => {
            source.client = Some(client);
            source.connected = true;
        }
        Ok(Err(e)) => {
            source.client = None;
            source.connected = false;
            source.error = Some(e.to_string());
        }
        Err(_) => {
            source.client = None;
            source.connected = false;
            source.error = Some(AdapterError::ConnectTimeout(CONNECT_TIMEOUT).to_string());
        }
    }

    if let Some(error) = &source.error {
        tracing::warn!(
            source_uuid = %source.source_uuid,
            %error,
            "failed to refresh connection"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullAdapter;

    #[async_trait]
    impl SourceAdapter for NullAdapter {
        fn engine_type(&self) -> &'static str {
            "null"
        }

        fn format_creds(&self, _source: &Source) -> Result<String, AdapterError> {
            Ok("null://".to_string())
        }

        async fn connect(&self, _source: &Source) -> Result<Arc<dyn SqlClient>, AdapterError> {
            Err(AdapterError::SourceConnect("always offline".to_string()))
        }

        async fn list_tables_and_views(
            &self,
            _source: &Source,
        ) -> Result<(Vec<String>, Vec<String>), AdapterError> {
            Ok((Vec::new(), Vec::new()))
        }

        async fn preview(
            &self,
            _source: &Source,
            _table_name: &str,
            _limit: i64,
        ) -> Result<RowBatch, AdapterError> {
            Ok(RowBatch::default())
        }

        async fn initial_pull(
            &self,
            _source: &Source,
            _table: &TableConfig,
            _batch_pull_size: i64,
        ) -> Result<RowBatch, AdapterError> {
            Ok(RowBatch::default())
        }

        async fn get_updated_rows(
            &self,
            _source: &Source,
            _table: &TableConfig,
        ) -> Result<RowBatch, AdapterError> {
            Ok(RowBatch::default())
        }

        async fn get_old_rows(
            &self,
            _source: &Source,
            _table: &TableConfig,
            _batch_pull_size: i64,
        ) -> Result<OldRowsPage, AdapterError> {
            Ok(OldRowsPage {
                rows: RowBatch::default(),
                completed: true,
            })
        }

        async fn get_primary_keys(
            &self,
            _source: &Source,
            _table: &TableConfig,
            _limit: i64,
        ) -> Result<RowBatch, AdapterError> {
            Ok(RowBatch::default())
        }
    }

    fn offline_source() -> Source {
        let config: crate::model::SourceConfig = serde_json::from_value(serde_json::json!({
            "source_name": "s",
            "engine_type": "null",
            "creds": {"user": "u", "ip": "127.0.0.1", "port": 1, "db_name": "d"},
        }))
        .unwrap();
        Source::from_config("src".to_string(), config)
    }

    #[tokio::test]
    async fn refresh_records_connect_failure() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(NullAdapter));
        let mut source = offline_source();

        refresh_source(&registry, &mut source).await;
        assert!(!source.connected);
        assert!(source.error_message().contains("always offline"));
        assert!(source.client.is_none());
    }

    #[tokio::test]
    async fn refresh_rejects_unknown_engine() {
        let registry = AdapterRegistry::new();
        let mut source = offline_source();

        refresh_source(&registry, &mut source).await;
        assert!(!source.connected);
        assert!(source.error_message().contains("No adapter registered"));
    }

    #[test]
    fn client_of_requires_refresh() {
        let source = offline_source();
        assert!(matches!(
            client_of(&source),
            Err(AdapterError::NotConnected)
        ));
    }
}
