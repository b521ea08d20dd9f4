//! Source and table configuration as pushed by the remote service.
//!
//! The remote owns this state: every `agent_info` push replaces the local
//! view. Deserialization is tolerant about scalar shapes (numbers vs.
//! strings) because the upstream config store does not normalize them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use secrecy::SecretString;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

use crate::adapters::SqlClient;

/// Sync mode for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Full bulk pull; also the forced mode for adapters without row-update
    /// support.
    Initial,
    /// Cursor-driven incremental pull.
    Incremental,
}

impl SyncStatus {
    pub fn as_int(self) -> i64 {
        match self {
            SyncStatus::Initial => 1,
            SyncStatus::Incremental => 3,
        }
    }
}

impl Serialize for SyncStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.as_int())
    }
}

impl<'de> Deserialize<'de> for SyncStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        let as_int = match &raw {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        match as_int {
            Some(1) => Ok(SyncStatus::Initial),
            Some(3) => Ok(SyncStatus::Incremental),
            _ => Err(de::Error::custom(format!("invalid sync_status: {raw}"))),
        }
    }
}

/// Scalar config values arrive as numbers or strings; keep the textual form.
fn flexible_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::Bool(b)) => Some(b.to_string()),
        Some(other) => Some(other.to_string()),
    })
}

/// One predicate of a table's query filter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryFilterItem {
    pub column: String,
    pub relational_operator: String,
    pub logical_operator: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub value: Option<String>,
}

/// The filter ships either as a bare list or wrapped in `{"items": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum QueryFilter {
    Items(Vec<QueryFilterItem>),
    Wrapped { items: Vec<QueryFilterItem> },
}

impl QueryFilter {
    pub fn items(&self) -> &[QueryFilterItem] {
        match self {
            QueryFilter::Items(items) => items,
            QueryFilter::Wrapped { items } => items,
        }
    }
}

fn default_crawler_step() -> i64 {
    0
}

/// A configured extraction target within a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub table_name: String,
    #[serde(default)]
    pub primary_key: Option<String>,
    /// The incremental cursor column. The wire format still calls this
    /// `last_update`.
    #[serde(rename = "last_update", default)]
    pub ordering_key: Option<String>,
    #[serde(default)]
    pub relevant_columns: Vec<String>,
    pub sync_status: SyncStatus,
    #[serde(default, deserialize_with = "flexible_string")]
    pub last_update_value: Option<String>,
    #[serde(default, deserialize_with = "flexible_string")]
    pub last_update_pk: Option<String>,
    #[serde(default = "default_crawler_step")]
    pub crawler_step: i64,
    #[serde(default)]
    pub crawler_step_info: Option<String>,
    #[serde(default)]
    pub check_for_deleted_rows_counter: i64,
    #[serde(default)]
    pub large_table: bool,
    #[serde(default)]
    pub large_table_row_limit: i64,
    #[serde(default)]
    pub batch_pull_size: Option<i64>,
    #[serde(default)]
    pub import_old_rows: bool,
    #[serde(default)]
    pub use_query_filter: bool,
    #[serde(default)]
    pub query_filter: Option<QueryFilter>,
    #[serde(default)]
    pub force_dtypes: Option<HashMap<String, String>>,
    #[serde(default)]
    pub column_timezones: Option<HashMap<String, String>>,
    #[serde(default)]
    pub processing_data: bool,
    /// Epoch seconds of the last completed sync for this table.
    #[serde(default)]
    pub last_sync: f64,
    /// Remote config changed; the next cycle must re-initialize.
    #[serde(default)]
    pub dirty: bool,
}

impl TableConfig {
    pub fn batch_pull_size(&self) -> i64 {
        self.batch_pull_size.unwrap_or(10_000)
    }

    /// `relevant_columns`, guaranteed to contain the primary and ordering
    /// keys when those are set.
    pub fn effective_columns(&self) -> Vec<String> {
        let mut columns = self.relevant_columns.clone();
        for key in [&self.primary_key, &self.ordering_key] {
            if let Some(key) = key {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        columns
    }

    /// Reset applied when the remote replaces this table's configuration.
    pub fn mark_replaced(&mut self) {
        self.sync_status = SyncStatus::Initial;
        self.crawler_step = 1;
        self.crawler_step_info = None;
        self.last_update_value = None;
        self.last_update_pk = None;
        self.dirty = true;
    }
}

/// Connection descriptor delivered alongside the encrypted secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub user: String,
    pub ip: String,
    #[serde(deserialize_with = "flexible_port")]
    pub port: u16,
    pub db_name: String,
}

fn flexible_port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    let raw = serde_json::Value::deserialize(deserializer)?;
    match &raw {
        serde_json::Value::Number(n) => n.as_u64().and_then(|v| u16::try_from(v).ok()),
        serde_json::Value::String(s) => s.trim().parse::<u16>().ok(),
        _ => None,
    }
    .ok_or_else(|| de::Error::custom(format!("invalid port: {raw}")))
}

/// Source configuration as delivered in `agent_info`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub source_name: Option<String>,
    pub engine_type: String,
    /// Vault ciphertext of the connection password.
    #[serde(rename = "key", default)]
    pub encrypted_secret: Option<String>,
    #[serde(rename = "creds")]
    pub connection: ConnectionDescriptor,
    #[serde(default)]
    pub tables: HashMap<String, TableConfig>,
}

/// A source plus its runtime connection state.
#[derive(Clone)]
pub struct Source {
    pub source_uuid: String,
    pub source_name: Option<String>,
    pub engine_type: String,
    pub encrypted_secret: Option<String>,
    pub connection: ConnectionDescriptor,
    /// Unwrapped connection password.
    pub secret: Option<SecretString>,
    pub connected: bool,
    pub error: Option<String>,
    /// Live driver handle, present after a successful `refresh_conn`.
    pub client: Option<Arc<dyn SqlClient>>,
    pub tables: HashMap<String, TableConfig>,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("source_uuid", &self.source_uuid)
            .field("source_name", &self.source_name)
            .field("engine_type", &self.engine_type)
            .field("connected", &self.connected)
            .field("error", &self.error)
            .field("tables", &self.tables.len())
            .finish()
    }
}

impl Source {
    pub fn from_config(source_uuid: String, config: SourceConfig) -> Self {
        Self {
            source_uuid,
            source_name: config.source_name,
            engine_type: config.engine_type,
            encrypted_secret: config.encrypted_secret,
            connection: config.connection,
            secret: None,
            connected: false,
            error: None,
            client: None,
            tables: config.tables,
        }
    }

    pub fn display_name(&self) -> &str {
        self.source_name.as_deref().unwrap_or(&self.source_uuid)
    }

    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "No error message.".to_string())
    }
}

/// Claims decoded from the bearer token's middle segment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub paused: bool,
}

/// Pre-fill hints an adapter can offer the dashboard for a table.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRequirements {
    pub primary_key: Option<String>,
    pub last_update: Option<String>,
    pub deleted_rows_sort_column: &'static str,
    pub required_relevant_columns: Vec<String>,
    pub prebuilt_column_links: HashMap<String, serde_json::Value>,
    pub column_aliases: HashMap<String, String>,
}
