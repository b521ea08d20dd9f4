//! Agent runtime: shared state, inbound message handling, and the worker
//! process entry point.
//!
//! `data_sources` is the process-local view of remote configuration. The
//! control-channel dispatcher and the sync engine both work off it; every
//! mutation goes through the `RwLock` here.

use std::collections::HashMap;
use std::sync::Arc;

use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::sync::{RwLock, Semaphore, mpsc};

use crate::adapters::{AdapterRegistry, SourceAdapter, refresh_source};
use crate::channel::protocol::{InboundFrame, RpcMeta};
use crate::channel::{ChannelHandle, control_channel};
use crate::config::Config;
use crate::engine;
use crate::error::Result;
use crate::model::{Source, SourceConfig, TableConfig};
use crate::state::StateStore;
use crate::vault;

/// Upper bound on concurrent per-table pulls, so one busy cycle cannot
/// exhaust customer database connection limits.
const TABLE_CONCURRENCY: usize = 8;

const COLUMN_VALUES_PREVIEW_ROWS: i64 = 2000;
const COLUMN_VALUES_LIMIT: usize = 500;

/// Shared context for the worker process.
pub struct Agent {
    pub config: Config,
    pub registry: AdapterRegistry,
    pub store: Arc<StateStore>,
    pub channel: ChannelHandle,
    pub sources: RwLock<HashMap<String, Source>>,
    pub table_permits: Arc<Semaphore>,
}

impl Agent {
    pub fn new(
        config: Config,
        registry: AdapterRegistry,
        store: Arc<StateStore>,
        channel: ChannelHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            store,
            channel,
            sources: RwLock::new(HashMap::new()),
            table_permits: Arc::new(Semaphore::new(TABLE_CONCURRENCY)),
        })
    }

    /// Drain inbound control-channel frames, handling each concurrently.
    pub async fn dispatch(self: Arc<Self>, mut inbound_rx: mpsc::Receiver<InboundFrame>) {
        while let Some(frame) = inbound_rx.recv().await {
            let agent = Arc::clone(&self);
            tokio::spawn(async move { agent.handle_message(frame).await });
        }
    }

    pub async fn handle_message(self: Arc<Self>, frame: InboundFrame) {
        if frame.message_type == "agent_info" {
            if let Err(e) = self.apply_agent_info(frame.message_body).await {
                tracing::error!(error = %e, "failed to apply agent_info");
            }
            return;
        }

        let meta = RpcMeta::from_body(&frame.message_body);
        let result = self
            .handle_rpc(&frame.message_type, &frame.message_body)
            .await;

        match meta {
            Some(meta) => {
                let (message, error_message) = match result {
                    Ok(response) => (response, String::new()),
                    Err(error) => {
                        tracing::warn!(
                            message_type = %frame.message_type,
                            %error,
                            "rpc handler failed"
                        );
                        (Value::Bool(false), error)
                    }
                };
                if let Err(e) = self
                    .channel
                    .send(&frame.message_type, meta.reply(message, &error_message))
                    .await
                {
                    tracing::warn!(error = %e, "rpc reply send failed");
                }
            }
            None => {
                if let Err(error) = result {
                    tracing::warn!(
                        message_type = %frame.message_type,
                        %error,
                        "handler failed (no reply requested)"
                    );
                }
            }
        }
    }

    /// Replace source configuration from a remote push, unwrap secrets,
    /// connect, and trigger a sync pass.
    async fn apply_agent_info(self: &Arc<Self>, body: Value) -> std::result::Result<(), String> {
        let configs: HashMap<String, SourceConfig> = match body {
            Value::String(raw) => serde_json::from_str(&raw).map_err(|e| e.to_string())?,
            other => serde_json::from_value(other).map_err(|e| e.to_string())?,
        };

        let master_key = self.config.identity.dbkey.clone();
        let prepared = futures::future::join_all(configs.into_iter().map(|(uuid, config)| {
            let master_key = master_key.clone();
            let registry = &self.registry;
            async move {
                let mut source = Source::from_config(uuid.clone(), config);
                if let Some(ciphertext) = source.encrypted_secret.clone() {
                    match vault::decrypt_secret_blocking(ciphertext, master_key, uuid.clone())
                        .await
                    {
                        Ok(plain) => source.secret = Some(SecretString::from(plain)),
                        Err(e) => {
                            tracing::warn!(source_uuid = %uuid, error = %e, "secret unwrap failed");
                            source.connected = false;
                            source.error = Some("Invalid credentials.".to_string());
                        }
                    }
                }
                if source.error.is_none() {
                    refresh_source(registry, &mut source).await;
                }
                (uuid, source)
            }
        }))
        .await;

        {
            let mut sources = self.sources.write().await;
            for (uuid, source) in prepared {
                sources.insert(uuid, source);
            }
        }

        let agent = Arc::clone(self);
        tokio::spawn(engine::sync(agent));
        Ok(())
    }

    async fn handle_rpc(
        &self,
        message_type: &str,
        body: &Value,
    ) -> std::result::Result<Value, String> {
        match message_type {
            "GET_TABLES_AND_VIEWS" => self.get_tables_and_views(body).await,
            "GET_TABLE_PREVIEW" => self.get_table_preview(body).await,
            "GET_TABLE_COLUMNS" => self.get_table_columns(body).await,
            "UPDATE_TABLE_INFO" => self.update_table_info(body).await,
            "SAVE_DATA_SOURCE" => self.save_data_source(body).await,
            "CHECK_SOURCE_STATUS" => self.check_source_status(body).await,
            "DELETE_SOURCE" => self.delete_source(body).await,
            "DELETE_TABLE" => self.delete_table(body).await,
            "GET_COLUMN_VALUES_FROM_AGENT" => self.get_column_values(body).await,
            "CHECK_DATASET_ACCESS" => self.check_dataset_access(body).await,
            other => {
                tracing::warn!(message_type = %other, "unrecognized message type");
                Ok(Value::Null)
            }
        }
    }

    // ==================== RPC operations ====================

    async fn get_tables_and_views(&self, body: &Value) -> std::result::Result<Value, String> {
        let source_uuid = require_str(body, "source_uuid")?;
        let source = self.source_clone(&source_uuid).await?;
        let adapter = self.adapter_for(&source)?;

        match adapter.list_tables_and_views(&source).await {
            Ok((tables, views)) => Ok(json!({
                "source_uuid": source_uuid,
                "TableNames": tables,
                "ViewNames": views,
            })),
            Err(e) => {
                tracing::warn!(error = %e, "failed to get tables and views");
                Ok(Value::Bool(false))
            }
        }
    }

    async fn get_table_preview(&self, body: &Value) -> std::result::Result<Value, String> {
        let source_uuid = require_str(body, "source_uuid")?;
        let table_name = require_str(body, "table_name")?;
        let number_of_rows = body
            .get("number_of_rows")
            .and_then(Value::as_i64)
            .unwrap_or(100);

        let source = self.source_clone(&source_uuid).await?;
        let adapter = self.adapter_for(&source)?;
        let preview = adapter
            .preview(&source, &table_name, number_of_rows)
            .await
            .map_err(|e| e.to_string())?;
        let requirements = adapter.table_requirements(&source, &table_name);

        Ok(json!({
            "table_preview": preview.to_wire(None),
            "source_uuid": source_uuid,
            "table_name": table_name,
            "table_requirements": requirements,
        }))
    }

    async fn get_table_columns(&self, body: &Value) -> std::result::Result<Value, String> {
        let source_uuid = require_str(body, "source_uuid")?;
        let table_name = require_str(body, "table_name")?;
        let source = self.source_clone(&source_uuid).await?;
        let adapter = self.adapter_for(&source)?;
        let preview = adapter
            .preview(&source, &table_name, 1)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!(preview.columns))
    }

    async fn update_table_info(&self, body: &Value) -> std::result::Result<Value, String> {
        let table_name = require_str(body, "table_name")?;
        let source_uuid = require_str(body, "fk_source_uuid")?;
        let table_uuid = require_str(body, "pk_table_uuid")?;

        let mut info = body
            .get("table_info")
            .cloned()
            .ok_or_else(|| "message has no table_info".to_string())?;
        info["table_name"] = json!(table_name);
        info["sync_status"] = json!(1);
        let mut table: TableConfig =
            serde_json::from_value(info).map_err(|e| e.to_string())?;
        table.mark_replaced();

        {
            let mut sources = self.sources.write().await;
            let source = sources
                .get_mut(&source_uuid)
                .ok_or_else(|| format!("unknown source {source_uuid}"))?;
            source.tables.insert(table_uuid.clone(), table);
        }
        self.store
            .reset_table_sync(&table_uuid)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!(true))
    }

    async fn save_data_source(&self, body: &Value) -> std::result::Result<Value, String> {
        let source_uuid = require_str(body, "pk_source_uuid")?;
        let source_name = require_str(body, "source_name")?;

        let secret = match body.get("key").and_then(Value::as_str) {
            Some(encrypted) => Some(
                vault::decrypt_secret_blocking(
                    encrypted.to_string(),
                    self.config.identity.dbkey.clone(),
                    source_uuid.clone(),
                )
                .await
                .map_err(|e| {
                    tracing::warn!(source_uuid = %source_uuid, error = %e, "secret unwrap failed");
                    "Invalid credentials.".to_string()
                })?,
            ),
            None => None,
        };

        let config: SourceConfig = serde_json::from_value(body.clone())
            .map_err(|_| "Invalid credentials.".to_string())?;
        let mut source = Source::from_config(source_uuid.clone(), config);
        source.secret = secret.map(SecretString::from);

        // Keep the tables already configured on this source.
        if let Some(existing) = self.sources.read().await.get(&source_uuid) {
            source.tables = existing.tables.clone();
        }

        tracing::info!(source_uuid = %source_uuid, "refreshing conn");
        refresh_source(&self.registry, &mut source).await;

        let status = source.connected;
        let error = source.error_message();
        self.store
            .upsert_connection_info(
                &source_uuid,
                &source_name,
                status,
                if status { "Good to go!" } else { error.as_str() },
            )
            .await
            .map_err(|e| e.to_string())?;

        self.sources.write().await.insert(source_uuid.clone(), source);

        Ok(json!({
            "source_uuid": source_uuid,
            "encrypted_password": Value::Null,
            "status": status,
            "error": error,
        }))
    }

    async fn check_source_status(&self, body: &Value) -> std::result::Result<Value, String> {
        let source_uuid = require_str(body, "source_uuid")?;
        let source = self
            .refresh_source_entry(&source_uuid)
            .await
            .ok_or_else(|| format!("unknown source {source_uuid}"))?;
        Ok(json!({
            "status": source.connected,
            "error": source.error_message(),
            "source_uuid": source_uuid,
        }))
    }

    async fn delete_source(&self, body: &Value) -> std::result::Result<Value, String> {
        let source_uuid = require_str(body, "source_uuid")?;
        self.sources.write().await.remove(&source_uuid);
        self.store
            .delete_connection_info(&source_uuid)
            .await
            .map_err(|e| e.to_string())?;
        Ok(Value::Null)
    }

    async fn delete_table(&self, body: &Value) -> std::result::Result<Value, String> {
        let source_uuid = require_str(body, "source_uuid")?;
        let table_uuid = require_str(body, "table_uuid")?;
        let mut sources = self.sources.write().await;
        if let Some(source) = sources.get_mut(&source_uuid) {
            source.tables.remove(&table_uuid);
        }
        Ok(Value::Null)
    }

    async fn get_column_values(&self, body: &Value) -> std::result::Result<Value, String> {
        let source_uuid = require_str(body, "source_uuid")?;
        let table_name = require_str(body, "table_name")?;
        let source = self.source_clone(&source_uuid).await?;
        let adapter = self.adapter_for(&source)?;
        let preview = adapter
            .preview(&source, &table_name, COLUMN_VALUES_PREVIEW_ROWS)
            .await
            .map_err(|e| e.to_string())?;

        let mut out = serde_json::Map::new();
        for (idx, column) in preview.columns.iter().enumerate() {
            let mut seen = std::collections::HashSet::new();
            let mut values = Vec::new();
            for row in &preview.rows {
                let rendered = match &row[idx] {
                    crate::rows::Cell::Null => "NULL".to_string(),
                    cell => cell.csv_value(),
                };
                if seen.insert(rendered.clone()) {
                    values.push(rendered);
                    if values.len() >= COLUMN_VALUES_LIMIT {
                        break;
                    }
                }
            }
            out.insert(column.clone(), json!(values));
        }
        Ok(Value::Object(out))
    }

    async fn check_dataset_access(&self, body: &Value) -> std::result::Result<Value, String> {
        let source_names = body.get("source_names").cloned().unwrap_or(Value::Null);
        let tables_by_source: HashMap<String, Vec<String>> = body
            .get("tables_by_source")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| e.to_string())?
            .unwrap_or_default();

        let mut access = serde_json::Map::new();
        for (source_uuid, tables) in tables_by_source {
            let probe = async {
                let source = self.source_clone(&source_uuid).await?;
                let adapter = self.adapter_for(&source)?;
                Ok::<_, String>((source, adapter))
            };
            match probe.await {
                Err(e) => {
                    access.insert(source_uuid, json!({"error": e}));
                }
                Ok((source, adapter)) => {
                    let mut table_results = serde_json::Map::new();
                    for table in tables {
                        let entry = match adapter.preview(&source, &table, 1).await {
                            Ok(_) => json!({"error": Value::Null, "success": true}),
                            Err(e) => json!({"error": e.to_string(), "success": false}),
                        };
                        table_results.insert(table, entry);
                    }
                    access.insert(
                        source_uuid,
                        json!({"error": Value::Null, "tables": table_results}),
                    );
                }
            }
        }

        Ok(json!({"source_names": source_names, "access": access}))
    }

    // ==================== shared state helpers ====================

    pub async fn source_clone(&self, source_uuid: &str) -> std::result::Result<Source, String> {
        self.sources
            .read()
            .await
            .get(source_uuid)
            .cloned()
            .ok_or_else(|| format!("unknown source {source_uuid}"))
    }

    fn adapter_for(
        &self,
        source: &Source,
    ) -> std::result::Result<Arc<dyn SourceAdapter>, String> {
        self.registry
            .get(&source.engine_type)
            .map_err(|e| e.to_string())
    }

    /// Reconnect one source in place and return the refreshed snapshot.
    pub async fn refresh_source_entry(&self, source_uuid: &str) -> Option<Source> {
        let mut sources = self.sources.write().await;
        let source = sources.get_mut(source_uuid)?;
        refresh_source(&self.registry, source).await;
        Some(source.clone())
    }

    /// A dirtied large table restarts from a full pull; reflect that in the
    /// shared view.
    pub async fn clear_table_dirty(&self, source_uuid: &str, table_uuid: &str) {
        let mut sources = self.sources.write().await;
        if let Some(table) = sources
            .get_mut(source_uuid)
            .and_then(|s| s.tables.get_mut(table_uuid))
        {
            table.dirty = false;
            table.sync_status = crate::model::SyncStatus::Initial;
        }
    }

    /// Persist batch-pull mutations (crawler completion, forced sync mode)
    /// until the next remote config push.
    pub async fn write_back_table(
        &self,
        source_uuid: &str,
        table_uuid: &str,
        after: &TableConfig,
    ) {
        let mut sources = self.sources.write().await;
        if let Some(table) = sources
            .get_mut(source_uuid)
            .and_then(|s| s.tables.get_mut(table_uuid))
        {
            table.crawler_step_info = after.crawler_step_info.clone();
            table.sync_status = after.sync_status;
        }
    }
}

fn require_str(body: &Value, key: &str) -> std::result::Result<String, String> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("message has no {key}"))
}

/// Worker process entry point: wire the channel, dispatcher, and sync loop,
/// then serve until the supervisor kills us.
pub async fn run_worker() -> Result<()> {
    let config = Config::load().map_err(crate::error::Error::Config)?;
    let store = Arc::new(
        StateStore::open(&config.state_db)
            .await
            .map_err(crate::error::Error::State)?,
    );
    let registry = AdapterRegistry::with_builtin();

    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let (channel, handle) = control_channel(
        config.websocket_url(),
        config.identity.clone(),
        Arc::clone(&store),
        inbound_tx,
    );

    tracing::info!(version = %crate::config::version(), "sync agent worker starting");

    let agent = Agent::new(config, registry, store, handle);
    tokio::spawn(channel.run());
    tokio::spawn(engine::sync_loop(Arc::clone(&agent)));

    agent.dispatch(inbound_rx).await;
    Ok(())
}
