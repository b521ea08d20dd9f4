//! Local state store.
//!
//! A single embedded database (`sync_info.db`) shared by the supervisor, the
//! worker, and large-table worker processes, plus the operator dashboard
//! which reads it directly. Cross-process coordination relies on OS-level
//! file locking; every operation opens a fresh connection and sets a busy
//! timeout so concurrent writers retry instead of failing.
//!
//! Statements are plain string SQL; every interpolated value goes through
//! [`sql_escape`].

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use libsql::Connection;

use crate::error::StateError;

/// Escape a value for embedding in a single-quoted SQL literal: double
/// single quotes, escape backslashes, strip newlines, escape percent signs.
pub fn sql_escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\'', "''")
        .replace('%', "%%")
        .replace('\n', " ")
}

/// Wall-clock time as fractional epoch seconds, the unit the dashboard and
/// the worker heartbeats agree on.
pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// The three fixed `agent_errors` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentErrorKind {
    Authentication,
    AgentConnection,
    AgentFailure,
}

impl AgentErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::AgentConnection => "agent_connection",
            Self::AgentFailure => "agent_failure",
        }
    }
}

/// One `table_sync_info` row.
#[derive(Debug, Clone, Default)]
pub struct TableSyncInfo {
    pub last_update: f64,
    pub in_progress: Option<String>,
    pub heartbeat: f64,
    pub checked_for_deleted_rows: Option<f64>,
}

/// Gate for spawning a large-table worker: open when no row exists, or when
/// more than 15 minutes have passed since `last_update` and the previous
/// worker is either not marked in-progress or has a heartbeat older than 60
/// seconds.
pub fn big_table_gate_open(info: Option<&TableSyncInfo>, now: f64) -> bool {
    match info {
        None => true,
        Some(row) => {
            now - row.last_update > 60.0 * 15.0
                && (row.in_progress.as_deref() != Some("true") || now - row.heartbeat > 60.0)
        }
    }
}

/// Handle to the local state database.
pub struct StateStore {
    db: libsql::Database,
}

impl StateStore {
    /// Open (and bootstrap, when empty) the state database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StateError::Open(e.to_string()))?;
        let store = Self { db };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Fresh connection with a busy timeout so concurrent writers from other
    /// processes get retried instead of surfacing "database is locked".
    async fn connect(&self) -> Result<Connection, StateError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| StateError::Open(e.to_string()))?;
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| StateError::Open(e.to_string()))?;
        Ok(conn)
    }

    async fn bootstrap(&self) -> Result<(), StateError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query("SELECT name FROM sqlite_master WHERE type='table'", ())
            .await?;
        if rows.next().await?.is_some() {
            return Ok(());
        }

        conn.execute_batch(
            r#"
            CREATE TABLE connection_info
                (source_uuid TEXT PRIMARY KEY, name TEXT, status TEXT, error TEXT, last_update TEXT);

            CREATE TABLE sync_info (sync_time REAL, last_update TEXT);

            CREATE TABLE agent_errors (kind TEXT, status TEXT, last_update TEXT);

            CREATE TABLE agent_commands (command TEXT, last_update TEXT);

            CREATE TABLE table_sync_info
                (table_uuid TEXT PRIMARY KEY, last_update REAL, in_progress TEXT,
                 heartbeat REAL, checked_for_deleted_rows REAL);

            CREATE TABLE big_table_cursors
                (table_uuid TEXT PRIMARY KEY, last_update_value TEXT, updated_at REAL);

            INSERT INTO sync_info (sync_time, last_update)
            VALUES (0, CURRENT_TIMESTAMP);

            INSERT INTO agent_errors (kind, status, last_update)
            VALUES ('authentication', 'Not Authenticated', CURRENT_TIMESTAMP);
            INSERT INTO agent_errors (kind, status, last_update)
            VALUES ('agent_connection', 'Not Connected', CURRENT_TIMESTAMP);
            INSERT INTO agent_errors (kind, status, last_update)
            VALUES ('agent_failure', 'Failed', CURRENT_TIMESTAMP);

            INSERT INTO agent_commands (command, last_update)
            VALUES ('continue', CURRENT_TIMESTAMP);
            "#,
        )
        .await?;
        Ok(())
    }

    // ==================== connection_info ====================

    /// Upsert the status row for one source. `status` is stored in the
    /// `True`/`False` form the dashboard renders.
    pub async fn upsert_connection_info(
        &self,
        source_uuid: &str,
        name: &str,
        status: bool,
        error: &str,
    ) -> Result<(), StateError> {
        let status = if status { "True" } else { "False" };
        let sql = format!(
            r#"
            UPDATE connection_info
            SET name = '{name}', status = '{status}', error = '{error}',
                last_update = CURRENT_TIMESTAMP
            WHERE source_uuid = '{uuid}';
            INSERT INTO connection_info (source_uuid, name, status, error, last_update)
                SELECT '{uuid}', '{name}', '{status}', '{error}', CURRENT_TIMESTAMP
                WHERE NOT EXISTS
                    (SELECT 1 FROM connection_info WHERE source_uuid = '{uuid}');
            "#,
            uuid = sql_escape(source_uuid),
            name = sql_escape(name),
            status = status,
            error = sql_escape(error),
        );
        self.connect().await?.execute_batch(&sql).await?;
        Ok(())
    }

    /// Drop the status row for a deleted source.
    pub async fn delete_connection_info(&self, source_uuid: &str) -> Result<(), StateError> {
        let sql = format!(
            "DELETE FROM connection_info WHERE source_uuid = '{}'",
            sql_escape(source_uuid)
        );
        self.connect().await?.execute(&sql, ()).await?;
        Ok(())
    }

    // ==================== sync_info ====================

    /// Record one sync cycle's wall-clock duration and prune history older
    /// than a day.
    pub async fn insert_sync_time(&self, sync_time: f64) -> Result<(), StateError> {
        let sql = format!(
            r#"
            INSERT INTO sync_info (sync_time, last_update)
            VALUES ({sync_time}, CURRENT_TIMESTAMP);

            DELETE FROM sync_info
            WHERE last_update < DATE('now', '-1 days');
            "#,
        );
        self.connect().await?.execute_batch(&sql).await?;
        Ok(())
    }

    /// Most recent sync cycle: `(duration_seconds, last_update)`.
    pub async fn latest_sync_info(&self) -> Result<(f64, String), StateError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT sync_time, last_update FROM sync_info ORDER BY rowid DESC LIMIT 1",
                (),
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok((
                row.get::<f64>(0).unwrap_or(0.0),
                row.get::<String>(1).unwrap_or_default(),
            )),
            None => Err(StateError::MissingRow("sync_info")),
        }
    }

    // ==================== agent_errors ====================

    /// Update one of the three fixed error rows.
    pub async fn set_agent_error(
        &self,
        kind: AgentErrorKind,
        status: &str,
    ) -> Result<(), StateError> {
        let sql = format!(
            r#"
            UPDATE agent_errors
            SET status = '{status}', last_update = CURRENT_TIMESTAMP
            WHERE kind = '{kind}';
            "#,
            status = sql_escape(status),
            kind = kind.as_str(),
        );
        self.connect().await?.execute(&sql, ()).await?;
        Ok(())
    }

    pub async fn agent_error_status(&self, kind: AgentErrorKind) -> Result<String, StateError> {
        let conn = self.connect().await?;
        let sql = format!(
            "SELECT status FROM agent_errors WHERE kind = '{}'",
            kind.as_str()
        );
        let mut rows = conn.query(&sql, ()).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<String>(0).unwrap_or_default()),
            None => Err(StateError::MissingRow("agent_errors")),
        }
    }

    // ==================== agent_commands ====================

    /// Current dashboard command (`continue` when unset).
    pub async fn read_command(&self) -> Result<String, StateError> {
        let conn = self.connect().await?;
        let mut rows = conn.query("SELECT command FROM agent_commands", ()).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<String>(0).unwrap_or_else(|_| "continue".into())),
            None => Ok("continue".to_string()),
        }
    }

    pub async fn set_command(&self, command: &str) -> Result<(), StateError> {
        let sql = format!(
            r#"
            UPDATE agent_commands
            SET command = '{}', last_update = CURRENT_TIMESTAMP;
            "#,
            sql_escape(command)
        );
        self.connect().await?.execute(&sql, ()).await?;
        Ok(())
    }

    // ==================== table_sync_info ====================

    pub async fn table_sync_info(
        &self,
        table_uuid: &str,
    ) -> Result<Option<TableSyncInfo>, StateError> {
        let conn = self.connect().await?;
        let sql = format!(
            "SELECT last_update, in_progress, heartbeat, checked_for_deleted_rows \
             FROM table_sync_info WHERE table_uuid = '{}'",
            sql_escape(table_uuid)
        );
        let mut rows = conn.query(&sql, ()).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(TableSyncInfo {
                last_update: row.get::<f64>(0).unwrap_or(0.0),
                in_progress: row.get::<String>(1).ok(),
                heartbeat: row.get::<f64>(2).unwrap_or(0.0),
                checked_for_deleted_rows: row.get::<f64>(3).ok(),
            })),
            None => Ok(None),
        }
    }

    /// Stamp a table's `last_update` with the current time, inserting the row
    /// on first contact.
    pub async fn touch_table_sync(&self, table_uuid: &str) -> Result<(), StateError> {
        let now = epoch_now();
        let uuid = sql_escape(table_uuid);
        let conn = self.connect().await?;
        if self.table_sync_info(table_uuid).await?.is_none() {
            let sql = format!(
                "INSERT INTO table_sync_info (table_uuid, last_update) VALUES ('{uuid}', {now})"
            );
            conn.execute(&sql, ()).await?;
        } else {
            let sql = format!(
                "UPDATE table_sync_info SET last_update = {now} WHERE table_uuid = '{uuid}'"
            );
            conn.execute(&sql, ()).await?;
        }
        Ok(())
    }

    /// Reset a table's sync stamp so the next cycle re-dispatches it
    /// immediately (remote config changed).
    pub async fn reset_table_sync(&self, table_uuid: &str) -> Result<(), StateError> {
        let sql = format!(
            "UPDATE table_sync_info SET last_update = 0 WHERE table_uuid = '{}'",
            sql_escape(table_uuid)
        );
        self.connect().await?.execute(&sql, ()).await?;
        Ok(())
    }

    /// Large-table worker heartbeat: alive and holding the table.
    pub async fn worker_heartbeat(&self, table_uuid: &str) -> Result<(), StateError> {
        let sql = format!(
            "UPDATE table_sync_info SET in_progress = 'true', heartbeat = {} \
             WHERE table_uuid = '{}'",
            epoch_now(),
            sql_escape(table_uuid)
        );
        self.connect().await?.execute(&sql, ()).await?;
        Ok(())
    }

    pub async fn worker_finished(&self, table_uuid: &str) -> Result<(), StateError> {
        let sql = format!(
            "UPDATE table_sync_info SET in_progress = 'false' WHERE table_uuid = '{}'",
            sql_escape(table_uuid)
        );
        self.connect().await?.execute(&sql, ()).await?;
        Ok(())
    }

    pub async fn set_checked_for_deleted_rows(&self, table_uuid: &str) -> Result<(), StateError> {
        let sql = format!(
            "UPDATE table_sync_info SET checked_for_deleted_rows = {} WHERE table_uuid = '{}'",
            epoch_now(),
            sql_escape(table_uuid)
        );
        self.connect().await?.execute(&sql, ()).await?;
        Ok(())
    }

    // ==================== big_table_cursors ====================

    /// Incremental cursor captured by the most recent large-table run.
    pub async fn big_table_cursor(&self, table_uuid: &str) -> Result<Option<String>, StateError> {
        let conn = self.connect().await?;
        let sql = format!(
            "SELECT last_update_value FROM big_table_cursors WHERE table_uuid = '{}'",
            sql_escape(table_uuid)
        );
        let mut rows = conn.query(&sql, ()).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<String>(0).ok()),
            None => Ok(None),
        }
    }

    pub async fn set_big_table_cursor(
        &self,
        table_uuid: &str,
        value: &str,
    ) -> Result<(), StateError> {
        let uuid = sql_escape(table_uuid);
        let value = sql_escape(value);
        let now = epoch_now();
        let sql = format!(
            r#"
            UPDATE big_table_cursors
            SET last_update_value = '{value}', updated_at = {now}
            WHERE table_uuid = '{uuid}';
            INSERT INTO big_table_cursors (table_uuid, last_update_value, updated_at)
                SELECT '{uuid}', '{value}', {now}
                WHERE NOT EXISTS
                    (SELECT 1 FROM big_table_cursors WHERE table_uuid = '{uuid}');
            "#,
        );
        self.connect().await?.execute_batch(&sql).await?;
        Ok(())
    }

    pub async fn clear_big_table_cursor(&self, table_uuid: &str) -> Result<(), StateError> {
        let sql = format!(
            "DELETE FROM big_table_cursors WHERE table_uuid = '{}'",
            sql_escape(table_uuid)
        );
        self.connect().await?.execute(&sql, ()).await?;
        Ok(())
    }
}
