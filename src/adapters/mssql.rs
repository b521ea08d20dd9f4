//! MS SQL Server adapter.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use secrecy::ExposeSecret;
use tiberius::{AuthMethod, ColumnData, ColumnType, Config, FromSql};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::error::AdapterError;
use crate::model::{Source, TableConfig};
use crate::rows::{Cell, Dtype, RowBatch};

use super::dialect::{self, Dialect, and_filter, cursor_literal, filter_clause, sql_escape};
use super::{OldRowsPage, SourceAdapter, SqlClient, first_column_strings};

const DIALECT: Dialect = dialect::MSSQL;

pub struct MssqlAdapter;

impl MssqlAdapter {
    fn ordering_key<'t>(table: &'t TableConfig) -> Result<&'t str, AdapterError> {
        table
            .ordering_key
            .as_deref()
            .ok_or_else(|| AdapterError::Query("table has no ordering key".to_string()))
    }

    /// Unquoted comma join, the form the server's query planner sees for
    /// bulk pull column lists.
    fn plain_columns(table: &TableConfig) -> String {
        table.effective_columns().join(",")
    }
}

#[async_trait]
impl SourceAdapter for MssqlAdapter {
    fn engine_type(&self) -> &'static str {
        "mssql"
    }

    fn format_creds(&self, source: &Source) -> Result<String, AdapterError> {
        let secret = source.secret.as_ref().ok_or(AdapterError::MissingSecret)?;
        let c = &source.connection;
        Ok(format!(
            "mssql://{}:{}@{}:{}/{}",
            urlencoding::encode(&c.user),
            urlencoding::encode(secret.expose_secret()),
            c.ip,
            c.port,
            urlencoding::encode(&c.db_name),
        ))
    }

    async fn connect(&self, source: &Source) -> Result<Arc<dyn SqlClient>, AdapterError> {
        let secret = source.secret.as_ref().ok_or(AdapterError::MissingSecret)?;
        let c = &source.connection;

        let mut config = Config::new();
        config.host(&c.ip);
        config.port(c.port);
        config.database(&c.db_name);
        config.authentication(AuthMethod::sql_server(&c.user, secret.expose_secret()));
        config.trust_cert();

        let tcp = TcpStream::connect((c.ip.as_str(), c.port))
            .await
            .map_err(|e| AdapterError::SourceConnect(e.to_string()))?;
        tcp.set_nodelay(true)
            .map_err(|e| AdapterError::SourceConnect(e.to_string()))?;

        let client = tiberius::Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| AdapterError::SourceConnect(e.to_string()))?;

        Ok(Arc::new(MssqlClient {
            inner: Mutex::new(client),
        }))
    }

    async fn list_tables_and_views(
        &self,
        source: &Source,
    ) -> Result<(Vec<String>, Vec<String>), AdapterError> {
        let client = super::client_of(source)?;
        let table_sql = "SELECT TABLE_NAME \
             FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_TYPE = 'BASE TABLE' \
             ORDER BY TABLE_NAME ASC";
        let view_sql = "SELECT v.name AS VIEW_NAME FROM sys.views AS v ORDER BY VIEW_NAME ASC";

        let tables = first_column_strings(&client.query(table_sql).await?);
        let views = first_column_strings(&client.query(view_sql).await?);
        Ok((tables, views))
    }

    async fn preview(
        &self,
        source: &Source,
        table_name: &str,
        limit: i64,
    ) -> Result<RowBatch, AdapterError> {
        let client = super::client_of(source)?;
        let sql = format!("SELECT TOP {limit} * FROM {table_name} ORDER BY 1 DESC");
        client.query(&sql).await
    }

    async fn initial_pull(
        &self,
        source: &Source,
        table: &TableConfig,
        batch_pull_size: i64,
    ) -> Result<RowBatch, AdapterError> {
        let client = super::client_of(source)?;
        let ordering_key = Self::ordering_key(table)?;
        let where_clause = filter_clause(self, &DIALECT, source, table).await?;
        let sql = format!(
            "SELECT TOP {batch_pull_size} {cols} FROM {table} {where_clause} \
             ORDER BY {ordering_key} DESC",
            cols = Self::plain_columns(table),
            table = table.table_name,
        );
        client.query(&sql).await
    }

    async fn get_updated_rows(
        &self,
        source: &Source,
        table: &TableConfig,
    ) -> Result<RowBatch, AdapterError> {
        let client = super::client_of(source)?;
        let ordering_key = Self::ordering_key(table)?;
        let cursor = table
            .last_update_value
            .as_deref()
            .ok_or_else(|| AdapterError::Query("table has no cursor value".to_string()))?;
        let extra = and_filter(self, &DIALECT, source, table).await?;

        let numeric = cursor.parse::<f64>().is_ok();
        let literal = if numeric {
            cursor_literal(cursor, true)
        } else {
            // DATETIME2 columns compare against the millisecond-truncated
            // form; anything unparseable passes through quoted as-is.
            match mssql_datetime_literal(cursor) {
                Some(formatted) => format!("'{formatted}'"),
                None => format!("'{}'", sql_escape(cursor)),
            }
        };

        let sql = format!(
            "SELECT {cols} FROM {table} WHERE {ordering_key} > {literal}{extra}",
            cols = Self::plain_columns(table),
            table = table.table_name,
        );
        client.query(&sql).await
    }

    async fn get_old_rows(
        &self,
        source: &Source,
        table: &TableConfig,
        batch_pull_size: i64,
    ) -> Result<OldRowsPage, AdapterError> {
        let client = super::client_of(source)?;
        let ordering_key = Self::ordering_key(table)?;
        let where_clause = filter_clause(self, &DIALECT, source, table).await?;
        let sql = format!(
            "SELECT {cols} FROM {table} {where_clause} \
             ORDER BY {ord} DESC \
             OFFSET {offset} ROWS \
             FETCH NEXT {batch_pull_size} ROWS ONLY",
            cols = Self::plain_columns(table),
            table = table.table_name,
            ord = DIALECT.quote_ident(ordering_key),
            offset = batch_pull_size * table.crawler_step,
        );
        let rows = client.query(&sql).await?;
        let completed = (rows.len() as i64) < batch_pull_size;
        Ok(OldRowsPage { rows, completed })
    }

    async fn get_primary_keys(
        &self,
        source: &Source,
        table: &TableConfig,
        limit: i64,
    ) -> Result<RowBatch, AdapterError> {
        let client = super::client_of(source)?;
        let ordering_key = Self::ordering_key(table)?;
        let primary_key = table
            .primary_key
            .as_deref()
            .ok_or_else(|| AdapterError::Query("table has no primary key".to_string()))?;
        let where_clause = filter_clause(self, &DIALECT, source, table).await?;
        let sql = format!(
            "SELECT TOP {limit} {pk} FROM {table} {where_clause} \
             ORDER BY {ordering_key} DESC",
            pk = DIALECT.quote_ident(primary_key),
            table = table.table_name,
        );
        client.query(&sql).await
    }
}

/// Reformat a timestamp cursor to `YYYY-MM-DD HH:MM:SS.mmm`; the server
/// keeps three fractional digits.
fn mssql_datetime_literal(value: &str) -> Option<String> {
    let parsed = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()?;
    let micros = parsed.format("%Y-%m-%d %H:%M:%S%.6f").to_string();
    Some(micros[..micros.len() - 3].to_string())
}

struct MssqlClient {
    inner: Mutex<tiberius::Client<Compat<TcpStream>>>,
}

#[async_trait]
impl SqlClient for MssqlClient {
    async fn query(&self, sql: &str) -> Result<RowBatch, AdapterError> {
        let mut client = self.inner.lock().await;
        let mut stream = client
            .simple_query(sql)
            .await
            .map_err(|e| AdapterError::Query(e.to_string()))?;

        let (columns, dtypes): (Vec<String>, Vec<Dtype>) = match stream
            .columns()
            .await
            .map_err(|e| AdapterError::Query(e.to_string()))?
        {
            Some(cols) => cols
                .iter()
                .map(|c| (c.name().to_string(), map_column_type(c.column_type())))
                .unzip(),
            None => (Vec::new(), Vec::new()),
        };

        let raw = stream
            .into_first_result()
            .await
            .map_err(|e| AdapterError::Query(e.to_string()))?;

        let mut batch = RowBatch::new(columns, dtypes);
        for row in raw {
            batch.rows.push(row.into_iter().map(to_cell).collect());
        }
        Ok(batch)
    }

    async fn ping(&self) -> Result<(), AdapterError> {
        let mut client = self.inner.lock().await;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| AdapterError::SourceConnect(e.to_string()))?
            .into_first_result()
            .await
            .map(|_| ())
            .map_err(|e| AdapterError::SourceConnect(e.to_string()))
    }
}

fn map_column_type(column_type: ColumnType) -> Dtype {
    match column_type {
        ColumnType::Int1
        | ColumnType::Int2
        | ColumnType::Int4
        | ColumnType::Int8
        | ColumnType::Intn => Dtype::Int64,
        ColumnType::Float4
        | ColumnType::Float8
        | ColumnType::Floatn
        | ColumnType::Decimaln
        | ColumnType::Numericn
        | ColumnType::Money
        | ColumnType::Money4 => Dtype::Float64,
        ColumnType::Bit | ColumnType::Bitn => Dtype::Bool,
        ColumnType::Datetime
        | ColumnType::Datetime4
        | ColumnType::Datetimen
        | ColumnType::Datetime2
        | ColumnType::Daten => Dtype::DatetimeNaive,
        ColumnType::DatetimeOffsetn => Dtype::DatetimeTz("UTC".to_string()),
        _ => Dtype::Object,
    }
}

fn to_cell(data: ColumnData<'static>) -> Cell {
    match data {
        ColumnData::U8(v) => v.map_or(Cell::Null, |x| Cell::Int(i64::from(x))),
        ColumnData::I16(v) => v.map_or(Cell::Null, |x| Cell::Int(i64::from(x))),
        ColumnData::I32(v) => v.map_or(Cell::Null, |x| Cell::Int(i64::from(x))),
        ColumnData::I64(v) => v.map_or(Cell::Null, Cell::Int),
        ColumnData::F32(v) => v.map_or(Cell::Null, |x| Cell::Float(f64::from(x))),
        ColumnData::F64(v) => v.map_or(Cell::Null, Cell::Float),
        ColumnData::Bit(v) => v.map_or(Cell::Null, Cell::Bool),
        ColumnData::String(v) => v.map_or(Cell::Null, |s| Cell::Text(s.into_owned())),
        ColumnData::Guid(v) => v.map_or(Cell::Null, |g| Cell::Text(g.to_string())),
        ColumnData::Numeric(v) => v.map_or(Cell::Null, |n| {
            Cell::Float(n.value() as f64 / 10f64.powi(i32::from(n.scale())))
        }),
        ColumnData::Binary(v) => v.map_or(Cell::Null, |b| {
            use base64::Engine;
            Cell::Text(base64::engine::general_purpose::STANDARD.encode(b.as_ref()))
        }),
        ColumnData::Xml(v) => v.map_or(Cell::Null, |x| Cell::Text(x.to_string())),
        data @ (ColumnData::DateTime(_)
        | ColumnData::SmallDateTime(_)
        | ColumnData::DateTime2(_)) => NaiveDateTime::from_sql(&data)
            .ok()
            .flatten()
            .map_or(Cell::Null, Cell::Timestamp),
        data @ ColumnData::DateTimeOffset(_) => DateTime::<Utc>::from_sql(&data)
            .ok()
            .flatten()
            .map_or(Cell::Null, |dt| Cell::TimestampTz(dt.fixed_offset())),
        data @ ColumnData::Date(_) => NaiveDate::from_sql(&data)
            .ok()
            .flatten()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map_or(Cell::Null, Cell::Timestamp),
        data @ ColumnData::Time(_) => NaiveTime::from_sql(&data)
            .ok()
            .flatten()
            .map_or(Cell::Null, |t| Cell::Text(t.to_string())),
    }
}
