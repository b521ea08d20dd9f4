//! MySQL adapter.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::Queryable;
use secrecy::ExposeSecret;

use crate::error::AdapterError;
use crate::model::{Source, TableConfig};
use crate::rows::{Cell, Dtype, RowBatch};

use super::dialect::{self, Dialect, and_filter, cursor_literal, filter_clause};
use super::{OldRowsPage, SourceAdapter, SqlClient, first_column_strings};

const DIALECT: Dialect = dialect::MYSQL;

pub struct MySqlAdapter;

impl MySqlAdapter {
    fn ordering_key<'t>(table: &'t TableConfig) -> Result<&'t str, AdapterError> {
        table
            .ordering_key
            .as_deref()
            .ok_or_else(|| AdapterError::Query("table has no ordering key".to_string()))
    }
}

#[async_trait]
impl SourceAdapter for MySqlAdapter {
    fn engine_type(&self) -> &'static str {
        "mysql"
    }

    fn format_creds(&self, source: &Source) -> Result<String, AdapterError> {
        let secret = source.secret.as_ref().ok_or(AdapterError::MissingSecret)?;
        let c = &source.connection;
        Ok(format!(
            "mysql://{}:{}@{}:{}/{}",
            urlencoding::encode(&c.user),
            urlencoding::encode(secret.expose_secret()),
            c.ip,
            c.port,
            urlencoding::encode(&c.db_name),
        ))
    }

    async fn connect(&self, source: &Source) -> Result<Arc<dyn SqlClient>, AdapterError> {
        let url = self.format_creds(source)?;
        let opts = mysql_async::Opts::from_url(&url)
            .map_err(|e| AdapterError::SourceConnect(e.to_string()))?;
        let pool = mysql_async::Pool::new(opts);
        let client = MySqlClient { pool };
        client.ping().await?;
        Ok(Arc::new(client))
    }

    async fn list_tables_and_views(
        &self,
        source: &Source,
    ) -> Result<(Vec<String>, Vec<String>), AdapterError> {
        let client = super::client_of(source)?;
        let table_sql = format!(
            "SELECT table_name \
             FROM information_schema.tables \
             WHERE (table_type = 'BASE TABLE' OR TABLE_TYPE = 'base table') \
                 AND table_schema = '{}' \
             ORDER BY table_name ASC",
            dialect::sql_escape(&source.connection.db_name),
        );
        let view_sql = "SELECT table_name FROM information_schema.tables \
             WHERE table_type = 'VIEW' ORDER BY table_name ASC";

        let tables = first_column_strings(&client.query(&table_sql).await?);
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
        let sql = format!("SELECT * FROM {table_name} LIMIT {limit}");
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
            "SELECT {cols} FROM {table} {where_clause} \
             ORDER BY {ord} DESC LIMIT {batch_pull_size}",
            cols = DIALECT.column_list(&table.effective_columns()),
            table = table.table_name,
            ord = DIALECT.quote_ident(ordering_key),
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
        let sql = format!(
            "SELECT {cols} FROM {table} WHERE {ordering_key} > {lit}{extra}",
            cols = DIALECT.column_list(&table.effective_columns()),
            table = table.table_name,
            lit = cursor_literal(cursor, numeric),
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
             ORDER BY {ord} DESC LIMIT {batch_pull_size} OFFSET {offset}",
            cols = DIALECT.column_list(&table.effective_columns()),
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
            "SELECT {pk}, {ord} FROM {table} {where_clause} \
             ORDER BY {ord} DESC LIMIT {limit}",
            pk = DIALECT.quote_ident(primary_key),
            ord = DIALECT.quote_ident(ordering_key),
            table = table.table_name,
        );
        client.query(&sql).await
    }
}

struct MySqlClient {
    pool: mysql_async::Pool,
}

#[async_trait]
impl SqlClient for MySqlClient {
    async fn query(&self, sql: &str) -> Result<RowBatch, AdapterError> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| AdapterError::SourceConnect(e.to_string()))?;
        let mut result = conn
            .query_iter(sql)
            .await
            .map_err(|e| AdapterError::Query(e.to_string()))?;

        let (columns, dtypes): (Vec<String>, Vec<Dtype>) = match result.columns() {
            Some(cols) => cols
                .iter()
                .map(|c| (c.name_str().into_owned(), map_column_type(c.column_type())))
                .unzip(),
            None => (Vec::new(), Vec::new()),
        };

        let raw: Vec<mysql_async::Row> = result
            .collect()
            .await
            .map_err(|e| AdapterError::Query(e.to_string()))?;

        let mut batch = RowBatch::new(columns, dtypes);
        for row in raw {
            let values = row.unwrap();
            let cells = values
                .into_iter()
                .enumerate()
                .map(|(i, value)| to_cell(value, &batch.dtypes[i]))
                .collect();
            batch.rows.push(cells);
        }
        Ok(batch)
    }

    async fn ping(&self) -> Result<(), AdapterError> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| AdapterError::SourceConnect(e.to_string()))?;
        conn.ping()
            .await
            .map_err(|e| AdapterError::SourceConnect(e.to_string()))
    }
}

fn map_column_type(column_type: ColumnType) -> Dtype {
    match column_type {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_YEAR
        | ColumnType::MYSQL_TYPE_BIT => Dtype::Int64,
        ColumnType::MYSQL_TYPE_FLOAT
        | ColumnType::MYSQL_TYPE_DOUBLE
        | ColumnType::MYSQL_TYPE_DECIMAL
        | ColumnType::MYSQL_TYPE_NEWDECIMAL => Dtype::Float64,
        ColumnType::MYSQL_TYPE_TIMESTAMP
        | ColumnType::MYSQL_TYPE_DATETIME
        | ColumnType::MYSQL_TYPE_DATE
        | ColumnType::MYSQL_TYPE_NEWDATE
        | ColumnType::MYSQL_TYPE_TIMESTAMP2
        | ColumnType::MYSQL_TYPE_DATETIME2 => Dtype::DatetimeNaive,
        _ => Dtype::Object,
    }
}

fn to_cell(value: mysql_async::Value, dtype: &Dtype) -> Cell {
    use mysql_async::Value;
    match value {
        Value::NULL => Cell::Null,
        Value::Int(v) => match dtype {
            Dtype::Float64 => Cell::Float(v as f64),
            _ => Cell::Int(v),
        },
        Value::UInt(v) => match dtype {
            Dtype::Float64 => Cell::Float(v as f64),
            _ => Cell::Int(v as i64),
        },
        Value::Float(v) => Cell::Float(f64::from(v)),
        Value::Double(v) => Cell::Float(v),
        Value::Date(y, mo, d, h, mi, s, us) => NaiveDate::from_ymd_opt(i32::from(y), u32::from(mo), u32::from(d))
            .and_then(|date| date.and_hms_micro_opt(u32::from(h), u32::from(mi), u32::from(s), us))
            .map(Cell::Timestamp)
            .unwrap_or(Cell::Null),
        Value::Time(neg, d, h, mi, s, us) => {
            let sign = if neg { "-" } else { "" };
            let hours = u32::from(d) * 24 + u32::from(h);
            Cell::Text(format!("{sign}{hours:02}:{mi:02}:{s:02}.{us:06}"))
        }
        Value::Bytes(bytes) => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            match dtype {
                // DECIMAL and friends arrive as text.
                Dtype::Float64 => text
                    .parse::<f64>()
                    .map(Cell::Float)
                    .unwrap_or(Cell::Text(text)),
                Dtype::Int64 => text.parse::<i64>().map(Cell::Int).unwrap_or(Cell::Text(text)),
                Dtype::DatetimeNaive => parse_datetime_text(&text)
                    .map(Cell::Timestamp)
                    .unwrap_or(Cell::Text(text)),
                _ => Cell::Text(text),
            }
        }
    }
}

fn parse_datetime_text(text: &str) -> Option<chrono::NaiveDateTime> {
    chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}
