//! PostgreSQL adapter.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use secrecy::ExposeSecret;
use tokio_postgres::NoTls;
use tokio_postgres::types::Type;

use crate::error::AdapterError;
use crate::model::{Source, TableConfig};
use crate::rows::{Cell, Dtype, RowBatch};

use super::dialect::{self, Dialect, and_filter, cursor_literal, filter_clause};
use super::{CONNECT_TIMEOUT, OldRowsPage, SourceAdapter, SqlClient, first_column_strings};

const DIALECT: Dialect = dialect::POSTGRES;

pub struct PostgresAdapter;

impl PostgresAdapter {
    fn ordering_key<'t>(table: &'t TableConfig) -> Result<&'t str, AdapterError> {
        table
            .ordering_key
            .as_deref()
            .ok_or_else(|| AdapterError::Query("table has no ordering key".to_string()))
    }
}

#[async_trait]
impl SourceAdapter for PostgresAdapter {
    fn engine_type(&self) -> &'static str {
        "postgresql"
    }

    fn format_creds(&self, source: &Source) -> Result<String, AdapterError> {
        let secret = source.secret.as_ref().ok_or(AdapterError::MissingSecret)?;
        let c = &source.connection;
        Ok(format!(
            "postgresql://{}:{}@{}:{}/{}",
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

        let mut config = tokio_postgres::Config::new();
        config
            .host(&c.ip)
            .port(c.port)
            .user(&c.user)
            .password(secret.expose_secret())
            .dbname(&c.db_name)
            .connect_timeout(CONNECT_TIMEOUT);

        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| AdapterError::SourceConnect(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "postgres connection task ended");
            }
        });

        let client = PgClient { client };
        client.ping().await?;
        Ok(Arc::new(client))
    }

    async fn list_tables_and_views(
        &self,
        source: &Source,
    ) -> Result<(Vec<String>, Vec<String>), AdapterError> {
        let client = super::client_of(source)?;
        let table_sql = r#"
            SELECT tablename AS "TABLE_NAME"
            FROM pg_catalog.pg_tables
            WHERE schemaname != 'pg_catalog'
                AND schemaname != 'information_schema'
            ORDER BY "TABLE_NAME" ASC
        "#;
        let view_sql = r#"
            SELECT table_name AS "VIEW_NAME"
            FROM information_schema.views
            WHERE table_schema NOT IN ('information_schema', 'pg_catalog')
            ORDER BY "VIEW_NAME" ASC
        "#;

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
        let sql = format!(
            "SELECT * FROM {} LIMIT {limit}",
            DIALECT.quote_ident(table_name)
        );
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
            table = DIALECT.quote_ident(&table.table_name),
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

        // Unquoted literals only for plain digit strings; everything else,
        // timestamps included, goes through the quoted form.
        let numeric = !cursor.is_empty() && cursor.bytes().all(|b| b.is_ascii_digit());
        let sql = format!(
            "SELECT {cols} FROM {table} WHERE {ord} > {lit}{extra}",
            cols = DIALECT.column_list(&table.effective_columns()),
            table = table.table_name,
            ord = DIALECT.quote_ident(ordering_key),
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
            "SELECT {pk} FROM {table} {where_clause} \
             ORDER BY {ord} DESC LIMIT {limit}",
            pk = DIALECT.quote_ident(primary_key),
            ord = DIALECT.quote_ident(ordering_key),
            table = table.table_name,
        );
        client.query(&sql).await
    }
}

struct PgClient {
    client: tokio_postgres::Client,
}

#[async_trait]
impl SqlClient for PgClient {
    async fn query(&self, sql: &str) -> Result<RowBatch, AdapterError> {
        // Prepared statements expose column metadata even for empty results.
        let statement = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| AdapterError::Query(e.to_string()))?;

        let (columns, dtypes): (Vec<String>, Vec<Dtype>) = statement
            .columns()
            .iter()
            .map(|c| (c.name().to_string(), map_pg_type(c.type_())))
            .unzip();
        let types: Vec<Type> = statement
            .columns()
            .iter()
            .map(|c| c.type_().clone())
            .collect();

        let raw = self
            .client
            .query(&statement, &[])
            .await
            .map_err(|e| AdapterError::Query(e.to_string()))?;

        let mut batch = RowBatch::new(columns, dtypes);
        for row in raw {
            let mut cells = Vec::with_capacity(types.len());
            for (i, ty) in types.iter().enumerate() {
                cells.push(to_cell(&row, i, ty)?);
            }
            batch.rows.push(cells);
        }
        Ok(batch)
    }

    async fn ping(&self) -> Result<(), AdapterError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|e| AdapterError::SourceConnect(e.to_string()))
    }
}

fn map_pg_type(ty: &Type) -> Dtype {
    match *ty {
        Type::INT2 | Type::INT4 | Type::INT8 => Dtype::Int64,
        Type::FLOAT4 | Type::FLOAT8 | Type::NUMERIC => Dtype::Float64,
        Type::BOOL => Dtype::Bool,
        Type::TIMESTAMP | Type::DATE => Dtype::DatetimeNaive,
        Type::TIMESTAMPTZ => Dtype::DatetimeTz("UTC".to_string()),
        _ => Dtype::Object,
    }
}

fn to_cell(row: &tokio_postgres::Row, i: usize, ty: &Type) -> Result<Cell, AdapterError> {
    let q = |e: tokio_postgres::Error| AdapterError::Query(e.to_string());
    let cell = match *ty {
        Type::INT2 => row
            .try_get::<_, Option<i16>>(i)
            .map_err(q)?
            .map_or(Cell::Null, |v| Cell::Int(i64::from(v))),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(i)
            .map_err(q)?
            .map_or(Cell::Null, |v| Cell::Int(i64::from(v))),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(i)
            .map_err(q)?
            .map_or(Cell::Null, Cell::Int),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(i)
            .map_err(q)?
            .map_or(Cell::Null, |v| Cell::Float(f64::from(v))),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(i)
            .map_err(q)?
            .map_or(Cell::Null, Cell::Float),
        Type::NUMERIC => row
            .try_get::<_, Option<rust_decimal::Decimal>>(i)
            .map_err(q)?
            .and_then(|d| d.to_f64())
            .map_or(Cell::Null, Cell::Float),
        Type::BOOL => row
            .try_get::<_, Option<bool>>(i)
            .map_err(q)?
            .map_or(Cell::Null, Cell::Bool),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(i)
            .map_err(q)?
            .map_or(Cell::Null, Cell::Timestamp),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(i)
            .map_err(q)?
            .map_or(Cell::Null, |v| Cell::TimestampTz(v.fixed_offset())),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(i)
            .map_err(q)?
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map_or(Cell::Null, Cell::Timestamp),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(i)
            .map_err(q)?
            .map_or(Cell::Null, |v| Cell::Text(v.to_string())),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(i)
            .map_err(q)?
            .map_or(Cell::Null, |v| Cell::Text(v.to_string())),
        _ => match row.try_get::<_, Option<String>>(i) {
            Ok(Some(v)) => Cell::Text(v),
            Ok(None) => Cell::Null,
            // Types with no text conversion surface as nulls rather than
            // failing the whole pull.
            Err(_) => Cell::Null,
        },
    };
    Ok(cell)
}
