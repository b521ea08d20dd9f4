//! Dialect-neutral SQL building shared by the engine adapters.
//!
//! The WHERE builder works off a preview sample of the target table so that
//! predicates referencing unknown columns are silently skipped and literal
//! quoting can follow the column's observed type.

use crate::error::AdapterError;
use crate::model::{Source, TableConfig};
use crate::rows::{Dtype, RowBatch};

use super::SourceAdapter;

/// Identifier quoting style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentQuote {
    /// MySQL backticks.
    Backtick,
    /// ANSI double quotes (PostgreSQL, MS SQL).
    Double,
}

/// How non-numeric filter literals are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralStyle {
    /// Plain `'...'` strings; datetimes quoted the same way.
    Plain,
    /// PostgreSQL escape strings `E'...'`.
    EscapeString,
    /// MS SQL: strings plain, datetimes `CAST('...' AS DATETIME2)`.
    CastDatetime2,
}

/// A dialect's quoting and literal rules.
#[derive(Debug, Clone, Copy)]
pub struct Dialect {
    pub ident: IdentQuote,
    pub literal: LiteralStyle,
}

pub const MYSQL: Dialect = Dialect {
    ident: IdentQuote::Backtick,
    literal: LiteralStyle::Plain,
};

pub const POSTGRES: Dialect = Dialect {
    ident: IdentQuote::Double,
    literal: LiteralStyle::EscapeString,
};

pub const MSSQL: Dialect = Dialect {
    ident: IdentQuote::Double,
    literal: LiteralStyle::CastDatetime2,
};

/// Escape a string for embedding in a single-quoted SQL literal.
pub fn sql_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "''")
}

impl Dialect {
    pub fn quote_ident(&self, name: &str) -> String {
        match self.ident {
            IdentQuote::Backtick => format!("`{}`", name.replace('`', "``")),
            IdentQuote::Double => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }

    /// Comma-joined quoted column list for SELECT clauses.
    pub fn column_list(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn string_literal(&self, value: &str) -> String {
        match self.literal {
            LiteralStyle::EscapeString => format!("E'{}'", sql_escape(value)),
            _ => format!("'{}'", sql_escape(value)),
        }
    }

    fn datetime_literal(&self, value: &str) -> String {
        match self.literal {
            LiteralStyle::CastDatetime2 => {
                format!("CAST('{}' AS DATETIME2)", sql_escape(value))
            }
            _ => self.string_literal(value),
        }
    }
}

fn known_operator(relational: &str, logical: &str) -> bool {
    matches!(relational, "=" | "!=" | "<" | ">") && matches!(logical, "and" | "or")
}

/// Build the filter clause from the table's configured predicates.
///
/// `sample` is a recent preview of the table: predicates on columns absent
/// from it are skipped, and the column's sampled dtype picks the literal
/// form. With at least one surviving predicate the clause opens with
/// `where ` unless `no_where` is set, in which case the caller glues it onto
/// an existing WHERE with its own `and`.
pub fn build_where(
    dialect: &Dialect,
    table: &TableConfig,
    sample: &RowBatch,
    no_where: bool,
) -> String {
    let Some(filter) = &table.query_filter else {
        return String::new();
    };
    if !table.use_query_filter {
        return String::new();
    }

    let mut sql = String::new();
    let mut first = true;
    for item in filter.items() {
        if !known_operator(&item.relational_operator, &item.logical_operator) {
            continue;
        }
        let Some(value) = &item.value else {
            continue;
        };
        let Some(col_idx) = sample.column_index(&item.column) else {
            continue;
        };

        let literal = match sample.dtypes[col_idx] {
            Dtype::Int64 | Dtype::Float64 => format!(" {} ", value),
            Dtype::DatetimeNaive | Dtype::DatetimeTz(_) => {
                format!(" {} ", dialect.datetime_literal(value))
            }
            _ => format!(" {} ", dialect.string_literal(value)),
        };

        let lead = if first {
            String::new()
        } else {
            format!("{} ", item.logical_operator)
        };
        if sql.is_empty() && !no_where {
            sql.push_str("where ");
        }
        sql.push_str(&lead);
        sql.push_str(&dialect.quote_ident(&item.column));
        sql.push(' ');
        sql.push_str(&item.relational_operator);
        sql.push_str(&literal);
        first = false;
    }
    sql
}

/// Fetch the 100-row sample and build the standalone filter clause.
pub async fn filter_clause(
    adapter: &dyn SourceAdapter,
    dialect: &Dialect,
    source: &Source,
    table: &TableConfig,
) -> Result<String, AdapterError> {
    if !table.use_query_filter
        || table
            .query_filter
            .as_ref()
            .is_none_or(|f| f.items().is_empty())
    {
        return Ok(String::new());
    }
    let sample = adapter.preview(source, &table.table_name, 100).await?;
    Ok(build_where(dialect, table, &sample, false))
}

/// Filter clause shaped for appending to an existing WHERE:
/// ` and (<predicates>)`, or empty.
pub async fn and_filter(
    adapter: &dyn SourceAdapter,
    dialect: &Dialect,
    source: &Source,
    table: &TableConfig,
) -> Result<String, AdapterError> {
    if !table.use_query_filter
        || table
            .query_filter
            .as_ref()
            .is_none_or(|f| f.items().is_empty())
    {
        return Ok(String::new());
    }
    let sample = adapter.preview(source, &table.table_name, 100).await?;
    let clause = build_where(dialect, table, &sample, true);
    if clause.is_empty() {
        Ok(String::new())
    } else {
        Ok(format!(" and ({clause})"))
    }
}

/// Render an incremental cursor literal: unquoted when numeric, plain
/// single-quoted otherwise. `numeric` comes from the dialect's own detection
/// rule.
pub fn cursor_literal(value: &str, numeric: bool) -> String {
    if numeric {
        value.to_string()
    } else {
        format!("'{}'", sql_escape(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QueryFilter;
    use crate::rows::Cell;

    fn sample() -> RowBatch {
        let mut batch = RowBatch::new(
            vec!["region".to_string(), "qty".to_string(), "seen_at".to_string()],
            vec![Dtype::Object, Dtype::Int64, Dtype::DatetimeNaive],
        );
        batch.rows.push(vec![
            Cell::Text("emea".to_string()),
            Cell::Int(3),
            Cell::Null,
        ]);
        batch
    }

    fn table_with_filter(items: serde_json::Value) -> TableConfig {
        serde_json::from_value(serde_json::json!({
            "table_name": "orders",
            "sync_status": 1,
            "use_query_filter": true,
            "query_filter": items,
        }))
        .unwrap()
    }

    #[test]
    fn opens_with_where_and_joins_on_logical_operator() {
        let table = table_with_filter(serde_json::json!([
            {"column": "region", "relational_operator": "=", "logical_operator": "and", "value": "emea"},
            {"column": "qty", "relational_operator": ">", "logical_operator": "or", "value": "5"},
        ]));
        let clause = build_where(&MYSQL, &table, &sample(), false);
        assert!(clause.starts_with("where "));
        assert!(clause.contains("`region` = 'emea'"));
        assert!(clause.contains("or `qty` > 5"));
    }

    #[test]
    fn no_where_elides_keyword() {
        let table = table_with_filter(serde_json::json!([
            {"column": "qty", "relational_operator": "<", "logical_operator": "and", "value": "10"},
        ]));
        let clause = build_where(&MYSQL, &table, &sample(), true);
        assert!(!clause.contains("where"));
        assert!(clause.contains("`qty` < 10"));
    }

    #[test]
    fn unknown_columns_are_skipped() {
        let table = table_with_filter(serde_json::json!([
            {"column": "ghost", "relational_operator": "=", "logical_operator": "and", "value": "x"},
        ]));
        assert_eq!(build_where(&MYSQL, &table, &sample(), false), "");
    }

    #[test]
    fn unknown_operators_are_skipped() {
        let table = table_with_filter(serde_json::json!([
            {"column": "qty", "relational_operator": "like", "logical_operator": "and", "value": "5"},
            {"column": "qty", "relational_operator": "=", "logical_operator": "xor", "value": "5"},
        ]));
        assert_eq!(build_where(&MYSQL, &table, &sample(), false), "");
    }

    #[test]
    fn datetime_literals_follow_the_dialect() {
        let table = table_with_filter(serde_json::json!([
            {"column": "seen_at", "relational_operator": ">", "logical_operator": "and", "value": "2024-01-01 00:00:00"},
        ]));
        let mssql = build_where(&MSSQL, &table, &sample(), false);
        assert!(mssql.contains("CAST('2024-01-01 00:00:00' AS DATETIME2)"));

        let pg = build_where(&POSTGRES, &table, &sample(), false);
        assert!(pg.contains("E'2024-01-01 00:00:00'"));

        let my = build_where(&MYSQL, &table, &sample(), false);
        assert!(my.contains("'2024-01-01 00:00:00'"));
        assert!(!my.contains("CAST"));
    }

    #[test]
    fn string_literals_escape_quotes_and_backslashes() {
        let table = table_with_filter(serde_json::json!([
            {"column": "region", "relational_operator": "=", "logical_operator": "and", "value": r"o'br\ien"},
        ]));
        let clause = build_where(&MYSQL, &table, &sample(), false);
        assert!(clause.contains(r"'o''br\\ien'"));
    }

    #[test]
    fn disabled_filter_yields_nothing() {
        let mut table = table_with_filter(serde_json::json!([
            {"column": "qty", "relational_operator": "=", "logical_operator": "and", "value": "1"},
        ]));
        table.use_query_filter = false;
        assert_eq!(build_where(&MYSQL, &table, &sample(), false), "");
        assert!(matches!(table.query_filter, Some(QueryFilter::Items(_))));
    }

    #[test]
    fn ident_quoting_styles() {
        assert_eq!(MYSQL.quote_ident("a`b"), "`a``b`");
        assert_eq!(POSTGRES.quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(
            MYSQL.column_list(&["a".to_string(), "b".to_string()]),
            "`a`,`b`"
        );
    }
}
