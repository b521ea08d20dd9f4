//! Row batches and the wire payload format.
//!
//! Every row-producing path (batch pulls, previews, deleted-row checks)
//! yields a [`RowBatch`]: positional cells plus parallel column-name and
//! dtype vectors. The ingest side speaks a pandas-flavoured dialect, so the
//! wire payload keeps its shape: `values` is a JSON-encoded array of rows by
//! index, `columns`/`dtypes` are ordered lists, and dtype names use the
//! `int64` / `float64` / `bool` / `object` / `datetime64[ns]` /
//! `datetime64[ns, <tz>]` vocabulary.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// One cell of a result set.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Driver timestamp with no timezone information.
    Timestamp(NaiveDateTime),
    /// Timezone-aware timestamp; the offset is preserved for emission.
    TimestampTz(DateTime<FixedOffset>),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Render for CSV export: empty marker handled by the caller, timestamps
    /// in `YYYY-MM-DD HH:MM:SS` form, booleans capitalized the way the
    /// ingest loader expects.
    pub fn csv_value(&self) -> String {
        match self {
            Cell::Null => String::new(),
            Cell::Bool(true) => "True".to_string(),
            Cell::Bool(false) => "False".to_string(),
            Cell::Int(v) => v.to_string(),
            Cell::Float(v) => v.to_string(),
            Cell::Text(v) => v.clone(),
            Cell::Timestamp(v) => v.format("%Y-%m-%d %H:%M:%S").to_string(),
            Cell::TimestampTz(v) => v.format("%Y-%m-%d %H:%M:%S%:z").to_string(),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Cell::Null => serde_json::Value::Null,
            Cell::Bool(v) => serde_json::Value::Bool(*v),
            Cell::Int(v) => serde_json::Value::from(*v),
            Cell::Float(v) => {
                if v.is_finite() {
                    serde_json::Value::from(*v)
                } else {
                    serde_json::Value::Null
                }
            }
            Cell::Text(v) => serde_json::Value::from(v.clone()),
            Cell::Timestamp(v) => {
                serde_json::Value::from(v.format("%Y-%m-%dT%H:%M:%S").to_string())
            }
            Cell::TimestampTz(v) => serde_json::Value::from(format_tz(v)),
        }
    }
}

/// ISO-8601 at second resolution; UTC collapses to the `Z` suffix.
fn format_tz(v: &DateTime<FixedOffset>) -> String {
    if v.offset().fix().local_minus_utc() == 0 {
        v.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    } else {
        v.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
    }
}

/// Column dtype in the pandas vocabulary the ingest side expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dtype {
    Int64,
    Float64,
    Bool,
    Object,
    DatetimeNaive,
    DatetimeTz(String),
}

impl Dtype {
    pub fn name(&self) -> String {
        match self {
            Dtype::Int64 => "int64".to_string(),
            Dtype::Float64 => "float64".to_string(),
            Dtype::Bool => "bool".to_string(),
            Dtype::Object => "object".to_string(),
            Dtype::DatetimeNaive => "datetime64[ns]".to_string(),
            Dtype::DatetimeTz(tz) => format!("datetime64[ns, {tz}]"),
        }
    }
}

impl FromStr for Dtype {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int64" => Ok(Dtype::Int64),
            "float64" => Ok(Dtype::Float64),
            "bool" => Ok(Dtype::Bool),
            "object" => Ok(Dtype::Object),
            "datetime64[ns]" => Ok(Dtype::DatetimeNaive),
            other => {
                if let Some(tz) = other
                    .strip_prefix("datetime64[ns, ")
                    .and_then(|rest| rest.strip_suffix(']'))
                {
                    Ok(Dtype::DatetimeTz(tz.to_string()))
                } else {
                    Err(format!("unknown dtype {other:?}"))
                }
            }
        }
    }
}

/// Positional result set with column metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    pub columns: Vec<String>,
    pub dtypes: Vec<Dtype>,
    pub rows: Vec<Vec<Cell>>,
}

impl RowBatch {
    pub fn new(columns: Vec<String>, dtypes: Vec<Dtype>) -> Self {
        debug_assert_eq!(columns.len(), dtypes.len());
        Self {
            columns,
            dtypes,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Encode for the control channel.
    ///
    /// With `Some(column_timezones)` (the data payload path), naive
    /// timestamp columns are localized to the timezone configured for the
    /// column, defaulting to UTC; ambiguous local times resolve to the
    /// earlier instant and nonexistent local times shift backward across
    /// the gap. With `None` (previews, deleted-row checks) timestamps are
    /// emitted as-is. Object columns have non-null cells cast to string
    /// either way.
    pub fn to_wire(mut self, column_timezones: Option<&HashMap<String, String>>) -> WirePayload {
        for (idx, dtype) in self.dtypes.iter_mut().enumerate() {
            match dtype {
                Dtype::DatetimeNaive => {
                    let Some(timezones) = column_timezones else {
                        continue;
                    };
                    let tz_name = timezones
                        .get(&self.columns[idx])
                        .map(String::as_str)
                        .unwrap_or("UTC");
                    let tz: Tz = tz_name.parse().unwrap_or(chrono_tz::UTC);
                    for row in &mut self.rows {
                        if let Cell::Timestamp(naive) = row[idx] {
                            row[idx] = Cell::TimestampTz(localize(naive, tz));
                        }
                    }
                    *dtype = Dtype::DatetimeTz(tz_name.to_string());
                }
                Dtype::Object => {
                    for row in &mut self.rows {
                        let cell = &mut row[idx];
                        if !cell.is_null() && !matches!(cell, Cell::Text(_)) {
                            *cell = Cell::Text(cell.csv_value());
                        }
                    }
                }
                _ => {}
            }
        }

        let values: Vec<Vec<serde_json::Value>> = self
            .rows
            .iter()
            .map(|row| row.iter().map(Cell::to_json).collect())
            .collect();

        WirePayload {
            values: serde_json::to_string(&values).unwrap_or_else(|_| "[]".to_string()),
            columns: self.columns,
            dtypes: self.dtypes.iter().map(Dtype::name).collect(),
        }
    }
}

/// Localize a naive timestamp into `tz`.
fn localize(naive: NaiveDateTime, tz: Tz) -> DateTime<FixedOffset> {
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt.fixed_offset(),
        chrono::LocalResult::Ambiguous(earliest, _) => earliest.fixed_offset(),
        chrono::LocalResult::None => {
            // Inside a DST gap: walk backward an hour at a time until the
            // local time exists again.
            let mut shifted = naive;
            for _ in 0..3 {
                shifted -= chrono::Duration::hours(1);
                if let chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) =
                    tz.from_local_datetime(&shifted)
                {
                    return dt.fixed_offset();
                }
            }
            Utc.from_utc_datetime(&naive).fixed_offset()
        }
    }
}

/// Order two cells of the same column: numerically when both sides are
/// numeric, chronologically for timestamps, lexicographically otherwise.
/// `None` when either side is null or the kinds cannot be compared.
pub fn compare_cells(a: &Cell, b: &Cell) -> Option<std::cmp::Ordering> {
    fn as_f64(cell: &Cell) -> Option<f64> {
        match cell {
            Cell::Int(v) => Some(*v as f64),
            Cell::Float(v) => Some(*v),
            Cell::Text(s) => s.parse().ok(),
            _ => None,
        }
    }
    fn as_utc(cell: &Cell) -> Option<NaiveDateTime> {
        match cell {
            Cell::Timestamp(v) => Some(*v),
            Cell::TimestampTz(v) => Some(v.naive_utc()),
            // Cursor values arrive as text; accept both timestamp spellings.
            Cell::Text(s) => NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
                .ok(),
            _ => None,
        }
    }

    match (a, b) {
        (Cell::Null, _) | (_, Cell::Null) => None,
        _ => {
            if let (Some(x), Some(y)) = (as_utc(a), as_utc(b)) {
                return x.partial_cmp(&y);
            }
            if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
                return x.partial_cmp(&y);
            }
            match (a, b) {
                (Cell::Text(x), Cell::Text(y)) => Some(x.cmp(y)),
                _ => None,
            }
        }
    }
}

const BLOB_MAGIC: &[u8; 4] = b"MPCB";
const BLOB_VERSION: u8 = 1;

impl RowBatch {
    /// Encode as a little-endian columnar binary blob: magic, version,
    /// column count, row count, per-column `(name, dtype)` header, then the
    /// tagged cell values column by column. Used for the deleted-rows
    /// primary-key uploads where row counts reach the millions.
    pub fn to_columnar_blob(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(BLOB_MAGIC);
        out.push(BLOB_VERSION);
        out.extend_from_slice(&(self.columns.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.rows.len() as u64).to_le_bytes());

        for (name, dtype) in self.columns.iter().zip(&self.dtypes) {
            push_str(&mut out, name);
            push_str(&mut out, &dtype.name());
        }

        for col in 0..self.columns.len() {
            for row in &self.rows {
                match &row[col] {
                    Cell::Null => out.push(0),
                    Cell::Int(v) => {
                        out.push(1);
                        out.extend_from_slice(&v.to_le_bytes());
                    }
                    Cell::Float(v) => {
                        out.push(2);
                        out.extend_from_slice(&v.to_le_bytes());
                    }
                    Cell::Bool(v) => {
                        out.push(3);
                        out.push(u8::from(*v));
                    }
                    cell @ (Cell::Text(_) | Cell::Timestamp(_) | Cell::TimestampTz(_)) => {
                        out.push(4);
                        push_str(&mut out, &cell.csv_value());
                    }
                }
            }
        }
        out
    }

    /// Decode a columnar blob produced by [`RowBatch::to_columnar_blob`].
    pub fn from_columnar_blob(data: &[u8]) -> Result<Self, String> {
        let mut cursor = Reader { data, pos: 0 };
        if cursor.take(4)? != BLOB_MAGIC {
            return Err("bad magic".to_string());
        }
        if cursor.take(1)?[0] != BLOB_VERSION {
            return Err("unsupported version".to_string());
        }
        let ncols = u16::from_le_bytes(cursor.take(2)?.try_into().unwrap()) as usize;
        let nrows = u64::from_le_bytes(cursor.take(8)?.try_into().unwrap()) as usize;

        let mut columns = Vec::with_capacity(ncols);
        let mut dtypes = Vec::with_capacity(ncols);
        for _ in 0..ncols {
            columns.push(cursor.take_str()?);
            dtypes.push(cursor.take_str()?.parse::<Dtype>()?);
        }

        let mut rows = vec![vec![Cell::Null; ncols]; nrows];
        for col in 0..ncols {
            for row in rows.iter_mut() {
                row[col] = match cursor.take(1)?[0] {
                    0 => Cell::Null,
                    1 => Cell::Int(i64::from_le_bytes(cursor.take(8)?.try_into().unwrap())),
                    2 => Cell::Float(f64::from_le_bytes(cursor.take(8)?.try_into().unwrap())),
                    3 => Cell::Bool(cursor.take(1)?[0] != 0),
                    4 => Cell::Text(cursor.take_str()?),
                    tag => return Err(format!("unknown cell tag {tag}")),
                };
            }
        }

        Ok(Self {
            columns,
            dtypes,
            rows,
        })
    }
}

fn push_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.pos + n > self.data.len() {
            return Err("truncated blob".to_string());
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_str(&mut self) -> Result<String, String> {
        let len = u32::from_le_bytes(self.take(4)?.try_into().unwrap()) as usize;
        String::from_utf8(self.take(len)?.to_vec()).map_err(|e| e.to_string())
    }
}

/// The `{values, columns, dtypes}` dictionary shipped inside `data_update`
/// messages and RPC replies.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WirePayload {
    /// JSON-encoded array of rows (arrays by column position).
    pub values: String,
    pub columns: Vec<String>,
    pub dtypes: Vec<String>,
}

impl WirePayload {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Decode back into a [`RowBatch`]. Inverse of [`RowBatch::to_wire`] for
    /// all supported dtypes.
    pub fn decode(&self) -> Result<RowBatch, String> {
        let dtypes: Vec<Dtype> = self
            .dtypes
            .iter()
            .map(|name| name.parse())
            .collect::<Result<_, _>>()?;
        let raw: Vec<Vec<serde_json::Value>> =
            serde_json::from_str(&self.values).map_err(|e| e.to_string())?;

        let mut rows = Vec::with_capacity(raw.len());
        for raw_row in raw {
            if raw_row.len() != dtypes.len() {
                return Err(format!(
                    "row width {} does not match {} columns",
                    raw_row.len(),
                    dtypes.len()
                ));
            }
            let mut row = Vec::with_capacity(raw_row.len());
            for (value, dtype) in raw_row.into_iter().zip(&dtypes) {
                row.push(decode_cell(value, dtype)?);
            }
            rows.push(row);
        }

        Ok(RowBatch {
            columns: self.columns.clone(),
            dtypes,
            rows,
        })
    }
}

fn decode_cell(value: serde_json::Value, dtype: &Dtype) -> Result<Cell, String> {
    if value.is_null() {
        return Ok(Cell::Null);
    }
    match dtype {
        Dtype::Int64 => value
            .as_i64()
            .map(Cell::Int)
            .ok_or_else(|| format!("expected int64, got {value}")),
        Dtype::Float64 => value
            .as_f64()
            .map(Cell::Float)
            .ok_or_else(|| format!("expected float64, got {value}")),
        Dtype::Bool => value
            .as_bool()
            .map(Cell::Bool)
            .ok_or_else(|| format!("expected bool, got {value}")),
        Dtype::Object => match value {
            serde_json::Value::String(s) => Ok(Cell::Text(s)),
            other => Ok(Cell::Text(other.to_string())),
        },
        Dtype::DatetimeNaive => {
            let s = value.as_str().ok_or("expected timestamp string")?;
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                .map(Cell::Timestamp)
                .map_err(|e| e.to_string())
        }
        Dtype::DatetimeTz(_) => {
            let s = value.as_str().ok_or("expected timestamp string")?;
            DateTime::parse_from_rfc3339(s)
                .map(Cell::TimestampTz)
                .map_err(|e| e.to_string())
        }
    }
}
