//! Row model shared by every pipeline stage
//!
//! Records arrive from the source API as flat JSON objects and leave for the
//! warehouses as text. [`RowBatch`] is the normalized, column-ordered form in
//! between: one header, one `Option<String>` per cell, records in arrival order.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

/// One source record as returned by the collection endpoint
pub type Record = Map<String, Value>;

/// An ordered run of records sharing one header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowBatch {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl RowBatch {
    /// An empty batch with a fixed header
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a batch from already-normalized cells, checking every row's width
    pub fn from_parts(
        columns: Vec<String>,
        rows: Vec<Vec<Option<String>>>,
    ) -> Result<Self, ParseError> {
        let mut batch = Self::new(columns);
        for row in rows {
            batch.push_row(row)?;
        }
        Ok(batch)
    }

    /// Normalize source records
    ///
    /// The header is the union of keys in first-seen order; a record missing a
    /// key gets `None` in that column.
    pub fn from_records(records: Vec<Record>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for record in &records {
            for key in record.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|column| record.get(column).and_then(normalize_value))
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
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

    pub fn push_row(&mut self, row: Vec<Option<String>>) -> Result<(), ParseError> {
        if row.len() != self.columns.len() {
            return Err(ParseError::Arity {
                line: self.rows.len() as u64 + 2,
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    /// Concatenate `other` after this batch
    ///
    /// Columns only `other` has are appended to the header and back-filled
    /// with `None` for the rows already here.
    pub fn append(&mut self, other: RowBatch) {
        if self.columns.is_empty() && self.rows.is_empty() {
            *self = other;
            return;
        }

        for column in &other.columns {
            if self.column_index(column).is_none() {
                self.columns.push(column.clone());
                for row in &mut self.rows {
                    row.push(None);
                }
            }
        }

        let mapping: Vec<Option<usize>> = self
            .columns
            .iter()
            .map(|column| other.column_index(column))
            .collect();

        for mut row in other.rows {
            let aligned = mapping
                .iter()
                .map(|source| source.and_then(|i| row.get_mut(i).and_then(Option::take)))
                .collect();
            self.rows.push(aligned);
        }
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<Vec<Option<String>>>) {
        (self.columns, self.rows)
    }
}

/// Render a JSON value as warehouse text
///
/// `null` stays absent; nested arrays and objects keep their JSON form.
pub fn normalize_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

/// Everything fetched for one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    rows: RowBatch,
    batch_count: usize,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, batch: RowBatch) {
        self.rows.append(batch);
        self.batch_count += 1;
    }

    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &RowBatch {
        &self.rows
    }

    pub fn into_rows(self) -> RowBatch {
        self.rows
    }
}

/// Whether a load replaces or adds to a table's contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WriteDisposition {
    #[default]
    #[serde(rename = "WRITE_TRUNCATE", alias = "truncate")]
    Truncate,
    #[serde(rename = "WRITE_APPEND", alias = "append")]
    Append,
}

impl WriteDisposition {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteDisposition::Truncate => "WRITE_TRUNCATE",
            WriteDisposition::Append => "WRITE_APPEND",
        }
    }
}

impl fmt::Display for WriteDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WriteDisposition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "WRITE_TRUNCATE" | "TRUNCATE" => Ok(WriteDisposition::Truncate),
            "WRITE_APPEND" | "APPEND" => Ok(WriteDisposition::Append),
            _ => Err(format!(
                "unknown write disposition {s:?} (expected WRITE_TRUNCATE or WRITE_APPEND)"
            )),
        }
    }
}

/// Per-table first-batch tracking for one multi-batch run
///
/// Starts out expecting a destructive first write; flips after the first
/// successful one. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableWriteState {
    first_batch: bool,
}

impl Default for TableWriteState {
    fn default() -> Self {
        Self::new()
    }
}

impl TableWriteState {
    pub fn new() -> Self {
        Self { first_batch: true }
    }

    pub fn is_first_batch(&self) -> bool {
        self.first_batch
    }

    /// Disposition for the next write: the requested one on the first batch,
    /// append afterwards
    pub fn disposition(&self, requested: WriteDisposition) -> WriteDisposition {
        if self.first_batch {
            requested
        } else {
            WriteDisposition::Append
        }
    }

    pub fn mark_written(&mut self) {
        self.first_batch = false;
    }
}
