//! CSV encoding of row batches for the staging store
//!
//! One header row, `\n` line endings, quotes only where a field needs them.
//! A missing value is an empty field and an empty field reads back as missing,
//! so empty strings do not survive a round trip.

use csv::{QuoteStyle, ReaderBuilder, Terminator, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use crate::error::ParseError;
use crate::records::RowBatch;

pub const CSV_CONTENT_TYPE: &str = "text/csv";

/// Free-text column that carries Windows paths and stray escapes in the
/// 311 service-request feeds
pub const DEFAULT_QUOTED_COLUMN: &str = "description";

/// Content pre-clean applied before a batch is written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CsvCleaning {
    /// Write values untouched
    None,
    /// Wrap any value containing a backslash in literal double quotes, for
    /// the named columns only
    QuoteBackslashes { columns: Vec<String> },
}

impl Default for CsvCleaning {
    fn default() -> Self {
        CsvCleaning::QuoteBackslashes {
            columns: vec![DEFAULT_QUOTED_COLUMN.to_string()],
        }
    }
}

impl CsvCleaning {
    /// Cleaning for a configured column list; an empty list disables it
    pub fn for_columns(columns: Vec<String>) -> Self {
        if columns.is_empty() {
            CsvCleaning::None
        } else {
            CsvCleaning::QuoteBackslashes { columns }
        }
    }

    fn quoted_indices(&self, batch: &RowBatch) -> Vec<usize> {
        match self {
            CsvCleaning::None => Vec::new(),
            CsvCleaning::QuoteBackslashes { columns } => columns
                .iter()
                .filter_map(|column| batch.column_index(column))
                .collect(),
        }
    }
}

fn clean<'a>(value: &'a str, quote: bool) -> Cow<'a, str> {
    if quote && value.contains('\\') {
        Cow::Owned(format!("\"{value}\""))
    } else {
        Cow::Borrowed(value)
    }
}

/// Serialize a batch; a batch without columns encodes to nothing
pub fn encode(batch: &RowBatch, cleaning: &CsvCleaning) -> Result<Vec<u8>, ParseError> {
    if batch.columns().is_empty() {
        return Ok(Vec::new());
    }

    let quoted = cleaning.quoted_indices(batch);
    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::Necessary)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    writer.write_record(batch.columns()).map_err(csv_error)?;

    for row in batch.rows() {
        let fields: Vec<Cow<'_, str>> = row
            .iter()
            .enumerate()
            .map(|(index, cell)| match cell {
                Some(value) => clean(value, quoted.contains(&index)),
                None => Cow::Borrowed(""),
            })
            .collect();
        writer
            .write_record(fields.iter().map(|field| field.as_bytes()))
            .map_err(csv_error)?;
    }

    writer.into_inner().map_err(|e| ParseError::Malformed {
        message: e.to_string(),
    })
}

/// Parse a staged payload back into a batch
pub fn decode(payload: &[u8]) -> Result<RowBatch, ParseError> {
    let text = std::str::from_utf8(payload).map_err(|e| ParseError::Encoding {
        message: e.to_string(),
    })?;

    if text.trim().is_empty() {
        return Ok(RowBatch::default());
    }

    check_quotes(text)?;

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(text.as_bytes());

    let columns = reader
        .headers()
        .map_err(csv_error)?
        .iter()
        .map(str::to_string)
        .collect();
    let mut batch = RowBatch::new(columns);

    for record in reader.records() {
        let record = record.map_err(csv_error)?;
        let row = record
            .iter()
            .map(|field| (!field.is_empty()).then(|| field.to_string()))
            .collect();
        batch.push_row(row)?;
    }

    Ok(batch)
}

/// Reject payloads whose quoting never closes
///
/// The csv reader would silently swallow the rest of the file into one field.
fn check_quotes(text: &str) -> Result<(), ParseError> {
    let mut line = 1u64;
    let mut open_line = None;

    for ch in text.chars() {
        match ch {
            '"' => {
                open_line = match open_line {
                    Some(_) => None,
                    None => Some(line),
                };
            },
            '\n' => line += 1,
            _ => {},
        }
    }

    match open_line {
        Some(line) => Err(ParseError::UnbalancedQuote { line }),
        None => Ok(()),
    }
}

fn csv_error(err: csv::Error) -> ParseError {
    match err.kind() {
        csv::ErrorKind::UnequalLengths {
            pos,
            expected_len,
            len,
        } => ParseError::Arity {
            line: pos.as_ref().map(|p| p.line()).unwrap_or_default(),
            expected: *expected_len as usize,
            found: *len as usize,
        },
        csv::ErrorKind::Utf8 { err, .. } => ParseError::Encoding {
            message: err.to_string(),
        },
        _ => ParseError::Malformed {
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(columns: &[&str], rows: &[&[Option<&str>]]) -> RowBatch {
        RowBatch::from_parts(
            columns.iter().map(|c| c.to_string()).collect(),
            rows.iter()
                .map(|row| row.iter().map(|cell| cell.map(str::to_string)).collect())
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_encode_writes_header_once() {
        let rows = batch(
            &["service_request_id", "status"],
            &[&[Some("101"), Some("open")], &[Some("102"), None]],
        );

        let payload = encode(&rows, &CsvCleaning::None).unwrap();

        assert_eq!(
            String::from_utf8(payload).unwrap(),
            "service_request_id,status\n101,open\n102,\n"
        );
    }

    #[test]
    fn test_round_trip_preserves_order_and_values() {
        let rows = batch(
            &["id", "address", "notes"],
            &[
                &[Some("1"), Some("12 Main St, Apt 4"), Some("said \"hello\"")],
                &[Some("2"), None, Some("line one\nline two")],
                &[Some("3"), Some("Elm"), None],
            ],
        );

        let payload = encode(&rows, &CsvCleaning::default()).unwrap();
        assert_eq!(decode(&payload).unwrap(), rows);
    }

    #[test]
    fn test_backslashes_quoted_only_in_configured_columns() {
        let rows = batch(
            &["description", "path"],
            &[&[Some(r"see C:\tmp"), Some(r"C:\tmp")], &[Some("plain"), None]],
        );

        let payload = encode(&rows, &CsvCleaning::default()).unwrap();
        let decoded = decode(&payload).unwrap();

        assert_eq!(decoded.rows()[0][0].as_deref(), Some(r#""see C:\tmp""#));
        assert_eq!(decoded.rows()[0][1].as_deref(), Some(r"C:\tmp"));
        assert_eq!(decoded.rows()[1][0].as_deref(), Some("plain"));
    }

    #[test]
    fn test_empty_batch_round_trip() {
        let payload = encode(&RowBatch::default(), &CsvCleaning::default()).unwrap();
        assert!(payload.is_empty());
        assert_eq!(decode(&payload).unwrap(), RowBatch::default());
    }

    #[test]
    fn test_header_only_payload_has_columns_and_no_rows() {
        let decoded = decode(b"a,b\n").unwrap();
        assert_eq!(decoded.columns(), ["a", "b"]);
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_decode_rejects_ragged_rows() {
        let err = decode(b"a,b\n1,2\n3\n").unwrap_err();
        assert!(matches!(err, ParseError::Arity { expected: 2, found: 1, .. }));
    }

    #[test]
    fn test_decode_rejects_unbalanced_quote() {
        let err = decode(b"a,b\n1,\"open\n2,3\n").unwrap_err();
        assert_eq!(err, ParseError::UnbalancedQuote { line: 2 });
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        let err = decode(&[b'a', b'\n', 0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, ParseError::Encoding { .. }));
    }

    #[test]
    fn test_cleaning_for_empty_column_list_is_none() {
        assert_eq!(CsvCleaning::for_columns(Vec::new()), CsvCleaning::None);
    }
}
