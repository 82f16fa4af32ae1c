//! Error taxonomy for the extract-load engine
//!
//! Each component boundary has its own error type so a caller can tell a
//! truncated fetch from a failed upload from a rejected warehouse load.
//! [`PipelineError`] is what the orchestrator hands back to a trigger.

use serde::Serialize;
use thiserror::Error;

use crate::pipeline::RunReport;
use crate::warehouse::Sink;

/// Classifies whether an I/O failure is worth another attempt
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

fn retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// A page request that did not produce a batch
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchError {
    #[error("request at offset {offset} failed with HTTP {status}")]
    Status { offset: u64, status: u16 },

    #[error("request at offset {offset} failed: {message}")]
    Transport { offset: u64, message: String },

    #[error("response at offset {offset} is not a JSON array of objects: {message}")]
    Decode { offset: u64, message: String },
}

impl FetchError {
    /// Offset of the page that failed
    pub fn offset(&self) -> u64 {
        match self {
            FetchError::Status { offset, .. }
            | FetchError::Transport { offset, .. }
            | FetchError::Decode { offset, .. } => *offset,
        }
    }
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => retryable_status(*status),
            FetchError::Transport { .. } => true,
            FetchError::Decode { .. } => false,
        }
    }
}

/// Staging store read/write failures
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageError {
    #[error("staged object {location} does not exist")]
    NotFound { location: String },

    #[error("upload to {location} failed: {message}")]
    Upload { location: String, message: String },

    #[error("download from {location} failed: {message}")]
    Download { location: String, message: String },

    #[error("checksum mismatch for {location}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        location: String,
        expected: String,
        actual: String,
    },
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Upload { .. } | StorageError::Download { .. })
    }
}

/// Malformed staged CSV
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParseError {
    #[error("staged CSV is not valid UTF-8: {message}")]
    Encoding { message: String },

    #[error("quoted field opened on line {line} is never closed")]
    UnbalancedQuote { line: u64 },

    #[error("row on line {line} has {found} fields, header has {expected}")]
    Arity {
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("malformed CSV: {message}")]
    Malformed { message: String },
}

/// Either half of a stage/unstage round trip
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(untagged)]
pub enum StagingError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl Retryable for StagingError {
    fn is_retryable(&self) -> bool {
        match self {
            StagingError::Storage(err) => err.is_retryable(),
            StagingError::Parse(_) => false,
        }
    }
}

/// A warehouse refused, failed, or could not be reached for a load
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoadError {
    #[error("{destination} rejected the load: {message}")]
    Rejected { destination: String, message: String },

    #[error("{destination} refused the credentials: {message}")]
    Unauthorized { destination: String, message: String },

    #[error("could not reach {destination}: {message}")]
    Transport { destination: String, message: String },

    #[error("{destination} did not finish within {seconds}s")]
    Timeout { destination: String, seconds: u64 },

    #[error("bulk write to {destination} reported failure after {chunks} chunk(s) and {rows} row(s)")]
    BulkWrite {
        destination: String,
        chunks: u32,
        rows: u64,
    },

    #[error("cannot load into {destination}: {reason}")]
    InvalidInput { destination: String, reason: String },
}

impl LoadError {
    /// Map an HTTP status from a warehouse API onto the taxonomy
    pub fn from_status(destination: &str, status: u16, message: impl Into<String>) -> Self {
        let destination = destination.to_string();
        let message = message.into();
        match status {
            401 | 403 => LoadError::Unauthorized {
                destination,
                message,
            },
            s if retryable_status(s) => LoadError::Transport {
                destination,
                message: format!("HTTP {s}: {message}"),
            },
            _ => LoadError::Rejected {
                destination,
                message,
            },
        }
    }
}

impl Retryable for LoadError {
    fn is_retryable(&self) -> bool {
        matches!(self, LoadError::Transport { .. })
    }
}

/// Failure of a pipeline operation as reported to a trigger
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("fetch stopped after {batches} batch(es): {source}")]
    Fetch {
        batches: usize,
        #[source]
        source: FetchError,
    },

    #[error("staging {location} failed: {source}")]
    Staging {
        location: String,
        #[source]
        source: StagingError,
    },

    #[error("{sink} load failed: {source}")]
    Load {
        sink: Sink,
        #[source]
        source: LoadError,
    },

    #[error("{}", incomplete_message(.0))]
    Incomplete(Box<RunReport>),

    #[error("invalid configuration: {0}")]
    Config(#[from] sluice_common::SluiceError),
}

impl PipelineError {
    /// The run report, when the failure happened after a run got going
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            PipelineError::Incomplete(report) => Some(report.as_ref()),
            _ => None,
        }
    }
}

fn incomplete_message(report: &RunReport) -> String {
    format!("run {} incomplete: {}", report.run_id, report.failure_summary())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_retryability() {
        assert!(FetchError::Status { offset: 0, status: 503 }.is_retryable());
        assert!(FetchError::Status { offset: 0, status: 429 }.is_retryable());
        assert!(!FetchError::Status { offset: 0, status: 404 }.is_retryable());
        assert!(!FetchError::Decode { offset: 0, message: "x".into() }.is_retryable());
    }

    #[test]
    fn test_load_error_from_status() {
        assert!(matches!(
            LoadError::from_status("bq", 403, "denied"),
            LoadError::Unauthorized { .. }
        ));
        assert!(LoadError::from_status("bq", 502, "bad gateway").is_retryable());
        assert!(matches!(
            LoadError::from_status("bq", 400, "bad schema"),
            LoadError::Rejected { .. }
        ));
    }

    #[test]
    fn test_staging_error_message_names_location() {
        let err = PipelineError::Staging {
            location: "s3://seeds/data/x.csv".to_string(),
            source: StagingError::Storage(StorageError::Upload {
                location: "s3://seeds/data/x.csv".to_string(),
                message: "connection reset".to_string(),
            }),
        };
        assert_eq!(
            err.to_string(),
            "staging s3://seeds/data/x.csv failed: upload to s3://seeds/data/x.csv failed: connection reset"
        );
    }
}
