//! Warehouse loaders
//!
//! - [`bigquery`]: load jobs with an atomic truncate-or-append disposition
//! - [`snowflake`]: recreate a wide VARCHAR table, then bulk append
//!
//! Each loader sits on a small trait (the remote API) with an HTTP client for
//! production and an in-memory double in [`memory`].

pub mod bigquery;
pub mod memory;
pub mod snowflake;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use bigquery::{BigQueryLoader, BigQueryRestClient, BigQueryTable, SchemaMode};
pub use memory::{MemoryBigQuery, MemorySnowflake};
pub use snowflake::{SnowflakeCredentials, SnowflakeLoader, SnowflakeTable, SqlApiConnector};

/// The two replication targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sink {
    BigQuery,
    Snowflake,
}

impl fmt::Display for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sink::BigQuery => f.write_str("bigquery"),
            Sink::Snowflake => f.write_str("snowflake"),
        }
    }
}

/// A completed load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResult {
    /// Fully qualified table name
    pub destination: String,
    pub rows_loaded: u64,
    /// Load jobs or insert statements issued
    pub chunks: u32,
}
