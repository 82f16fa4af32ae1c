//! In-process warehouse doubles for tests and `--dry-run`
//!
//! Both keep real table semantics (truncate vs append, recreate vs append)
//! so pipeline behaviour can be checked without a network.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::LoadError;
use crate::records::WriteDisposition;
use crate::retry::RetryPolicy;
use crate::staging::csv_codec;

use super::bigquery::{JobStatistics, LoadJobRunner, LoadJobSpec};
use super::snowflake::{
    BulkWriteReport, SnowflakeConnector, SnowflakeCredentials, SnowflakeSession, SnowflakeTable,
};

type Rows = Vec<Vec<Option<String>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct StoredTable {
    columns: Vec<String>,
    rows: Rows,
}

/// BigQuery stand-in that applies load jobs to in-memory tables
#[derive(Debug, Default)]
pub struct MemoryBigQuery {
    tables: Mutex<HashMap<String, StoredTable>>,
    jobs: AtomicUsize,
    failures: Mutex<Vec<LoadError>>,
}

impl MemoryBigQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next job with `error` (queued, first in first out)
    pub async fn fail_next(&self, error: LoadError) {
        self.failures.lock().await.push(error);
    }

    /// Jobs submitted, failed ones included
    pub fn job_count(&self) -> usize {
        self.jobs.load(Ordering::SeqCst)
    }

    pub async fn rows(&self, table: &str) -> Option<Rows> {
        self.tables.lock().await.get(table).map(|t| t.rows.clone())
    }

    pub async fn columns(&self, table: &str) -> Option<Vec<String>> {
        self.tables.lock().await.get(table).map(|t| t.columns.clone())
    }
}

#[async_trait]
impl LoadJobRunner for MemoryBigQuery {
    async fn run_load_job(
        &self,
        spec: &LoadJobSpec,
        _retry: &RetryPolicy,
    ) -> Result<JobStatistics, LoadError> {
        self.jobs.fetch_add(1, Ordering::SeqCst);
        let destination = spec.table.to_string();

        {
            let mut failures = self.failures.lock().await;
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }

        let batch = csv_codec::decode(&spec.payload).map_err(|e| LoadError::Rejected {
            destination: destination.clone(),
            message: e.to_string(),
        })?;
        if batch.columns() != spec.columns.as_slice() {
            return Err(LoadError::Rejected {
                destination,
                message: "CSV header does not match the declared schema".to_string(),
            });
        }

        let output_rows = batch.len() as u64;
        let (columns, rows) = batch.into_parts();
        let mut tables = self.tables.lock().await;

        let existing = match spec.disposition {
            WriteDisposition::Append => tables.get_mut(&destination),
            WriteDisposition::Truncate => None,
        };
        match existing {
            Some(existing) => {
                if existing.columns.len() != columns.len() {
                    return Err(LoadError::Rejected {
                        message: format!(
                            "table has {} columns, load has {}",
                            existing.columns.len(),
                            columns.len()
                        ),
                        destination,
                    });
                }
                existing.rows.extend(rows);
            },
            None => {
                tables.insert(destination, StoredTable { columns, rows });
            },
        }

        Ok(JobStatistics {
            job_id: spec.job_id.clone(),
            output_rows,
        })
    }
}

#[derive(Debug, Default)]
struct SnowflakeState {
    tables: Mutex<HashMap<String, StoredTable>>,
    ddl: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    fail_bulk: AtomicBool,
    fail_connect: AtomicBool,
}

/// Snowflake stand-in counting DDL and connection lifecycle
#[derive(Debug, Clone)]
pub struct MemorySnowflake {
    state: Arc<SnowflakeState>,
    chunk_rows: usize,
}

impl Default for MemorySnowflake {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySnowflake {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            chunk_rows: crate::config::DEFAULT_SNOWFLAKE_CHUNK_ROWS,
        }
    }

    pub fn with_chunk_rows(mut self, chunk_rows: usize) -> Self {
        self.chunk_rows = chunk_rows.max(1);
        self
    }

    /// Make bulk writes report failure
    pub fn set_fail_bulk(&self, fail: bool) {
        self.state.fail_bulk.store(fail, Ordering::SeqCst);
    }

    /// Make connection attempts fail with an auth error
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// CREATE OR REPLACE statements executed
    pub fn ddl_count(&self) -> usize {
        self.state.ddl.load(Ordering::SeqCst)
    }

    pub fn connections_opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub async fn rows(&self, table: &SnowflakeTable) -> Option<Rows> {
        self.state
            .tables
            .lock()
            .await
            .get(&table.to_string())
            .map(|t| t.rows.clone())
    }

    pub async fn columns(&self, table: &SnowflakeTable) -> Option<Vec<String>> {
        self.state
            .tables
            .lock()
            .await
            .get(&table.to_string())
            .map(|t| t.columns.clone())
    }
}

#[async_trait]
impl SnowflakeConnector for MemorySnowflake {
    async fn connect(
        &self,
        credentials: &SnowflakeCredentials,
        table: &SnowflakeTable,
    ) -> Result<Box<dyn SnowflakeSession>, LoadError> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(LoadError::Unauthorized {
                destination: table.to_string(),
                message: format!("user {} is not authorized", credentials.user),
            });
        }

        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            state: self.state.clone(),
            chunk_rows: self.chunk_rows,
        }))
    }
}

struct MemorySession {
    state: Arc<SnowflakeState>,
    chunk_rows: usize,
}

#[async_trait]
impl SnowflakeSession for MemorySession {
    async fn recreate_table(&self, table: &SnowflakeTable, columns: &[String]) -> Result<(), LoadError> {
        self.state.ddl.fetch_add(1, Ordering::SeqCst);
        self.state.tables.lock().await.insert(
            table.to_string(),
            StoredTable {
                columns: columns.to_vec(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn write_rows(
        &self,
        table: &SnowflakeTable,
        _columns: &[String],
        rows: &[Vec<Option<String>>],
    ) -> Result<BulkWriteReport, LoadError> {
        if self.state.fail_bulk.load(Ordering::SeqCst) {
            return Ok(BulkWriteReport {
                success: false,
                chunks: 0,
                rows: 0,
            });
        }

        let mut tables = self.state.tables.lock().await;
        let stored = tables
            .get_mut(&table.to_string())
            .ok_or_else(|| LoadError::Rejected {
                destination: table.to_string(),
                message: "table does not exist".to_string(),
            })?;
        stored.rows.extend(rows.iter().cloned());

        Ok(BulkWriteReport {
            success: true,
            chunks: rows.len().div_ceil(self.chunk_rows) as u32,
            rows: rows.len() as u64,
        })
    }

    async fn close(&self) -> Result<(), LoadError> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
