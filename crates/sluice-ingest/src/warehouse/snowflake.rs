//! Warehouse B: Snowflake
//!
//! Every column is stored as `VARCHAR(16777216)` under its upper-cased name.
//! The first write of a run recreates the table from the current batch's
//! header; later writes append blind. A schema change between batches is
//! not detected.
//!
//! A session is opened per call and closed on every exit path.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Secret, SnowflakeConfig};
use crate::error::LoadError;
use crate::records::RowBatch;
use crate::retry::RetryPolicy;

use super::LoadResult;

/// Widest Snowflake text type
pub const WIDE_TEXT_TYPE: &str = "VARCHAR(16777216)";

const TOKEN_TYPE_HEADER: &str = "X-Snowflake-Authorization-Token-Type";
const STATEMENT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnowflakeCredentials {
    pub account: String,
    pub user: String,
    pub token: Secret,
    /// `OAUTH`, `KEYPAIR_JWT` or `PROGRAMMATIC_ACCESS_TOKEN`
    pub token_type: String,
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnowflakeTable {
    pub warehouse: String,
    pub database: String,
    pub schema: String,
    pub table: String,
}

impl SnowflakeTable {
    pub fn new(
        warehouse: impl Into<String>,
        database: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            warehouse: warehouse.into(),
            database: database.into(),
            schema: schema.into(),
            table: table.into(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("warehouse", &self.warehouse),
            ("database", &self.database),
            ("schema", &self.schema),
            ("table", &self.table),
        ] {
            if value.trim().is_empty() {
                return Err(format!("Snowflake {name} cannot be empty"));
            }
        }
        Ok(())
    }

    /// `"DB"."SCHEMA"."TABLE"`
    pub fn qualified_name(&self) -> String {
        format!(
            "{}.{}.{}",
            quote_ident(&self.database),
            quote_ident(&self.schema),
            quote_ident(&self.table)
        )
    }
}

impl fmt::Display for SnowflakeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.database.to_uppercase(),
            self.schema.to_uppercase(),
            self.table.to_uppercase()
        )
    }
}

/// Upper-cased, double-quoted identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.to_uppercase().replace('"', "\"\""))
}

/// DDL recreating the table with one wide text column per header entry
pub fn create_or_replace_sql(table: &SnowflakeTable, columns: &[String]) -> String {
    let definitions: Vec<String> = columns
        .iter()
        .map(|column| format!("{} {WIDE_TEXT_TYPE}", quote_ident(column)))
        .collect();
    format!(
        "CREATE OR REPLACE TABLE {} ({})",
        table.qualified_name(),
        definitions.join(", ")
    )
}

/// Multi-row INSERT with positional binds
pub fn insert_sql(table: &SnowflakeTable, columns: &[String], rows: usize) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let tuple = format!("({})", vec!["?"; columns.len()].join(", "));
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        table.qualified_name(),
        names.join(", "),
        vec![tuple; rows].join(", ")
    )
}

/// Result of a bulk append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkWriteReport {
    pub success: bool,
    pub chunks: u32,
    pub rows: u64,
}

#[async_trait]
pub trait SnowflakeConnector: Send + Sync {
    async fn connect(
        &self,
        credentials: &SnowflakeCredentials,
        table: &SnowflakeTable,
    ) -> Result<Box<dyn SnowflakeSession>, LoadError>;
}

/// An open connection scoped to one warehouse/database/schema
#[async_trait]
pub trait SnowflakeSession: Send + Sync {
    async fn recreate_table(&self, table: &SnowflakeTable, columns: &[String]) -> Result<(), LoadError>;

    /// Append rows; a destination-side failure is `success: false`
    async fn write_rows(
        &self,
        table: &SnowflakeTable,
        columns: &[String],
        rows: &[Vec<Option<String>>],
    ) -> Result<BulkWriteReport, LoadError>;

    async fn close(&self) -> Result<(), LoadError>;
}

pub struct SnowflakeLoader {
    connector: Arc<dyn SnowflakeConnector>,
    retry: RetryPolicy,
}

impl fmt::Debug for SnowflakeLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnowflakeLoader")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl SnowflakeLoader {
    pub fn new(connector: Arc<dyn SnowflakeConnector>, retry: RetryPolicy) -> Self {
        Self { connector, retry }
    }

    /// Recreate (when `truncate_first`) and append
    #[instrument(skip(self, batch, credentials), fields(destination = %table, rows = batch.len()))]
    pub async fn load(
        &self,
        batch: &RowBatch,
        credentials: &SnowflakeCredentials,
        table: &SnowflakeTable,
        truncate_first: bool,
    ) -> Result<LoadResult, LoadError> {
        let destination = table.to_string();

        table.validate().map_err(|reason| LoadError::InvalidInput {
            destination: destination.clone(),
            reason,
        })?;

        let columns: Vec<String> = batch.columns().iter().map(|c| c.to_uppercase()).collect();
        if truncate_first && columns.is_empty() {
            return Err(LoadError::InvalidInput {
                destination,
                reason: "batch has no columns to create the table from".to_string(),
            });
        }

        let session = self
            .retry
            .run("snowflake_connect", || self.connector.connect(credentials, table))
            .await?;

        let outcome = self
            .write(session.as_ref(), batch, table, &columns, truncate_first)
            .await;

        if let Err(err) = session.close().await {
            warn!(error = %err, "Failed to close Snowflake session");
        }

        outcome
    }

    async fn write(
        &self,
        session: &dyn SnowflakeSession,
        batch: &RowBatch,
        table: &SnowflakeTable,
        columns: &[String],
        truncate_first: bool,
    ) -> Result<LoadResult, LoadError> {
        let destination = table.to_string();

        if truncate_first {
            self.retry
                .run("snowflake_recreate", || session.recreate_table(table, columns))
                .await?;
            info!(
                columns = columns.len(),
                "Created or replaced table {} with all columns as {}", destination, WIDE_TEXT_TYPE
            );
        }

        let report = session.write_rows(table, columns, batch.rows()).await?;
        if !report.success {
            error!(chunks = report.chunks, rows = report.rows, "Bulk write to {} failed", destination);
            return Err(LoadError::BulkWrite {
                destination,
                chunks: report.chunks,
                rows: report.rows,
            });
        }

        info!(chunks = report.chunks, "Loaded {} rows into {}", report.rows, destination);
        Ok(LoadResult {
            destination,
            rows_loaded: report.rows,
            chunks: report.chunks,
        })
    }
}

/// Sessions over the Snowflake SQL API v2
#[derive(Debug, Clone)]
pub struct SqlApiConnector {
    client: Client,
    base_url: Option<String>,
    chunk_rows: usize,
    statement_timeout: Duration,
    poll_interval: Duration,
}

impl SqlApiConnector {
    pub fn new(config: &SnowflakeConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("sluice/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: config
                .base_url
                .as_ref()
                .map(|url| url.trim_end_matches('/').to_string()),
            chunk_rows: config.chunk_rows.max(1),
            statement_timeout: Duration::from_secs(config.statement_timeout_secs),
            poll_interval: STATEMENT_POLL_INTERVAL,
        })
    }

    /// Shorten the status poll interval, mainly for tests
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl SnowflakeConnector for SqlApiConnector {
    async fn connect(
        &self,
        credentials: &SnowflakeCredentials,
        table: &SnowflakeTable,
    ) -> Result<Box<dyn SnowflakeSession>, LoadError> {
        let base_url = self
            .base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}.snowflakecomputing.com", credentials.account));

        let session = SqlApiSession {
            client: self.client.clone(),
            base_url,
            credentials: credentials.clone(),
            table: table.clone(),
            chunk_rows: self.chunk_rows,
            statement_timeout: self.statement_timeout,
            poll_interval: self.poll_interval,
            closed: AtomicBool::new(false),
        };

        session.execute("SELECT 1", None).await?;
        debug!(account = %credentials.account, user = %credentials.user, "Snowflake session opened");

        Ok(Box::new(session))
    }
}

struct SqlApiSession {
    client: Client,
    base_url: String,
    credentials: SnowflakeCredentials,
    table: SnowflakeTable,
    chunk_rows: usize,
    statement_timeout: Duration,
    poll_interval: Duration,
    closed: AtomicBool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    statement_handle: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl SqlApiSession {
    fn destination(&self) -> String {
        self.table.to_string()
    }

    fn transport(&self, err: reqwest::Error) -> LoadError {
        LoadError::Transport {
            destination: self.destination(),
            message: err.to_string(),
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(self.credentials.token.expose())
            .header(TOKEN_TYPE_HEADER, &self.credentials.token_type)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    /// Run one statement to completion
    async fn execute(&self, statement: &str, bindings: Option<Map<String, Value>>) -> Result<(), LoadError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LoadError::InvalidInput {
                destination: self.destination(),
                reason: "session already closed".to_string(),
            });
        }

        let mut body = json!({
            "statement": statement,
            "timeout": self.statement_timeout.as_secs(),
            "warehouse": self.table.warehouse,
            "database": self.table.database,
            "schema": self.table.schema,
        });
        if let Some(role) = &self.credentials.role {
            body["role"] = json!(role);
        }
        if let Some(bindings) = bindings {
            body["bindings"] = Value::Object(bindings);
        }

        let url = format!("{}/api/v2/statements", self.base_url);
        let response = self
            .request(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        let deadline = tokio::time::Instant::now() + self.statement_timeout;
        let (mut status, mut parsed) = self.read(response).await?;

        while status == StatusCode::ACCEPTED {
            let handle = parsed.statement_handle.clone().ok_or_else(|| LoadError::Transport {
                destination: self.destination(),
                message: "statement accepted without a handle".to_string(),
            })?;
            if tokio::time::Instant::now() >= deadline {
                return Err(LoadError::Timeout {
                    destination: self.destination(),
                    seconds: self.statement_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;

            let url = format!("{}/api/v2/statements/{}", self.base_url, handle);
            let response = self
                .request(self.client.get(&url))
                .send()
                .await
                .map_err(|e| self.transport(e))?;
            (status, parsed) = self.read(response).await?;
        }

        Ok(())
    }

    async fn read(&self, response: reqwest::Response) -> Result<(StatusCode, StatementResponse), LoadError> {
        let status = response.status();
        let text = response.text().await.map_err(|e| self.transport(e))?;
        let parsed: StatementResponse = serde_json::from_str(&text).unwrap_or(StatementResponse {
            statement_handle: None,
            message: Some(text.chars().take(512).collect()),
        });

        if status.is_success() {
            Ok((status, parsed))
        } else {
            Err(LoadError::from_status(
                &self.destination(),
                status.as_u16(),
                parsed.message.unwrap_or_default(),
            ))
        }
    }
}

fn bindings_for(rows: &[Vec<Option<String>>]) -> Map<String, Value> {
    let mut bindings = Map::new();
    for (index, value) in rows.iter().flatten().enumerate() {
        bindings.insert(
            (index + 1).to_string(),
            json!({ "type": "TEXT", "value": value }),
        );
    }
    bindings
}

#[async_trait]
impl SnowflakeSession for SqlApiSession {
    async fn recreate_table(&self, table: &SnowflakeTable, columns: &[String]) -> Result<(), LoadError> {
        self.execute(&create_or_replace_sql(table, columns), None).await
    }

    async fn write_rows(
        &self,
        table: &SnowflakeTable,
        columns: &[String],
        rows: &[Vec<Option<String>>],
    ) -> Result<BulkWriteReport, LoadError> {
        let mut report = BulkWriteReport {
            success: true,
            chunks: 0,
            rows: 0,
        };

        for chunk in rows.chunks(self.chunk_rows) {
            let sql = insert_sql(table, columns, chunk.len());
            match self.execute(&sql, Some(bindings_for(chunk))).await {
                Ok(()) => {
                    report.chunks += 1;
                    report.rows += chunk.len() as u64;
                    debug!(chunk = report.chunks, rows = chunk.len(), "Inserted chunk");
                },
                Err(LoadError::Rejected { message, .. }) => {
                    error!(chunk = report.chunks + 1, message = %message, "Insert rejected");
                    report.success = false;
                    return Ok(report);
                },
                Err(err) => return Err(err),
            }
        }

        Ok(report)
    }

    async fn close(&self) -> Result<(), LoadError> {
        self.closed.store(true, Ordering::SeqCst);
        debug!("Snowflake session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SnowflakeTable {
        SnowflakeTable::new("LOAD_WH", "raw", "public", "service_requests")
    }

    #[test]
    fn test_create_or_replace_sql() {
        let sql = create_or_replace_sql(&table(), &["ID".to_string(), "STATUS".to_string()]);
        assert_eq!(
            sql,
            r#"CREATE OR REPLACE TABLE "RAW"."PUBLIC"."SERVICE_REQUESTS" ("ID" VARCHAR(16777216), "STATUS" VARCHAR(16777216))"#
        );
    }

    #[test]
    fn test_identifiers_are_escaped() {
        assert_eq!(quote_ident(r#"we"ird"#), r#""WE""IRD""#);
    }

    #[test]
    fn test_insert_sql() {
        assert_eq!(
            insert_sql(&table(), &["A".to_string(), "B".to_string()], 2),
            r#"INSERT INTO "RAW"."PUBLIC"."SERVICE_REQUESTS" ("A", "B") VALUES (?, ?), (?, ?)"#
        );
    }

    #[test]
    fn test_bindings_keep_nulls_distinct() {
        let bindings = bindings_for(&[vec![Some("x".to_string()), None]]);
        assert_eq!(bindings["1"], json!({"type": "TEXT", "value": "x"}));
        assert_eq!(bindings["2"], json!({"type": "TEXT", "value": null}));
    }

    #[test]
    fn test_display_is_uppercased() {
        assert_eq!(table().to_string(), "RAW.PUBLIC.SERVICE_REQUESTS");
    }

    #[test]
    fn test_credentials_debug_hides_token() {
        let credentials = SnowflakeCredentials {
            account: "xy12345".to_string(),
            user: "loader".to_string(),
            token: Secret::new("t0k3n"),
            token_type: "OAUTH".to_string(),
            role: None,
        };
        assert!(!format!("{credentials:?}").contains("t0k3n"));
    }
}
