//! Pipeline configuration
//!
//! [`PipelineConfig::from_env`] is the only code that reads the process
//! environment. Every component receives its slice of the tree at
//! construction.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use sluice_common::{Result, SluiceError};

use crate::fetcher::{ApiAuth, FetchRequest, DEFAULT_BATCH_SIZE, DEFAULT_HTTP_TIMEOUT_SECS};
use crate::records::WriteDisposition;
use crate::retry::{RetryPolicy, DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_BACKOFF_MS};
use crate::staging::csv_codec::DEFAULT_QUOTED_COLUMN;
use crate::staging::{CsvCleaning, ObjectLocation};
use crate::warehouse::bigquery::{BigQueryTable, SchemaMode};
use crate::warehouse::snowflake::{SnowflakeCredentials, SnowflakeTable};

// ============================================================================
// Defaults
// ============================================================================

/// Default S3 region for the staging store.
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// Default object path for a run's staged CSV.
pub const DEFAULT_STAGING_PATH: &str = "data/extract.csv";

/// Default S3 operation timeout in seconds.
pub const DEFAULT_STORAGE_TIMEOUT_SECS: u64 = 300;

/// Default BigQuery API root.
pub const DEFAULT_BIGQUERY_BASE_URL: &str = "https://bigquery.googleapis.com";

/// Default interval between load-job status polls in milliseconds.
pub const DEFAULT_BIGQUERY_POLL_INTERVAL_MS: u64 = 1_000;

/// Default ceiling on waiting for one load job (1 hour).
pub const DEFAULT_BIGQUERY_JOB_TIMEOUT_SECS: u64 = 3_600;

/// Default Snowflake token type for the SQL API.
pub const DEFAULT_SNOWFLAKE_TOKEN_TYPE: &str = "OAUTH";

/// Default rows per INSERT statement.
pub const DEFAULT_SNOWFLAKE_CHUNK_ROWS: usize = 1_000;

/// Default ceiling on one SQL statement (1 hour).
pub const DEFAULT_SNOWFLAKE_STATEMENT_TIMEOUT_SECS: u64 = 3_600;

/// A credential that never appears in logs
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"***\"")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Header used to send the source API token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    #[default]
    AppToken,
    Bearer,
}

impl FromStr for AuthScheme {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "app_token" | "app-token" | "apptoken" => Ok(AuthScheme::AppToken),
            "bearer" => Ok(AuthScheme::Bearer),
            _ => Err(format!("expected app_token or bearer, got {s:?}")),
        }
    }
}

/// What the orchestrator does when a sink fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Stop the run at the failing batch
    Abort,
    /// Record the failure and keep going
    Continue,
}

impl FromStr for OnFailure {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "abort" | "stop" => Ok(OnFailure::Abort),
            "continue" => Ok(OnFailure::Continue),
            _ => Err(format!("expected abort or continue, got {s:?}")),
        }
    }
}

/// What a full run does with a dataset cut short by a failed page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FetchFailureMode {
    /// Stage and load nothing
    #[default]
    Abort,
    /// Stage and load what was fetched, still reporting the run incomplete
    StagePartial,
}

impl FromStr for FetchFailureMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "abort" => Ok(FetchFailureMode::Abort),
            "stage_partial" | "stage-partial" | "partial" => Ok(FetchFailureMode::StagePartial),
            _ => Err(format!("expected abort or stage_partial, got {s:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePolicy {
    pub bigquery: OnFailure,
    pub snowflake: OnFailure,
    pub fetch: FetchFailureMode,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            bigquery: OnFailure::Abort,
            snowflake: OnFailure::Continue,
            fetch: FetchFailureMode::Abort,
        }
    }
}

/// Source collection endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub api_url: String,
    pub token: Option<Secret>,
    pub auth_scheme: AuthScheme,
    pub query_params: Vec<(String, String)>,
    pub batch_size: u64,
    pub test_mode: bool,
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            token: None,
            auth_scheme: AuthScheme::AppToken,
            query_params: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            test_mode: false,
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl SourceConfig {
    pub fn auth(&self) -> Option<ApiAuth> {
        self.token.as_ref().map(|token| match self.auth_scheme {
            AuthScheme::AppToken => ApiAuth::AppToken(token.expose().to_string()),
            AuthScheme::Bearer => ApiAuth::Bearer(token.expose().to_string()),
        })
    }

    pub fn fetch_request(&self) -> FetchRequest {
        FetchRequest {
            endpoint: self.api_url.clone(),
            auth: self.auth(),
            query_params: self.query_params.clone(),
            batch_size: self.batch_size,
            test_mode: self.test_mode,
        }
    }
}

/// Staging object store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Custom endpoint (MinIO, GCS interop); `None` means AWS
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub path: String,
    pub access_key: Option<String>,
    pub secret_key: Option<Secret>,
    pub path_style: bool,
    /// Columns whose backslash-bearing values get wrapped in quotes
    pub quote_columns: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: DEFAULT_S3_REGION.to_string(),
            bucket: String::new(),
            path: DEFAULT_STAGING_PATH.to_string(),
            access_key: None,
            secret_key: None,
            path_style: false,
            quote_columns: vec![DEFAULT_QUOTED_COLUMN.to_string()],
            timeout_secs: DEFAULT_STORAGE_TIMEOUT_SECS,
        }
    }
}

impl StagingConfig {
    pub fn location(&self) -> ObjectLocation {
        ObjectLocation::new(&self.bucket, &self.path)
    }

    pub fn cleaning(&self) -> CsvCleaning {
        CsvCleaning::for_columns(self.quote_columns.clone())
    }
}

/// Warehouse A
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BigQueryConfig {
    pub base_url: String,
    pub access_token: Option<Secret>,
    /// Job location, e.g. "US" or "europe-west2"
    pub location: Option<String>,
    pub project: String,
    pub dataset: String,
    pub table: String,
    pub schema_mode: SchemaMode,
    pub write_disposition: WriteDisposition,
    pub poll_interval_ms: u64,
    pub job_timeout_secs: u64,
    pub timeout_secs: u64,
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BIGQUERY_BASE_URL.to_string(),
            access_token: None,
            location: None,
            project: String::new(),
            dataset: String::new(),
            table: String::new(),
            schema_mode: SchemaMode::AllStrings,
            write_disposition: WriteDisposition::Truncate,
            poll_interval_ms: DEFAULT_BIGQUERY_POLL_INTERVAL_MS,
            job_timeout_secs: DEFAULT_BIGQUERY_JOB_TIMEOUT_SECS,
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl BigQueryConfig {
    pub fn table(&self) -> BigQueryTable {
        BigQueryTable::new(&self.project, &self.dataset, &self.table)
    }
}

/// Warehouse B
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnowflakeConfig {
    pub account: String,
    pub user: String,
    pub token: Option<Secret>,
    pub token_type: String,
    pub role: Option<String>,
    pub warehouse: String,
    pub database: String,
    pub schema: String,
    pub table: String,
    /// Overrides `https://<account>.snowflakecomputing.com`
    pub base_url: Option<String>,
    pub chunk_rows: usize,
    pub statement_timeout_secs: u64,
    pub timeout_secs: u64,
}

impl Default for SnowflakeConfig {
    fn default() -> Self {
        Self {
            account: String::new(),
            user: String::new(),
            token: None,
            token_type: DEFAULT_SNOWFLAKE_TOKEN_TYPE.to_string(),
            role: None,
            warehouse: String::new(),
            database: String::new(),
            schema: String::new(),
            table: String::new(),
            base_url: None,
            chunk_rows: DEFAULT_SNOWFLAKE_CHUNK_ROWS,
            statement_timeout_secs: DEFAULT_SNOWFLAKE_STATEMENT_TIMEOUT_SECS,
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl SnowflakeConfig {
    pub fn credentials(&self) -> SnowflakeCredentials {
        SnowflakeCredentials {
            account: self.account.clone(),
            user: self.user.clone(),
            token: self.token.clone().unwrap_or_else(|| Secret::new("")),
            token_type: self.token_type.clone(),
            role: self.role.clone(),
        }
    }

    pub fn table(&self) -> SnowflakeTable {
        SnowflakeTable::new(&self.warehouse, &self.database, &self.schema, &self.table)
    }
}

/// Everything a pipeline process needs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    pub staging: StagingConfig,
    pub bigquery: BigQueryConfig,
    pub snowflake: SnowflakeConfig,
    pub retry: RetryPolicy,
    pub failure: FailurePolicy,
}

impl PipelineConfig {
    /// Load from `.env` and the process environment
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup; unset keys keep their defaults
    ///
    /// Values are parsed but not validated, so callers can layer overrides
    /// (CLI flags, request payloads) before calling [`validate`](Self::validate).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        let mut config = Self::default();

        // Source API
        if let Some(url) = env.string("SLUICE_API_URL") {
            config.source.api_url = url;
        }
        config.source.token = env.string("SLUICE_API_TOKEN").map(Secret::new);
        if let Some(scheme) = env.parse("SLUICE_API_AUTH")? {
            config.source.auth_scheme = scheme;
        }
        if let Some(params) = env.string("SLUICE_API_PARAMS") {
            config.source.query_params = parse_query_params("SLUICE_API_PARAMS", &params)?;
        }
        if let Some(batch_size) = env.parse("SLUICE_BATCH_SIZE")? {
            config.source.batch_size = batch_size;
        }
        if let Some(test_mode) = env.parse("SLUICE_TEST_MODE")? {
            config.source.test_mode = test_mode;
        }
        if let Some(timeout) = env.parse("SLUICE_HTTP_TIMEOUT_SECS")? {
            config.source.timeout_secs = timeout;
            config.bigquery.timeout_secs = timeout;
            config.snowflake.timeout_secs = timeout;
        }

        // Staging store
        config.staging.endpoint = env.string("SLUICE_S3_ENDPOINT");
        if let Some(region) = env.string("SLUICE_S3_REGION") {
            config.staging.region = region;
        }
        if let Some(bucket) = env.string("SLUICE_STAGING_BUCKET") {
            config.staging.bucket = bucket;
        }
        if let Some(path) = env.string("SLUICE_STAGING_PATH") {
            config.staging.path = path;
        }
        config.staging.access_key = env
            .string("SLUICE_S3_ACCESS_KEY")
            .or_else(|| env.string("AWS_ACCESS_KEY_ID"));
        config.staging.secret_key = env
            .string("SLUICE_S3_SECRET_KEY")
            .or_else(|| env.string("AWS_SECRET_ACCESS_KEY"))
            .map(Secret::new);
        if let Some(path_style) = env.parse("SLUICE_S3_PATH_STYLE")? {
            config.staging.path_style = path_style;
        }
        if let Some(columns) = env.raw("SLUICE_QUOTE_COLUMNS") {
            config.staging.quote_columns = split_list(&columns);
        }
        if let Some(timeout) = env.parse("SLUICE_S3_TIMEOUT_SECS")? {
            config.staging.timeout_secs = timeout;
        }

        // Warehouse A
        if let Some(base_url) = env.string("SLUICE_BQ_BASE_URL") {
            config.bigquery.base_url = base_url;
        }
        config.bigquery.access_token = env.string("SLUICE_BQ_TOKEN").map(Secret::new);
        config.bigquery.location = env.string("SLUICE_BQ_LOCATION");
        if let Some(project) = env.string("SLUICE_BQ_PROJECT") {
            config.bigquery.project = project;
        }
        if let Some(dataset) = env.string("SLUICE_BQ_DATASET") {
            config.bigquery.dataset = dataset;
        }
        if let Some(table) = env.string("SLUICE_BQ_TABLE") {
            config.bigquery.table = table;
        }
        if let Some(true) = env.parse::<bool>("SLUICE_BQ_AUTODETECT")? {
            config.bigquery.schema_mode = SchemaMode::Autodetect;
        }
        if let Some(disposition) = env.parse("SLUICE_BQ_WRITE_DISPOSITION")? {
            config.bigquery.write_disposition = disposition;
        }
        if let Some(interval) = env.parse("SLUICE_BQ_POLL_INTERVAL_MS")? {
            config.bigquery.poll_interval_ms = interval;
        }
        if let Some(timeout) = env.parse("SLUICE_BQ_JOB_TIMEOUT_SECS")? {
            config.bigquery.job_timeout_secs = timeout;
        }

        // Warehouse B
        if let Some(account) = env.string("SLUICE_SF_ACCOUNT") {
            config.snowflake.account = account;
        }
        if let Some(user) = env.string("SLUICE_SF_USER") {
            config.snowflake.user = user;
        }
        config.snowflake.token = env.string("SLUICE_SF_TOKEN").map(Secret::new);
        if let Some(token_type) = env.string("SLUICE_SF_TOKEN_TYPE") {
            config.snowflake.token_type = token_type;
        }
        config.snowflake.role = env.string("SLUICE_SF_ROLE");
        if let Some(warehouse) = env.string("SLUICE_SF_WAREHOUSE") {
            config.snowflake.warehouse = warehouse;
        }
        if let Some(database) = env.string("SLUICE_SF_DATABASE") {
            config.snowflake.database = database;
        }
        if let Some(schema) = env.string("SLUICE_SF_SCHEMA") {
            config.snowflake.schema = schema;
        }
        if let Some(table) = env.string("SLUICE_SF_TABLE") {
            config.snowflake.table = table;
        }
        config.snowflake.base_url = env.string("SLUICE_SF_BASE_URL");
        if let Some(chunk_rows) = env.parse("SLUICE_SF_CHUNK_ROWS")? {
            config.snowflake.chunk_rows = chunk_rows;
        }
        if let Some(timeout) = env.parse("SLUICE_SF_STATEMENT_TIMEOUT_SECS")? {
            config.snowflake.statement_timeout_secs = timeout;
        }

        // Retry and failure policy
        if let Some(attempts) = env.parse("SLUICE_RETRY_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }
        config.retry.initial_backoff_ms = env
            .parse("SLUICE_RETRY_INITIAL_BACKOFF_MS")?
            .unwrap_or(DEFAULT_INITIAL_BACKOFF_MS);
        config.retry.max_backoff_ms = env
            .parse("SLUICE_RETRY_MAX_BACKOFF_MS")?
            .unwrap_or(DEFAULT_MAX_BACKOFF_MS);
        if let Some(mode) = env.parse("SLUICE_ON_BIGQUERY_FAILURE")? {
            config.failure.bigquery = mode;
        }
        if let Some(mode) = env.parse("SLUICE_ON_SNOWFLAKE_FAILURE")? {
            config.failure.snowflake = mode;
        }
        if let Some(mode) = env.parse("SLUICE_ON_FETCH_FAILURE")? {
            config.failure.fetch = mode;
        }

        Ok(config)
    }

    /// Check values that would make a component misbehave
    ///
    /// Identifiers (URLs, table names) are checked per operation instead,
    /// since a process may only ever run some of the operations.
    pub fn validate(&self) -> Result<()> {
        if self.source.batch_size == 0 {
            return Err(SluiceError::Config("batch_size must be greater than 0".to_string()));
        }
        if self.source.timeout_secs == 0
            || self.staging.timeout_secs == 0
            || self.bigquery.timeout_secs == 0
            || self.snowflake.timeout_secs == 0
        {
            return Err(SluiceError::Config("timeouts must be greater than 0".to_string()));
        }
        if self.bigquery.job_timeout_secs == 0 || self.snowflake.statement_timeout_secs == 0 {
            return Err(SluiceError::Config(
                "job and statement timeouts must be greater than 0".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SluiceError::Config(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(SluiceError::Config(format!(
                "retry initial backoff ({}ms) cannot exceed max backoff ({}ms)",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            )));
        }
        if self.snowflake.chunk_rows == 0 {
            return Err(SluiceError::Config(
                "snowflake chunk_rows must be greater than 0".to_string(),
            ));
        }
        if self.staging.bucket.trim().is_empty() {
            return Err(SluiceError::Config("staging bucket cannot be empty".to_string()));
        }
        Ok(())
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Set value, possibly empty
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    /// Set, non-blank value
    fn string(&self, key: &str) -> Option<String> {
        self.raw(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.string(key)
            .map(|value| {
                value
                    .parse()
                    .map_err(|e: T::Err| SluiceError::invalid(key, value.as_str(), e))
            })
            .transpose()
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `k=v&k2=v2` into ordered pairs
fn parse_query_params(key: &str, value: &str) -> Result<Vec<(String, String)>> {
    value
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => Err(SluiceError::invalid(key, value, "expected k=v pairs joined by &")),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::from_lookup(lookup(&[("SLUICE_STAGING_BUCKET", "seeds")])).unwrap();
        config.validate().unwrap();

        assert_eq!(config.source.batch_size, 1000);
        assert_eq!(config.source.timeout_secs, 300);
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.bigquery.schema_mode, SchemaMode::AllStrings);
        assert_eq!(config.bigquery.write_disposition, WriteDisposition::Truncate);
        assert_eq!(config.failure.bigquery, OnFailure::Abort);
        assert_eq!(config.failure.snowflake, OnFailure::Continue);
        assert_eq!(config.staging.cleaning(), CsvCleaning::default());
    }

    #[test]
    fn test_overrides() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("SLUICE_API_URL", "https://data.example.org/resource/abcd.json"),
            ("SLUICE_API_TOKEN", "tok"),
            ("SLUICE_API_AUTH", "bearer"),
            ("SLUICE_API_PARAMS", "$order=id&$where=status='open'"),
            ("SLUICE_BATCH_SIZE", "250"),
            ("SLUICE_TEST_MODE", "true"),
            ("SLUICE_STAGING_BUCKET", "seeds"),
            ("AWS_ACCESS_KEY_ID", "AKIA"),
            ("SLUICE_QUOTE_COLUMNS", ""),
            ("SLUICE_BQ_AUTODETECT", "true"),
            ("SLUICE_BQ_WRITE_DISPOSITION", "WRITE_APPEND"),
            ("SLUICE_ON_SNOWFLAKE_FAILURE", "abort"),
            ("SLUICE_ON_FETCH_FAILURE", "stage_partial"),
            ("SLUICE_RETRY_ATTEMPTS", "3"),
        ]))
        .unwrap();

        let request = config.source.fetch_request();
        assert_eq!(request.batch_size, 250);
        assert!(request.test_mode);
        assert_eq!(request.auth, Some(ApiAuth::Bearer("tok".to_string())));
        assert_eq!(
            request.query_params,
            vec![
                ("$order".to_string(), "id".to_string()),
                ("$where".to_string(), "status='open'".to_string()),
            ]
        );
        assert_eq!(config.staging.access_key.as_deref(), Some("AKIA"));
        assert_eq!(config.staging.cleaning(), CsvCleaning::None);
        assert_eq!(config.bigquery.schema_mode, SchemaMode::Autodetect);
        assert_eq!(config.bigquery.write_disposition, WriteDisposition::Append);
        assert_eq!(config.failure.snowflake, OnFailure::Abort);
        assert_eq!(config.failure.fetch, FetchFailureMode::StagePartial);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_invalid_number_names_the_key() {
        let err = PipelineConfig::from_lookup(lookup(&[
            ("SLUICE_STAGING_BUCKET", "seeds"),
            ("SLUICE_BATCH_SIZE", "lots"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("SLUICE_BATCH_SIZE"));
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("SLUICE_STAGING_BUCKET", "seeds"),
            ("SLUICE_BATCH_SIZE", "0"),
        ]))
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SluiceError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_missing_bucket() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secrets_are_redacted() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("SLUICE_STAGING_BUCKET", "seeds"),
            ("SLUICE_SF_TOKEN", "very-secret-token"),
            ("SLUICE_S3_SECRET_KEY", "another-secret"),
        ]))
        .unwrap();

        let debug = format!("{config:?}");
        assert!(!debug.contains("very-secret-token"));
        assert!(!debug.contains("another-secret"));
    }

    #[test]
    fn test_bad_query_params() {
        assert!(parse_query_params("K", "=x").is_err());
        assert!(parse_query_params("K", "novalue").is_err());
    }
}
