//! Warehouse A: BigQuery load jobs
//!
//! A load replaces or extends the destination table inside one job, so
//! `WRITE_TRUNCATE` never exposes an empty table to readers. The loader waits
//! for the job to finish before returning.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::{BigQueryConfig, Secret};
use crate::error::LoadError;
use crate::records::{RowBatch, WriteDisposition};
use crate::retry::RetryPolicy;
use crate::staging::csv_codec::{self, CsvCleaning, CSV_CONTENT_TYPE};

use super::LoadResult;

/// How the destination schema is declared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchemaMode {
    /// Every column a NULLABLE STRING, named from the batch header
    #[default]
    AllStrings,
    /// Let BigQuery infer types from the CSV
    Autodetect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BigQueryTable {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl BigQueryTable {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("project", &self.project),
            ("dataset", &self.dataset),
            ("table", &self.table),
        ] {
            if value.trim().is_empty() {
                return Err(format!("BigQuery {name} cannot be empty"));
            }
        }
        Ok(())
    }
}

impl fmt::Display for BigQueryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// One CSV load job
#[derive(Debug, Clone)]
pub struct LoadJobSpec {
    /// Fixed for the lifetime of the load; a resubmission reuses it
    pub job_id: String,
    pub table: BigQueryTable,
    pub columns: Vec<String>,
    pub schema_mode: SchemaMode,
    pub disposition: WriteDisposition,
    /// CSV with a header row
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatistics {
    pub job_id: String,
    pub output_rows: u64,
}

/// Submits a load job and blocks until it is done
///
/// `retry` covers submission and status checks separately. A job is never
/// submitted under a second id, so an `APPEND` load applies at most once.
#[async_trait]
pub trait LoadJobRunner: Send + Sync {
    async fn run_load_job(
        &self,
        spec: &LoadJobSpec,
        retry: &RetryPolicy,
    ) -> Result<JobStatistics, LoadError>;
}

pub struct BigQueryLoader {
    runner: Arc<dyn LoadJobRunner>,
    schema_mode: SchemaMode,
    retry: RetryPolicy,
}

impl fmt::Debug for BigQueryLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigQueryLoader")
            .field("schema_mode", &self.schema_mode)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl BigQueryLoader {
    pub fn new(runner: Arc<dyn LoadJobRunner>, schema_mode: SchemaMode, retry: RetryPolicy) -> Self {
        Self {
            runner,
            schema_mode,
            retry,
        }
    }

    pub fn schema_mode(&self) -> SchemaMode {
        self.schema_mode
    }

    #[instrument(skip(self, batch), fields(destination = %table, rows = batch.len()))]
    pub async fn load(
        &self,
        batch: &RowBatch,
        table: &BigQueryTable,
        disposition: WriteDisposition,
    ) -> Result<LoadResult, LoadError> {
        let destination = table.to_string();

        table.validate().map_err(|reason| LoadError::InvalidInput {
            destination: destination.clone(),
            reason,
        })?;
        if batch.columns().is_empty() {
            return Err(LoadError::InvalidInput {
                destination,
                reason: "batch has no columns to build a schema from".to_string(),
            });
        }

        let payload =
            csv_codec::encode(batch, &CsvCleaning::None).map_err(|e| LoadError::InvalidInput {
                destination: destination.clone(),
                reason: e.to_string(),
            })?;

        let spec = LoadJobSpec {
            job_id: format!("sluice_{}", Uuid::new_v4().simple()),
            table: table.clone(),
            columns: batch.columns().to_vec(),
            schema_mode: self.schema_mode,
            disposition,
            payload,
        };

        let stats = self.runner.run_load_job(&spec, &self.retry).await?;

        info!(
            job_id = %stats.job_id,
            disposition = %disposition,
            "Loaded {} rows into {}",
            stats.output_rows,
            destination
        );

        Ok(LoadResult {
            destination,
            rows_loaded: stats.output_rows,
            chunks: 1,
        })
    }
}

/// `jobs.insert` / `jobs.get` over the BigQuery v2 REST API
#[derive(Debug, Clone)]
pub struct BigQueryRestClient {
    client: Client,
    base_url: String,
    access_token: Option<Secret>,
    location: Option<String>,
    poll_interval: Duration,
    job_timeout: Duration,
}

impl BigQueryRestClient {
    pub fn new(config: &BigQueryConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("sluice/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
            location: config.location.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            job_timeout: Duration::from_secs(config.job_timeout_secs),
        })
    }

    fn job_configuration(&self, job_id: &str, spec: &LoadJobSpec) -> Value {
        let mut load = json!({
            "destinationTable": {
                "projectId": spec.table.project,
                "datasetId": spec.table.dataset,
                "tableId": spec.table.table,
            },
            "sourceFormat": "CSV",
            "skipLeadingRows": 1,
            "allowQuotedNewlines": true,
            "createDisposition": "CREATE_IF_NEEDED",
            "writeDisposition": spec.disposition.as_str(),
        });

        match spec.schema_mode {
            SchemaMode::AllStrings => {
                let fields: Vec<Value> = spec
                    .columns
                    .iter()
                    .map(|name| json!({"name": name, "type": "STRING", "mode": "NULLABLE"}))
                    .collect();
                load["schema"] = json!({ "fields": fields });
            },
            SchemaMode::Autodetect => {
                load["autodetect"] = json!(true);
            },
        }

        let mut job_reference = json!({
            "projectId": spec.table.project,
            "jobId": job_id,
        });
        if let Some(location) = &self.location {
            job_reference["location"] = json!(location);
        }

        json!({
            "jobReference": job_reference,
            "configuration": { "load": load },
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token.expose()),
            None => request,
        }
    }

    async fn read_job(&self, destination: &str, response: reqwest::Response) -> Result<JobResource, LoadError> {
        let status = response.status();
        let body = response.text().await.map_err(|e| LoadError::Transport {
            destination: destination.to_string(),
            message: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(LoadError::from_status(destination, status.as_u16(), api_message(&body)));
        }

        serde_json::from_str(&body).map_err(|e| LoadError::Transport {
            destination: destination.to_string(),
            message: format!("unreadable job resource: {e}"),
        })
    }

    /// `jobs.insert` under `LoadJobSpec::job_id`; `None` when a job with that id
    /// already exists (an earlier attempt reached the server)
    async fn submit_job(
        &self,
        destination: &str,
        spec: &LoadJobSpec,
    ) -> Result<Option<JobResource>, LoadError> {
        let boundary = format!("sluice_boundary_{}", Uuid::new_v4().simple());
        let configuration = serde_json::to_vec(&self.job_configuration(&spec.job_id, spec))
            .map_err(|e| LoadError::InvalidInput {
                destination: destination.to_string(),
                reason: e.to_string(),
            })?;
        let body = multipart_related(&boundary, &configuration, &spec.payload);

        let url = format!(
            "{}/upload/bigquery/v2/projects/{}/jobs?uploadType=multipart",
            self.base_url, spec.table.project
        );
        debug!(job_id = %spec.job_id, bytes = spec.payload.len(), "Submitting load job");

        let response = self
            .authorize(self.client.post(&url))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| transport(destination, e))?;

        if response.status() == StatusCode::CONFLICT {
            return Ok(None);
        }
        self.read_job(destination, response).await.map(Some)
    }

    async fn get_job(&self, destination: &str, project: &str, job_id: &str) -> Result<JobResource, LoadError> {
        let url = format!("{}/bigquery/v2/projects/{}/jobs/{}", self.base_url, project, job_id);
        let mut request = self.authorize(self.client.get(&url));
        if let Some(location) = &self.location {
            request = request.query(&[("location", location)]);
        }

        let response = request.send().await.map_err(|e| transport(destination, e))?;
        self.read_job(destination, response).await
    }
}

#[async_trait]
impl LoadJobRunner for BigQueryRestClient {
    #[instrument(skip(self, spec, retry), fields(destination = %spec.table, job_id = %spec.job_id))]
    async fn run_load_job(
        &self,
        spec: &LoadJobSpec,
        retry: &RetryPolicy,
    ) -> Result<JobStatistics, LoadError> {
        let destination = spec.table.to_string();
        let project = spec.table.project.as_str();
        let job_id = spec.job_id.as_str();

        let submitted = retry
            .run("bigquery_submit", || self.submit_job(&destination, spec))
            .await?;
        let mut job = match submitted {
            Some(job) => job,
            None => {
                debug!(job_id, "Load job already exists, resuming");
                retry
                    .run("bigquery_poll", || self.get_job(&destination, project, job_id))
                    .await?
            },
        };
        let deadline = tokio::time::Instant::now() + self.job_timeout;

        while !job.is_done() {
            if tokio::time::Instant::now() >= deadline {
                return Err(LoadError::Timeout {
                    destination,
                    seconds: self.job_timeout.as_secs(),
                });
            }
            debug!(job_id, state = %job.status.state, "Waiting for load job");
            tokio::time::sleep(self.poll_interval).await;
            job = retry
                .run("bigquery_poll", || self.get_job(&destination, project, job_id))
                .await?;
        }

        if let Some(error) = &job.status.error_result {
            let mut message = error.describe();
            for detail in job.status.errors.iter().take(5) {
                message.push_str("; ");
                message.push_str(&detail.describe());
            }
            return Err(LoadError::Rejected {
                destination,
                message,
            });
        }

        Ok(JobStatistics {
            job_id: spec.job_id.clone(),
            output_rows: job.output_rows(),
        })
    }
}

fn transport(destination: &str, err: reqwest::Error) -> LoadError {
    let message = if err.is_timeout() {
        format!("request timed out: {err}")
    } else {
        err.to_string()
    };
    LoadError::Transport {
        destination: destination.to_string(),
        message,
    }
}

/// Pull `error.message` out of a Google API error body
fn api_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(512).collect())
}

fn multipart_related(boundary: &str, metadata: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(metadata.len() + payload.len() + 256);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata);
    body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    body.extend_from_slice(format!("Content-Type: {CSV_CONTENT_TYPE}\r\n\r\n").as_bytes());
    body.extend_from_slice(payload);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    status: JobStatus,
    #[serde(default)]
    statistics: Option<JobStatisticsResource>,
}

impl JobResource {
    fn is_done(&self) -> bool {
        self.status.state == "DONE"
    }

    fn output_rows(&self) -> u64 {
        self.statistics
            .as_ref()
            .and_then(|s| s.load.as_ref())
            .and_then(|l| l.output_rows.as_deref())
            .and_then(|rows| rows.parse().ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    #[serde(default)]
    error_result: Option<ErrorProto>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorProto {
    fn describe(&self) -> String {
        match (&self.reason, &self.message) {
            (Some(reason), Some(message)) => format!("{reason}: {message}"),
            (None, Some(message)) => message.clone(),
            (Some(reason), None) => reason.clone(),
            (None, None) => "unknown error".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JobStatisticsResource {
    #[serde(default)]
    load: Option<LoadStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    #[serde(default)]
    output_rows: Option<String>,
}
