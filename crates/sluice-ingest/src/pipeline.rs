//! Extract-load orchestration
//!
//! The three building blocks can be triggered on their own (possibly by
//! different processes sharing a staging store):
//!
//! - [`Pipeline::fetch_to_staging`]
//! - [`Pipeline::staging_to_bigquery`]
//! - [`Pipeline::staging_to_snowflake`]
//!
//! or chained by [`Pipeline::run`] (one artifact for the whole dataset) and
//! [`Pipeline::run_batched`] (one artifact per fetched batch, first-batch
//! truncation per table). In both run modes the two warehouse loads of a
//! staged artifact execute concurrently and both outcomes are recorded
//! before the run is reported.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use sluice_common::SluiceError;

use crate::config::{FailurePolicy, FetchFailureMode, OnFailure, PipelineConfig};
use crate::error::{FetchError, LoadError, PipelineError, StagingError};
use crate::fetcher::{FetchRequest, FetchSummary, PageFetcher};
use crate::records::{RowBatch, TableWriteState, WriteDisposition};
use crate::staging::{MemoryObjectStore, ObjectLocation, S3ObjectStore, StagedArtifact, Stager};
use crate::warehouse::bigquery::{BigQueryLoader, BigQueryRestClient, BigQueryTable};
use crate::warehouse::memory::{MemoryBigQuery, MemorySnowflake};
use crate::warehouse::snowflake::{
    SnowflakeCredentials, SnowflakeLoader, SnowflakeTable, SqlApiConnector,
};
use crate::warehouse::{LoadResult, Sink};

/// Where and how warehouse A is loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BigQueryTarget {
    pub table: BigQueryTable,
    pub disposition: WriteDisposition,
}

/// Where and as whom warehouse B is loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnowflakeTarget {
    pub credentials: SnowflakeCredentials,
    pub table: SnowflakeTable,
}

/// Inputs of one end-to-end run
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub fetch: FetchRequest,
    /// Artifact path for a full run; batch paths are derived from it
    pub staging: ObjectLocation,
    pub bigquery: Option<BigQueryTarget>,
    pub snowflake: Option<SnowflakeTarget>,
}

impl RunSpec {
    /// Both sinks, as configured
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            fetch: config.source.fetch_request(),
            staging: config.staging.location(),
            bigquery: Some(BigQueryTarget {
                table: config.bigquery.table(),
                disposition: config.bigquery.write_disposition,
            }),
            snowflake: Some(SnowflakeTarget {
                credentials: config.snowflake.credentials(),
                table: config.snowflake.table(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Full,
    Batched,
}

/// What happened to one sink for one artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SinkStatus {
    Loaded(LoadResult),
    Failed { error: LoadError },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkOutcome {
    pub sink: Sink,
    /// Batch index in a batched run
    pub batch: Option<usize>,
    pub status: SinkStatus,
}

impl SinkOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, SinkStatus::Failed { .. })
    }
}

/// Account of one run, successful or not
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Batches fetched
    pub batches: usize,
    pub rows_fetched: u64,
    pub artifacts: Vec<StagedArtifact>,
    pub sinks: Vec<SinkOutcome>,
    /// Set when pagination stopped on a failed page
    pub fetch_failure: Option<FetchError>,
    /// Staging or its read-back failed; nothing after it was loaded
    pub staging_failure: Option<StagingError>,
    /// A sink failure under the abort policy stopped the run early
    pub aborted: bool,
}

impl RunReport {
    fn start(mode: RunMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            started_at: Utc::now(),
            finished_at: None,
            batches: 0,
            rows_fetched: 0,
            artifacts: Vec::new(),
            sinks: Vec::new(),
            fetch_failure: None,
            staging_failure: None,
            aborted: false,
        }
    }

    fn record_fetch(&mut self, summary: &FetchSummary) {
        self.batches = summary.dataset.batch_count();
        self.rows_fetched = summary.dataset.row_count() as u64;
        self.fetch_failure = summary.failure().cloned();
    }

    fn record_staging_failure(&mut self, location: &ObjectLocation, err: StagingError) {
        error!(error = %err, location = %location, "Staging failed, stopping run");
        self.staging_failure = Some(err);
    }

    fn record(&mut self, sink: Sink, batch: Option<usize>, status: SinkStatus) {
        self.sinks.push(SinkOutcome { sink, batch, status });
    }

    /// Close the report: `Ok` when nothing failed, `Incomplete` otherwise
    fn finish(mut self) -> Result<RunReport, PipelineError> {
        self.finished_at = Some(Utc::now());
        if self.is_success() {
            info!(run_id = %self.run_id, batches = self.batches, rows = self.rows_fetched, "Run complete");
            Ok(self)
        } else {
            error!(run_id = %self.run_id, failures = %self.failure_summary(), "Run incomplete");
            Err(PipelineError::Incomplete(Box::new(self)))
        }
    }

    pub fn is_success(&self) -> bool {
        self.fetch_failure.is_none()
            && self.staging_failure.is_none()
            && !self.aborted
            && !self.sinks.iter().any(SinkOutcome::is_failure)
    }

    /// Rows loaded into `sink` across all artifacts
    pub fn rows_loaded(&self, sink: Sink) -> u64 {
        self.sinks
            .iter()
            .filter(|o| o.sink == sink)
            .filter_map(|o| match &o.status {
                SinkStatus::Loaded(result) => Some(result.rows_loaded),
                _ => None,
            })
            .sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &SinkOutcome> {
        self.sinks.iter().filter(|o| o.is_failure())
    }

    /// One line naming every failure
    pub fn failure_summary(&self) -> String {
        let mut parts = Vec::new();

        if let Some(err) = &self.fetch_failure {
            parts.push(format!(
                "fetch stopped after {} batch(es): {}",
                self.batches, err
            ));
        }
        if let Some(err) = &self.staging_failure {
            match self.mode {
                RunMode::Batched => parts.push(format!(
                    "staging of batch {} failed: {}",
                    self.batches.saturating_sub(1),
                    err
                )),
                RunMode::Full => parts.push(format!("staging failed: {err}")),
            }
        }
        for outcome in self.failures() {
            if let SinkStatus::Failed { error } = &outcome.status {
                match outcome.batch {
                    Some(batch) => parts.push(format!("{} load of batch {}: {}", outcome.sink, batch, error)),
                    None => parts.push(format!("{} load: {}", outcome.sink, error)),
                }
            }
        }
        if self.aborted {
            parts.push("run aborted".to_string());
        }

        if parts.is_empty() {
            "no failures".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// The engine: fetcher, stager and both loaders
pub struct Pipeline {
    fetcher: PageFetcher,
    stager: Stager,
    bigquery: BigQueryLoader,
    snowflake: SnowflakeLoader,
    policy: FailurePolicy,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stager", &self.stager)
            .field("bigquery", &self.bigquery)
            .field("snowflake", &self.snowflake)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        fetcher: PageFetcher,
        stager: Stager,
        bigquery: BigQueryLoader,
        snowflake: SnowflakeLoader,
    ) -> Self {
        Self {
            fetcher,
            stager,
            bigquery,
            snowflake,
            policy: FailurePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Production wiring: S3 staging, BigQuery REST, Snowflake SQL API
    pub async fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let fetcher = PageFetcher::new(Duration::from_secs(config.source.timeout_secs), config.retry)
            .map_err(client_error)?;
        let store = S3ObjectStore::new(&config.staging).await;
        let stager = Stager::new(Arc::new(store), config.staging.cleaning(), config.retry);
        let bigquery = BigQueryLoader::new(
            Arc::new(BigQueryRestClient::new(&config.bigquery).map_err(client_error)?),
            config.bigquery.schema_mode,
            config.retry,
        );
        let snowflake = SnowflakeLoader::new(
            Arc::new(SqlApiConnector::new(&config.snowflake).map_err(client_error)?),
            config.retry,
        );

        Ok(Self::new(fetcher, stager, bigquery, snowflake).with_policy(config.failure))
    }

    /// Real source API, in-memory staging and warehouses
    pub fn in_memory(config: &PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let fetcher = PageFetcher::new(Duration::from_secs(config.source.timeout_secs), config.retry)
            .map_err(client_error)?;
        let stager = Stager::new(
            Arc::new(MemoryObjectStore::new()),
            config.staging.cleaning(),
            config.retry,
        );
        let bigquery = BigQueryLoader::new(
            Arc::new(MemoryBigQuery::new()),
            config.bigquery.schema_mode,
            config.retry,
        );
        let snowflake = SnowflakeLoader::new(
            Arc::new(MemorySnowflake::new().with_chunk_rows(config.snowflake.chunk_rows)),
            config.retry,
        );

        Ok(Self::new(fetcher, stager, bigquery, snowflake).with_policy(config.failure))
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn stager(&self) -> &Stager {
        &self.stager
    }

    /// Fetch the whole collection and stage it as one artifact
    ///
    /// A failed page is an error. Under [`FetchFailureMode::StagePartial`]
    /// the rows fetched before it are staged first.
    #[instrument(skip(self, request), fields(endpoint = %request.endpoint, location = %location))]
    pub async fn fetch_to_staging(
        &self,
        request: FetchRequest,
        location: &ObjectLocation,
    ) -> Result<StagedArtifact, PipelineError> {
        info!("Step 1/2: Fetching {}", request.endpoint);
        let summary = self.fetcher.fetch(request).collect().await;

        if let Some(err) = summary.failure() {
            if self.policy.fetch == FetchFailureMode::StagePartial {
                warn!(batches = summary.dataset.batch_count(), "Staging partial dataset");
                self.stage(summary.dataset.rows(), location).await?;
            }
            return Err(PipelineError::Fetch {
                batches: summary.dataset.batch_count(),
                source: err.clone(),
            });
        }

        info!(
            batches = summary.dataset.batch_count(),
            "Step 2/2: Staging {} rows",
            summary.dataset.row_count()
        );
        self.stage(summary.dataset.rows(), location).await
    }

    /// Load a staged artifact into BigQuery; `None` when it holds no data
    #[instrument(skip(self, target), fields(location = %location, destination = %target.table))]
    pub async fn staging_to_bigquery(
        &self,
        location: &ObjectLocation,
        target: &BigQueryTarget,
    ) -> Result<Option<LoadResult>, PipelineError> {
        let rows = self.unstage(location).await?;
        if rows.columns().is_empty() {
            info!("Staged artifact is empty, skipping BigQuery load");
            return Ok(None);
        }

        self.bigquery
            .load(&rows, &target.table, target.disposition)
            .await
            .map(Some)
            .map_err(|source| PipelineError::Load {
                sink: Sink::BigQuery,
                source,
            })
    }

    /// Recreate the Snowflake table from a staged artifact; `None` when it
    /// holds no data
    #[instrument(skip(self, target), fields(location = %location, destination = %target.table))]
    pub async fn staging_to_snowflake(
        &self,
        location: &ObjectLocation,
        target: &SnowflakeTarget,
    ) -> Result<Option<LoadResult>, PipelineError> {
        let rows = self.unstage(location).await?;
        if rows.columns().is_empty() {
            info!("Staged artifact is empty, skipping Snowflake load");
            return Ok(None);
        }

        self.snowflake
            .load(&rows, &target.credentials, &target.table, true)
            .await
            .map(Some)
            .map_err(|source| PipelineError::Load {
                sink: Sink::Snowflake,
                source,
            })
    }

    /// Fetch everything, stage once, then load both sinks concurrently
    #[instrument(skip(self, spec), fields(endpoint = %spec.fetch.endpoint))]
    pub async fn run(&self, spec: &RunSpec) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::start(RunMode::Full);
        info!(run_id = %report.run_id, "Step 1/3: Fetching {}", spec.fetch.endpoint);

        let summary = self.fetcher.fetch(spec.fetch.clone()).collect().await;
        report.record_fetch(&summary);

        if !summary.is_complete() && self.policy.fetch == FetchFailureMode::Abort {
            warn!("Fetch incomplete, nothing will be staged or loaded");
            report.aborted = true;
            return report.finish();
        }

        info!(rows = report.rows_fetched, "Step 2/3: Staging to {}", spec.staging);
        let rows = match self.stage_verified(summary.dataset.rows(), &spec.staging, &mut report).await {
            Ok(rows) => rows,
            Err(err) => {
                report.record_staging_failure(&spec.staging, err);
                return report.finish();
            },
        };

        info!("Step 3/3: Loading warehouses");
        let (bigquery, snowflake) = tokio::join!(
            self.load_bigquery(&rows, spec.bigquery.as_ref(), None),
            self.load_snowflake(&rows, spec.snowflake.as_ref(), true),
        );
        if let Some(status) = bigquery {
            report.record(Sink::BigQuery, None, status);
        }
        if let Some(status) = snowflake {
            report.record(Sink::Snowflake, None, status);
        }

        report.finish()
    }

    /// Stage and load batch by batch as pages arrive
    ///
    /// Each table is reset by its first successful write only; BigQuery
    /// uses the requested disposition for that write and appends after it,
    /// Snowflake recreates then appends. A sink failure stops the run or
    /// is recorded and skipped, per the failure policy.
    #[instrument(skip(self, spec), fields(endpoint = %spec.fetch.endpoint))]
    pub async fn run_batched(&self, spec: &RunSpec) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::start(RunMode::Batched);
        let mut pages = self.fetcher.fetch(spec.fetch.clone());
        let mut bigquery_state = TableWriteState::new();
        let mut snowflake_state = TableWriteState::new();
        let mut index = 0usize;

        info!(run_id = %report.run_id, "Starting batched run against {}", spec.fetch.endpoint);

        while let Some(item) = pages.next_batch().await {
            let batch = match item {
                Ok(batch) => batch,
                Err(err) => {
                    report.fetch_failure = Some(err);
                    break;
                },
            };
            report.batches += 1;
            report.rows_fetched += batch.len() as u64;

            let location = spec.staging.for_batch(index);
            let rows = match self.stage_verified(&batch, &location, &mut report).await {
                Ok(rows) => rows,
                Err(err) => {
                    report.record_staging_failure(&location, err);
                    break;
                },
            };

            let disposition = spec
                .bigquery
                .as_ref()
                .map(|target| bigquery_state.disposition(target.disposition));
            let (bigquery, snowflake) = tokio::join!(
                self.load_bigquery(&rows, spec.bigquery.as_ref(), disposition),
                self.load_snowflake(&rows, spec.snowflake.as_ref(), snowflake_state.is_first_batch()),
            );

            if let Some(status) = bigquery {
                self.apply(&mut report, Sink::BigQuery, index, status, &mut bigquery_state);
            }
            if let Some(status) = snowflake {
                self.apply(&mut report, Sink::Snowflake, index, status, &mut snowflake_state);
            }

            if report.aborted {
                warn!(batch = index, "Aborting batched run");
                break;
            }
            index += 1;
        }

        report.finish()
    }

    fn apply(
        &self,
        report: &mut RunReport,
        sink: Sink,
        index: usize,
        status: SinkStatus,
        state: &mut TableWriteState,
    ) {
        match &status {
            SinkStatus::Loaded(_) => state.mark_written(),
            SinkStatus::Failed { .. } => {
                let on_failure = match sink {
                    Sink::BigQuery => self.policy.bigquery,
                    Sink::Snowflake => self.policy.snowflake,
                };
                if on_failure == OnFailure::Abort {
                    report.aborted = true;
                }
            },
            SinkStatus::Skipped { .. } => {},
        }
        report.record(sink, Some(index), status);
    }

    async fn load_bigquery(
        &self,
        rows: &RowBatch,
        target: Option<&BigQueryTarget>,
        disposition: Option<WriteDisposition>,
    ) -> Option<SinkStatus> {
        let target = target?;
        if rows.columns().is_empty() {
            return Some(skipped());
        }

        let disposition = disposition.unwrap_or(target.disposition);
        Some(match self.bigquery.load(rows, &target.table, disposition).await {
            Ok(result) => SinkStatus::Loaded(result),
            Err(error) => {
                error!(error = %error, "BigQuery load failed");
                SinkStatus::Failed { error }
            },
        })
    }

    async fn load_snowflake(
        &self,
        rows: &RowBatch,
        target: Option<&SnowflakeTarget>,
        truncate_first: bool,
    ) -> Option<SinkStatus> {
        let target = target?;
        if rows.columns().is_empty() {
            return Some(skipped());
        }

        Some(
            match self
                .snowflake
                .load(rows, &target.credentials, &target.table, truncate_first)
                .await
            {
                Ok(result) => SinkStatus::Loaded(result),
                Err(error) => {
                    error!(error = %error, "Snowflake load failed");
                    SinkStatus::Failed { error }
                },
            },
        )
    }

    async fn stage(
        &self,
        rows: &RowBatch,
        location: &ObjectLocation,
    ) -> Result<StagedArtifact, PipelineError> {
        self.stager.stage(rows, location).await.map_err(|source| {
            error!(error = %source, location = %location, "Staging failed");
            staging_error(location, source)
        })
    }

    /// Stage `rows`, record the artifact, and read it back checksum-verified
    async fn stage_verified(
        &self,
        rows: &RowBatch,
        location: &ObjectLocation,
        report: &mut RunReport,
    ) -> Result<RowBatch, StagingError> {
        let artifact = self.stager.stage(rows, location).await?;
        report.artifacts.push(artifact.clone());
        self.stager.unstage_verified(&artifact).await
    }

    async fn unstage(&self, location: &ObjectLocation) -> Result<RowBatch, PipelineError> {
        self.stager
            .unstage(location)
            .await
            .map_err(|source| staging_error(location, source))
    }
}

fn skipped() -> SinkStatus {
    SinkStatus::Skipped {
        reason: "no columns to load".to_string(),
    }
}

fn staging_error(location: &ObjectLocation, source: StagingError) -> PipelineError {
    PipelineError::Staging {
        location: location.to_string(),
        source,
    }
}

fn client_error(err: reqwest::Error) -> PipelineError {
    PipelineError::Config(SluiceError::Config(format!("failed to build HTTP client: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(sink: Sink, batch: Option<usize>, rows: u64) -> SinkOutcome {
        SinkOutcome {
            sink,
            batch,
            status: SinkStatus::Loaded(LoadResult {
                destination: "t".to_string(),
                rows_loaded: rows,
                chunks: 1,
            }),
        }
    }

    #[test]
    fn test_report_success_and_row_totals() {
        let mut report = RunReport::start(RunMode::Batched);
        report.sinks.push(loaded(Sink::BigQuery, Some(0), 100));
        report.sinks.push(loaded(Sink::BigQuery, Some(1), 50));
        report.sinks.push(loaded(Sink::Snowflake, Some(0), 100));

        assert!(report.is_success());
        assert_eq!(report.rows_loaded(Sink::BigQuery), 150);
        assert_eq!(report.rows_loaded(Sink::Snowflake), 100);
        assert_eq!(report.failure_summary(), "no failures");
    }

    #[test]
    fn test_failure_summary_names_sink_and_batch() {
        let mut report = RunReport::start(RunMode::Batched);
        report.batches = 3;
        report.sinks.push(SinkOutcome {
            sink: Sink::Snowflake,
            batch: Some(2),
            status: SinkStatus::Failed {
                error: LoadError::BulkWrite {
                    destination: "RAW.PUBLIC.T".to_string(),
                    chunks: 0,
                    rows: 0,
                },
            },
        });

        assert!(!report.is_success());
        let summary = report.failure_summary();
        assert!(summary.starts_with("snowflake load of batch 2:"), "{summary}");
    }

    #[test]
    fn test_finish_turns_failures_into_incomplete() {
        let mut report = RunReport::start(RunMode::Full);
        report.fetch_failure = Some(FetchError::Status {
            offset: 2000,
            status: 500,
        });

        let err = report.finish().unwrap_err();
        let report = err.report().unwrap();
        assert!(report.finished_at.is_some());
        assert!(err.to_string().contains("fetch stopped after 0 batch(es)"));
    }

    #[test]
    fn test_report_serializes_statuses() {
        let mut report = RunReport::start(RunMode::Full);
        report.sinks.push(loaded(Sink::BigQuery, None, 3));
        report.sinks.push(SinkOutcome {
            sink: Sink::Snowflake,
            batch: None,
            status: skipped(),
        });

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["mode"], "full");
        assert_eq!(json["sinks"][0]["sink"], "bigquery");
        assert_eq!(json["sinks"][0]["status"]["state"], "loaded");
        assert_eq!(json["sinks"][0]["status"]["rows_loaded"], 3);
        assert_eq!(json["sinks"][1]["status"]["state"], "skipped");
    }
}
