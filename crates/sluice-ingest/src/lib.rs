//! Sluice Ingest Library
//!
//! Extract-load engine that replicates a paginated open-data collection into
//! two warehouses through a CSV staging store.
//!
//! # Components
//!
//! - **Fetcher**: offset pagination with lazy, pull-driven page requests
//! - **Staging**: CSV codec plus S3-compatible and in-memory object stores
//! - **Warehouses**: BigQuery load jobs and Snowflake recreate-and-append
//! - **Pipeline**: standalone operations, full runs and batched runs
//!
//! # Example
//!
//! ```no_run
//! use sluice_ingest::{Pipeline, PipelineConfig, RunSpec};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::from_env()?;
//!     let pipeline = Pipeline::from_config(&config).await?;
//!     let report = pipeline.run(&RunSpec::from_config(&config)).await?;
//!     println!("{} rows replicated", report.rows_fetched);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod fetcher;
pub mod pipeline;
pub mod records;
pub mod retry;
pub mod staging;
pub mod warehouse;

pub use config::{FailurePolicy, FetchFailureMode, OnFailure, PipelineConfig, Secret};
pub use error::{FetchError, LoadError, ParseError, PipelineError, Retryable, StagingError, StorageError};
pub use fetcher::{ApiAuth, FetchRequest, FetchSummary, PageFetcher, Pages, Termination};
pub use pipeline::{BigQueryTarget, Pipeline, RunReport, RunSpec, SinkOutcome, SinkStatus, SnowflakeTarget};
pub use records::{Dataset, RowBatch, TableWriteState, WriteDisposition};
pub use retry::RetryPolicy;
pub use staging::{ObjectLocation, ObjectStore, StagedArtifact, Stager};
pub use warehouse::{LoadResult, Sink};
