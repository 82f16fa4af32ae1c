//! Typed trigger payloads
//!
//! Every field is optional and falls back to the server's [`PipelineConfig`].
//! The field names of the older function payloads (`gcs_bucket`,
//! `bq_table_id`, ...) are accepted as aliases. Warehouse credentials are
//! never read from a payload.

use serde::Deserialize;
use sluice_ingest::config::Secret;
use sluice_ingest::{
    BigQueryTarget, FetchRequest, ObjectLocation, PipelineConfig, RunSpec, SnowflakeTarget,
    WriteDisposition,
};
use thiserror::Error;

/// A payload that cannot be turned into a pipeline call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Source endpoint overrides
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceFields {
    #[serde(alias = "endpoint", alias = "url")]
    pub api_url: Option<String>,
    #[serde(alias = "api_key", alias = "app_token")]
    pub api_token: Option<String>,
    pub batch_size: Option<u64>,
    pub test_mode: Option<bool>,
}

/// Staged artifact address overrides
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StagingFields {
    #[serde(alias = "gcs_bucket", alias = "s3_bucket")]
    pub bucket: Option<String>,
    #[serde(alias = "gcs_file_name", alias = "file_name")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BigQueryFields {
    #[serde(alias = "bq_project_id", alias = "project_id")]
    pub bq_project: Option<String>,
    #[serde(alias = "bq_dataset_id", alias = "dataset_id")]
    pub bq_dataset: Option<String>,
    #[serde(alias = "bq_table_id", alias = "table_id")]
    pub bq_table: Option<String>,
    pub write_disposition: Option<WriteDisposition>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnowflakeFields {
    pub sf_warehouse: Option<String>,
    pub sf_database: Option<String>,
    pub sf_schema: Option<String>,
    pub sf_table: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FetchToStagingRequest {
    #[serde(flatten)]
    pub source: SourceFields,
    #[serde(flatten)]
    pub staging: StagingFields,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BigQueryLoadRequest {
    #[serde(flatten)]
    pub staging: StagingFields,
    #[serde(flatten)]
    pub bigquery: BigQueryFields,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnowflakeLoadRequest {
    #[serde(flatten)]
    pub staging: StagingFields,
    #[serde(flatten)]
    pub snowflake: SnowflakeFields,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunRequest {
    #[serde(flatten)]
    pub source: SourceFields,
    #[serde(flatten)]
    pub staging: StagingFields,
    #[serde(flatten)]
    pub bigquery: BigQueryFields,
    #[serde(flatten)]
    pub snowflake: SnowflakeFields,
    /// Stage and load per batch instead of once
    #[serde(default)]
    pub batched: bool,
}

fn overlay(target: &mut String, value: &Option<String>) {
    if let Some(value) = value {
        *target = value.trim().to_string();
    }
}

fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::new(field, "must not be empty"))
    } else {
        Ok(())
    }
}

impl SourceFields {
    pub fn resolve(&self, defaults: &PipelineConfig) -> Result<FetchRequest, ValidationError> {
        let mut source = defaults.source.clone();
        overlay(&mut source.api_url, &self.api_url);
        if let Some(token) = &self.api_token {
            source.token = Some(Secret::new(token.as_str()));
        }
        if let Some(batch_size) = self.batch_size {
            source.batch_size = batch_size;
        }
        if let Some(test_mode) = self.test_mode {
            source.test_mode = test_mode;
        }

        require("api_url", &source.api_url)?;
        if !(source.api_url.starts_with("http://") || source.api_url.starts_with("https://")) {
            return Err(ValidationError::new("api_url", "must be an http(s) URL"));
        }
        if source.batch_size == 0 {
            return Err(ValidationError::new("batch_size", "must be greater than 0"));
        }

        Ok(source.fetch_request())
    }
}

impl StagingFields {
    pub fn resolve(&self, defaults: &PipelineConfig) -> Result<ObjectLocation, ValidationError> {
        let mut location = defaults.staging.location();
        overlay(&mut location.bucket, &self.bucket);
        overlay(&mut location.path, &self.path);

        require("bucket", &location.bucket)?;
        require("path", &location.path)?;
        Ok(location)
    }
}

impl BigQueryFields {
    pub fn resolve(&self, defaults: &PipelineConfig) -> Result<BigQueryTarget, ValidationError> {
        let mut table = defaults.bigquery.table();
        overlay(&mut table.project, &self.bq_project);
        overlay(&mut table.dataset, &self.bq_dataset);
        overlay(&mut table.table, &self.bq_table);

        table
            .validate()
            .map_err(|reason| ValidationError::new("bigquery table", reason))?;

        Ok(BigQueryTarget {
            table,
            disposition: self
                .write_disposition
                .unwrap_or(defaults.bigquery.write_disposition),
        })
    }
}

impl SnowflakeFields {
    pub fn resolve(&self, defaults: &PipelineConfig) -> Result<SnowflakeTarget, ValidationError> {
        let mut table = defaults.snowflake.table();
        overlay(&mut table.warehouse, &self.sf_warehouse);
        overlay(&mut table.database, &self.sf_database);
        overlay(&mut table.schema, &self.sf_schema);
        overlay(&mut table.table, &self.sf_table);

        table
            .validate()
            .map_err(|reason| ValidationError::new("snowflake table", reason))?;

        Ok(SnowflakeTarget {
            credentials: defaults.snowflake.credentials(),
            table,
        })
    }
}

impl RunRequest {
    pub fn resolve(&self, defaults: &PipelineConfig) -> Result<RunSpec, ValidationError> {
        Ok(RunSpec {
            fetch: self.source.resolve(defaults)?,
            staging: self.staging.resolve(defaults)?,
            bigquery: Some(self.bigquery.resolve(defaults)?),
            snowflake: Some(self.snowflake.resolve(defaults)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defaults() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.source.api_url = "https://data.example.org/resource/abcd.json".to_string();
        config.staging.bucket = "staging".to_string();
        config
    }

    #[test]
    fn test_legacy_field_names() {
        let request: RunRequest = serde_json::from_value(json!({
            "api_url": "https://data.cityofnewyork.us/resource/erm2-nwe9.json",
            "api_key": "app-token",
            "gcs_bucket": "nyc-staging",
            "gcs_file_name": "311/extract.csv",
            "test_mode": true,
            "bq_project_id": "analytics",
            "bq_dataset_id": "raw",
            "bq_table_id": "requests",
            "write_disposition": "WRITE_APPEND",
            "sf_warehouse": "LOAD_WH",
            "sf_database": "RAW",
            "sf_schema": "PUBLIC",
            "sf_table": "REQUESTS"
        }))
        .unwrap();

        let spec = request.resolve(&defaults()).unwrap();
        assert_eq!(spec.fetch.endpoint, "https://data.cityofnewyork.us/resource/erm2-nwe9.json");
        assert!(spec.fetch.test_mode);
        assert!(spec.fetch.auth.is_some());
        assert_eq!(spec.staging, ObjectLocation::new("nyc-staging", "311/extract.csv"));

        let bigquery = spec.bigquery.unwrap();
        assert_eq!(bigquery.table.to_string(), "analytics.raw.requests");
        assert_eq!(bigquery.disposition, WriteDisposition::Append);
        assert_eq!(spec.snowflake.unwrap().table.to_string(), "RAW.PUBLIC.REQUESTS");
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let request = FetchToStagingRequest::default();

        let fetch = request.source.resolve(&defaults()).unwrap();
        let location = request.staging.resolve(&defaults()).unwrap();
        assert_eq!(fetch.endpoint, "https://data.example.org/resource/abcd.json");
        assert_eq!(location.bucket, "staging");
        assert_eq!(location.path, "data/extract.csv");
    }

    #[test]
    fn test_blank_bucket_rejected() {
        let request: StagingFields = serde_json::from_value(json!({ "gcs_bucket": "  " })).unwrap();

        let err = request.resolve(&defaults()).unwrap_err();
        assert_eq!(err.field, "bucket");
    }

    #[test]
    fn test_non_http_url_rejected() {
        let request: SourceFields =
            serde_json::from_value(json!({ "api_url": "ftp://example.org/data" })).unwrap();

        let err = request.resolve(&defaults()).unwrap_err();
        assert_eq!(err.field, "api_url");
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let request: SourceFields = serde_json::from_value(json!({ "batch_size": 0 })).unwrap();

        assert!(request.resolve(&defaults()).is_err());
    }

    #[test]
    fn test_missing_bigquery_table_rejected() {
        let request: BigQueryFields =
            serde_json::from_value(json!({ "bq_project_id": "analytics" })).unwrap();

        let err = request.resolve(&defaults()).unwrap_err();
        assert_eq!(err.field, "bigquery table");
    }
}
