//! Trigger routes
//!
//! | Method | Path | Pipeline call |
//! |---|---|---|
//! | GET | `/health` | none |
//! | POST | `/fetch-to-staging` | [`Pipeline::fetch_to_staging`] |
//! | POST | `/staging-to-bigquery` | [`Pipeline::staging_to_bigquery`] |
//! | POST | `/staging-to-snowflake` | [`Pipeline::staging_to_snowflake`] |
//! | POST | `/run` | [`Pipeline::run`] or [`Pipeline::run_batched`] |

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use sluice_ingest::{LoadResult, Pipeline, PipelineConfig, RunReport, StagedArtifact};
use std::sync::Arc;
use tracing::info;

use crate::error::{AppError, TriggerResponse};
use crate::middleware;
use crate::requests::{BigQueryLoadRequest, FetchToStagingRequest, RunRequest, SnowflakeLoadRequest};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    /// Defaults for payload fields, plus warehouse credentials
    pub defaults: Arc<PipelineConfig>,
}

impl AppState {
    pub fn new(pipeline: Pipeline, defaults: PipelineConfig) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            defaults: Arc::new(defaults),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/fetch-to-staging", post(fetch_to_staging))
        .route("/staging-to-bigquery", post(staging_to_bigquery))
        .route("/staging-to-snowflake", post(staging_to_snowflake))
        .route("/run", post(run))
        .with_state(state)
        .layer(middleware::tracing_layer())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn fetch_to_staging(
    State(state): State<AppState>,
    payload: Result<Json<FetchToStagingRequest>, JsonRejection>,
) -> Result<Json<TriggerResponse<StagedArtifact>>, AppError> {
    let Json(request) = payload?;
    let fetch = request.source.resolve(&state.defaults)?;
    let location = request.staging.resolve(&state.defaults)?;

    info!(endpoint = %fetch.endpoint, location = %location, "Fetch-to-staging triggered");
    let artifact = state.pipeline.fetch_to_staging(fetch, &location).await?;

    Ok(Json(TriggerResponse::success(
        format!("Staged {} rows to {}", artifact.rows, artifact.location),
        Some(artifact),
    )))
}

async fn staging_to_bigquery(
    State(state): State<AppState>,
    payload: Result<Json<BigQueryLoadRequest>, JsonRejection>,
) -> Result<Json<TriggerResponse<LoadResult>>, AppError> {
    let Json(request) = payload?;
    let location = request.staging.resolve(&state.defaults)?;
    let target = request.bigquery.resolve(&state.defaults)?;

    info!(location = %location, destination = %target.table, "Staging-to-BigQuery triggered");
    let result = state.pipeline.staging_to_bigquery(&location, &target).await?;

    Ok(Json(load_response(result, &location.to_string())))
}

async fn staging_to_snowflake(
    State(state): State<AppState>,
    payload: Result<Json<SnowflakeLoadRequest>, JsonRejection>,
) -> Result<Json<TriggerResponse<LoadResult>>, AppError> {
    let Json(request) = payload?;
    let location = request.staging.resolve(&state.defaults)?;
    let target = request.snowflake.resolve(&state.defaults)?;

    info!(location = %location, destination = %target.table, "Staging-to-Snowflake triggered");
    let result = state.pipeline.staging_to_snowflake(&location, &target).await?;

    Ok(Json(load_response(result, &location.to_string())))
}

async fn run(
    State(state): State<AppState>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Result<Json<TriggerResponse<RunReport>>, AppError> {
    let Json(request) = payload?;
    let spec = request.resolve(&state.defaults)?;

    info!(endpoint = %spec.fetch.endpoint, batched = request.batched, "Run triggered");
    let report = if request.batched {
        state.pipeline.run_batched(&spec).await?
    } else {
        state.pipeline.run(&spec).await?
    };

    Ok(Json(TriggerResponse::success(
        format!(
            "Replicated {} rows in {} batch(es)",
            report.rows_fetched, report.batches
        ),
        Some(report),
    )))
}

fn load_response(result: Option<LoadResult>, location: &str) -> TriggerResponse<LoadResult> {
    match result {
        Some(result) => TriggerResponse::success(
            format!("Loaded {} rows into {}", result.rows_loaded, result.destination),
            Some(result),
        ),
        None => TriggerResponse::success(format!("Nothing to load from {location}"), None),
    }
}
