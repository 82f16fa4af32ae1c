//! End-to-end runs: mocked source API, in-memory staging and warehouses

use serde_json::{json, Value};
use sluice_ingest::retry::RetryPolicy;
use sluice_ingest::staging::{CsvCleaning, MemoryObjectStore};
use sluice_ingest::warehouse::bigquery::{BigQueryLoader, BigQueryTable, SchemaMode};
use sluice_ingest::warehouse::memory::{MemoryBigQuery, MemorySnowflake};
use sluice_ingest::warehouse::snowflake::{SnowflakeCredentials, SnowflakeLoader, SnowflakeTable};
use sluice_ingest::{
    BigQueryTarget, FailurePolicy, FetchError, FetchFailureMode, FetchRequest, LoadError,
    ObjectLocation, OnFailure, PageFetcher, Pipeline, PipelineError, RowBatch, RunSpec, Sink,
    SinkStatus, SnowflakeTarget, WriteDisposition,
};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RESOURCE: &str = "/resource/erm2-nwe9.json";
const BQ_TABLE: &str = "analytics.raw.requests";

struct Harness {
    pipeline: Pipeline,
    store: Arc<MemoryObjectStore>,
    bigquery: Arc<MemoryBigQuery>,
    snowflake: MemorySnowflake,
}

fn harness(policy: FailurePolicy) -> Harness {
    let store = Arc::new(MemoryObjectStore::new());
    let bigquery = Arc::new(MemoryBigQuery::new());
    let snowflake = MemorySnowflake::new().with_chunk_rows(64);

    let fetcher = PageFetcher::new(Duration::from_secs(5), RetryPolicy::none()).unwrap();
    let stager = sluice_ingest::Stager::new(store.clone(), CsvCleaning::default(), RetryPolicy::none());
    let pipeline = Pipeline::new(
        fetcher,
        stager,
        BigQueryLoader::new(bigquery.clone(), SchemaMode::AllStrings, RetryPolicy::none()),
        SnowflakeLoader::new(Arc::new(snowflake.clone()), RetryPolicy::none()),
    )
    .with_policy(policy);

    Harness {
        pipeline,
        store,
        bigquery,
        snowflake,
    }
}

fn bigquery_target(disposition: WriteDisposition) -> BigQueryTarget {
    BigQueryTarget {
        table: BigQueryTable::new("analytics", "raw", "requests"),
        disposition,
    }
}

fn snowflake_table() -> SnowflakeTable {
    SnowflakeTable::new("LOAD_WH", "raw", "public", "requests")
}

fn snowflake_target() -> SnowflakeTarget {
    SnowflakeTarget {
        credentials: SnowflakeCredentials {
            account: "acme-xy12345".to_string(),
            user: "LOADER".to_string(),
            token: "token".into(),
            token_type: "OAUTH".to_string(),
            role: None,
        },
        table: snowflake_table(),
    }
}

fn spec(server: &MockServer, batch_size: u64) -> RunSpec {
    RunSpec {
        fetch: FetchRequest::new(format!("{}{}", server.uri(), RESOURCE)).batch_size(batch_size),
        staging: ObjectLocation::new("staging", "nyc/311/extract.csv"),
        bigquery: Some(bigquery_target(WriteDisposition::Truncate)),
        snowflake: Some(snowflake_target()),
    }
}

fn records(start: usize, count: usize) -> Value {
    Value::Array(
        (start..start + count)
            .map(|i| {
                json!({
                    "unique_key": i.to_string(),
                    "complaint_type": "Noise",
                    "description": format!("complaint {i}"),
                })
            })
            .collect(),
    )
}

async fn mount_page(server: &MockServer, offset: u64, body: Value) {
    Mock::given(method("GET"))
        .and(path(RESOURCE))
        .and(query_param("$offset", offset.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn mount_failure(server: &MockServer, offset: u64, status: u16) {
    Mock::given(method("GET"))
        .and(path(RESOURCE))
        .and(query_param("$offset", offset.to_string()))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_full_run_replicates_into_both_sinks() {
    let server = MockServer::start().await;
    mount_page(&server, 0, records(0, 100)).await;
    mount_page(&server, 100, records(100, 100)).await;
    mount_page(&server, 200, json!([])).await;

    let h = harness(FailurePolicy::default());
    let spec = spec(&server, 100);
    let report = h.pipeline.run(&spec).await.unwrap();

    assert_eq!(report.batches, 2);
    assert_eq!(report.rows_fetched, 200);
    assert_eq!(report.rows_loaded(Sink::BigQuery), 200);
    assert_eq!(report.rows_loaded(Sink::Snowflake), 200);

    let payload = h.store.object(&spec.staging).await.unwrap();
    let text = String::from_utf8(payload).unwrap();
    assert_eq!(text.lines().count(), 201);
    assert!(text.starts_with("unique_key,complaint_type,description\n"));

    assert_eq!(h.bigquery.rows(BQ_TABLE).await.unwrap().len(), 200);
    assert_eq!(h.snowflake.rows(&snowflake_table()).await.unwrap().len(), 200);
    assert_eq!(
        h.snowflake.columns(&snowflake_table()).await.unwrap(),
        vec!["UNIQUE_KEY", "COMPLAINT_TYPE", "DESCRIPTION"]
    );
    assert_eq!(h.snowflake.ddl_count(), 1);
    assert_eq!(h.snowflake.connections_opened(), h.snowflake.connections_closed());
}

#[tokio::test]
async fn test_staged_artifact_reads_back_as_fetched() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        0,
        json!([
            { "id": "1", "note": "comma, inside", "city": "São Paulo" },
            { "id": "2", "note": "said \"hi\"\nthen left", "city": null },
        ]),
    )
    .await;
    mount_page(&server, 2, json!([])).await;

    let h = harness(FailurePolicy::default());
    let location = ObjectLocation::new("staging", "roundtrip.csv");
    let request = FetchRequest::new(format!("{}{}", server.uri(), RESOURCE)).batch_size(2);

    let artifact = h.pipeline.fetch_to_staging(request, &location).await.unwrap();
    assert_eq!(artifact.rows, 2);

    let expected = RowBatch::from_parts(
        vec!["id".to_string(), "note".to_string(), "city".to_string()],
        vec![
            vec![
                Some("1".to_string()),
                Some("comma, inside".to_string()),
                Some("São Paulo".to_string()),
            ],
            vec![
                Some("2".to_string()),
                Some("said \"hi\"\nthen left".to_string()),
                None,
            ],
        ],
    )
    .unwrap();
    assert_eq!(h.pipeline.stager().unstage(&location).await.unwrap(), expected);
    assert_eq!(
        h.store.content_type(&location).await.as_deref(),
        Some("text/csv")
    );
}

#[tokio::test]
async fn test_standalone_steps_share_one_artifact() {
    let server = MockServer::start().await;
    mount_page(&server, 0, records(0, 30)).await;
    mount_page(&server, 30, json!([])).await;

    let h = harness(FailurePolicy::default());
    let location = ObjectLocation::new("staging", "steps.csv");
    let request = FetchRequest::new(format!("{}{}", server.uri(), RESOURCE)).batch_size(30);

    h.pipeline.fetch_to_staging(request, &location).await.unwrap();
    let bigquery = h
        .pipeline
        .staging_to_bigquery(&location, &bigquery_target(WriteDisposition::Truncate))
        .await
        .unwrap()
        .unwrap();
    let snowflake = h
        .pipeline
        .staging_to_snowflake(&location, &snowflake_target())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(bigquery.rows_loaded, 30);
    assert_eq!(bigquery.destination, BQ_TABLE);
    assert_eq!(snowflake.rows_loaded, 30);
    assert_eq!(snowflake.destination, "RAW.PUBLIC.REQUESTS");
}

#[tokio::test]
async fn test_loading_a_missing_artifact_is_a_staging_error() {
    let h = harness(FailurePolicy::default());
    let location = ObjectLocation::new("staging", "never-written.csv");

    let err = h
        .pipeline
        .staging_to_bigquery(&location, &bigquery_target(WriteDisposition::Truncate))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Staging { .. }));
    assert_eq!(h.bigquery.job_count(), 0);
}

#[tokio::test]
async fn test_empty_collection_stages_nothing_to_load() {
    let server = MockServer::start().await;
    mount_page(&server, 0, json!([])).await;

    let h = harness(FailurePolicy::default());
    let report = h.pipeline.run(&spec(&server, 100)).await.unwrap();

    assert_eq!(report.rows_fetched, 0);
    assert!(report
        .sinks
        .iter()
        .all(|o| matches!(o.status, SinkStatus::Skipped { .. })));
    assert_eq!(h.bigquery.job_count(), 0);
    assert_eq!(h.snowflake.connections_opened(), 0);
}

#[tokio::test]
async fn test_batched_run_truncates_each_table_once() {
    let server = MockServer::start().await;
    mount_page(&server, 0, records(0, 50)).await;
    mount_page(&server, 50, records(50, 50)).await;
    mount_page(&server, 100, records(100, 20)).await;
    mount_page(&server, 150, json!([])).await;

    let h = harness(FailurePolicy::default());
    let spec = spec(&server, 50);
    let report = h.pipeline.run_batched(&spec).await.unwrap();

    assert_eq!(report.batches, 3);
    assert_eq!(report.artifacts.len(), 3);
    assert_eq!(
        report.artifacts[1].location.path,
        "nyc/311/extract_batch_00001.csv"
    );
    assert_eq!(h.bigquery.rows(BQ_TABLE).await.unwrap().len(), 120);
    assert_eq!(h.snowflake.rows(&snowflake_table()).await.unwrap().len(), 120);
    assert_eq!(h.snowflake.ddl_count(), 1);
    assert_eq!(h.snowflake.connections_opened(), 3);
    assert_eq!(h.snowflake.connections_closed(), 3);
}

fn keys(rows: Vec<Vec<Option<String>>>) -> Vec<String> {
    rows.into_iter()
        .map(|row| row[0].clone().unwrap_or_default())
        .collect()
}

#[tokio::test]
async fn test_batched_rerun_replaces_previous_contents() {
    let first = MockServer::start().await;
    mount_page(&first, 0, records(0, 10)).await;
    mount_page(&first, 10, records(10, 5)).await;
    mount_page(&first, 20, json!([])).await;

    let second = MockServer::start().await;
    mount_page(&second, 0, records(500, 4)).await;
    mount_page(&second, 10, json!([])).await;

    let h = harness(FailurePolicy::default());
    h.pipeline.run_batched(&spec(&first, 10)).await.unwrap();
    assert_eq!(h.bigquery.rows(BQ_TABLE).await.unwrap().len(), 15);

    h.pipeline.run_batched(&spec(&second, 10)).await.unwrap();

    let expected: Vec<String> = (500..504).map(|i| i.to_string()).collect();
    assert_eq!(keys(h.bigquery.rows(BQ_TABLE).await.unwrap()), expected);
    assert_eq!(
        keys(h.snowflake.rows(&snowflake_table()).await.unwrap()),
        expected
    );
    assert_eq!(h.snowflake.ddl_count(), 2);
}

#[tokio::test]
async fn test_fetch_failure_aborts_full_run_before_staging() {
    let server = MockServer::start().await;
    mount_page(&server, 0, records(0, 1000)).await;
    mount_page(&server, 1000, records(1000, 1000)).await;
    mount_failure(&server, 2000, 500).await;

    let h = harness(FailurePolicy::default());
    let err = h.pipeline.run(&spec(&server, 1000)).await.unwrap_err();

    let report = err.report().unwrap();
    assert_eq!(report.batches, 2);
    assert_eq!(
        report.fetch_failure,
        Some(FetchError::Status {
            offset: 2000,
            status: 500
        })
    );
    assert!(report.artifacts.is_empty());
    assert_eq!(h.store.put_count(), 0);
    assert_eq!(h.bigquery.job_count(), 0);
}

#[tokio::test]
async fn test_fetch_failure_with_stage_partial_loads_but_reports_incomplete() {
    let server = MockServer::start().await;
    mount_page(&server, 0, records(0, 10)).await;
    mount_failure(&server, 10, 503).await;

    let policy = FailurePolicy {
        fetch: FetchFailureMode::StagePartial,
        ..FailurePolicy::default()
    };
    let h = harness(policy);
    let err = h.pipeline.run(&spec(&server, 10)).await.unwrap_err();

    let report = err.report().unwrap();
    assert_eq!(report.rows_fetched, 10);
    assert_eq!(report.rows_loaded(Sink::BigQuery), 10);
    assert_eq!(report.rows_loaded(Sink::Snowflake), 10);
    assert!(report.fetch_failure.is_some());
}

#[tokio::test]
async fn test_fetch_to_staging_surfaces_failed_page() {
    let server = MockServer::start().await;
    mount_page(&server, 0, records(0, 5)).await;
    mount_failure(&server, 5, 500).await;

    let h = harness(FailurePolicy::default());
    let location = ObjectLocation::new("staging", "partial.csv");
    let request = FetchRequest::new(format!("{}{}", server.uri(), RESOURCE)).batch_size(5);
    let err = h.pipeline.fetch_to_staging(request, &location).await.unwrap_err();

    assert!(matches!(err, PipelineError::Fetch { batches: 1, .. }));
    assert!(h.store.object(&location).await.is_none());
}

#[tokio::test]
async fn test_batched_fetch_failure_keeps_loaded_batches() {
    let server = MockServer::start().await;
    mount_page(&server, 0, records(0, 25)).await;
    mount_failure(&server, 25, 500).await;

    let h = harness(FailurePolicy::default());
    let err = h.pipeline.run_batched(&spec(&server, 25)).await.unwrap_err();

    let report = err.report().unwrap();
    assert_eq!(report.batches, 1);
    assert_eq!(report.rows_loaded(Sink::BigQuery), 25);
    assert!(report.failure_summary().starts_with("fetch stopped after 1 batch(es)"));
}

#[tokio::test]
async fn test_snowflake_failure_continues_batched_run() {
    let server = MockServer::start().await;
    mount_page(&server, 0, records(0, 10)).await;
    mount_page(&server, 10, records(10, 10)).await;
    mount_page(&server, 20, json!([])).await;

    let h = harness(FailurePolicy::default());
    h.snowflake.set_fail_bulk(true);
    let err = h.pipeline.run_batched(&spec(&server, 10)).await.unwrap_err();

    let report = err.report().unwrap();
    assert!(!report.aborted);
    assert_eq!(report.batches, 2);
    assert_eq!(report.rows_loaded(Sink::BigQuery), 20);
    assert_eq!(report.failures().count(), 2);
    assert!(report
        .failures()
        .all(|o| matches!(o.status, SinkStatus::Failed { error: LoadError::BulkWrite { .. } })));
    assert_eq!(h.snowflake.connections_opened(), h.snowflake.connections_closed());
}

#[tokio::test]
async fn test_bigquery_failure_aborts_batched_run() {
    let server = MockServer::start().await;
    mount_page(&server, 0, records(0, 10)).await;
    Mock::given(method("GET"))
        .and(path(RESOURCE))
        .and(query_param("$offset", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(records(10, 10)))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness(FailurePolicy::default());
    h.bigquery
        .fail_next(LoadError::Rejected {
            destination: BQ_TABLE.to_string(),
            message: "quota exceeded".to_string(),
        })
        .await;
    let err = h.pipeline.run_batched(&spec(&server, 10)).await.unwrap_err();

    let report = err.report().unwrap();
    assert!(report.aborted);
    assert_eq!(report.batches, 1);
    assert_eq!(report.rows_loaded(Sink::Snowflake), 10);
    assert!(report.failure_summary().contains("quota exceeded"));
}

#[tokio::test]
async fn test_failed_first_write_keeps_truncate_for_next_batch() {
    let server = MockServer::start().await;
    mount_page(&server, 0, records(0, 10)).await;
    mount_page(&server, 10, records(10, 10)).await;
    mount_page(&server, 20, json!([])).await;

    let policy = FailurePolicy {
        bigquery: OnFailure::Continue,
        ..FailurePolicy::default()
    };
    let h = harness(policy);
    h.bigquery
        .fail_next(LoadError::Rejected {
            destination: BQ_TABLE.to_string(),
            message: "transient".to_string(),
        })
        .await;
    let err = h.pipeline.run_batched(&spec(&server, 10)).await.unwrap_err();

    let report = err.report().unwrap();
    assert!(!report.aborted);
    assert_eq!(h.bigquery.job_count(), 2);
    assert_eq!(h.bigquery.rows(BQ_TABLE).await.unwrap().len(), 10);
    assert_eq!(report.rows_loaded(Sink::BigQuery), 10);
}

#[tokio::test]
async fn test_sinks_can_be_left_out_of_a_run() {
    let server = MockServer::start().await;
    mount_page(&server, 0, records(0, 3)).await;
    mount_page(&server, 3, json!([])).await;

    let h = harness(FailurePolicy::default());
    let mut spec = spec(&server, 3);
    spec.snowflake = None;
    let report = h.pipeline.run(&spec).await.unwrap();

    assert_eq!(report.sinks.len(), 1);
    assert_eq!(report.sinks[0].sink, Sink::BigQuery);
    assert_eq!(h.snowflake.connections_opened(), 0);
}

#[tokio::test]
async fn test_staging_upload_failure_stops_run() {
    let server = MockServer::start().await;
    mount_page(&server, 0, records(0, 3)).await;
    mount_page(&server, 3, json!([])).await;

    let h = harness(FailurePolicy::default());
    h.store.fail_next_puts(1);
    let err = h.pipeline.run(&spec(&server, 3)).await.unwrap_err();

    let report = err.report().unwrap();
    assert_eq!(report.rows_fetched, 3);
    assert!(report.artifacts.is_empty());
    assert!(report.sinks.is_empty());
    assert!(report.staging_failure.is_some());
    assert!(err.to_string().contains("staging failed"), "{err}");
    assert_eq!(h.bigquery.job_count(), 0);
}

#[tokio::test]
async fn test_batched_staging_failure_keeps_loaded_batches_in_report() {
    let server = MockServer::start().await;
    mount_page(&server, 0, records(0, 10)).await;
    mount_page(&server, 10, records(10, 10)).await;
    mount_page(&server, 20, json!([])).await;

    let h = harness(FailurePolicy::default());
    h.store.fail_puts_after(1);
    let err = h.pipeline.run_batched(&spec(&server, 10)).await.unwrap_err();

    let report = err.report().unwrap();
    assert_eq!(report.batches, 2);
    assert_eq!(report.artifacts.len(), 1);
    assert_eq!(report.rows_loaded(Sink::BigQuery), 10);
    assert_eq!(report.rows_loaded(Sink::Snowflake), 10);
    assert!(report.sinks.iter().all(|o| o.batch == Some(0)));
    assert!(
        report.failure_summary().contains("staging of batch 1 failed"),
        "{}",
        report.failure_summary()
    );
    assert_eq!(h.bigquery.rows(BQ_TABLE).await.unwrap().len(), 10);
}
