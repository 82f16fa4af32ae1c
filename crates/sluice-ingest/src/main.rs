//! Sluice - extract-load CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sluice_common::logging::{init_logging, LogConfig, LogLevel};
use sluice_ingest::config::PipelineConfig;
use sluice_ingest::pipeline::{BigQueryTarget, Pipeline, RunReport, RunSpec, SnowflakeTarget};
use sluice_ingest::records::WriteDisposition;
use sluice_ingest::warehouse::SchemaMode;
use sluice_ingest::PipelineError;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(author, version, about = "Replicate a paginated open-data API into BigQuery and Snowflake")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use in-memory staging and warehouses; `fetch` and `run` only, since
    /// a fresh in-memory store holds nothing to load
    #[arg(long, global = true)]
    dry_run: bool,

    /// Staging bucket
    #[arg(long, global = true)]
    bucket: Option<String>,

    /// Staging object path
    #[arg(long, global = true)]
    path: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch the whole collection and stage it as CSV
    Fetch {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Load a staged CSV into BigQuery
    LoadBigquery {
        #[command(flatten)]
        bigquery: BigQueryArgs,
    },

    /// Recreate a Snowflake table from a staged CSV
    LoadSnowflake {
        #[command(flatten)]
        snowflake: SnowflakeArgs,
    },

    /// Fetch, stage and load both warehouses
    Run {
        /// Stage and load page by page instead of once at the end
        #[arg(long)]
        batched: bool,

        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        bigquery: BigQueryArgs,

        #[command(flatten)]
        snowflake: SnowflakeArgs,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Fetch { .. } => "fetch",
            Command::LoadBigquery { .. } => "load-bigquery",
            Command::LoadSnowflake { .. } => "load-snowflake",
            Command::Run { .. } => "run",
        }
    }

    /// Standalone loads read an artifact staged by an earlier process
    fn reads_existing_artifact(&self) -> bool {
        matches!(self, Command::LoadBigquery { .. } | Command::LoadSnowflake { .. })
    }
}

fn check_dry_run(cli: &Cli) -> Result<()> {
    if cli.dry_run && cli.command.reads_existing_artifact() {
        anyhow::bail!(
            "--dry-run cannot be used with {}: the in-memory staging store starts empty",
            cli.command.name()
        );
    }
    Ok(())
}

#[derive(clap::Args, Debug)]
struct SourceArgs {
    /// Collection endpoint
    #[arg(long)]
    api_url: Option<String>,

    /// Records per page
    #[arg(long)]
    batch_size: Option<u64>,

    /// Stop after the first page
    #[arg(long)]
    test_mode: bool,
}

#[derive(clap::Args, Debug)]
struct BigQueryArgs {
    #[arg(long)]
    bq_project: Option<String>,

    #[arg(long)]
    bq_dataset: Option<String>,

    #[arg(long)]
    bq_table: Option<String>,

    /// WRITE_TRUNCATE or WRITE_APPEND
    #[arg(long)]
    write_disposition: Option<WriteDisposition>,

    /// Infer column types instead of loading everything as STRING
    #[arg(long)]
    autodetect: bool,
}

#[derive(clap::Args, Debug)]
struct SnowflakeArgs {
    #[arg(long)]
    sf_warehouse: Option<String>,

    #[arg(long)]
    sf_database: Option<String>,

    #[arg(long)]
    sf_schema: Option<String>,

    #[arg(long)]
    sf_table: Option<String>,
}

impl SourceArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(url) = &self.api_url {
            config.source.api_url = url.clone();
        }
        if let Some(batch_size) = self.batch_size {
            config.source.batch_size = batch_size;
        }
        if self.test_mode {
            config.source.test_mode = true;
        }
    }
}

impl BigQueryArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        let bigquery = &mut config.bigquery;
        if let Some(project) = &self.bq_project {
            bigquery.project = project.clone();
        }
        if let Some(dataset) = &self.bq_dataset {
            bigquery.dataset = dataset.clone();
        }
        if let Some(table) = &self.bq_table {
            bigquery.table = table.clone();
        }
        if let Some(disposition) = self.write_disposition {
            bigquery.write_disposition = disposition;
        }
        if self.autodetect {
            bigquery.schema_mode = SchemaMode::Autodetect;
        }
    }
}

impl SnowflakeArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        let snowflake = &mut config.snowflake;
        if let Some(warehouse) = &self.sf_warehouse {
            snowflake.warehouse = warehouse.clone();
        }
        if let Some(database) = &self.sf_database {
            snowflake.database = database.clone();
        }
        if let Some(schema) = &self.sf_schema {
            snowflake.schema = schema.clone();
        }
        if let Some(table) = &self.sf_table {
            snowflake.table = table.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    check_dry_run(&cli)?;

    let log_config = LogConfig::builder().log_file_prefix("sluice").build();
    let mut log_config = LogConfig::from_env().unwrap_or(log_config);
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    init_logging(&log_config)?;

    let mut config = PipelineConfig::from_env().context("Failed to read configuration")?;
    if let Some(bucket) = &cli.bucket {
        config.staging.bucket = bucket.clone();
    }
    if let Some(path) = &cli.path {
        config.staging.path = path.clone();
    }
    match &cli.command {
        Command::Fetch { source } => source.apply(&mut config),
        Command::LoadBigquery { bigquery } => bigquery.apply(&mut config),
        Command::LoadSnowflake { snowflake } => snowflake.apply(&mut config),
        Command::Run {
            source,
            bigquery,
            snowflake,
            ..
        } => {
            source.apply(&mut config);
            bigquery.apply(&mut config);
            snowflake.apply(&mut config);
        },
    }
    config.validate().context("Invalid configuration")?;

    let pipeline = if cli.dry_run {
        info!("Dry run: staging and warehouses are in memory");
        Pipeline::in_memory(&config)?
    } else {
        Pipeline::from_config(&config).await?
    };

    let location = config.staging.location();
    match cli.command {
        Command::Fetch { .. } => {
            let artifact = pipeline
                .fetch_to_staging(config.source.fetch_request(), &location)
                .await?;
            info!(bytes = artifact.bytes, sha256 = %artifact.sha256, "Staged {} rows to {}", artifact.rows, artifact.location);
        },
        Command::LoadBigquery { .. } => {
            let target = BigQueryTarget {
                table: config.bigquery.table(),
                disposition: config.bigquery.write_disposition,
            };
            match pipeline.staging_to_bigquery(&location, &target).await? {
                Some(result) => info!("Loaded {} rows into {}", result.rows_loaded, result.destination),
                None => info!("Nothing to load from {}", location),
            }
        },
        Command::LoadSnowflake { .. } => {
            let target = SnowflakeTarget {
                credentials: config.snowflake.credentials(),
                table: config.snowflake.table(),
            };
            match pipeline.staging_to_snowflake(&location, &target).await? {
                Some(result) => info!("Loaded {} rows into {}", result.rows_loaded, result.destination),
                None => info!("Nothing to load from {}", location),
            }
        },
        Command::Run { batched, .. } => {
            let spec = RunSpec::from_config(&config);
            let outcome = if batched {
                pipeline.run_batched(&spec).await
            } else {
                pipeline.run(&spec).await
            };
            match outcome {
                Ok(report) => log_report(&report),
                Err(PipelineError::Incomplete(report)) => {
                    log_report(&report);
                    anyhow::bail!("run {} incomplete: {}", report.run_id, report.failure_summary());
                },
                Err(err) => return Err(err.into()),
            }
        },
    }

    info!("Done");
    Ok(())
}

fn log_report(report: &RunReport) {
    info!(
        run_id = %report.run_id,
        batches = report.batches,
        rows = report.rows_fetched,
        artifacts = report.artifacts.len(),
        "Run finished"
    );
    for outcome in &report.sinks {
        match serde_json::to_string(&outcome.status) {
            Ok(status) => info!(sink = %outcome.sink, batch = ?outcome.batch, "{}", status),
            Err(err) => error!(error = %err, "Could not render sink outcome"),
        }
    }
}
