//! Sluice Server Library
//!
//! HTTP trigger surface over the sluice engine, for schedulers that start
//! pipeline steps by calling a URL.
//!
//! Each route accepts a JSON payload whose fields override the server's
//! configured defaults and answers with `{"status", "message", "report"}`:
//! 200 on success, 400 when the payload is invalid, 500 when the pipeline
//! fails (the run report is attached when there is one).
//!
//! # Example
//!
//! ```no_run
//! use sluice_ingest::Pipeline;
//! use sluice_server::{config::Config, router, AppState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pipeline = Pipeline::from_config(&config.pipeline).await?;
//!     let app = router(AppState::new(pipeline, config.pipeline));
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod middleware;
pub mod requests;
pub mod routes;

pub use error::{AppError, TriggerResponse};
pub use routes::{router, AppState};
