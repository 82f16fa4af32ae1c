//! Sluice Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared plumbing for the sluice workspace members:
//!
//! - **Logging**: `tracing` subscriber bootstrap driven by [`logging::LogConfig`]
//! - **Error Handling**: the configuration-level [`SluiceError`]
//! - **Checksums**: SHA-256 digests of staged payloads
//!
//! # Example
//!
//! ```no_run
//! use sluice_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{Result, SluiceError};
