//! Configuration management

use serde::{Deserialize, Serialize};
use sluice_ingest::PipelineConfig;

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8080;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Trigger server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    /// Defaults for every trigger; payload fields override them per request
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_SERVER_HOST.to_string(),
            port: DEFAULT_SERVER_PORT,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let server = ServerConfig {
            host: std::env::var("SLUICE_HOST").unwrap_or_else(|_| DEFAULT_SERVER_HOST.to_string()),
            port: std::env::var("SLUICE_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SERVER_PORT),
            shutdown_timeout_secs: std::env::var("SLUICE_SHUTDOWN_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        };

        let config = Config {
            server,
            pipeline: PipelineConfig::from_env()?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        self.pipeline.validate()?;

        if self.pipeline.snowflake.token.is_none() {
            tracing::warn!("No Snowflake token configured - Snowflake triggers will fail to connect");
        }

        Ok(())
    }
}
