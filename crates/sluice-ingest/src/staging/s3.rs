use async_trait::async_trait;
use aws_sdk_s3::{
    config::{timeout::TimeoutConfig, BehaviorVersion, Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    Client,
};
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::{ObjectLocation, ObjectStore};
use crate::config::StagingConfig;
use crate::error::StorageError;

/// Staging store on S3 or any S3-compatible endpoint (MinIO, GCS interop)
#[derive(Clone, Debug)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    /// Static keys from the config when both are set, otherwise the default
    /// AWS credential chain
    pub async fn new(config: &StagingConfig) -> Self {
        let timeouts = TimeoutConfig::builder()
            .operation_timeout(Duration::from_secs(config.timeout_secs))
            .build();

        let mut builder = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .credentials_provider(Credentials::new(
                    access_key,
                    secret_key.expose(),
                    None,
                    None,
                    "sluice-staging",
                )),
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest()).load().await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        builder = builder
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style)
            .timeout_config(timeouts);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        info!(
            region = %config.region,
            endpoint = config.endpoint.as_deref().unwrap_or("aws"),
            "Staging store client initialized"
        );

        Self::from_client(Client::from_conf(builder.build()))
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, data), fields(location = %location, bytes = data.len()))]
    async fn put(
        &self,
        location: &ObjectLocation,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        debug!("Uploading to {}", location);

        self.client
            .put_object()
            .bucket(&location.bucket)
            .key(&location.path)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::Upload {
                location: location.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(())
    }

    #[instrument(skip(self), fields(location = %location))]
    async fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, StorageError> {
        debug!("Downloading from {}", location);

        let response = self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.path)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|s| s.is_no_such_key()) {
                    StorageError::NotFound {
                        location: location.to_string(),
                    }
                } else {
                    StorageError::Download {
                        location: location.to_string(),
                        message: DisplayErrorContext(&e).to_string(),
                    }
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Download {
                location: location.to_string(),
                message: e.to_string(),
            })?
            .into_bytes()
            .to_vec();

        Ok(data)
    }
}
