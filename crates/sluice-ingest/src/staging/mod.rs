//! Durable staging of row batches as CSV objects
//!
//! [`Stager::stage`] encodes a batch and writes it in one upload;
//! [`Stager::unstage`] reads an object back, possibly in another process.
//! The store behind them is an [`ObjectStore`]: S3 (and S3-compatible
//! endpoints) in production, memory in tests and dry runs.

pub mod csv_codec;
pub mod memory;
pub mod s3;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument};

use sluice_common::checksum::{matches_sha256, sha256_hex};

use crate::error::{StagingError, StorageError};
use crate::records::RowBatch;
use crate::retry::RetryPolicy;

pub use csv_codec::{CsvCleaning, CSV_CONTENT_TYPE};
pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

/// Address of one staged object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub path: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
        }
    }

    /// Path for one batch of a batched run
    ///
    /// `exports/311.csv` becomes `exports/311_batch_00003.csv` for batch 3.
    pub fn for_batch(&self, index: usize) -> Self {
        let name_start = self.path.rfind('/').map_or(0, |i| i + 1);
        let path = match self.path[name_start..].rfind('.') {
            Some(dot) if dot > 0 => {
                let (stem, ext) = self.path.split_at(name_start + dot);
                format!("{stem}_batch_{index:05}{ext}")
            },
            _ => format!("{}_batch_{index:05}", self.path),
        };

        Self {
            bucket: self.bucket.clone(),
            path,
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.path)
    }
}

/// Whole-object key/value storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write the full payload in a single request, replacing any object there
    async fn put(
        &self,
        location: &ObjectLocation,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Read the full payload
    async fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, StorageError>;
}

/// What a successful stage wrote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedArtifact {
    pub location: ObjectLocation,
    /// Data rows, header excluded
    pub rows: u64,
    pub bytes: u64,
    pub sha256: String,
}

/// Writes and reads staged CSV
#[derive(Clone)]
pub struct Stager {
    store: Arc<dyn ObjectStore>,
    cleaning: CsvCleaning,
    retry: RetryPolicy,
}

impl fmt::Debug for Stager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stager")
            .field("cleaning", &self.cleaning)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Stager {
    pub fn new(store: Arc<dyn ObjectStore>, cleaning: CsvCleaning, retry: RetryPolicy) -> Self {
        Self {
            store,
            cleaning,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    #[instrument(skip(self, batch), fields(location = %location, rows = batch.len()))]
    pub async fn stage(
        &self,
        batch: &RowBatch,
        location: &ObjectLocation,
    ) -> Result<StagedArtifact, StagingError> {
        let payload = csv_codec::encode(batch, &self.cleaning)?;
        let artifact = StagedArtifact {
            location: location.clone(),
            rows: batch.len() as u64,
            bytes: payload.len() as u64,
            sha256: sha256_hex(&payload),
        };

        self.retry
            .run("stage", || {
                self.store
                    .put(location, payload.clone(), CSV_CONTENT_TYPE)
            })
            .await?;

        info!(bytes = artifact.bytes, "Staged {} rows to {}", artifact.rows, location);
        Ok(artifact)
    }

    #[instrument(skip(self), fields(location = %location))]
    pub async fn unstage(&self, location: &ObjectLocation) -> Result<RowBatch, StagingError> {
        let payload = self.download(location).await?;
        let batch = csv_codec::decode(&payload)?;

        info!(columns = batch.columns().len(), "Unstaged {} rows from {}", batch.len(), location);
        Ok(batch)
    }

    /// Read back an artifact this run wrote, refusing a payload that changed
    /// since
    pub async fn unstage_verified(&self, artifact: &StagedArtifact) -> Result<RowBatch, StagingError> {
        let payload = self.download(&artifact.location).await?;

        if !matches_sha256(&payload, &artifact.sha256) {
            return Err(StorageError::ChecksumMismatch {
                location: artifact.location.to_string(),
                expected: artifact.sha256.clone(),
                actual: sha256_hex(&payload),
            }
            .into());
        }

        Ok(csv_codec::decode(&payload)?)
    }

    async fn download(&self, location: &ObjectLocation) -> Result<Vec<u8>, StorageError> {
        self.retry.run("unstage", || self.store.get(location)).await
    }
}
