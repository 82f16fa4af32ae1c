//! In-process object store for tests and dry runs

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use super::{ObjectLocation, ObjectStore};
use crate::error::StorageError;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: String,
}

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<ObjectLocation, StoredObject>>,
    puts: AtomicUsize,
    failing_puts: AtomicUsize,
    /// 1-based index of the first upload that always fails; 0 disables
    fail_from: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place an object directly, bypassing `put` accounting
    pub async fn insert(&self, location: &ObjectLocation, data: Vec<u8>) {
        self.objects.lock().await.insert(
            location.clone(),
            StoredObject {
                data,
                content_type: super::CSV_CONTENT_TYPE.to_string(),
            },
        );
    }

    pub async fn object(&self, location: &ObjectLocation) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .await
            .get(location)
            .map(|object| object.data.clone())
    }

    pub async fn content_type(&self, location: &ObjectLocation) -> Option<String> {
        self.objects
            .lock()
            .await
            .get(location)
            .map(|object| object.content_type.clone())
    }

    pub async fn locations(&self) -> Vec<ObjectLocation> {
        let mut locations: Vec<_> = self.objects.lock().await.keys().cloned().collect();
        locations.sort_by(|a, b| a.path.cmp(&b.path));
        locations
    }

    /// Upload attempts so far, failed ones included
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Make the next `n` uploads fail with a transient error
    pub fn fail_next_puts(&self, n: usize) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// Let the first `n` uploads through, then fail every later one
    pub fn fail_puts_after(&self, n: usize) {
        self.fail_from.store(n.saturating_add(1), Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        location: &ObjectLocation,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let attempt = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
        let fail_from = self.fail_from.load(Ordering::SeqCst);

        let should_fail = (fail_from != 0 && attempt >= fail_from)
            || self
                .failing_puts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if should_fail {
            return Err(StorageError::Upload {
                location: location.to_string(),
                message: "injected upload failure".to_string(),
            });
        }

        self.objects.lock().await.insert(
            location.clone(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, StorageError> {
        self.object(location).await.ok_or_else(|| StorageError::NotFound {
            location: location.to_string(),
        })
    }
}
