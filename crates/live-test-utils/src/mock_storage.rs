//! In-memory object storage mock.
//!
//! Behaves like a multipart backend with a minimum part size: completion
//! fails if any non-final part is below the minimum. Every call is recorded
//! so tests can assert on part sizes, aborts and fallbacks.
//!
//! # Example
//!
//! ```rust,ignore
//! use live_test_utils::MockObjectStorage;
//!
//! let storage = MockObjectStorage::new(5 * 1024 * 1024).fail_create();
//! // init falls back to simple mode
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use live_runtime::recording::{CompletedPart, ObjectStorage, StorageError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Mock object storage.
#[derive(Debug, Clone)]
pub struct MockObjectStorage {
    inner: Arc<Mutex<MockStorageInner>>,
    min_part_size: usize,
}

#[derive(Debug, Default)]
struct MockStorageInner {
    /// Staged parts per backend upload id, keyed by part number.
    uploads: HashMap<String, BTreeMap<u32, Bytes>>,
    objects: HashMap<String, Bytes>,
    aborted: Vec<String>,
    completed: Vec<String>,
    put_calls: usize,
    fail_create: bool,
    fail_put: bool,
    fail_parts: HashSet<u32>,
}

impl MockObjectStorage {
    /// Create a mock enforcing `min_part_size` on completion.
    #[must_use]
    pub fn new(min_part_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockStorageInner::default())),
            min_part_size,
        }
    }

    /// Make `create_multipart` fail, forcing simple mode.
    #[must_use]
    pub fn fail_create(self) -> Self {
        self.inner.lock().unwrap().fail_create = true;
        self
    }

    /// Make `upload_part` fail for `part_number`.
    #[must_use]
    pub fn fail_part(self, part_number: u32) -> Self {
        self.inner.lock().unwrap().fail_parts.insert(part_number);
        self
    }

    /// Make `put_object` fail.
    #[must_use]
    pub fn fail_put(self) -> Self {
        self.inner.lock().unwrap().fail_put = true;
        self
    }

    /// Sizes of the parts staged for `upload_id`, in part order.
    #[must_use]
    pub fn part_sizes(&self, upload_id: &str) -> Vec<usize> {
        self.inner
            .lock()
            .unwrap()
            .uploads
            .get(upload_id)
            .map(|parts| parts.values().map(Bytes::len).collect())
            .unwrap_or_default()
    }

    /// Backend upload ids created so far that are neither completed nor aborted.
    #[must_use]
    pub fn open_uploads(&self) -> Vec<String> {
        self.inner.lock().unwrap().uploads.keys().cloned().collect()
    }

    #[must_use]
    pub fn aborted(&self) -> Vec<String> {
        self.inner.lock().unwrap().aborted.clone()
    }

    /// Keys written by `complete_multipart`.
    #[must_use]
    pub fn completed(&self) -> Vec<String> {
        self.inner.lock().unwrap().completed.clone()
    }

    #[must_use]
    pub fn put_calls(&self) -> usize {
        self.inner.lock().unwrap().put_calls
    }

    #[must_use]
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.inner.lock().unwrap().objects.get(key).cloned()
    }

    /// The single stored object, for tests that write exactly one.
    #[must_use]
    pub fn only_object(&self) -> (String, Bytes) {
        let inner = self.inner.lock().unwrap();
        assert_eq!(inner.objects.len(), 1, "expected exactly one stored object");
        let (key, body) = inner.objects.iter().next().unwrap();
        (key.clone(), body.clone())
    }

    fn url(key: &str) -> String {
        format!("https://storage.test/{key}")
    }
}

#[async_trait]
impl ObjectStorage for MockObjectStorage {
    async fn create_multipart(
        &self,
        _key: &str,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_create {
            return Err(StorageError::Unavailable("no credentials".to_string()));
        }
        let upload_id = Uuid::new_v4().to_string();
        inner.uploads.insert(upload_id.clone(), BTreeMap::new());
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_parts.contains(&part_number) {
            return Err(StorageError::Unavailable(format!(
                "injected failure on part {part_number}"
            )));
        }
        let parts = inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StorageError::UnknownUpload(upload_id.to_string()))?;
        parts.insert(part_number, body);
        Ok(format!("etag-{part_number}"))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<String, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let staged = inner
            .uploads
            .get(upload_id)
            .ok_or_else(|| StorageError::UnknownUpload(upload_id.to_string()))?;
        if parts.is_empty() {
            return Err(StorageError::InvalidParts("no parts".to_string()));
        }

        let mut body = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            let data = staged.get(&part.part_number).ok_or_else(|| {
                StorageError::InvalidParts(format!("part {} missing", part.part_number))
            })?;
            if i + 1 < parts.len() && data.len() < self.min_part_size {
                return Err(StorageError::PartTooSmall {
                    part_number: part.part_number,
                    size: data.len() as u64,
                    minimum: self.min_part_size,
                });
            }
            body.extend_from_slice(data);
        }

        inner.uploads.remove(upload_id);
        inner.objects.insert(key.to_string(), Bytes::from(body));
        inner.completed.push(key.to_string());
        Ok(Self::url(key))
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.uploads.remove(upload_id).is_none() {
            return Err(StorageError::UnknownUpload(upload_id.to_string()));
        }
        inner.aborted.push(upload_id.to_string());
        Ok(())
    }

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.put_calls += 1;
        if inner.fail_put {
            return Err(StorageError::Unavailable("injected put failure".to_string()));
        }
        inner.objects.insert(key.to_string(), body);
        Ok(Self::url(key))
    }
}
