//! In-memory object store.
//!
//! Objects live only as long as the process. Outages can be simulated with
//! [`MemoryObjectStore::set_unavailable`] so fail-open paths can be exercised.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{validate_path, ObjectMeta, ObjectStore, StoreError};

struct StoredObject {
    body: Bytes,
    uploaded_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, StoredObject>,
    unavailable: AtomicBool,
    puts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Insert an object with an explicit timestamp, bypassing outage simulation.
    pub fn insert_at(&self, path: &str, body: impl Into<Bytes>, uploaded_at: DateTime<Utc>) {
        self.objects.insert(
            path.to_string(),
            StoredObject {
                body: body.into(),
                uploaded_at,
            },
        );
    }

    /// Number of successful writes so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Stored paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("simulated outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, path: &str) -> Result<Option<Bytes>, StoreError> {
        self.check_available()?;
        Ok(self.objects.get(path).map(|o| o.body.clone()))
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.objects.contains_key(path))
    }

    async fn put(&self, path: &str, body: Bytes, _content_type: &str) -> Result<(), StoreError> {
        self.check_available()?;
        validate_path(path)?;
        self.insert_at(path, body, Utc::now());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError> {
        self.check_available()?;
        Ok(self
            .objects
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| ObjectMeta {
                path: e.key().clone(),
                size: e.body.len() as u64,
                uploaded_at: e.uploaded_at,
            })
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

impl std::fmt::Debug for MemoryObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryObjectStore")
            .field("objects", &self.objects.len())
            .field("unavailable", &self.unavailable.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list() {
        let store = MemoryObjectStore::new();
        store
            .put("vision/metadata/a/latest.json", Bytes::from_static(b"{}"), "application/json")
            .await
            .unwrap();
        store
            .put("vision/source/a/source.bin", Bytes::from_static(b"raw"), "application/octet-stream")
            .await
            .unwrap();

        assert_eq!(
            store.get("vision/metadata/a/latest.json").await.unwrap(),
            Some(Bytes::from_static(b"{}"))
        );
        assert!(store.get("vision/metadata/b/latest.json").await.unwrap().is_none());
        assert!(store.exists("vision/source/a/source.bin").await.unwrap());

        let listed = store.list("vision/metadata/a/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size, 2);
        assert_eq!(store.put_count(), 2);
    }

    #[tokio::test]
    async fn test_outage_fails_every_operation() {
        let store = MemoryObjectStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get("x").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.list("x").await.is_err());
        assert!(store.put("x", Bytes::new(), "text/plain").await.is_err());

        store.set_unavailable(false);
        assert!(store.get("x").await.unwrap().is_none());
    }
}
