//! Object store backed by a local directory.
//!
//! Object paths map 1:1 onto files below the root. Writes go to a temporary
//! sibling first and are renamed into place, so readers never observe a
//! half-written entry.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{validate_path, ObjectMeta, ObjectStore, StoreError};

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        validate_path(path)?;
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, path: &str) -> Result<Option<Bytes>, StoreError> {
        let file = self.resolve(path)?;
        match tokio::fs::read(&file).await {
            Ok(body) => Ok(Some(Bytes::from(body))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let file = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&file).await?)
    }

    async fn put(&self, path: &str, body: Bytes, _content_type: &str) -> Result<(), StoreError> {
        let file = self.resolve(path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = file.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &body).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &file).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(path, bytes = body.len(), "Wrote object");
        Ok(())
    }

    /// Lists files in the directory containing `prefix` whose names start with
    /// the remainder of `prefix`. Not recursive.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError> {
        let (dir, name_prefix) = match prefix.rsplit_once('/') {
            Some((dir, rest)) => (dir, rest),
            None => ("", prefix),
        };
        let dir_path = if dir.is_empty() {
            self.root.clone()
        } else {
            self.resolve(dir)?
        };

        let mut entries = match tokio::fs::read_dir(&dir_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut objects = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(name_prefix) || name.contains(".tmp-") {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let uploaded_at: DateTime<Utc> = metadata.modified()?.into();
            let path = if dir.is_empty() {
                name
            } else {
                format!("{dir}/{name}")
            };
            objects.push(ObjectMeta {
                path,
                size: metadata.len(),
                uploaded_at,
            });
        }
        Ok(objects)
    }

    fn backend_name(&self) -> &'static str {
        "fs"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        assert!(store.get("vision/metadata/h/latest.json").await.unwrap().is_none());
        assert!(store.list("vision/metadata/h/").await.unwrap().is_empty());

        store
            .put("vision/metadata/h/latest.json", Bytes::from_static(b"{}"), "application/json")
            .await
            .unwrap();
        store
            .put("vision/metadata/h/20260101T000000.000Z.json", Bytes::from_static(b"[]"), "application/json")
            .await
            .unwrap();

        assert_eq!(
            store.get("vision/metadata/h/latest.json").await.unwrap(),
            Some(Bytes::from_static(b"{}"))
        );
        assert!(store.exists("vision/metadata/h/latest.json").await.unwrap());

        let mut listed: Vec<String> = store
            .list("vision/metadata/h/")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.path)
            .collect();
        listed.sort();
        assert_eq!(
            listed,
            vec![
                "vision/metadata/h/20260101T000000.000Z.json".to_string(),
                "vision/metadata/h/latest.json".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_overwrite_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.put("a/b.bin", Bytes::from_static(b"one"), "application/octet-stream").await.unwrap();
        store.put("a/b.bin", Bytes::from_static(b"two"), "application/octet-stream").await.unwrap();
        assert_eq!(store.get("a/b.bin").await.unwrap(), Some(Bytes::from_static(b"two")));
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(matches!(
            store.get("../outside").await,
            Err(StoreError::InvalidPath(_))
        ));
    }
}
