//! Cache index: "do we already have an analysis for this hash?"
//!
//! Two tiers keep the common case cheap:
//!
//! 1. probe the well-known `vision/metadata/<hash>/latest.json` with a short
//!    timeout;
//! 2. on miss or error, list `vision/metadata/<hash>/` under a longer timeout
//!    and take the most recently written entry.
//!
//! Lookups fail open. Backend errors, timeouts and entries that no longer
//! match the schema all read as a miss.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::hash::ContentHash;
use crate::paths;
use crate::schema::AnalysisResult;
use crate::store::{ObjectStore, StoreError};

/// Default bound on the fast-path probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default bound on the listing fallback.
pub const DEFAULT_LIST_TIMEOUT: Duration = Duration::from_secs(10);

const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone)]
pub struct CacheIndexConfig {
    pub probe_timeout: Duration,
    pub list_timeout: Duration,
    /// Also write a timestamped entry next to `latest.json`.
    pub keep_history: bool,
}

impl Default for CacheIndexConfig {
    fn default() -> Self {
        Self {
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            list_timeout: DEFAULT_LIST_TIMEOUT,
            keep_history: false,
        }
    }
}

#[derive(Clone)]
pub struct CacheIndex {
    store: Arc<dyn ObjectStore>,
    config: CacheIndexConfig,
}

impl CacheIndex {
    pub fn new(store: Arc<dyn ObjectStore>, config: CacheIndexConfig) -> Self {
        Self { store, config }
    }

    pub fn backend(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Cached analysis for `hash`, or `None` on miss or any backend trouble.
    #[instrument(level = "debug", skip(self), fields(hash = %hash.short(), backend = self.store.backend_name()))]
    pub async fn lookup(&self, hash: &ContentHash) -> Option<AnalysisResult> {
        let start = Instant::now();

        if let Some(result) = self.probe_latest(hash).await {
            info!(
                latency_ms = start.elapsed().as_millis() as u64,
                tier = "probe",
                "Cache HIT"
            );
            return Some(result);
        }

        match self.scan_prefix(hash).await {
            Some(result) => {
                info!(
                    latency_ms = start.elapsed().as_millis() as u64,
                    tier = "listing",
                    "Cache HIT"
                );
                Some(result)
            }
            None => {
                debug!(latency_ms = start.elapsed().as_millis() as u64, "Cache MISS");
                None
            }
        }
    }

    async fn probe_latest(&self, hash: &ContentHash) -> Option<AnalysisResult> {
        let path = paths::latest_metadata_path(hash);
        let body = match tokio::time::timeout(self.config.probe_timeout, self.store.get(&path)).await
        {
            Ok(Ok(Some(body))) => body,
            Ok(Ok(None)) => return None,
            Ok(Err(e)) => {
                warn!(error = %e, path, "Cache probe failed, falling back to listing");
                return None;
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.probe_timeout.as_millis() as u64,
                    path, "Cache probe timed out, falling back to listing"
                );
                return None;
            }
        };
        decode_entry(&path, &body)
    }

    async fn scan_prefix(&self, hash: &ContentHash) -> Option<AnalysisResult> {
        let prefix = paths::metadata_prefix(hash);
        let scan = async {
            let mut entries = self.store.list(&prefix).await?;
            entries.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at).then(b.path.cmp(&a.path)));
            for entry in entries {
                if let Some(body) = self.store.get(&entry.path).await? {
                    if let Some(result) = decode_entry(&entry.path, &body) {
                        return Ok::<_, StoreError>(Some(result));
                    }
                }
            }
            Ok(None)
        };

        match tokio::time::timeout(self.config.list_timeout, scan).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(error = %e, prefix, "Cache listing failed, treating as miss");
                None
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.list_timeout.as_millis() as u64,
                    prefix, "Cache listing timed out, treating as miss"
                );
                None
            }
        }
    }

    /// Write `result` under the deterministic path for `hash`.
    ///
    /// Overwrites are idempotent: the same hash always maps to an equivalent
    /// analysis.
    #[instrument(level = "debug", skip(self, result), fields(hash = %hash.short()))]
    pub async fn store(&self, hash: &ContentHash, result: &AnalysisResult) -> Result<(), StoreError> {
        let body = Bytes::from(
            result
                .to_json_vec()
                .map_err(|e| StoreError::Malformed(e.to_string()))?,
        );

        self.store
            .put(&paths::latest_metadata_path(hash), body.clone(), JSON_CONTENT_TYPE)
            .await?;

        if self.config.keep_history {
            let path = paths::history_metadata_path(hash, Utc::now());
            self.store.put(&path, body, JSON_CONTENT_TYPE).await?;
        }

        debug!("Cache entry written");
        Ok(())
    }
}

/// Corrupt or stale-format entries are misses, never errors.
fn decode_entry(path: &str, body: &[u8]) -> Option<AnalysisResult> {
    match AnalysisResult::from_slice(body) {
        Ok(result) => Some(result),
        Err(e) => {
            warn!(error = %e, path, "Ignoring cache entry that fails validation");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fixtures::VALID;
    use crate::store::MemoryObjectStore;
    use chrono::Duration as ChronoDuration;

    fn index(store: Arc<MemoryObjectStore>) -> CacheIndex {
        CacheIndex::new(store, CacheIndexConfig::default())
    }

    fn valid_with_scene(scene: &str) -> String {
        let mut doc: serde_json::Value = serde_json::from_str(VALID).unwrap();
        doc["global_context"]["scene_description"] = scene.into();
        doc.to_string()
    }

    #[tokio::test]
    async fn test_miss_on_empty_store() {
        let store = Arc::new(MemoryObjectStore::new());
        let hash = ContentHash::from_bytes(b"img");
        assert!(index(store).lookup(&hash).await.is_none());
    }

    #[tokio::test]
    async fn test_put_then_probe_hit() {
        let store = Arc::new(MemoryObjectStore::new());
        let cache = index(store.clone());
        let hash = ContentHash::from_bytes(b"img");
        let result = AnalysisResult::from_json(VALID).unwrap();

        cache.store(&hash, &result).await.unwrap();

        assert_eq!(cache.lookup(&hash).await, Some(result));
        assert_eq!(store.paths(), vec![paths::latest_metadata_path(&hash)]);
    }

    #[tokio::test]
    async fn test_listing_fallback_picks_newest() {
        let store = Arc::new(MemoryObjectStore::new());
        let hash = ContentHash::from_bytes(b"img");
        let now = Utc::now();
        let prefix = paths::metadata_prefix(&hash);

        store.insert_at(&format!("{prefix}old.json"), valid_with_scene("old"), now - ChronoDuration::hours(2));
        store.insert_at(&format!("{prefix}new.json"), valid_with_scene("new"), now - ChronoDuration::minutes(5));

        let found = index(store).lookup(&hash).await.unwrap();
        assert_eq!(found.global_context.scene_description, "new");
    }

    #[tokio::test]
    async fn test_corrupt_latest_falls_back_to_history() {
        let store = Arc::new(MemoryObjectStore::new());
        let hash = ContentHash::from_bytes(b"img");
        let now = Utc::now();
        let prefix = paths::metadata_prefix(&hash);

        store.insert_at(&paths::latest_metadata_path(&hash), "{not json", now);
        store.insert_at(&format!("{prefix}older.json"), valid_with_scene("history"), now - ChronoDuration::hours(1));

        let found = index(store).lookup(&hash).await.unwrap();
        assert_eq!(found.global_context.scene_description, "history");
    }

    #[tokio::test]
    async fn test_invalid_entry_is_miss() {
        let store = Arc::new(MemoryObjectStore::new());
        let hash = ContentHash::from_bytes(b"img");
        store.insert_at(&paths::latest_metadata_path(&hash), r#"{"meta":{}}"#, Utc::now());
        assert!(index(store).lookup(&hash).await.is_none());
    }

    #[tokio::test]
    async fn test_outage_reads_as_miss() {
        let store = Arc::new(MemoryObjectStore::new());
        let cache = index(store.clone());
        let hash = ContentHash::from_bytes(b"img");
        cache.store(&hash, &AnalysisResult::from_json(VALID).unwrap()).await.unwrap();

        store.set_unavailable(true);
        assert!(cache.lookup(&hash).await.is_none());
        assert!(cache
            .store(&hash, &AnalysisResult::from_json(VALID).unwrap())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_history_written_when_enabled() {
        let store = Arc::new(MemoryObjectStore::new());
        let cache = CacheIndex::new(
            store.clone(),
            CacheIndexConfig {
                keep_history: true,
                ..Default::default()
            },
        );
        let hash = ContentHash::from_bytes(b"img");
        cache.store(&hash, &AnalysisResult::from_json(VALID).unwrap()).await.unwrap();
        assert_eq!(store.len(), 2);
    }
}
