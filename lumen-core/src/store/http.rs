//! REST blob service client.
//!
//! Objects are addressed at predictable URLs, `{base_url}/{path}`, so the
//! cache fast path is a single GET. Listings use `GET {base_url}?prefix=..`
//! and return pages of `{ objects: [{ path, size, uploaded_at }], cursor }`.
//!
//! All requests go through [`ResilientTransport`], so 5xx and network errors
//! are retried under the configured budget.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{header, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{validate_path, ObjectMeta, ObjectStore, StoreError};
use crate::error::LumenError;
use crate::transport::{FetchOptions, ResilientTransport};

/// Upper bound on listing pages followed for one prefix.
const MAX_LIST_PAGES: usize = 50;

/// Configuration for [`HttpObjectStore`].
#[derive(Clone)]
pub struct HttpObjectStoreConfig {
    /// Base URL, without trailing slash
    pub base_url: String,
    /// Bearer token for writes and listings
    pub token: Option<String>,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base backoff delay
    pub retry_delay: Duration,
    /// Per-attempt timeout
    pub timeout: Duration,
}

impl std::fmt::Debug for HttpObjectStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpObjectStoreConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpObjectStoreConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            max_retries: 2,
            retry_delay: Duration::from_millis(200),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[derive(Debug, Deserialize)]
struct ListPage {
    objects: Vec<ListedObject>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    path: String,
    #[serde(default)]
    size: u64,
    uploaded_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct HttpObjectStore {
    transport: ResilientTransport,
    config: HttpObjectStoreConfig,
}

impl HttpObjectStore {
    pub fn new(transport: ResilientTransport, config: HttpObjectStoreConfig) -> Self {
        Self { transport, config }
    }

    fn object_url(&self, path: &str) -> Result<String, StoreError> {
        validate_path(path)?;
        Ok(format!("{}/{}", self.config.base_url, path))
    }

    fn options(&self) -> FetchOptions {
        FetchOptions {
            max_retries: self.config.max_retries,
            retry_delay: self.config.retry_delay,
            timeout: self.config.timeout,
            cancel: None,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Transport failures mean the backend is unreachable.
fn unavailable(err: LumenError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

async fn status_error(response: Response) -> StoreError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    StoreError::Status {
        status,
        message: message.chars().take(200).collect(),
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    #[instrument(level = "debug", skip(self))]
    async fn get(&self, path: &str) -> Result<Option<Bytes>, StoreError> {
        let url = self.object_url(path)?;
        let response = self
            .transport
            .execute(&url, &self.options(), |client| self.authorize(client.get(&url)))
            .await
            .map_err(unavailable)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                debug!(bytes = body.len(), "Fetched object");
                Ok(Some(body))
            }
            _ => Err(status_error(response).await),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let url = self.object_url(path)?;
        let response = self
            .transport
            .execute(&url, &self.options(), |client| self.authorize(client.head(&url)))
            .await
            .map_err(unavailable)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(status_error(response).await),
        }
    }

    #[instrument(level = "debug", skip(self, body), fields(bytes = body.len()))]
    async fn put(&self, path: &str, body: Bytes, content_type: &str) -> Result<(), StoreError> {
        let url = self.object_url(path)?;
        let response = self
            .transport
            .execute(&url, &self.options(), |client| {
                self.authorize(client.put(&url))
                    .header(header::CONTENT_TYPE, content_type)
                    .body(body.clone())
            })
            .await
            .map_err(unavailable)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response).await)
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError> {
        let url = self.config.base_url.clone();
        let mut objects = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let response = self
                .transport
                .execute(&url, &self.options(), |client| {
                    let mut request = client.get(&url).query(&[("prefix", prefix)]);
                    if let Some(cursor) = &cursor {
                        request = request.query(&[("cursor", cursor.as_str())]);
                    }
                    self.authorize(request)
                })
                .await
                .map_err(unavailable)?;

            if !response.status().is_success() {
                return Err(status_error(response).await);
            }

            let page: ListPage = response
                .json()
                .await
                .map_err(|e| StoreError::Malformed(e.to_string()))?;

            objects.extend(page.objects.into_iter().map(|o| ObjectMeta {
                path: o.path,
                size: o.size,
                uploaded_at: o.uploaded_at,
            }));

            match page.cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(objects),
            }
        }

        debug!(pages = MAX_LIST_PAGES, "Listing truncated");
        Ok(objects)
    }

    fn backend_name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_redacts_token() {
        let config = HttpObjectStoreConfig::new("https://blob.example.com/").with_token("secret");
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
        assert_eq!(config.base_url, "https://blob.example.com");
    }

    #[test]
    fn test_object_url_joins_path() {
        let store = HttpObjectStore::new(
            ResilientTransport::new().unwrap(),
            HttpObjectStoreConfig::new("https://blob.example.com"),
        );
        assert_eq!(
            store.object_url("vision/source/h/source.bin").unwrap(),
            "https://blob.example.com/vision/source/h/source.bin"
        );
        assert!(store.object_url("../x").is_err());
    }

    #[test]
    fn test_list_page_decodes() {
        let page: ListPage = serde_json::from_str(
            r#"{"objects":[{"path":"vision/metadata/h/latest.json","size":10,"uploaded_at":"2026-01-02T03:04:05Z"}]}"#,
        )
        .unwrap();
        assert_eq!(page.objects.len(), 1);
        assert!(page.cursor.is_none());
    }
}
