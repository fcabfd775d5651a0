//! Analysis orchestrator.
//!
//! One request walks this state machine:
//!
//! ```text
//! Fetching -> Hashing (while persisting to scratch) -> CacheCheck
//!   CacheCheck: hit -> Done
//!   LockAcquire: won -> Generating | lost -> Coalescing | backend down -> Generating (fail open)
//!   Coalescing: result found -> Done | lock freed -> LockAcquire | ceiling hit -> CoalesceTimeout
//!   Generating -> Validating -> Persisting (background) -> Done
//! ```
//!
//! Everything from CacheCheck to Validating runs inside an in-process
//! single-flight keyed by the content hash, so concurrent requests in one
//! process share one flight and at most one of them talks to the lock.
//! Callers attach to the flight and detach on their own cancellation; the
//! flight is dropped, releasing any lock it holds, when the last caller leaves.
//!
//! Successful requests publish an [`AnalysisCompleted`] message. The scratch
//! file it names belongs to the subscriber from then on. Failed requests
//! delete their own scratch file since no message will ever reference it.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::cache::CacheIndex;
use crate::cancel::CancelSignal;
use crate::config::{TimeoutOverrides, Timeouts, DEFAULT_POLL_INTERVAL};
use crate::error::{LumenError, Result};
use crate::hash::{persist_stream, ContentHash};
use crate::lock::{AdvisoryLock, LockGuard, DEFAULT_LOCK_TTL};
use crate::model::VisionModel;
use crate::paths;
use crate::prompt::AnalysisMode;
use crate::schema::AnalysisResult;
use crate::singleflight::SingleFlight;
use crate::transport::{FetchOptions, ResilientTransport, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY};

const SOURCE_CONTENT_TYPE: &str = "application/octet-stream";

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Where source downloads are written
    pub scratch_dir: PathBuf,
    /// Default deadlines, overridable per request
    pub timeouts: Timeouts,
    /// Retries after the first source download attempt
    pub fetch_retries: u32,
    /// Base backoff delay for source downloads
    pub retry_delay: Duration,
    /// Lifetime of the coordination lock record
    pub lock_ttl: Duration,
    /// Interval between coalescing polls
    pub poll_interval: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join("lumen").join("scratch"),
            timeouts: Timeouts::default(),
            fetch_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            lock_ttl: DEFAULT_LOCK_TTL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// A request to analyze one image.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub image_url: String,
    pub mode: AnalysisMode,
    pub timeouts: TimeoutOverrides,
    pub cancel: Option<CancelSignal>,
}

impl AnalysisRequest {
    pub fn new(image_url: impl Into<String>) -> Self {
        Self {
            image_url: image_url.into(),
            mode: AnalysisMode::default(),
            timeouts: TimeoutOverrides::default(),
            cancel: None,
        }
    }

    pub fn with_mode(mut self, mode: AnalysisMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutOverrides) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// How a request obtained its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Read from the cache index
    CacheHit,
    /// This request ran inference
    Generated,
    /// Another request, in this process or elsewhere, ran inference
    Coalesced,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::CacheHit => "cache_hit",
            Self::Generated => "generated",
            Self::Coalesced => "coalesced",
        })
    }
}

/// Outbound message published once per successful request.
#[derive(Debug, Clone)]
pub struct AnalysisCompleted {
    pub hash: ContentHash,
    /// Local copy of the source bytes, now owned by the subscriber
    pub scratch_path: PathBuf,
    pub origin: Origin,
    pub result: Arc<AnalysisResult>,
}

/// A successful analysis with its provenance.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub hash: ContentHash,
    pub origin: Origin,
    pub scratch_path: PathBuf,
    pub bytes: u64,
    pub result: Arc<AnalysisResult>,
}

/// Output shared by every caller of one flight.
#[derive(Debug, Clone)]
struct Resolved {
    result: Arc<AnalysisResult>,
    origin: Origin,
}

enum CoalesceOutcome {
    Found(AnalysisResult),
    LockFreed,
}

struct Inner {
    transport: ResilientTransport,
    cache: CacheIndex,
    lock: Arc<dyn AdvisoryLock>,
    model: Arc<dyn VisionModel>,
    config: AnalyzerConfig,
    flights: SingleFlight<ContentHash, Resolved>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AnalysisCompleted>>>,
    background: TaskTracker,
}

/// Entry point of the pipeline. Cheap to clone; clones share flights,
/// subscribers and background tasks.
#[derive(Clone)]
pub struct Analyzer {
    inner: Arc<Inner>,
}

impl Analyzer {
    pub fn new(
        transport: ResilientTransport,
        cache: CacheIndex,
        lock: Arc<dyn AdvisoryLock>,
        model: Arc<dyn VisionModel>,
        config: AnalyzerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                cache,
                lock,
                model,
                config,
                flights: SingleFlight::new(),
                subscribers: Mutex::new(Vec::new()),
                background: TaskTracker::new(),
            }),
        }
    }

    /// Receive an [`AnalysisCompleted`] for every successful request from now on.
    ///
    /// Delivery is unbounded: a slow subscriber never loses a message, since
    /// each one carries a scratch file only the subscriber will delete.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AnalysisCompleted> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Analyze one image, returning only the result.
    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResult> {
        let analysis = self.analyze_detailed(request).await?;
        Ok(Arc::unwrap_or_clone(analysis.result))
    }

    /// Analyze one image, returning the result with its hash and provenance.
    #[instrument(skip(self, request), fields(url = %request.image_url, mode = %request.mode))]
    pub async fn analyze_detailed(&self, request: AnalysisRequest) -> Result<Analysis> {
        let start = Instant::now();
        let cancel = request.cancel.clone().unwrap_or_default();
        let timeouts = self.inner.config.timeouts.with_overrides(&request.timeouts);
        cancel.check()?;

        let (hash, scratch_path, bytes) = self.fetch_source(&request.image_url, timeouts.fetch, &cancel).await?;

        match self.resolve(hash, &scratch_path, request.mode, timeouts, &cancel).await {
            Ok(resolved) => {
                info!(
                    hash = %hash.short(),
                    origin = %resolved.origin,
                    latency_ms = start.elapsed().as_millis() as u64,
                    "Analysis complete"
                );
                self.inner.publish(AnalysisCompleted {
                    hash,
                    scratch_path: scratch_path.clone(),
                    origin: resolved.origin,
                    result: Arc::clone(&resolved.result),
                });
                Ok(Analysis {
                    hash,
                    origin: resolved.origin,
                    scratch_path,
                    bytes,
                    result: resolved.result,
                })
            }
            Err(e) => {
                warn!(hash = %hash.short(), error = %e, "Analysis failed");
                discard_scratch(&scratch_path).await;
                Err(e)
            }
        }
    }

    /// Cache lookup without fetching or generating.
    pub async fn lookup(&self, hash: &ContentHash) -> Option<AnalysisResult> {
        self.inner.cache.lookup(hash).await
    }

    /// Wait for background persistence started so far.
    pub async fn flush(&self) {
        let background = &self.inner.background;
        background.close();
        background.wait().await;
        background.reopen();
    }

    /// Fetching and Hashing: stream the body to scratch storage, hashing on the way.
    async fn fetch_source(
        &self,
        url: &str,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<(ContentHash, PathBuf, u64)> {
        let config = &self.inner.config;
        tokio::fs::create_dir_all(&config.scratch_dir).await?;

        let options = FetchOptions {
            max_retries: config.fetch_retries,
            retry_delay: config.retry_delay,
            timeout,
            cancel: Some(cancel.clone()),
        };
        let response = self.inner.transport.fetch(url, &options).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LumenError::FetchFailed {
                url: url.to_string(),
                status: Some(status.as_u16()),
                message: format!("server returned {status}"),
            });
        }

        let scratch_path = config.scratch_dir.join(format!("{}.bin", Uuid::new_v4()));
        let body = response.bytes_stream().map_err(io::Error::other);

        let persisted = tokio::select! {
            res = tokio::time::timeout(timeout, persist_stream(body, &scratch_path)) => match res {
                Ok(Ok(persisted)) => Ok(persisted),
                Ok(Err(e)) => Err(LumenError::FetchFailed {
                    url: url.to_string(),
                    status: Some(status.as_u16()),
                    message: format!("body read failed: {e}"),
                }),
                Err(_) => Err(LumenError::FetchFailed {
                    url: url.to_string(),
                    status: Some(status.as_u16()),
                    message: format!("body not received within {}ms", timeout.as_millis()),
                }),
            },
            _ = cancel.cancelled() => Err(cancel.to_error()),
        };

        match persisted {
            Ok((hash, bytes)) => {
                debug!(hash = %hash.short(), bytes, path = %scratch_path.display(), "Source persisted");
                Ok((hash, scratch_path, bytes))
            }
            Err(e) => {
                discard_scratch(&scratch_path).await;
                Err(e)
            }
        }
    }

    /// Attach to the flight for `hash`, starting it if needed.
    async fn resolve(
        &self,
        hash: ContentHash,
        scratch_path: &std::path::Path,
        mode: AnalysisMode,
        timeouts: Timeouts,
        cancel: &CancelSignal,
    ) -> Result<Resolved> {
        // Each caller brings its own copy so a flight never depends on
        // another caller's scratch file.
        let image = Bytes::from(tokio::fs::read(scratch_path).await?);

        let inner = Arc::clone(&self.inner);
        let (flight, leader) = self
            .inner
            .flights
            .join(hash, move || inner.run_flight(hash, image, mode, timeouts));

        if !leader {
            info!(hash = %hash.short(), "Joined in-process flight");
        }

        // The leader is bounded inside the flight; a follower also holds the
        // flight to its own generation ceiling.
        let started = Instant::now();
        let ceiling = if leader { None } else { Some(timeouts.generation) };
        let bounded = async {
            match ceiling {
                Some(ceiling) => match tokio::time::timeout(ceiling, flight).await {
                    Ok(res) => res,
                    Err(_) => Err(LumenError::CoalesceTimeout {
                        hash,
                        waited: started.elapsed(),
                    }),
                },
                None => flight.await,
            }
        };

        let resolved = tokio::select! {
            res = bounded => match res {
                Ok(resolved) => resolved,
                Err(e) => {
                    if matches!(e, LumenError::CoalesceTimeout { .. }) {
                        warn!(hash = %hash.short(), error = %e, "Gave up waiting on in-process flight");
                    }
                    return Err(e);
                }
            },
            _ = cancel.cancelled() => {
                info!(hash = %hash.short(), reason = %cancel.reason(), "Caller detached from flight");
                return Err(cancel.to_error());
            }
        };

        match resolved.origin {
            Origin::Generated if !leader => Ok(Resolved {
                origin: Origin::Coalesced,
                ..resolved
            }),
            _ => Ok(resolved),
        }
    }
}

impl Inner {
    /// Deliver `event` to every live subscriber, forgetting closed ones.
    fn publish(&self, event: AnalysisCompleted) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if subscribers.is_empty() {
            debug!(hash = %event.hash.short(), "No subscribers for completion message");
        }
    }

    /// CacheCheck through Validating. Runs at most once per hash at a time.
    async fn run_flight(
        self: Arc<Self>,
        hash: ContentHash,
        image: Bytes,
        mode: AnalysisMode,
        timeouts: Timeouts,
    ) -> Result<Resolved> {
        if let Some(result) = self.cache.lookup(&hash).await {
            return Ok(resolved(result, Origin::CacheHit));
        }

        let key = paths::lock_key(&hash);
        let started = Instant::now();
        let mut waited_on_holder = false;

        loop {
            match LockGuard::acquire(Arc::clone(&self.lock), &key, self.config.lock_ttl).await {
                Ok(Some(guard)) => {
                    info!(hash = %hash.short(), "Lock acquired, generating");
                    // A holder may have finished between the first check and now.
                    if let Some(result) = self.cache.lookup(&hash).await {
                        release(guard).await;
                        let origin = if waited_on_holder {
                            Origin::Coalesced
                        } else {
                            Origin::CacheHit
                        };
                        return Ok(resolved(result, origin));
                    }
                    return self.generate(hash, image, mode, timeouts.generation, Some(guard)).await;
                }
                Ok(None) => {
                    waited_on_holder = true;
                    info!(hash = %hash.short(), "Generation in progress elsewhere, coalescing");
                    match self.coalesce(&hash, &key, started, timeouts.generation).await? {
                        CoalesceOutcome::Found(result) => {
                            return Ok(resolved(result, Origin::Coalesced));
                        }
                        CoalesceOutcome::LockFreed => {
                            info!(hash = %hash.short(), "Lock freed without a result, retrying acquisition");
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        hash = %hash.short(),
                        backend = self.lock.backend_name(),
                        error = %e,
                        "Coordination backend unavailable, generating without lock"
                    );
                    return self.generate(hash, image, mode, timeouts.generation, None).await;
                }
            }
        }
    }

    /// Poll the cache and the lock until a result appears, the lock goes away
    /// or `ceiling` has passed since `started`.
    async fn coalesce(
        &self,
        hash: &ContentHash,
        key: &str,
        started: Instant,
        ceiling: Duration,
    ) -> Result<CoalesceOutcome> {
        let mut polls = 0u32;
        loop {
            let waited = started.elapsed();
            if waited >= ceiling {
                warn!(hash = %hash.short(), polls, waited_ms = waited.as_millis() as u64, "Coalescing timed out");
                return Err(LumenError::CoalesceTimeout { hash: *hash, waited });
            }
            tokio::time::sleep(self.config.poll_interval.min(ceiling - waited)).await;
            polls += 1;

            if let Some(result) = self.cache.lookup(hash).await {
                debug!(hash = %hash.short(), polls, "Result appeared while coalescing");
                return Ok(CoalesceOutcome::Found(result));
            }

            match self.lock.exists(key).await {
                Ok(true) => continue,
                Ok(false) => return Ok(CoalesceOutcome::LockFreed),
                Err(e) => {
                    warn!(hash = %hash.short(), error = %e, "Lock check failed while coalescing");
                    return Ok(CoalesceOutcome::LockFreed);
                }
            }
        }
    }

    /// Generating and Validating. Hands a valid result to the persist task,
    /// releases the lock itself on every failure.
    async fn generate(
        &self,
        hash: ContentHash,
        image: Bytes,
        mode: AnalysisMode,
        ceiling: Duration,
        guard: Option<LockGuard>,
    ) -> Result<Resolved> {
        let start = Instant::now();
        let prompt = mode.prompt();

        let raw = match tokio::time::timeout(ceiling, self.model.analyze(&image, &prompt, mode)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                release_opt(guard).await;
                return Err(LumenError::Generation(e.to_string()));
            }
            Err(_) => {
                release_opt(guard).await;
                return Err(LumenError::GenerationTimeout { after: ceiling });
            }
        };

        let result = match AnalysisResult::from_json(&raw) {
            Ok(result) => Arc::new(result),
            Err(e) => {
                release_opt(guard).await;
                warn!(hash = %hash.short(), error = %e, "Model output rejected");
                return Err(LumenError::Validation(e.to_string()));
            }
        };

        info!(
            hash = %hash.short(),
            model = self.model.model_name(),
            latency_ms = start.elapsed().as_millis() as u64,
            "Generation succeeded"
        );

        self.spawn_persist(hash, Arc::clone(&result), image, guard);
        Ok(Resolved {
            result,
            origin: Origin::Generated,
        })
    }

    /// Persisting: cache entry, then lock release, then source snapshot.
    fn spawn_persist(&self, hash: ContentHash, result: Arc<AnalysisResult>, image: Bytes, guard: Option<LockGuard>) {
        let cache = self.cache.clone();
        let span = info_span!("persist", hash = %hash.short());

        self.background.spawn(
            async move {
                if let Err(e) = cache.store(&hash, &result).await {
                    warn!(error = %e, "Cache write failed, result not persisted");
                }
                release_opt(guard).await;

                let store = cache.backend();
                let path = paths::source_snapshot_path(&hash);
                match store.exists(&path).await {
                    Ok(true) => debug!("Source snapshot already archived"),
                    Ok(false) => match store.put(&path, image, SOURCE_CONTENT_TYPE).await {
                        Ok(()) => debug!("Source snapshot archived"),
                        Err(e) => warn!(error = %e, "Source snapshot write failed"),
                    },
                    Err(e) => warn!(error = %e, "Source snapshot check failed"),
                }
            }
            .instrument(span),
        );
    }
}

fn resolved(result: AnalysisResult, origin: Origin) -> Resolved {
    Resolved {
        result: Arc::new(result),
        origin,
    }
}

async fn release(guard: LockGuard) {
    let key = guard.key().to_string();
    if let Err(e) = guard.release().await {
        warn!(key, error = %e, "Lock release failed, record will expire");
    }
}

async fn release_opt(guard: Option<LockGuard>) {
    if let Some(guard) = guard {
        release(guard).await;
    }
}

async fn discard_scratch(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove scratch file");
        }
    }
}
