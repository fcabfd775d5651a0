//! Lumen Core - content-addressed vision analysis cache
//!
//! Sits in front of a slow, expensive vision model and makes sure the same
//! image bytes are analyzed once.
//!
//! # Features
//!
//! - Results keyed by the SHA-256 of the image content, never by URL
//! - In-process single-flight plus a distributed advisory lock, so concurrent
//!   requests for the same image share one inference call
//! - Fail-open cache and lock backends: an outage costs duplicate work, never
//!   a failed request
//! - Retrying HTTP transport with exponential backoff and cancellation
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lumen_core::{
//!     AnalysisRequest, Analyzer, AnalyzerConfig, CacheIndex, CacheIndexConfig, MemoryLock,
//!     MemoryObjectStore, MockVisionModel, ResilientTransport,
//! };
//!
//! # async fn example() -> lumen_core::Result<()> {
//! let cache = CacheIndex::new(Arc::new(MemoryObjectStore::new()), CacheIndexConfig::default());
//! let analyzer = Analyzer::new(
//!     ResilientTransport::new()?,
//!     cache,
//!     Arc::new(MemoryLock::new()),
//!     Arc::new(MockVisionModel::new("{}")),
//!     AnalyzerConfig::default(),
//! );
//!
//! let mut events = analyzer.subscribe();
//! let result = analyzer
//!     .analyze(AnalysisRequest::new("https://cdn.example.com/cat.png"))
//!     .await?;
//! println!("{}", result.global_context.scene_description);
//!
//! // The subscriber owns the scratch copy from here on.
//! if let Some(done) = events.recv().await {
//!     let _ = std::fs::remove_file(&done.scratch_path);
//! }
//! # Ok(())
//! # }
//! ```

pub mod analyzer;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod hash;
pub mod lock;
pub mod model;
pub mod paths;
pub mod prompt;
pub mod schema;
pub mod singleflight;
pub mod store;
pub mod transport;

// Re-export main types for convenience
pub use analyzer::{Analysis, AnalysisCompleted, AnalysisRequest, Analyzer, AnalyzerConfig, Origin};
pub use cache::{CacheIndex, CacheIndexConfig};
pub use cancel::CancelSignal;
pub use config::{LumenConfig, TimeoutOverrides, Timeouts};
pub use error::{LumenError, Result};
pub use hash::{hash_reader, persist_reader, persist_stream, ContentHash, FanOutWriter};
pub use lock::{AdvisoryLock, LockError, LockGuard, MemoryLock, NoopLock};
pub use model::{MockVisionModel, ModelError, VisionModel};
pub use prompt::AnalysisMode;
pub use schema::{AnalysisResult, SchemaError};
pub use store::{
    FsObjectStore, HttpObjectStore, HttpObjectStoreConfig, MemoryObjectStore, ObjectMeta, ObjectStore,
    StoreError,
};
pub use transport::{FetchOptions, ResilientTransport};

#[cfg(feature = "redis")]
pub use lock::RedisLock;

#[cfg(feature = "gemini")]
pub use model::{GeminiConfig, GeminiVisionModel};
