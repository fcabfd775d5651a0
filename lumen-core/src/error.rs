use std::time::Duration;

use thiserror::Error;

use crate::hash::ContentHash;

/// Fatal errors surfaced to callers of the analysis pipeline.
///
/// Backend problems on the cache and coordination side never show up here:
/// they are swallowed by the fail-open policy and only logged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LumenError {
    #[error("Fetch failed for {url}: {message}")]
    FetchFailed {
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Gave up waiting for analysis of {hash} after {}ms", waited.as_millis())]
    CoalesceTimeout { hash: ContentHash, waited: Duration },

    #[error("Generation timed out after {}ms", after.as_millis())]
    GenerationTimeout { after: Duration },

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Model output failed validation: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LumenError {
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Whether the error was caused by the caller rather than the pipeline.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl From<std::io::Error> for LumenError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LumenError>;
