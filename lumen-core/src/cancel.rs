//! Cancellation signal threaded through fetch, coalescing and inference.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::error::LumenError;

/// Cloneable abort handle that remembers why it fired.
///
/// Wraps a [`CancellationToken`] so suspended operations can `select!` on
/// [`CancelSignal::cancelled`] and report the caller's reason instead of a
/// generic error.
#[derive(Clone, Default, Debug)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Only the first reason is kept.
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.reason.set(reason.into());
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> String {
        self.reason
            .get()
            .cloned()
            .unwrap_or_else(|| "cancelled".to_string())
    }

    /// Resolves once the signal fires.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// The error every cancelled operation unwinds with.
    pub fn to_error(&self) -> LumenError {
        LumenError::cancelled(self.reason())
    }

    /// Fail fast if the signal already fired.
    pub fn check(&self) -> Result<(), LumenError> {
        if self.is_cancelled() {
            Err(self.to_error())
        } else {
            Ok(())
        }
    }
}
