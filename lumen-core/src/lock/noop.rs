use std::time::Duration;

use async_trait::async_trait;

use super::{AdvisoryLock, LockError};

/// Lock that grants every request.
///
/// Disables cross-process coordination. In-process single-flight still
/// collapses concurrent requests within one analyzer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLock;

#[async_trait]
impl AdvisoryLock for NoopLock {
    async fn try_acquire(&self, _key: &str, _token: &str, _ttl: Duration) -> Result<bool, LockError> {
        Ok(true)
    }

    async fn release(&self, _key: &str, _token: &str) -> Result<(), LockError> {
        Ok(())
    }

    async fn exists(&self, _key: &str) -> Result<bool, LockError> {
        Ok(false)
    }

    async fn force_release(&self, _key: &str) -> Result<bool, LockError> {
        Ok(false)
    }

    fn backend_name(&self) -> &'static str {
        "noop"
    }
}
