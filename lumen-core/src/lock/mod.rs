//! Advisory coordination lock.
//!
//! A lock record at `vision:lock:<hash>` means "someone is generating this
//! analysis right now". It is a TTL mutex, not a correctness primitive: a
//! holder that dies simply lets the record expire, and callers that cannot
//! reach the backend generate anyway.
//!
//! ## Backends
//!
//! - [`RedisLock`] - `SET NX PX` with a token-checked Lua release (feature `redis`)
//! - [`MemoryLock`] - in-process TTL map with outage injection
//! - [`NoopLock`] - always grants, never reports a holder
//!
//! Release is compare-and-delete on the holder token, so a request whose
//! record already expired cannot delete a lock another request now holds.

mod memory;
mod noop;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryLock;
pub use noop::NoopLock;
#[cfg(feature = "redis")]
pub use self::redis::{RedisLock, DEFAULT_OP_TIMEOUT as REDIS_OP_TIMEOUT};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default lock lifetime. Generation normally finishes well inside it.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(120);

/// Errors from a lock backend. Always treated as "coordination unavailable".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock backend unavailable: {0}")]
    Unavailable(String),

    #[error("Lock backend timed out during {op} after {}ms", after.as_millis())]
    Timeout { op: &'static str, after: Duration },

    #[error("Lock backend returned an unexpected reply: {0}")]
    Protocol(String),
}

/// Atomic set-if-absent mutex with expiry.
#[async_trait]
pub trait AdvisoryLock: Send + Sync {
    /// Create the record if absent. `Ok(false)` means someone else holds it.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Delete the record if it still carries `token`. Releasing a lock that
    /// expired or changed hands is a no-op.
    async fn release(&self, key: &str, token: &str) -> Result<(), LockError>;

    /// Whether any holder currently owns `key`.
    async fn exists(&self, key: &str) -> Result<bool, LockError>;

    /// Delete the record regardless of holder. Returns whether one existed.
    async fn force_release(&self, key: &str) -> Result<bool, LockError>;

    fn backend_name(&self) -> &'static str;
}

/// A held lock.
///
/// Call [`LockGuard::release`] on the normal path. A guard dropped without an
/// explicit release (task aborted, future cancelled) spawns the release on the
/// current tokio runtime.
pub struct LockGuard {
    lock: Arc<dyn AdvisoryLock>,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    /// Try to take `key` under a fresh holder token.
    ///
    /// `Ok(None)` means contention. The guard exists before the round trip,
    /// so a caller dropped mid-acquire still releases whatever the backend
    /// granted.
    pub async fn acquire(
        lock: Arc<dyn AdvisoryLock>,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<Self>, LockError> {
        let mut guard = Self {
            lock,
            key: key.to_string(),
            token: Uuid::new_v4().to_string(),
            released: false,
        };
        match guard.lock.try_acquire(&guard.key, &guard.token, ttl).await {
            Ok(true) => {
                debug!(key, backend = guard.lock.backend_name(), "Lock acquired");
                Ok(Some(guard))
            }
            Ok(false) => {
                guard.released = true;
                Ok(None)
            }
            Err(e) => {
                guard.released = true;
                Err(e)
            }
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release explicitly. If this future is dropped before the backend
    /// answers, the guard's drop still schedules the release.
    pub async fn release(mut self) -> Result<(), LockError> {
        let result = self.lock.release(&self.key, &self.token).await;
        self.released = true;
        debug!(key = %self.key, ok = result.is_ok(), "Lock released");
        result
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let lock = Arc::clone(&self.lock);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match lock.release(&key, &token).await {
                        Ok(()) => debug!(key, "Lock released after abandoned request"),
                        Err(e) => warn!(key, error = %e, "Lock release failed, record will expire"),
                    }
                });
            }
            Err(_) => warn!(key, "No runtime to release lock, record will expire"),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("backend", &self.lock.backend_name())
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_guard_excludes_second_holder() {
        let lock: Arc<dyn AdvisoryLock> = Arc::new(MemoryLock::new());
        let guard = LockGuard::acquire(lock.clone(), "vision:lock:a", DEFAULT_LOCK_TTL)
            .await
            .unwrap()
            .unwrap();

        assert!(LockGuard::acquire(lock.clone(), "vision:lock:a", DEFAULT_LOCK_TTL)
            .await
            .unwrap()
            .is_none());

        guard.release().await.unwrap();
        assert!(!lock.exists("vision:lock:a").await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let lock: Arc<dyn AdvisoryLock> = Arc::new(MemoryLock::new());
        let guard = LockGuard::acquire(lock.clone(), "vision:lock:b", DEFAULT_LOCK_TTL)
            .await
            .unwrap()
            .unwrap();
        drop(guard);

        for _ in 0..50 {
            if !lock.exists("vision:lock:b").await.unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("lock still held after guard was dropped");
    }

    #[tokio::test]
    async fn test_tokens_are_unique() {
        let lock: Arc<dyn AdvisoryLock> = Arc::new(NoopLock);
        let a = LockGuard::acquire(lock.clone(), "k", DEFAULT_LOCK_TTL).await.unwrap().unwrap();
        let b = LockGuard::acquire(lock.clone(), "k", DEFAULT_LOCK_TTL).await.unwrap().unwrap();
        assert_ne!(a.token, b.token);
        a.release().await.unwrap();
        b.release().await.unwrap();
    }

    /// Delegates to a [`MemoryLock`] but stalls after granting or before
    /// releasing, so callers can be dropped mid round trip.
    struct Stalling {
        inner: Arc<MemoryLock>,
        stall_acquire: bool,
        stall_release: AtomicBool,
    }

    #[async_trait]
    impl AdvisoryLock for Stalling {
        async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
            let granted = self.inner.try_acquire(key, token, ttl).await?;
            if self.stall_acquire {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(granted)
        }

        async fn release(&self, key: &str, token: &str) -> Result<(), LockError> {
            if self.stall_release.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            self.inner.release(key, token).await
        }

        async fn exists(&self, key: &str) -> Result<bool, LockError> {
            self.inner.exists(key).await
        }

        async fn force_release(&self, key: &str) -> Result<bool, LockError> {
            self.inner.force_release(key).await
        }

        fn backend_name(&self) -> &'static str {
            "stalling"
        }
    }

    async fn wait_until_free(lock: &MemoryLock, key: &str) {
        for _ in 0..50 {
            if !lock.exists(key).await.unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{key} still held");
    }

    #[tokio::test]
    async fn test_acquire_dropped_after_grant_releases() {
        let inner = Arc::new(MemoryLock::new());
        let lock: Arc<dyn AdvisoryLock> = Arc::new(Stalling {
            inner: inner.clone(),
            stall_acquire: true,
            stall_release: AtomicBool::new(false),
        });

        let attempt = tokio::time::timeout(
            Duration::from_millis(20),
            LockGuard::acquire(lock, "vision:lock:c", DEFAULT_LOCK_TTL),
        )
        .await;
        assert!(attempt.is_err());
        assert!(inner.holder("vision:lock:c").is_some());

        wait_until_free(&inner, "vision:lock:c").await;
    }

    #[tokio::test]
    async fn test_release_dropped_midway_still_releases() {
        let inner = Arc::new(MemoryLock::new());
        let lock: Arc<dyn AdvisoryLock> = Arc::new(Stalling {
            inner: inner.clone(),
            stall_acquire: false,
            stall_release: AtomicBool::new(true),
        });
        let guard = LockGuard::acquire(lock, "vision:lock:d", DEFAULT_LOCK_TTL)
            .await
            .unwrap()
            .unwrap();

        let released = tokio::time::timeout(Duration::from_millis(20), guard.release()).await;
        assert!(released.is_err());

        wait_until_free(&inner, "vision:lock:d").await;
    }

    #[tokio::test]
    async fn test_contention_does_not_release_the_holder() {
        let inner = Arc::new(MemoryLock::new());
        let lock: Arc<dyn AdvisoryLock> = inner.clone();
        let holder = LockGuard::acquire(lock.clone(), "vision:lock:e", DEFAULT_LOCK_TTL)
            .await
            .unwrap()
            .unwrap();

        assert!(LockGuard::acquire(lock, "vision:lock:e", DEFAULT_LOCK_TTL)
            .await
            .unwrap()
            .is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(inner.holder("vision:lock:e").as_deref(), Some(holder.token.as_str()));
        holder.release().await.unwrap();
    }
}
