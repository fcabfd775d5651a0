//! In-process lock with real TTL semantics.
//!
//! Several analyzers sharing one `Arc<MemoryLock>` behave like separate
//! processes sharing a lock server, which is what the coalescing tests rely on.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{AdvisoryLock, LockError};

#[derive(Debug, Clone)]
struct Holder {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct MemoryLock {
    records: DashMap<String, Holder>,
    unavailable: AtomicBool,
    grants: AtomicUsize,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`LockError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful acquisitions so far.
    pub fn grant_count(&self) -> usize {
        self.grants.load(Ordering::SeqCst)
    }

    /// Token of the live holder of `key`, if any.
    pub fn holder(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.records
            .get(key)
            .filter(|h| h.expires_at > now)
            .map(|h| h.token.clone())
    }

    fn check_available(&self) -> Result<(), LockError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LockError::Unavailable("simulated outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AdvisoryLock for MemoryLock {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        self.check_available()?;
        let now = Instant::now();
        let holder = Holder {
            token: token.to_string(),
            expires_at: now + ttl,
        };

        let granted = match self.records.entry(key.to_string()) {
            Entry::Occupied(mut record) if record.get().expires_at <= now => {
                record.insert(holder);
                true
            }
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(holder);
                true
            }
        };

        if granted {
            self.grants.fetch_add(1, Ordering::SeqCst);
        }
        Ok(granted)
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), LockError> {
        self.check_available()?;
        self.records.remove_if(key, |_, h| h.token == token);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, LockError> {
        self.check_available()?;
        let now = Instant::now();
        let live = self.records.get(key).map(|h| h.expires_at > now);
        if live == Some(false) {
            self.records.remove_if(key, |_, h| h.expires_at <= now);
        }
        Ok(live.unwrap_or(false))
    }

    async fn force_release(&self, key: &str) -> Result<bool, LockError> {
        self.check_available()?;
        Ok(self.records.remove(key).is_some())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
