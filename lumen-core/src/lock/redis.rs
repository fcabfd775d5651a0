//! Redis-backed advisory lock.
//!
//! Acquire is `SET key token NX PX ttl`. Release runs a Lua script that
//! deletes the key only while it still holds our token, so the check and the
//! delete are one atomic step on the server.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Script};
use tokio::sync::Mutex;
use tracing::debug;

use super::{AdvisoryLock, LockError};

/// Default bound on a single backend round trip, connection setup included.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(2);

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub struct RedisLock {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    release_script: Script,
    op_timeout: Duration,
}

impl RedisLock {
    /// Parse `url` and prepare a lazily connected client.
    ///
    /// No network traffic happens until the first operation.
    pub fn new(url: &str, op_timeout: Duration) -> Result<Self, LockError> {
        let client = Client::open(url).map_err(|e| LockError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            release_script: Script::new(RELEASE_SCRIPT),
            op_timeout,
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, LockError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = tokio::time::timeout(self.op_timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| LockError::Timeout {
                op: "connect",
                after: self.op_timeout,
            })?
            .map_err(|e| LockError::Unavailable(e.to_string()))?;

        debug!("Connected to lock backend");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Run one round trip under the op timeout, dropping the cached
    /// connection when it turns out to be dead.
    async fn run<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T, LockError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        let conn = self.connection().await?;
        match tokio::time::timeout(self.op_timeout, call(conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    self.connection.lock().await.take();
                }
                Err(LockError::Unavailable(e.to_string()))
            }
            Err(_) => {
                self.connection.lock().await.take();
                Err(LockError::Timeout {
                    op,
                    after: self.op_timeout,
                })
            }
        }
    }
}

#[async_trait]
impl AdvisoryLock for RedisLock {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let reply: Option<String> = self
            .run("acquire", |mut conn| async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(token)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        match reply.as_deref() {
            Some("OK") => Ok(true),
            None => Ok(false),
            Some(other) => Err(LockError::Protocol(format!("SET NX replied {other:?}"))),
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), LockError> {
        let script = &self.release_script;
        let deleted: i64 = self
            .run("release", |mut conn| async move {
                script.key(key).arg(token).invoke_async(&mut conn).await
            })
            .await?;
        if deleted == 0 {
            debug!(key, "Lock already expired or changed hands");
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, LockError> {
        let count: i64 = self
            .run("exists", |mut conn| async move {
                redis::cmd("EXISTS").arg(key).query_async(&mut conn).await
            })
            .await?;
        Ok(count > 0)
    }

    async fn force_release(&self, key: &str) -> Result<bool, LockError> {
        let deleted: i64 = self
            .run("force_release", |mut conn| async move {
                redis::cmd("DEL").arg(key).query_async(&mut conn).await
            })
            .await?;
        Ok(deleted > 0)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

impl std::fmt::Debug for RedisLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLock")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}
