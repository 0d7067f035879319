use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{BackendConnector, BackendKind, CacheBackend};
use crate::error::{BorgUiError, Result};

/// Longest expiry sent as `PX`. Redis rejects expiries that overflow its
/// clock, so anything longer is stored without one.
const MAX_EXPIRY_MILLIS: u64 = i64::MAX as u64 / 2;

/// Networked cache on a Redis server. Keys are namespaced with a prefix so
/// the server can be shared. Every command is bounded by the connect
/// timeout so a stalled server surfaces as an error, never a hang.
pub struct RedisBackend {
    conn: MultiplexedConnection,
    key_prefix: String,
    info: String,
    timeout: Duration,
}

impl RedisBackend {
    /// Connect, verify with `PING`, and ask the server to bound itself to
    /// `max_bytes` with LRU eviction.
    pub async fn connect(
        url: &str,
        key_prefix: &str,
        max_bytes: u64,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::open(url)?;
        let mut conn = tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| BorgUiError::Cache(format!("connect to {} timed out", redact_url(url))))??;

        let pong: String = tokio::time::timeout(timeout, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| BorgUiError::Cache("PING timed out".into()))??;
        if pong != "PONG" {
            return Err(BorgUiError::Cache(format!("unexpected PING reply: {pong}")));
        }

        let backend = Self {
            conn,
            key_prefix: key_prefix.to_string(),
            info: redact_url(url),
            timeout,
        };
        backend.apply_memory_bound(max_bytes).await;
        Ok(backend)
    }

    /// Best effort: managed servers commonly refuse `CONFIG SET`.
    async fn apply_memory_bound(&self, max_bytes: u64) {
        let mut conn = self.conn.clone();
        let maxmemory: Result<()> = self
            .bounded(
                "CONFIG SET maxmemory",
                redis::cmd("CONFIG")
                    .arg("SET")
                    .arg("maxmemory")
                    .arg(max_bytes)
                    .query_async(&mut conn),
            )
            .await;
        let policy: Result<()> = self
            .bounded(
                "CONFIG SET maxmemory-policy",
                redis::cmd("CONFIG")
                    .arg("SET")
                    .arg("maxmemory-policy")
                    .arg("allkeys-lru")
                    .query_async(&mut conn),
            )
            .await;
        if let Err(e) = maxmemory.and(policy) {
            tracing::warn!(backend = %self.info, error = %e, "could not apply cache size bound on server");
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn bounded<T>(
        &self,
        op: &str,
        fut: impl Future<Output = redis::RedisResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(BorgUiError::Cache(format!(
                "{op} on {} timed out after {:?}",
                self.info, self.timeout
            ))),
        }
    }
}

/// `PX` argument for `ttl`, or `None` when the expiry cannot be represented.
fn expiry_millis(ttl: Duration) -> Option<u64> {
    u64::try_from(ttl.as_millis())
        .ok()
        .filter(|ms| *ms <= MAX_EXPIRY_MILLIS)
        .map(|ms| ms.max(1))
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let key = self.key(key);
        self.bounded("GET", conn.get(&key)).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value);
        if let Some(ms) = ttl.and_then(expiry_millis) {
            cmd.arg("PX").arg(ms);
        }
        self.bounded("SET", cmd.query_async(&mut conn)).await
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = self.key(key);
        self.bounded("DEL", conn.del(&key)).await
    }

    fn connection_info(&self) -> String {
        self.info.clone()
    }
}

/// Connects [`RedisBackend`]s for [`CacheService::reconfigure`](super::CacheService::reconfigure).
pub struct RedisConnector {
    key_prefix: String,
    timeout: Duration,
}

impl RedisConnector {
    pub fn new(key_prefix: impl Into<String>, timeout: Duration) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            timeout,
        }
    }
}

impl Default for RedisConnector {
    fn default() -> Self {
        Self::new("borg-ui:", Duration::from_secs(2))
    }
}

#[async_trait]
impl BackendConnector for RedisConnector {
    async fn connect(&self, target: &str, max_bytes: u64) -> Result<Arc<dyn CacheBackend>> {
        let backend = RedisBackend::connect(target, &self.key_prefix, max_bytes, self.timeout).await?;
        Ok(Arc::new(backend))
    }
}

/// `target` with any password replaced, safe for logs and API responses.
pub fn redact_url(target: &str) -> String {
    let Some((scheme, rest)) = target.split_once("://") else {
        return target.to_string();
    };
    let (authority, path) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };
    match authority.rsplit_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split_once(':').map_or(userinfo, |(u, _)| u);
            format!("{scheme}://{user}:***@{host}{path}")
        }
        None => target.to_string(),
    }
}
