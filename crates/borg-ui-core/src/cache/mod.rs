//! Cache service with a swappable backend.
//!
//! The in-process [`MemoryBackend`] is always available and is active until
//! [`CacheService::reconfigure`] manages to reach a networked backend. The
//! active backend is an `Arc<dyn CacheBackend>` replaced in one assignment
//! under a write lock; readers clone the `Arc` and drop the lock before
//! awaiting, so a swap never stalls or splits an operation.
//!
//! Operations through the service never fail the caller: backend errors are
//! logged and read as a miss.

mod memory;
mod redis_backend;

pub use memory::MemoryBackend;
pub use redis_backend::{redact_url, RedisBackend, RedisConnector};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::Result;
use crate::settings::CacheConfig;

// ---------------------------------------------------------------------------
// Backend capability set
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Redis,
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Redis => "redis",
            BackendKind::Memory => "memory",
        })
    }
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    async fn invalidate(&self, key: &str) -> Result<()>;

    /// Human-readable target, without credentials.
    fn connection_info(&self) -> String;
}

/// Establishes networked backends. Swappable so tests can stand in for Redis.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, target: &str, max_bytes: u64) -> Result<Arc<dyn CacheBackend>>;
}

// ---------------------------------------------------------------------------
// ReconfigureOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconfigureOutcome {
    /// The requested backend is now active.
    pub success: bool,
    pub backend: BackendKind,
    pub connection_info: String,
    /// Why the in-process backend is active instead of the requested one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

impl ReconfigureOutcome {
    pub fn is_fallback(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
    pub backend: BackendKind,
    pub connection_info: String,
    pub default_ttl_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// CacheService
// ---------------------------------------------------------------------------

pub struct CacheService {
    active: RwLock<Arc<dyn CacheBackend>>,
    fallback: Arc<MemoryBackend>,
    connector: Arc<dyn BackendConnector>,
    /// Seconds; 0 means entries do not expire.
    default_ttl_secs: AtomicU64,
}

impl CacheService {
    /// A service on the in-process backend, reconfigurable to Redis.
    pub fn new(max_bytes: u64) -> Self {
        Self::with_connector(max_bytes, Arc::new(RedisConnector::default()))
    }

    pub fn with_connector(max_bytes: u64, connector: Arc<dyn BackendConnector>) -> Self {
        let fallback = Arc::new(MemoryBackend::new(max_bytes));
        let active: Arc<dyn CacheBackend> = fallback.clone();
        Self {
            active: RwLock::new(active),
            fallback,
            connector,
            default_ttl_secs: AtomicU64::new(0),
        }
    }

    fn current(&self) -> Arc<dyn CacheBackend> {
        self.active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn swap(&self, backend: Arc<dyn CacheBackend>) {
        *self
            .active
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = backend;
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.current().kind()
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        match self.default_ttl_secs.load(Ordering::Relaxed) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn set_default_ttl(&self, ttl: Option<Duration>) {
        let secs = ttl.map_or(0, |t| t.as_secs());
        self.default_ttl_secs.store(secs, Ordering::Relaxed);
    }

    pub fn status(&self) -> CacheStatus {
        let backend = self.current();
        CacheStatus {
            backend: backend.kind(),
            connection_info: backend.connection_info(),
            default_ttl_secs: self.default_ttl().map(|t| t.as_secs()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let backend = self.current();
        match backend.get(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(backend = %backend.kind(), key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    pub async fn put(&self, key: &str, value: Vec<u8>) {
        self.put_with_ttl(key, value, self.default_ttl()).await
    }

    pub async fn put_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        let backend = self.current();
        if let Err(e) = backend.put(key, value, ttl).await {
            tracing::warn!(backend = %backend.kind(), key, error = %e, "cache write failed");
        }
    }

    pub async fn invalidate(&self, key: &str) {
        let backend = self.current();
        if let Err(e) = backend.invalidate(key).await {
            tracing::warn!(backend = %backend.kind(), key, error = %e, "cache invalidate failed");
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(key, error = %e, "cached value does not decode, treating as miss");
                None
            }
        }
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_vec(value) {
            Ok(raw) => self.put(key, raw).await,
            Err(e) => tracing::warn!(key, error = %e, "value not cacheable"),
        }
    }

    /// Point the service at `target`, or at the in-process backend when
    /// `target` is `None`. A target that cannot be reached leaves the
    /// in-process backend active and is reported as a fallback.
    pub async fn reconfigure(&self, target: Option<&str>, max_size_mb: u64) -> ReconfigureOutcome {
        let max_bytes = max_size_mb.saturating_mul(1024 * 1024);
        self.fallback.resize(max_bytes);

        let Some(target) = target.map(str::trim).filter(|t| !t.is_empty()) else {
            self.swap(self.fallback.clone());
            tracing::info!(backend = %BackendKind::Memory, max_size_mb, "cache using in-process backend");
            return ReconfigureOutcome {
                success: true,
                backend: BackendKind::Memory,
                connection_info: self.fallback.connection_info(),
                fallback_reason: None,
            };
        };

        match self.connector.connect(target, max_bytes).await {
            Ok(backend) => {
                let outcome = ReconfigureOutcome {
                    success: true,
                    backend: backend.kind(),
                    connection_info: backend.connection_info(),
                    fallback_reason: None,
                };
                self.swap(backend);
                tracing::info!(backend = %outcome.backend, target = %outcome.connection_info, "cache backend connected");
                outcome
            }
            Err(e) => {
                self.swap(self.fallback.clone());
                tracing::warn!(
                    target = %redact_url(target),
                    error = %e,
                    "cache backend unreachable, using in-process fallback"
                );
                ReconfigureOutcome {
                    success: false,
                    backend: BackendKind::Memory,
                    connection_info: self.fallback.connection_info(),
                    fallback_reason: Some(e.to_string()),
                }
            }
        }
    }

    /// [`reconfigure`](Self::reconfigure) plus the default entry TTL.
    pub async fn apply(&self, config: &CacheConfig) -> ReconfigureOutcome {
        self.set_default_ttl(config.ttl());
        self.reconfigure(config.backend_target.as_deref(), config.max_size_mb)
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
