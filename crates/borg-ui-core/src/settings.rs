//! Settings store: runtime-editable system settings persisted as YAML.

use crate::error::Result;
use crate::io::atomic_write;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// SystemSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSettings {
    /// Networked cache target, e.g. `redis://cache:6379/0`. Unset means the
    /// in-process cache is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    #[serde(default = "default_cache_max_size_mb")]
    pub cache_max_size_mb: u64,
    #[serde(default = "default_cache_ttl_minutes")]
    pub cache_ttl_minutes: u64,
    #[serde(default = "default_log_cleanup_on_startup")]
    pub log_cleanup_on_startup: bool,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u64,
    #[serde(default = "default_log_max_total_size_mb")]
    pub log_max_total_size_mb: u64,
}

fn default_cache_max_size_mb() -> u64 {
    2048
}

/// Longest entry TTL accepted from users: one year.
pub const MAX_CACHE_TTL_MINUTES: u64 = 60 * 24 * 365;

fn default_cache_ttl_minutes() -> u64 {
    120
}

fn default_log_cleanup_on_startup() -> bool {
    true
}

fn default_log_retention_days() -> u64 {
    30
}

fn default_log_max_total_size_mb() -> u64 {
    500
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            cache_max_size_mb: default_cache_max_size_mb(),
            cache_ttl_minutes: default_cache_ttl_minutes(),
            log_cleanup_on_startup: default_log_cleanup_on_startup(),
            log_retention_days: default_log_retention_days(),
            log_max_total_size_mb: default_log_max_total_size_mb(),
        }
    }
}

impl SystemSettings {
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            backend_target: self
                .redis_url
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            max_size_mb: self.cache_max_size_mb,
            ttl_minutes: self.cache_ttl_minutes,
        }
    }

    pub fn log_retention(&self) -> LogRetention {
        LogRetention {
            max_age: Duration::from_secs(self.log_retention_days.saturating_mul(24 * 60 * 60)),
            max_total_bytes: self.log_max_total_size_mb.saturating_mul(1024 * 1024),
        }
    }
}

// ---------------------------------------------------------------------------
// Views handed to the orchestration layer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub backend_target: Option<String>,
    pub max_size_mb: u64,
    #[serde(default = "default_cache_ttl_minutes")]
    pub ttl_minutes: u64,
}

impl CacheConfig {
    pub fn max_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_minutes > 0).then(|| Duration::from_secs(self.ttl_minutes.saturating_mul(60)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogRetention {
    pub max_age: Duration,
    pub max_total_bytes: u64,
}

// ---------------------------------------------------------------------------
// SettingsStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn fetch_cache_config(&self) -> Result<CacheConfig>;

    async fn fetch_log_cleanup_policy(&self) -> Result<bool>;

    async fn fetch_log_retention(&self) -> Result<LogRetention>;

    /// Persist new cache settings. Does not touch the running cache.
    async fn update_cache_config(&self, config: &CacheConfig) -> Result<()>;
}

/// [`SettingsStore`] backed by `<data_dir>/settings.yaml`.
pub struct FileSettingsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current settings, or defaults if the file does not exist.
    pub async fn load(&self) -> Result<SystemSettings> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(data) if data.trim().is_empty() => Ok(SystemSettings::default()),
            Ok(data) => Ok(serde_yaml::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SystemSettings::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, settings: &SystemSettings) -> Result<()> {
        let data = serde_yaml::to_string(settings)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || atomic_write(&path, data.as_bytes())).await?
    }
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    async fn fetch_cache_config(&self) -> Result<CacheConfig> {
        Ok(self.load().await?.cache_config())
    }

    async fn fetch_log_cleanup_policy(&self) -> Result<bool> {
        Ok(self.load().await?.log_cleanup_on_startup)
    }

    async fn fetch_log_retention(&self) -> Result<LogRetention> {
        Ok(self.load().await?.log_retention())
    }

    async fn update_cache_config(&self, config: &CacheConfig) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut settings = self.load().await?;
        settings.redis_url = config.backend_target.clone();
        settings.cache_max_size_mb = config.max_size_mb;
        settings.cache_ttl_minutes = config.ttl_minutes;
        self.save(&settings).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let store = FileSettingsStore::new(dir.path().join("settings.yaml"));
        let cache = store.fetch_cache_config().await.unwrap();
        assert_eq!(cache.backend_target, None);
        assert_eq!(cache.max_size_mb, 2048);
        assert!(store.fetch_log_cleanup_policy().await.unwrap());
    }

    #[tokio::test]
    async fn blank_redis_url_means_no_networked_backend() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "redis_url: '  '\ncache_max_size_mb: 64\n").unwrap();
        let store = FileSettingsStore::new(path);
        let cache = store.fetch_cache_config().await.unwrap();
        assert_eq!(cache.backend_target, None);
        assert_eq!(cache.max_bytes(), 64 * 1024 * 1024);
    }

    #[tokio::test]
    async fn update_cache_config_preserves_other_settings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "log_cleanup_on_startup: false\nlog_retention_days: 7\n").unwrap();
        let store = FileSettingsStore::new(path);

        store
            .update_cache_config(&CacheConfig {
                backend_target: Some("redis://cache:6379/0".into()),
                max_size_mb: 100,
                ttl_minutes: 10,
            })
            .await
            .unwrap();

        let settings = store.load().await.unwrap();
        assert_eq!(settings.redis_url.as_deref(), Some("redis://cache:6379/0"));
        assert_eq!(settings.cache_max_size_mb, 100);
        assert!(!settings.log_cleanup_on_startup);
        assert_eq!(
            store.fetch_log_retention().await.unwrap().max_age,
            Duration::from_secs(7 * 24 * 60 * 60)
        );
    }

    #[test]
    fn zero_ttl_disables_expiry() {
        let cfg = CacheConfig {
            backend_target: None,
            max_size_mb: 1,
            ttl_minutes: 0,
        };
        assert_eq!(cfg.ttl(), None);
    }

    #[test]
    fn huge_values_saturate_instead_of_overflowing() {
        let settings = SystemSettings {
            cache_ttl_minutes: u64::MAX,
            log_retention_days: u64::MAX,
            log_max_total_size_mb: u64::MAX,
            ..Default::default()
        };
        let retention = settings.log_retention();
        assert_eq!(retention.max_age, Duration::from_secs(u64::MAX));
        assert_eq!(retention.max_total_bytes, u64::MAX);
        assert_eq!(
            settings.cache_config().ttl(),
            Some(Duration::from_secs(u64::MAX))
        );
    }
}
