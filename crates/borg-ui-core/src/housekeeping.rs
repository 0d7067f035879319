//! One-shot startup chores the supervisor runs before reconciliation.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::OnceCell;

use crate::admin::{self, AdminBootstrap};
use crate::cache::CacheService;
use crate::config::AppConfig;
use crate::error::Result;
use crate::logs::{self, RotationReport};
use crate::registry::RedbRegistry;
use crate::settings::LogRetention;
use crate::sysinfo::{self, SystemInfo, SYSTEM_INFO_KEY};

#[async_trait]
pub trait Housekeeping: Send + Sync {
    /// Returns how many migrations ran.
    async fn apply_migrations(&self) -> Result<u32>;

    async fn bootstrap_admin(&self) -> Result<AdminBootstrap>;

    /// Collect system information and publish it to the cache.
    async fn load_system_info(&self) -> Result<SystemInfo>;

    async fn rotate_logs(&self, retention: LogRetention) -> Result<RotationReport>;
}

pub struct Housekeeper {
    registry: Arc<RedbRegistry>,
    cache: Arc<CacheService>,
    data_dir: PathBuf,
    log_dir: PathBuf,
    admin_username: String,
    admin_password: Option<String>,
    borg_binary: String,
    command_timeout: Duration,
    system_info: OnceCell<SystemInfo>,
}

impl Housekeeper {
    pub fn new(config: &AppConfig, registry: Arc<RedbRegistry>, cache: Arc<CacheService>) -> Self {
        Self {
            registry,
            cache,
            data_dir: config.data_dir.clone(),
            log_dir: config.log_dir(),
            admin_username: config.admin.username.clone(),
            admin_password: None,
            borg_binary: config.processes.borg_binary.clone(),
            command_timeout: config.command_timeout(),
            system_info: OnceCell::new(),
        }
    }

    pub fn with_admin_password(mut self, password: Option<String>) -> Self {
        self.admin_password = password;
        self
    }

    /// Info from the first successful [`Housekeeping::load_system_info`].
    pub fn system_info(&self) -> Option<&SystemInfo> {
        self.system_info.get()
    }
}

#[async_trait]
impl Housekeeping for Housekeeper {
    async fn apply_migrations(&self) -> Result<u32> {
        self.registry.apply_migrations().await
    }

    async fn bootstrap_admin(&self) -> Result<AdminBootstrap> {
        admin::bootstrap_admin(
            &self.registry,
            &self.data_dir,
            &self.admin_username,
            self.admin_password.as_deref(),
        )
        .await
    }

    async fn load_system_info(&self) -> Result<SystemInfo> {
        if let Some(info) = self.system_info.get() {
            return Ok(info.clone());
        }
        match sysinfo::collect(&self.borg_binary, self.command_timeout).await {
            Ok(info) => {
                self.cache.put_json(SYSTEM_INFO_KEY, &info).await;
                let info = self.system_info.get_or_init(|| async { info }).await;
                tracing::info!(
                    borg_version = info.borg_version.as_deref().unwrap_or("unknown"),
                    app_version = %info.app_version,
                    "system info loaded"
                );
                Ok(info.clone())
            }
            Err((partial, e)) => {
                // publish what is known; retried on the next call
                self.cache.put_json(SYSTEM_INFO_KEY, &partial).await;
                Err(e)
            }
        }
    }

    async fn rotate_logs(&self, retention: LogRetention) -> Result<RotationReport> {
        let dir = self.log_dir.clone();
        tokio::task::spawn_blocking(move || logs::rotate_logs(&dir, &retention, SystemTime::now()))
            .await?
    }
}
