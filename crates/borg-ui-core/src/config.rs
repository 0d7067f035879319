use crate::error::Result;
use crate::paths;
use crate::registry::ScheduleKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// SchedulerConfig
// ---------------------------------------------------------------------------

/// Polling intervals, in seconds, of the three background schedulers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_backup_interval")]
    pub backup_interval_secs: u64,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_backup_interval() -> u64 {
    60
}

fn default_check_interval() -> u64 {
    3600
}

fn default_stats_interval() -> u64 {
    3600
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backup_interval_secs: default_backup_interval(),
            check_interval_secs: default_check_interval(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval_for(&self, kind: ScheduleKind) -> Duration {
        let secs = match kind {
            ScheduleKind::Backup => self.backup_interval_secs,
            ScheduleKind::Check => self.check_interval_secs,
            ScheduleKind::Stats => self.stats_interval_secs,
        };
        Duration::from_secs(secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// ReconcilerConfig
// ---------------------------------------------------------------------------

/// How hard the orphan reconciler tries before treating an undeterminable
/// liveness answer as "not live".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,
    #[serde(default = "default_verify_delay_ms")]
    pub verify_delay_ms: u64,
}

fn default_verify_attempts() -> u32 {
    3
}

fn default_verify_delay_ms() -> u64 {
    250
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            verify_attempts: default_verify_attempts(),
            verify_delay_ms: default_verify_delay_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// A live pid only counts as ours if one of its arguments has a file
    /// name starting with one of these. Empty disables the ownership check.
    #[serde(default = "default_owned_names")]
    pub owned_names: Vec<String>,
    #[serde(default = "default_borg_binary")]
    pub borg_binary: String,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_owned_names() -> Vec<String> {
    vec!["borg".to_string()]
}

fn default_borg_binary() -> String {
    "borg".to_string()
}

fn default_command_timeout() -> u64 {
    10
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            owned_names: default_owned_names(),
            borg_binary: default_borg_binary(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// CacheTuning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTuning {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_key_prefix() -> String {
    "borg-ui:".to_string()
}

impl Default for CacheTuning {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchConfig
// ---------------------------------------------------------------------------

/// Command templates run by the default dispatcher. `{repository}` and
/// `{schedule}` are substituted per argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_backup_command")]
    pub backup: Vec<String>,
    #[serde(default = "default_check_command")]
    pub check: Vec<String>,
    #[serde(default = "default_stats_command")]
    pub stats: Vec<String>,
}

fn worker_command(verb: &str) -> Vec<String> {
    [
        "borg-ui-worker",
        verb,
        "--repository",
        "{repository}",
        "--schedule",
        "{schedule}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_backup_command() -> Vec<String> {
    worker_command("backup")
}

fn default_check_command() -> Vec<String> {
    worker_command("check")
}

fn default_stats_command() -> Vec<String> {
    worker_command("stats")
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            backup: default_backup_command(),
            check: default_check_command(),
            stats: default_stats_command(),
        }
    }
}

impl DispatchConfig {
    pub fn template_for(&self, kind: ScheduleKind) -> &[String] {
        match kind {
            ScheduleKind::Backup => &self.backup,
            ScheduleKind::Check => &self.check,
            ScheduleKind::Stats => &self.stats,
        }
    }
}

// ---------------------------------------------------------------------------
// AdminConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_username")]
    pub username: String,
}

fn default_admin_username() -> String {
    "admin".to_string()
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            username: default_admin_username(),
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Filled in from the directory the config was loaded from.
    #[serde(skip)]
    pub data_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub schedulers: SchedulerConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub processes: ProcessConfig,
    #[serde(default)]
    pub cache: CacheTuning,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_version() -> u32 {
    1
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl AppConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            version: default_version(),
            data_dir: data_dir.into(),
            log_dir: None,
            schedulers: SchedulerConfig::default(),
            reconciler: ReconcilerConfig::default(),
            processes: ProcessConfig::default(),
            cache: CacheTuning::default(),
            dispatch: DispatchConfig::default(),
            admin: AdminConfig::default(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }

    /// Load `<data_dir>/config.yaml`, or defaults if the file is absent.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = paths::config_path(data_dir);
        if !path.exists() {
            return Ok(Self::new(data_dir));
        }
        let data = std::fs::read_to_string(&path)?;
        let mut cfg: AppConfig = serde_yaml::from_str(&data)?;
        cfg.data_dir = data_dir.to_path_buf();
        Ok(cfg)
    }

    pub fn save(&self) -> Result<()> {
        let path = paths::config_path(&self.data_dir);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| paths::default_logs_dir(&self.data_dir))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn verify_delay(&self) -> Duration {
        Duration::from_millis(self.reconciler.verify_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.cache.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.processes.command_timeout_secs.max(1))
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        for kind in ScheduleKind::all() {
            let secs = match kind {
                ScheduleKind::Backup => self.schedulers.backup_interval_secs,
                ScheduleKind::Check => self.schedulers.check_interval_secs,
                ScheduleKind::Stats => self.schedulers.stats_interval_secs,
            };
            if secs == 0 {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("{kind} scheduler interval is 0; using 1 second"),
                });
            }

            if self.dispatch.template_for(*kind).is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!(
                        "no dispatch command for {kind} schedules; they will be marked failed"
                    ),
                });
            }
        }

        if self.reconciler.verify_attempts == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "reconciler.verify_attempts is 0; unknown liveness is never re-checked"
                    .to_string(),
            });
        }

        if self.shutdown_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "shutdown_timeout_secs is 0; background tasks are aborted immediately"
                    .to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
